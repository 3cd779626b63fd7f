use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReflectError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Polars error: {0}")]
    Polars(String),
}

pub type Result<T> = std::result::Result<T, ReflectError>;
