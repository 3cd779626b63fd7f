pub mod assistant;
pub mod config;
pub mod error;
pub mod execution;
pub mod llm;
pub mod reflection;
pub mod schema;

pub use assistant::{AssistantRun, SqlAssistant};
pub use config::{LlmConfig, ReflectionConfig};
pub use error::{ReflectError, Result};
pub use execution::{BackingStore, FrameStore, QueryResult, SqliteStore};
pub use llm::{CompletionService, LlmClient};
pub use reflection::{ReflectionEngine, ReflectionVerdict, RefinedSql};
pub use schema::Schema;
