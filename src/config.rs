//! Configuration
//!
//! Tunables for the reflection pipeline and credentials for the completion
//! endpoint. Both carry defaults and can be overridden from the environment.

use crate::error::{ReflectError, Result};
use serde::{Deserialize, Serialize};
use std::env;

pub const DUMMY_API_KEY: &str = "dummy-api-key";

/// A categorical dimension whose full cardinality is known up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRule {
    /// Column name, matched case-insensitively against result columns
    pub column: String,
    /// Number of distinct values a full-coverage result should contain
    pub expected_values: usize,
}

impl CoverageRule {
    pub fn new(column: impl Into<String>, expected_values: usize) -> Self {
        Self {
            column: column.into(),
            expected_values,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    /// Table the enrichment queries run against
    pub active_table: String,

    /// Timestamp column summarized by the date range probe
    pub timestamp_column: String,

    /// Rows of the result shown to the model
    pub sample_rows: usize,

    /// Distinct values sampled per filtered column
    pub column_sample_limit: usize,

    /// Temperature for the semantic check (produces the corrective query)
    pub semantic_temperature: f32,

    /// Temperature for the natural-language explanation
    pub explanation_temperature: f32,

    /// Maximum entries per stage cache
    pub cache_capacity: usize,

    pub coverage_rules: Vec<CoverageRule>,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            active_table: "transactions".to_string(),
            timestamp_column: "ts".to_string(),
            sample_rows: 3,
            column_sample_limit: 10,
            semantic_temperature: 0.0,
            explanation_temperature: 0.4,
            cache_capacity: 1024,
            coverage_rules: vec![CoverageRule::new("region", 4)],
        }
    }
}

impl ReflectionConfig {
    /// Defaults overridden by `QUERYMIND_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(table) = env::var("QUERYMIND_TABLE") {
            config.active_table = table;
        }
        if let Ok(column) = env::var("QUERYMIND_TIMESTAMP_COLUMN") {
            config.timestamp_column = column;
        }
        if let Ok(capacity) = env::var("QUERYMIND_CACHE_CAPACITY") {
            config.cache_capacity = capacity.parse().map_err(|e| {
                ReflectError::Config(format!(
                    "QUERYMIND_CACHE_CAPACITY must be a positive integer, got '{}': {}",
                    capacity, e
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_active_table(mut self, table: impl Into<String>) -> Self {
        self.active_table = table.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.active_table.trim().is_empty() {
            return Err(ReflectError::Config("active table name is empty".to_string()));
        }
        if self.cache_capacity == 0 {
            return Err(ReflectError::Config("cache capacity must be at least 1".to_string()));
        }
        if self.column_sample_limit == 0 {
            return Err(ReflectError::Config(
                "column sample limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Credentials and endpoint for an OpenAI-compatible chat completions API.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env::var("OPENAI_API_KEY").unwrap_or_else(|_| DUMMY_API_KEY.to_string()),
            model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.api_key == DUMMY_API_KEY
    }
}
