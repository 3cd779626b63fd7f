//! SQL Assistant - question in, reflected answer out
//!
//! One round of: generate SQL → execute → reflect → execute the refined
//! query when reflection produced a different, answerable one.

use crate::config::ReflectionConfig;
use crate::error::{ReflectError, Result};
use crate::execution::result::QueryResult;
use crate::execution::store::BackingStore;
use crate::llm::{strip_code_fences, CompletionService};
use crate::reflection::engine::{ReflectionEngine, ReflectionVerdict};
use crate::reflection::rewrite::same_query;
use crate::schema::Schema;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything one `ask` produced.
#[derive(Debug, Clone)]
pub struct AssistantRun {
    pub question: String,
    pub initial_sql: String,
    pub initial_result: QueryResult,
    pub verdict: ReflectionVerdict,
    /// Set only when reflection proposed a different, answerable query
    pub refined_sql: Option<String>,
    pub refined_result: Option<QueryResult>,
    pub refined_error: Option<String>,
}

impl AssistantRun {
    /// Result the user should see: the refined one when it ran, else the first.
    pub fn final_result(&self) -> &QueryResult {
        self.refined_result.as_ref().unwrap_or(&self.initial_result)
    }
}

pub struct SqlAssistant {
    llm: Arc<dyn CompletionService>,
    engine: ReflectionEngine,
}

impl SqlAssistant {
    pub fn new(llm: Arc<dyn CompletionService>, store: Box<dyn BackingStore>, config: ReflectionConfig) -> Self {
        let engine = ReflectionEngine::new(llm.clone(), store, config);
        Self { llm, engine }
    }

    pub fn engine(&self) -> &ReflectionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ReflectionEngine {
        &mut self.engine
    }

    /// Schema of the active table.
    pub fn schema(&self) -> Result<Schema> {
        self.engine.store().table_schema(self.engine.active_table())
    }

    pub fn execute(&self, sql: &str) -> Result<QueryResult> {
        self.engine.store().query(sql).map(QueryResult::new)
    }

    pub fn build_sql_prompt(question: &str, schema: &Schema, table: &str) -> String {
        format!(
            r#"You are a SQL assistant. Given the schema and user question, write a valid SQLite query.
Use table name '{table}'. If the question contains a name or text, use LIKE '%text%' for partial matching instead of exact '='. Always ensure column names match those in the schema exactly.

Schema:
{schema}

Question: {question}

Respond with the SQL query only, no explanations."#,
            table = table,
            schema = schema.render(),
            question = question,
        )
    }

    /// One SQLite query for `question`, generated at temperature 0.
    pub async fn generate_sql(&self, question: &str, schema: &Schema) -> Result<String> {
        let prompt = Self::build_sql_prompt(question, schema, self.engine.active_table());
        let raw = self.llm.complete(&prompt, 0.0).await?;
        let sql = strip_code_fences(&raw).trim().trim_end_matches(';').trim().to_string();
        if sql.is_empty() {
            return Err(ReflectError::Llm("Model returned no SQL".to_string()));
        }
        Ok(sql)
    }

    /// Generate, execute, reflect, and re-execute when a correction exists.
    ///
    /// Fails only when the schema cannot be read, SQL generation fails, or
    /// the first query does not execute.
    pub async fn ask(&mut self, question: &str) -> Result<AssistantRun> {
        let schema = self.schema()?;
        let initial_sql = self.generate_sql(question, &schema).await?;
        info!("Generated SQL: {}", initial_sql);

        let initial_result = self.execute(&initial_sql)?;
        info!("Initial query returned {} row(s)", initial_result.row_count());

        let verdict = self
            .engine
            .reflect(question, &initial_sql, &initial_result, &schema)
            .await;

        let refined_sql = verdict
            .refined_sql
            .as_sql()
            .filter(|sql| !same_query(sql, &initial_sql))
            .map(str::to_string);

        let (refined_result, refined_error) = match &refined_sql {
            Some(sql) => match self.execute(sql) {
                Ok(result) => (Some(result), None),
                Err(e) => {
                    warn!("Refined query failed: {}", e);
                    (None, Some(e.to_string()))
                }
            },
            None => (None, None),
        };

        Ok(AssistantRun {
            question: question.to_string(),
            initial_sql,
            initial_result,
            verdict,
            refined_sql,
            refined_result,
            refined_error,
        })
    }
}
