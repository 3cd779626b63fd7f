use async_trait::async_trait;
use polars::prelude::*;
use querymind::config::{ReflectionConfig, DUMMY_API_KEY};
use querymind::execution::{BackingStore, QueryResult, SqliteStore};
use querymind::llm::{CompletionService, LlmClient};
use querymind::reflection::cache::CacheStats;
use querymind::reflection::semantic::NO_OP_FEEDBACK;
use querymind::{ReflectError, ReflectionEngine, RefinedSql, Result, Schema, SqlAssistant};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Completion double: semantic prompts get the next scripted reply, every
/// other prompt gets the fixed explanation reply. All prompts are recorded.
struct ScriptedLlm {
    semantic: Mutex<VecDeque<std::result::Result<String, String>>>,
    explanation: std::result::Result<String, String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn new(semantic: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            semantic: Mutex::new(semantic.into_iter().map(Ok).collect()),
            explanation: Ok("The query matches the question and the data.".to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn unreachable(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            semantic: Mutex::new(VecDeque::new()),
            explanation: Err(reason.to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn semantic_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains("\"refined_sql\""))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CompletionService for ScriptedLlm {
    async fn complete(&self, prompt: &str, _temperature: f32) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if prompt.contains("\"refined_sql\"") {
            let next = self.semantic.lock().unwrap().pop_front();
            match next {
                Some(reply) => reply.map_err(ReflectError::Llm),
                None => Err(ReflectError::Llm(
                    match &self.explanation {
                        Err(reason) => reason.clone(),
                        Ok(_) => "no scripted reply".to_string(),
                    },
                )),
            }
        } else {
            self.explanation.clone().map_err(ReflectError::Llm)
        }
    }
}

fn keep(query: &str) -> String {
    serde_json::json!({"feedback": "No semantic issues detected.", "refined_sql": query}).to_string()
}

fn seeded_store() -> SqliteStore {
    let store = SqliteStore::in_memory().unwrap();
    store
        .connection()
        .execute_batch(
            "CREATE TABLE transactions (
                id INTEGER PRIMARY KEY,
                product_name TEXT,
                category TEXT,
                region TEXT,
                qty_sold INTEGER,
                revenue REAL,
                ts TEXT
             );
             INSERT INTO transactions (product_name, category, region, qty_sold, revenue, ts) VALUES
                ('iPhone 15 Pro', 'Phone', 'North', 2, 1998.0, '2025-09-01'),
                ('AirPods Pro', 'Earbuds', 'South', 1, 249.0, '2025-09-10'),
                ('MacBook Air M3', 'Laptop', 'East', 1, 1299.0, '2025-09-20'),
                ('Apple Watch Series 10', 'Watch', 'West', -1, -399.0, '2025-10-01');
             CREATE TABLE returns (id INTEGER PRIMARY KEY, region TEXT, amount REAL, ts TEXT);
             INSERT INTO returns (region, amount, ts) VALUES
                ('NY', 10.0, '2025-10-03'),
                ('Boston', 5.0, '2025-10-04');",
        )
        .unwrap();
    store
}

fn engine(llm: Arc<ScriptedLlm>) -> (ReflectionEngine, Schema) {
    let store = seeded_store();
    let schema = store.table_schema("transactions").unwrap();
    (
        ReflectionEngine::new(llm, Box::new(store), ReflectionConfig::default()),
        schema,
    )
}

fn regional_totals() -> QueryResult {
    QueryResult::new(
        df![
            "region" => ["North", "South", "East", "West"],
            "total" => [1998.0, 249.0, 1299.0, 120.0]
        ]
        .unwrap(),
    )
}

const REGION_QUERY: &str = "SELECT region, SUM(revenue) AS total FROM transactions GROUP BY region";
const NY_QUERY: &str = "SELECT * FROM transactions WHERE region = 'NY'";

#[tokio::test]
async fn negative_revenue_is_rewritten_with_abs() {
    let llm = ScriptedLlm::new(vec![]);
    let (mut engine, schema) = engine(llm.clone());
    let result = QueryResult::new(df!["revenue" => [-12500.0]].unwrap());

    let verdict = engine
        .reflect("What is the total revenue?", "SELECT SUM(revenue) FROM transactions", &result, &schema)
        .await;

    assert_eq!(
        verdict.refined_sql,
        RefinedSql::Answerable("SELECT SUM(ABS(revenue)) FROM transactions".to_string())
    );
    assert!(verdict.issues.iter().any(|i| i.starts_with("negative values detected")));
    assert!(llm.semantic_prompts().is_empty());
}

#[tokio::test]
async fn absent_filter_value_makes_question_unanswerable() {
    let llm = ScriptedLlm::new(vec![keep(NY_QUERY)]);
    let (mut engine, schema) = engine(llm.clone());
    let result = QueryResult::empty(&["product_name", "revenue"]);

    let verdict = engine.reflect("Sales in NY?", NY_QUERY, &result, &schema).await;

    assert_eq!(verdict.issues, vec!["empty result — likely filter/join mismatch".to_string()]);
    assert_eq!(verdict.refined_sql, RefinedSql::Unanswerable);
    assert_eq!(verdict.refined_sql.to_string(), "NULL");
    assert!(verdict.feedback.contains("'NY'"));
    for region in ["North", "South", "East", "West"] {
        assert!(verdict.explanation.contains(region), "{}", verdict.explanation);
    }

    let prompts = llm.semantic_prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Distinct values of region"));
    assert!(prompts[0].contains("2025-09-01 to 2025-10-01"));
    // unanswerable verdicts are explained locally
    assert_eq!(llm.calls(), 1);
    assert_eq!(engine.get_cache_stats().column_values, 1);
}

#[tokio::test]
async fn absent_value_is_unanswerable_when_sample_hits_the_limit() {
    let store = seeded_store();
    store
        .connection()
        .execute_batch(
            "INSERT INTO transactions (product_name, category, region, qty_sold, revenue, ts) VALUES
                ('Pixel 9', 'Phone', 'Central', 1, 799.0, '2025-09-02'),
                ('Pixel 9', 'Phone', 'Coastal', 1, 799.0, '2025-09-03'),
                ('Pixel 9', 'Phone', 'Highlands', 1, 799.0, '2025-09-04'),
                ('Pixel 9', 'Phone', 'Lakes', 1, 799.0, '2025-09-05'),
                ('Pixel 9', 'Phone', 'Midlands', 1, 799.0, '2025-09-06'),
                ('Pixel 9', 'Phone', 'Plains', 1, 799.0, '2025-09-07'),
                ('Pixel 9', 'Phone', 'Valley', 1, 799.0, '2025-09-08'),
                ('Pixel 9', 'Phone', 'Delta', 1, 799.0, '2025-09-09');",
        )
        .unwrap();
    let schema = store.table_schema("transactions").unwrap();
    let llm = ScriptedLlm::new(vec![keep(NY_QUERY)]);
    let mut engine = ReflectionEngine::new(llm.clone(), Box::new(store), ReflectionConfig::default());

    let verdict = engine
        .reflect("Sales in NY?", NY_QUERY, &QueryResult::empty(&["id"]), &schema)
        .await;

    assert_eq!(verdict.refined_sql, RefinedSql::Unanswerable);
    assert!(verdict
        .feedback
        .starts_with("Filter value 'NY' does not exist in region; first 10 distinct values: ["));
    assert!(verdict.explanation.starts_with("No rows match 'NY'."));
}

#[tokio::test]
async fn non_json_reply_with_absent_marker_is_unanswerable() {
    let query = "SELECT product_name FROM transactions";
    let llm = ScriptedLlm::new(vec!["The colour attribute is absent from the schema.".to_string()]);
    let (mut engine, schema) = engine(llm.clone());
    let result = QueryResult::new(df!["product_name" => ["iPhone 15 Pro"]].unwrap());

    let verdict = engine.reflect("Which colour sells best?", query, &result, &schema).await;

    assert_eq!(verdict.refined_sql, RefinedSql::Unanswerable);
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn identical_inputs_are_served_from_cache() {
    let llm = ScriptedLlm::new(vec![keep(REGION_QUERY)]);
    let (mut engine, schema) = engine(llm.clone());
    let result = regional_totals();

    let first = engine.reflect("Revenue by region?", REGION_QUERY, &result, &schema).await;
    let calls = llm.calls();
    let second = engine.reflect("Revenue by region?", REGION_QUERY, &result, &schema).await;

    assert_eq!(calls, 2);
    assert_eq!(llm.calls(), calls);
    assert_eq!(first, second);
    assert_eq!(first.issues, vec!["no anomalies detected".to_string()]);
    assert_eq!(first.refined_sql, RefinedSql::Answerable(REGION_QUERY.to_string()));
    assert_eq!(engine.get_cache_stats().reflection, 1);
}

#[tokio::test]
async fn cache_stats_track_new_inputs_and_reset() {
    let llm = ScriptedLlm::new(vec![keep(REGION_QUERY), keep(REGION_QUERY)]);
    let (mut engine, schema) = engine(llm.clone());
    let result = regional_totals();

    engine.reflect("Revenue by region?", REGION_QUERY, &result, &schema).await;
    assert_eq!(
        engine.get_cache_stats(),
        CacheStats {
            reflection: 1,
            semantic: 1,
            explanation: 1,
            column_values: 0,
            total: 3
        }
    );

    engine.reflect("Total sales per region?", REGION_QUERY, &result, &schema).await;
    let stats = engine.get_cache_stats();
    assert_eq!(stats.reflection, 2);
    assert_eq!(stats.semantic, 2);
    // same (issues, feedback, old, new) tuple, so the explanation is reused
    assert_eq!(stats.explanation, 1);
    assert_eq!(llm.calls(), 3);

    engine.clear_cache();
    assert_eq!(engine.get_cache_stats(), CacheStats::default());
}

#[tokio::test]
async fn switching_tables_isolates_enrichment() {
    let llm = ScriptedLlm::new(vec![keep(NY_QUERY), keep(NY_QUERY)]);
    let (mut engine, schema) = engine(llm.clone());
    let empty = QueryResult::empty(&["region"]);

    let on_transactions = engine.reflect("Sales in NY?", NY_QUERY, &empty, &schema).await;
    assert_eq!(on_transactions.refined_sql, RefinedSql::Unanswerable);
    assert_eq!(engine.get_cache_stats().column_values, 1);

    engine.set_active_table("returns");
    assert_eq!(engine.get_cache_stats().column_values, 0);

    let returns_schema = engine.store().table_schema("returns").unwrap();
    let on_returns = engine.reflect("Sales in NY?", NY_QUERY, &empty, &returns_schema).await;
    assert_eq!(on_returns.refined_sql, RefinedSql::Answerable(NY_QUERY.to_string()));
    assert_eq!(engine.get_cache_stats().column_values, 1);

    let prompts = llm.semantic_prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("North"));
    assert!(prompts[1].contains("Boston"));
    assert!(!prompts[1].contains("North"));
}

#[tokio::test]
async fn unreachable_service_degrades_without_caching() {
    let llm = ScriptedLlm::unreachable("503 Service Unavailable");
    let (mut engine, schema) = engine(llm.clone());
    let query = "SELECT * FROM transactions WHERE region = 'North' AND ts >= '2026-01-01'";
    let empty = QueryResult::empty(&["id"]);

    let verdict = engine.reflect("North sales this year?", query, &empty, &schema).await;

    assert_eq!(verdict.refined_sql, RefinedSql::Answerable(query.to_string()));
    assert_eq!(verdict.feedback, "semantic check failed: LLM error: 503 Service Unavailable");
    assert_eq!(verdict.explanation, "(explanation unavailable: LLM error: 503 Service Unavailable)");

    let calls = llm.calls();
    engine.reflect("North sales this year?", query, &empty, &schema).await;
    assert!(llm.calls() > calls);
    assert_eq!(engine.get_cache_stats().reflection, 0);
}

#[tokio::test]
async fn non_json_reply_mentioning_missing_field_is_unanswerable() {
    let query = "SELECT product_name FROM transactions";
    let llm = ScriptedLlm::new(vec!["The colour column is missing from this table.".to_string()]);
    let (mut engine, schema) = engine(llm.clone());
    let result = QueryResult::new(df!["product_name" => ["iPhone 15 Pro"]].unwrap());

    let verdict = engine.reflect("Which colour sells best?", query, &result, &schema).await;

    assert_eq!(verdict.refined_sql, RefinedSql::Unanswerable);
    assert!(verdict
        .explanation
        .starts_with("There's no matching column for your question in the database schema."));
}

#[tokio::test]
async fn non_json_reply_without_markers_keeps_query() {
    let query = "SELECT product_name FROM transactions";
    let llm = ScriptedLlm::new(vec!["Looks fine to me!".to_string()]);
    let (mut engine, schema) = engine(llm.clone());
    let result = QueryResult::new(df!["product_name" => ["iPhone 15 Pro"]].unwrap());

    let verdict = engine.reflect("List the products", query, &result, &schema).await;

    assert_eq!(verdict.refined_sql, RefinedSql::Answerable(query.to_string()));
    assert_eq!(verdict.feedback, "Model returned non-JSON output: Looks fine to me!...");
}

#[tokio::test]
async fn cosmetic_rewrite_of_empty_result_is_reverted() {
    let query = "SELECT * FROM transactions WHERE ts >= '2025-12-01'";
    let rewrite = serde_json::json!({
        "feedback": "Use explicit columns",
        "refined_sql": "SELECT product_name, revenue FROM transactions WHERE ts >=  '2025-12-01'"
    })
    .to_string();
    let llm = ScriptedLlm::new(vec![rewrite]);
    let (mut engine, schema) = engine(llm.clone());

    let verdict = engine
        .reflect("Sales since December?", query, &QueryResult::empty(&["id"]), &schema)
        .await;

    assert_eq!(verdict.refined_sql, RefinedSql::Answerable(query.to_string()));
    assert_eq!(verdict.feedback, NO_OP_FEEDBACK);
}

#[tokio::test]
async fn offline_client_runs_the_whole_loop() {
    let llm = Arc::new(LlmClient::new(
        DUMMY_API_KEY.to_string(),
        "gpt-4o-mini".to_string(),
        "http://localhost".to_string(),
    ));
    let mut assistant = SqlAssistant::new(llm, Box::new(seeded_store()), ReflectionConfig::default());

    let run = assistant.ask("Show me some transactions").await.unwrap();

    assert_eq!(run.initial_sql, "SELECT * FROM transactions LIMIT 10");
    assert_eq!(run.initial_result.row_count(), 4);
    assert!(run.verdict.issues[0].starts_with("negative values detected"));
    assert!(run.verdict.feedback.contains("no SUM()"));
    assert!(run.refined_sql.is_none());
    assert!(!run.verdict.explanation.is_empty());
}
