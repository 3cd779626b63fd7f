//! Explanation Generator
//!
//! Plain-language rationale for a verdict. Answerable verdicts get a second
//! model call; unanswerable ones get a message built from the feedback and
//! the data that was actually found.

use crate::error::Result;
use crate::llm::CompletionService;
use crate::reflection::enricher::{literal_filters, EnrichmentContext};
use crate::schema::Schema;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::warn;

lazy_static! {
    static ref QUOTED_VALUE: Regex = Regex::new(r"'([^']+)'").unwrap();
    static ref PERIOD_WORDS: Regex =
        Regex::new(r"(?i)\b(?:date|dates|day|days|week|weeks|month|months|quarter|year|years|period|time range|timestamp)\b")
            .unwrap();
}

/// Minimum Jaro-Winkler similarity for a "did you mean" suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.85;

pub struct ExplanationGenerator {
    llm: Arc<dyn CompletionService>,
    temperature: f32,
}

impl ExplanationGenerator {
    pub fn new(llm: Arc<dyn CompletionService>, temperature: f32) -> Self {
        Self { llm, temperature }
    }

    pub fn build_prompt(issues: &[String], feedback: &str, old_sql: &str, new_sql: &str, sample: &str) -> String {
        format!(
            r#"You are QueryMind, an AI SQL reflection assistant.

Context:
- Detected issues: {issues}
- Feedback summary: {feedback}
- Original SQL: {old_sql}
- Corrected SQL: {new_sql}
- Sample of the observed output: {sample}

Explain concisely (in 2-3 sentences) why the correction improves the query, or why the original query stands when nothing changed.
Only state what the issues, feedback and sample above show; do not claim problems (such as a date format mismatch) they do not evidence.
Avoid repeating SQL code, just summarize the reasoning in plain English."#,
            issues = issues.join("; "),
            feedback = feedback,
            old_sql = old_sql,
            new_sql = new_sql,
            sample = sample,
        )
    }

    pub async fn try_explain(
        &self,
        issues: &[String],
        feedback: &str,
        old_sql: &str,
        new_sql: &str,
        sample: &str,
    ) -> Result<String> {
        let prompt = Self::build_prompt(issues, feedback, old_sql, new_sql, sample);
        let text = self.llm.complete(&prompt, self.temperature).await?;
        Ok(text.trim().to_string())
    }

    /// Rationale text, or a placeholder naming the failure.
    pub async fn explain(
        &self,
        issues: &[String],
        feedback: &str,
        old_sql: &str,
        new_sql: &str,
        sample: &str,
    ) -> String {
        match self.try_explain(issues, feedback, old_sql, new_sql, sample).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Explanation generation failed: {}", e);
                unavailable_placeholder(&e.to_string())
            }
        }
    }
}

pub fn unavailable_placeholder(reason: &str) -> String {
    format!("(explanation unavailable: {})", reason)
}

/// Explanation for a `NULL` verdict of `query`, grounded in the schema and
/// in what the enrichment stage found.
pub fn grounded_unanswerable_message(
    feedback: &str,
    query: &str,
    schema: &Schema,
    enrichment: Option<&EnrichmentContext>,
) -> String {
    let lowered = feedback.to_lowercase();
    let names_field = lowered.contains("missing field") || lowered.contains("not present in the schema");

    if names_field && !quotes_filter_value(feedback, query, schema, enrichment) {
        return match suggested_fields(schema) {
            Some(fields) => format!(
                "There's no matching column for your question in the database schema. Try rephrasing your question using available fields such as {}.",
                fields
            ),
            None => "There's no matching column for your question in the database schema.".to_string(),
        };
    }

    if let Some(value) = QUOTED_VALUE.captures(feedback).map(|c| c[1].to_string()) {
        let mut message = format!("No rows match '{}'.", value);
        if let Some(context) = enrichment {
            for (column, values) in &context.column_values {
                message.push_str(&format!(" Values present for {}: {}.", column, values.join(", ")));
            }
            if let Some(close) = closest_value(&value, context) {
                message.push_str(&format!(" Did you mean '{}'?", close));
            }
        }
        return message;
    }

    if PERIOD_WORDS.is_match(feedback) {
        let range = enrichment
            .map(|c| c.date_range.as_str())
            .filter(|r| !r.is_empty());
        return match range {
            Some(range) => format!("No data exists for the requested period. {}.", range),
            None => "No data exists for the requested period.".to_string(),
        };
    }

    match suggested_fields(schema) {
        Some(fields) => format!(
            "No matching data was found for your question. Try rephrasing it using available fields such as {}.",
            fields
        ),
        None => "No matching data was found for your question.".to_string(),
    }
}

/// A quoted term of `feedback` is a value the query filters by (or one the
/// enrichment sampled) rather than a schema column.
fn quotes_filter_value(
    feedback: &str,
    query: &str,
    schema: &Schema,
    enrichment: Option<&EnrichmentContext>,
) -> bool {
    let filter_values: Vec<String> = literal_filters(query)
        .into_iter()
        .flat_map(|f| f.values)
        .collect();
    QUOTED_VALUE
        .captures_iter(feedback)
        .map(|c| c[1].to_string())
        .filter(|term| !schema.contains(term))
        .any(|term| {
            filter_values.iter().any(|v| v.eq_ignore_ascii_case(&term))
                || enrichment.is_some_and(|c| c.contains_value(&term))
        })
}

/// `'a', 'b', or 'c'` from the first three schema columns.
fn suggested_fields(schema: &Schema) -> Option<String> {
    let names: Vec<String> = schema
        .column_names()
        .into_iter()
        .take(3)
        .map(|n| format!("'{}'", n))
        .collect();
    match names.len() {
        0 => None,
        1 => Some(names[0].clone()),
        2 => Some(format!("{} or {}", names[0], names[1])),
        _ => Some(format!("{}, {}, or {}", names[0], names[1], names[2])),
    }
}

fn closest_value(value: &str, context: &EnrichmentContext) -> Option<String> {
    let target = value.to_lowercase();
    context
        .column_values
        .iter()
        .flat_map(|(_, values)| values.iter())
        .map(|candidate| (candidate, strsim::jaro_winkler(&target, &candidate.to_lowercase())))
        .filter(|(candidate, score)| *score >= SUGGESTION_THRESHOLD && candidate.as_str() != value)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(candidate, _)| candidate.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReflectError;
    use async_trait::async_trait;

    struct Failing;

    #[async_trait]
    impl CompletionService for Failing {
        async fn complete(&self, _prompt: &str, _temperature: f32) -> Result<String> {
            Err(ReflectError::Llm("rate limited".to_string()))
        }
    }

    struct Echo;

    #[async_trait]
    impl CompletionService for Echo {
        async fn complete(&self, prompt: &str, temperature: f32) -> Result<String> {
            Ok(format!("  {} chars at {}  ", prompt.len(), temperature))
        }
    }

    fn schema() -> Schema {
        Schema::from_pairs(&[
            ("product_name", "TEXT"),
            ("category", "TEXT"),
            ("region", "TEXT"),
            ("revenue", "REAL"),
        ])
    }

    fn context() -> EnrichmentContext {
        EnrichmentContext {
            column_values: vec![(
                "product_name".to_string(),
                vec!["Galaxy S24".to_string(), "iPhone 15".to_string()],
            )],
            date_range: "Data in transactions spans 2025-09-01 to 2025-10-05 (4 rows)".to_string(),
            sample_limit: 10,
        }
    }

    #[tokio::test]
    async fn test_explain_failure_placeholder() {
        let generator = ExplanationGenerator::new(Arc::new(Failing), 0.4);
        let text = generator
            .explain(&["no anomalies detected".to_string()], "ok", "SELECT 1", "SELECT 1", "[]")
            .await;
        assert_eq!(text, "(explanation unavailable: LLM error: rate limited)");
    }

    #[tokio::test]
    async fn test_explain_trims_and_uses_temperature() {
        let generator = ExplanationGenerator::new(Arc::new(Echo), 0.4);
        let text = generator.explain(&[], "ok", "a", "b", "[]").await;
        assert!(text.ends_with("chars at 0.4"));
        assert!(!text.starts_with(' '));
    }

    #[test]
    fn test_prompt_grounds_in_sample() {
        let prompt = ExplanationGenerator::build_prompt(
            &["negative values detected in revenue".to_string()],
            "added ABS()",
            "SELECT SUM(revenue) FROM t",
            "SELECT SUM(ABS(revenue)) FROM t",
            r#"[{"revenue":-12500.0}]"#,
        );
        assert!(prompt.contains("2-3 sentences"));
        assert!(prompt.contains(r#"[{"revenue":-12500.0}]"#));
        assert!(!prompt.contains("\"refined_sql\""));
    }

    #[test]
    fn test_missing_field_message_lists_columns() {
        let msg = grounded_unanswerable_message(
            "The question references missing field(s): ['color']. Please rephrase or use available fields.",
            "SELECT product_name FROM transactions",
            &schema(),
            None,
        );
        assert_eq!(
            msg,
            "There's no matching column for your question in the database schema. Try rephrasing your question using available fields such as 'product_name', 'category', or 'region'."
        );
    }

    #[test]
    fn test_value_message_suggests_close_match() {
        let msg = grounded_unanswerable_message(
            "Filter value 'Galaxy S23' does not exist in product_name; available values: [Galaxy S24, iPhone 15].",
            "SELECT * FROM transactions WHERE product_name = 'Galaxy S23'",
            &schema(),
            Some(&context()),
        );
        assert!(msg.starts_with("No rows match 'Galaxy S23'."));
        assert!(msg.contains("Values present for product_name: Galaxy S24, iPhone 15."));
        assert!(msg.ends_with("Did you mean 'Galaxy S24'?"));
    }

    #[test]
    fn test_missing_field_wording_for_a_filter_value() {
        let msg = grounded_unanswerable_message(
            "The question references missing field(s): ['NY'] which do not exist in the schema.",
            "SELECT * FROM transactions WHERE region = 'NY'",
            &schema(),
            Some(&EnrichmentContext {
                column_values: vec![("region".to_string(), vec!["North".to_string(), "South".to_string()])],
                date_range: String::new(),
                sample_limit: 2,
            }),
        );
        assert!(!msg.contains("no matching column"));
        assert_eq!(msg, "No rows match 'NY'. Values present for region: North, South.");
    }

    #[test]
    fn test_period_message_includes_range() {
        let msg = grounded_unanswerable_message(
            "No sales recorded for that month.",
            "SELECT * FROM transactions WHERE ts >= '2025-11-01'",
            &schema(),
            Some(&context()),
        );
        assert_eq!(
            msg,
            "No data exists for the requested period. Data in transactions spans 2025-09-01 to 2025-10-05 (4 rows)."
        );
    }

    #[test]
    fn test_generic_message() {
        let msg = grounded_unanswerable_message("Cannot answer.", "SELECT 1", &Schema::default(), None);
        assert_eq!(msg, "No matching data was found for your question.");
    }
}
