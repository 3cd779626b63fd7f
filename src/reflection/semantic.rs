//! Semantic Reflector
//!
//! Asks the completion service whether a query answers the question at all,
//! given the schema, what the query returned and (for empty results) what
//! the table really holds. The model may only answer "unanswerable" or
//! "keep the query"; anything else it proposes has to survive a syntax check
//! and a WHERE-clause comparison before it is accepted.

use crate::execution::result::NO_OUTPUT_MARKER;
use crate::llm::{strip_code_fences, CompletionService};
use crate::reflection::engine::RefinedSql;
use crate::reflection::enricher::{AbsentValue, EnrichmentContext};
use crate::reflection::rewrite::{same_filter_logic, same_query, validate_sql};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const NO_ISSUES_FEEDBACK: &str = "No semantic issues detected.";
pub const NO_OP_FEEDBACK: &str = "query already correct; absence of data explains empty result.";
const ABSENCE_MARKERS: [&str; 5] = ["missing", "not present", "absent", "does not exist", "doesn't exist"];
const KEYWORD_UNANSWERABLE_FEEDBACK: &str =
    "The question seems to reference fields not present in the schema. Please rephrase or use available columns.";

/// How a semantic verdict was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckOrigin {
    /// Well-formed model verdict, taken as is
    Model,
    /// Non-JSON completion, classified by keywords
    KeywordFallback,
    /// The completion call itself failed
    ServiceFailure(String),
    /// Model rewrite did not parse as SQL
    RejectedRewrite,
    /// Model rewrite left the filter logic untouched
    NoOpRewrite,
    /// A filter value is provably absent from the table
    AbsentValue,
}

impl CheckOrigin {
    pub fn is_failure(&self) -> bool {
        matches!(self, CheckOrigin::ServiceFailure(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticCheck {
    pub feedback: String,
    pub refined_sql: RefinedSql,
    pub origin: CheckOrigin,
}

impl SemanticCheck {
    fn keep(query: &str, feedback: impl Into<String>, origin: CheckOrigin) -> Self {
        Self {
            feedback: feedback.into(),
            refined_sql: RefinedSql::Answerable(query.to_string()),
            origin,
        }
    }
}

/// The only shape accepted from the model.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelVerdict {
    feedback: String,
    refined_sql: String,
}

pub struct SemanticReflector {
    llm: Arc<dyn CompletionService>,
    temperature: f32,
}

impl SemanticReflector {
    pub fn new(llm: Arc<dyn CompletionService>, temperature: f32) -> Self {
        Self { llm, temperature }
    }

    pub fn build_prompt(
        question: &str,
        query: &str,
        schema: &Schema,
        sample: &str,
        enrichment: Option<&EnrichmentContext>,
    ) -> String {
        let sample = if sample.trim().is_empty() {
            NO_OUTPUT_MARKER
        } else {
            sample
        };
        let data_context = enrichment
            .map(|context| context.render())
            .filter(|text| !text.is_empty())
            .map(|text| {
                format!(
                    "\nData context (values actually present in the table):\n{}\n",
                    text
                )
            })
            .unwrap_or_default();

        format!(
            r#"You are QueryMind, a SQL reasoning and reflection assistant.

Decide whether the SQL query logically answers the user's question, given the schema and what the query returned.

Question: {question}
SQL Query:
```sql
{query}
```
Schema:
{schema}

Sample output:
{sample}
{data_context}
Rules:
- If the question refers to a field that does not exist in the schema, the question cannot be answered. Respond with:
  {{"feedback": "The question references missing field(s): ['<missing_field_names>'] which do not exist in the schema.", "refined_sql": "NULL"}}
- If the query filters on a value the data context shows is not present, respond with:
  {{"feedback": "Filter value '<value>' is not present in <column>.", "refined_sql": "NULL"}}
- If the query asks for a time range the data context shows is not covered, respond with:
  {{"feedback": "No data exists for the requested period.", "refined_sql": "NULL"}}
- Otherwise keep the query exactly as given. Respond with:
  {{"feedback": "{no_issues}", "refined_sql": "<the SQL query above, unchanged>"}}
- Do not propose cosmetic or unfounded rewrites (reformatting, renaming, a different date or text format) that the data does not justify.
- Respond with one JSON object with exactly the keys "feedback" and "refined_sql" and nothing else."#,
            question = question,
            query = query,
            schema = schema.render(),
            sample = sample,
            data_context = data_context,
            no_issues = NO_ISSUES_FEEDBACK,
        )
    }

    /// Verdict for `query`. Service failures and malformed output degrade
    /// to a verdict instead of an error.
    pub async fn reflect_semantics(
        &self,
        question: &str,
        query: &str,
        schema: &Schema,
        sample: &str,
        enrichment: Option<&EnrichmentContext>,
    ) -> SemanticCheck {
        let prompt = Self::build_prompt(question, query, schema, sample, enrichment);
        let check = match self.llm.complete(&prompt, self.temperature).await {
            Ok(raw) => Self::parse_response(&raw, query),
            Err(e) => {
                warn!("Semantic check failed: {}", e);
                SemanticCheck::keep(
                    query,
                    format!("semantic check failed: {}", e),
                    CheckOrigin::ServiceFailure(e.to_string()),
                )
            }
        };

        match enrichment {
            Some(context) => ground_absent_values(check, query, context),
            None => check,
        }
    }

    /// Interpret one completion for `query`.
    pub fn parse_response(raw: &str, query: &str) -> SemanticCheck {
        let body = strip_code_fences(raw);
        let verdict = match serde_json::from_str::<ModelVerdict>(body) {
            Ok(verdict) => verdict,
            Err(e) => {
                debug!("Semantic response is not a verdict object: {}", e);
                return keyword_fallback(raw, query);
            }
        };

        let feedback = if verdict.feedback.trim().is_empty() {
            NO_ISSUES_FEEDBACK.to_string()
        } else {
            verdict.feedback.trim().to_string()
        };

        match RefinedSql::parse(&verdict.refined_sql, query) {
            RefinedSql::Unanswerable => SemanticCheck {
                feedback,
                refined_sql: RefinedSql::Unanswerable,
                origin: CheckOrigin::Model,
            },
            RefinedSql::Answerable(proposed) if same_query(&proposed, query) => {
                SemanticCheck::keep(query, feedback, CheckOrigin::Model)
            }
            RefinedSql::Answerable(proposed) => validate_rewrite(proposed, query, feedback),
        }
    }
}

fn keyword_fallback(raw: &str, query: &str) -> SemanticCheck {
    let lowered = raw.to_lowercase();
    if ABSENCE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        info!("Non-JSON semantic response mentions missing fields, treating as unanswerable");
        return SemanticCheck {
            feedback: KEYWORD_UNANSWERABLE_FEEDBACK.to_string(),
            refined_sql: RefinedSql::Unanswerable,
            origin: CheckOrigin::KeywordFallback,
        };
    }
    let preview: String = raw.trim().chars().take(120).collect();
    SemanticCheck::keep(
        query,
        format!("Model returned non-JSON output: {}...", preview),
        CheckOrigin::KeywordFallback,
    )
}

fn validate_rewrite(proposed: String, query: &str, feedback: String) -> SemanticCheck {
    if let Err(e) = validate_sql(&proposed) {
        warn!("Discarding unparseable rewrite: {}", e);
        return SemanticCheck::keep(
            query,
            format!("Rejected proposed rewrite ({}); keeping the original query.", e),
            CheckOrigin::RejectedRewrite,
        );
    }
    if same_filter_logic(query, &proposed) {
        debug!("Proposed rewrite keeps the same WHERE clause, reverting");
        return SemanticCheck::keep(query, NO_OP_FEEDBACK, CheckOrigin::NoOpRewrite);
    }
    SemanticCheck {
        feedback,
        refined_sql: RefinedSql::Answerable(proposed),
        origin: CheckOrigin::Model,
    }
}

/// Force "unanswerable" when a literal filter value is provably absent.
fn ground_absent_values(check: SemanticCheck, query: &str, context: &EnrichmentContext) -> SemanticCheck {
    let absent = context.absent_filter_values(query);
    if absent.is_empty() {
        return check;
    }
    info!("{} filter value(s) absent from the table", absent.len());
    SemanticCheck {
        feedback: absent_value_feedback(&absent),
        refined_sql: RefinedSql::Unanswerable,
        origin: CheckOrigin::AbsentValue,
    }
}

fn absent_value_feedback(absent: &[AbsentValue]) -> String {
    absent
        .iter()
        .map(|a| {
            let listed = if a.truncated {
                format!("first {} distinct values", a.available.len())
            } else {
                "available values".to_string()
            };
            format!(
                "Filter value '{}' does not exist in {}; {}: [{}].",
                a.value,
                a.column,
                listed,
                a.available.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}
