//! Reflection Engine
//!
//! Orchestrates one reflection pass over a query result:
//!
//! ```text
//! cache hit?  → cached verdict
//! anomalies   → negative values? deterministic SUM(ABS()) rewrite + explanation
//!             → otherwise: enrichment (empty result only) → semantic check
//!               → static field fallback → explanation (grounded message for NULL)
//! ```
//!
//! Every path returns a well-formed [`ReflectionVerdict`]; completion and
//! store failures degrade the verdict instead of surfacing as errors.

use crate::config::ReflectionConfig;
use crate::execution::result::QueryResult;
use crate::execution::store::BackingStore;
use crate::llm::CompletionService;
use crate::reflection::anomaly::AnomalyDetector;
use crate::reflection::cache::{fingerprint, CacheLayer, CacheStats};
use crate::reflection::enricher::{ContextEnricher, EnrichmentContext};
use crate::reflection::explain::{grounded_unanswerable_message, unavailable_placeholder, ExplanationGenerator};
use crate::reflection::field_check::find_unknown_terms;
use crate::reflection::rewrite::{absolute_sums, same_query};
use crate::reflection::semantic::SemanticReflector;
use crate::schema::Schema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const NEGATIVE_TOTALS_FEEDBACK: &str =
    "Detected negative totals from refunds; added ABS() around SUM() for correction.";
const NEGATIVE_WITHOUT_SUM_FEEDBACK: &str =
    "Detected negative values, but the query has no SUM() aggregate to correct.";

/// Corrected query, or the verdict that the question cannot be answered.
///
/// Written and read as the query text or exactly `NULL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefinedSql {
    Answerable(String),
    Unanswerable,
}

impl RefinedSql {
    pub const SENTINEL: &'static str = "NULL";

    /// Interpret model output for `original`; blank output keeps `original`.
    pub fn parse(text: &str, original: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            RefinedSql::Answerable(original.to_string())
        } else {
            Self::from_text(trimmed)
        }
    }

    fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case(Self::SENTINEL) {
            RefinedSql::Unanswerable
        } else {
            RefinedSql::Answerable(trimmed.to_string())
        }
    }

    pub fn is_unanswerable(&self) -> bool {
        matches!(self, RefinedSql::Unanswerable)
    }

    pub fn as_sql(&self) -> Option<&str> {
        match self {
            RefinedSql::Answerable(sql) => Some(sql),
            RefinedSql::Unanswerable => None,
        }
    }
}

impl fmt::Display for RefinedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefinedSql::Answerable(sql) => write!(f, "{}", sql),
            RefinedSql::Unanswerable => write!(f, "{}", Self::SENTINEL),
        }
    }
}

impl Serialize for RefinedSql {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RefinedSql {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self::from_text(&text))
    }
}

/// Output of one reflection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionVerdict {
    pub issues: Vec<String>,
    pub feedback: String,
    pub refined_sql: RefinedSql,
    pub explanation: String,
}

pub struct ReflectionEngine {
    detector: AnomalyDetector,
    enricher: ContextEnricher,
    semantic: SemanticReflector,
    explainer: ExplanationGenerator,
    cache: CacheLayer,
    config: ReflectionConfig,
}

impl ReflectionEngine {
    pub fn new(llm: Arc<dyn CompletionService>, store: Box<dyn BackingStore>, config: ReflectionConfig) -> Self {
        Self {
            detector: AnomalyDetector::new(config.coverage_rules.clone()),
            enricher: ContextEnricher::new(store, config.active_table.clone(), config.timestamp_column.clone()),
            semantic: SemanticReflector::new(llm.clone(), config.semantic_temperature),
            explainer: ExplanationGenerator::new(llm, config.explanation_temperature),
            cache: CacheLayer::new(config.cache_capacity),
            config,
        }
    }

    pub fn config(&self) -> &ReflectionConfig {
        &self.config
    }

    pub fn active_table(&self) -> &str {
        &self.config.active_table
    }

    pub fn store(&self) -> &dyn BackingStore {
        self.enricher.store()
    }

    /// Point enrichment at another table; its sampled values are dropped.
    pub fn set_active_table(&mut self, table: impl Into<String>) {
        let table = table.into();
        info!("Switching active table to {}", table);
        self.enricher.set_active_table(table.clone());
        self.config.active_table = table;
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.enricher.clear_cache();
        info!("Reflection caches cleared");
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let reflection = self.cache.reflection.len();
        let semantic = self.cache.semantic.len();
        let explanation = self.cache.explanation.len();
        let column_values = self.enricher.cache_len();
        CacheStats {
            reflection,
            semantic,
            explanation,
            column_values,
            total: reflection + semantic + explanation + column_values,
        }
    }

    /// Diagnose `result` of `query` for `question` and propose at most one
    /// corrected query.
    pub async fn reflect(
        &mut self,
        question: &str,
        query: &str,
        result: &QueryResult,
        schema: &Schema,
    ) -> ReflectionVerdict {
        let key = fingerprint(&[
            &self.config.active_table,
            question,
            query,
            &result.content_signature(),
            &schema.render(),
        ]);
        if let Some(verdict) = self.cache.reflection.get(&key) {
            debug!("Reflection cache hit");
            return verdict;
        }
        debug!("Reflection cache miss");

        let anomalies = self.detector.detect_anomalies(result);
        let issues: Vec<String> = anomalies.iter().map(|a| a.to_string()).collect();
        info!("Detected {} issue(s): {:?}", issues.len(), issues);
        let sample = result.render_sample(self.config.sample_rows);

        let (verdict, degraded) = if anomalies.iter().any(|a| a.is_negative_values()) {
            self.correct_negative_totals(issues, query, &sample).await
        } else {
            self.semantic_pass(issues, question, query, result, schema, &sample).await
        };

        if degraded {
            debug!("Not caching a degraded verdict");
        } else {
            self.cache.reflection.put(key, verdict.clone());
        }
        verdict
    }

    async fn correct_negative_totals(
        &mut self,
        issues: Vec<String>,
        query: &str,
        sample: &str,
    ) -> (ReflectionVerdict, bool) {
        let fixed = absolute_sums(query);
        let feedback = if fixed == query {
            NEGATIVE_WITHOUT_SUM_FEEDBACK
        } else {
            NEGATIVE_TOTALS_FEEDBACK
        };
        info!("Negative values present, rewrote SUM aggregates");

        let (explanation, explained) = self.explanation_for(&issues, feedback, query, &fixed, sample).await;
        let verdict = ReflectionVerdict {
            issues,
            feedback: feedback.to_string(),
            refined_sql: RefinedSql::Answerable(fixed),
            explanation,
        };
        (verdict, !explained)
    }

    async fn semantic_pass(
        &mut self,
        issues: Vec<String>,
        question: &str,
        query: &str,
        result: &QueryResult,
        schema: &Schema,
        sample: &str,
    ) -> (ReflectionVerdict, bool) {
        let mut enrichment: Option<EnrichmentContext> = None;
        let semantic_key = fingerprint(&[&self.config.active_table, question, query, &schema.render(), sample]);

        let check = match self.cache.semantic.get(&semantic_key) {
            Some(check) => {
                debug!("Semantic cache hit");
                check
            }
            None => {
                if result.is_empty() {
                    enrichment = Some(self.enricher.gather(query, self.config.column_sample_limit));
                }
                let check = self
                    .semantic
                    .reflect_semantics(question, query, schema, sample, enrichment.as_ref())
                    .await;
                if !check.origin.is_failure() {
                    self.cache.semantic.put(semantic_key, check.clone());
                }
                check
            }
        };
        let mut degraded = check.origin.is_failure();
        let mut feedback = check.feedback;
        let mut refined_sql = check.refined_sql;

        let kept_original = matches!(&refined_sql, RefinedSql::Answerable(sql) if same_query(sql, query));
        if kept_original && !feedback.to_lowercase().contains("missing") {
            let unknown = find_unknown_terms(question, schema);
            if !unknown.is_empty() {
                info!("Static field check flagged {:?}", unknown);
                feedback = format!(
                    "The question references missing field(s): [{}]. Please rephrase or use available fields.",
                    unknown.iter().map(|t| format!("'{}'", t)).collect::<Vec<_>>().join(", ")
                );
                refined_sql = RefinedSql::Unanswerable;
            }
        }

        let explanation = match &refined_sql {
            RefinedSql::Unanswerable => {
                if enrichment.is_none() && result.is_empty() {
                    enrichment = Some(self.enricher.gather(query, self.config.column_sample_limit));
                }
                grounded_unanswerable_message(&feedback, query, schema, enrichment.as_ref())
            }
            RefinedSql::Answerable(sql) => {
                let (text, explained) = self.explanation_for(&issues, &feedback, query, sql, sample).await;
                degraded |= !explained;
                text
            }
        };

        let verdict = ReflectionVerdict {
            issues,
            feedback,
            refined_sql,
            explanation,
        };
        (verdict, degraded)
    }

    /// Cached explanation; the flag is false when only a placeholder could
    /// be produced.
    async fn explanation_for(
        &mut self,
        issues: &[String],
        feedback: &str,
        old_sql: &str,
        new_sql: &str,
        sample: &str,
    ) -> (String, bool) {
        let key = fingerprint(&[&issues.join("\n"), feedback, old_sql, new_sql]);
        if let Some(text) = self.cache.explanation.get(&key) {
            debug!("Explanation cache hit");
            return (text, true);
        }
        match self.explainer.try_explain(issues, feedback, old_sql, new_sql, sample).await {
            Ok(text) => {
                self.cache.explanation.put(key, text.clone());
                (text, true)
            }
            Err(e) => {
                warn!("Explanation generation failed: {}", e);
                (unavailable_placeholder(&e.to_string()), false)
            }
        }
    }
}
