//! Anomaly Detector
//!
//! Structural and numeric checks over a result set. Pure: no I/O, no model
//! calls, same answer for the same rows.

use crate::config::CoverageRule;
use crate::execution::result::QueryResult;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anomaly {
    /// No rows at all; every other check is skipped
    EmptyResult,
    NegativeValues { columns: Vec<String> },
    DuplicateRows { count: usize },
    NullOnlyColumns { columns: Vec<String> },
    CoverageGap {
        column: String,
        present: usize,
        expected: usize,
    },
    /// Sentinel so callers always see at least one entry
    NoAnomalies,
}

impl Anomaly {
    pub fn is_negative_values(&self) -> bool {
        matches!(self, Anomaly::NegativeValues { .. })
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::EmptyResult => write!(f, "empty result — likely filter/join mismatch"),
            Anomaly::NegativeValues { columns } => write!(
                f,
                "negative values detected in {} (possible refunds or sign errors)",
                columns.join(", ")
            ),
            Anomaly::DuplicateRows { count } => {
                write!(f, "duplicate rows: {} repeated row(s) in result set", count)
            }
            Anomaly::NullOnlyColumns { columns } => {
                write!(f, "empty/null-only column(s): {}", columns.join(", "))
            }
            Anomaly::CoverageGap {
                column,
                present,
                expected,
            } => write!(
                f,
                "coverage gap: only {} of {} expected {} values present (possible filtering issue or incomplete data)",
                present, expected, column
            ),
            Anomaly::NoAnomalies => write!(f, "no anomalies detected"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    coverage_rules: Vec<CoverageRule>,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(vec![CoverageRule::new("region", 4)])
    }
}

impl AnomalyDetector {
    pub fn new(coverage_rules: Vec<CoverageRule>) -> Self {
        Self { coverage_rules }
    }

    /// Issue descriptions in fixed order; never empty.
    pub fn detect(&self, result: &QueryResult) -> Vec<String> {
        self.detect_anomalies(result)
            .iter()
            .map(|a| a.to_string())
            .collect()
    }

    pub fn detect_anomalies(&self, result: &QueryResult) -> Vec<Anomaly> {
        if result.is_empty() {
            return vec![Anomaly::EmptyResult];
        }

        let df = result.frame();
        let mut anomalies = Vec::new();

        let negative_columns: Vec<String> = df
            .get_columns()
            .iter()
            .filter(|s| s.dtype().is_numeric() && has_negative(s))
            .map(|s| s.name().to_string())
            .collect();
        if !negative_columns.is_empty() {
            anomalies.push(Anomaly::NegativeValues {
                columns: negative_columns,
            });
        }

        let duplicates = count_duplicate_rows(result);
        if duplicates > 0 {
            anomalies.push(Anomaly::DuplicateRows { count: duplicates });
        }

        let null_only: Vec<String> = df
            .get_columns()
            .iter()
            .filter(|s| s.null_count() == s.len())
            .map(|s| s.name().to_string())
            .collect();
        if !null_only.is_empty() {
            anomalies.push(Anomaly::NullOnlyColumns { columns: null_only });
        }

        for rule in &self.coverage_rules {
            let Some(series) = df
                .get_columns()
                .iter()
                .find(|s| s.name().eq_ignore_ascii_case(&rule.column))
            else {
                continue;
            };
            let present = series.drop_nulls().n_unique().unwrap_or(0);
            if present < rule.expected_values {
                anomalies.push(Anomaly::CoverageGap {
                    column: series.name().to_string(),
                    present,
                    expected: rule.expected_values,
                });
            }
        }

        if anomalies.is_empty() {
            anomalies.push(Anomaly::NoAnomalies);
        }
        anomalies
    }
}

fn has_negative(series: &Series) -> bool {
    series
        .cast(&DataType::Float64)
        .ok()
        .and_then(|cast| {
            cast.f64()
                .ok()
                .map(|ca| ca.into_iter().any(|v| matches!(v, Some(x) if x < 0.0)))
        })
        .unwrap_or(false)
}

/// Rows that repeat an earlier row exactly (first occurrence not counted).
fn count_duplicate_rows(result: &QueryResult) -> usize {
    let mut seen = HashSet::new();
    result
        .row_keys()
        .into_iter()
        .filter(|key| !seen.insert(key.clone()))
        .count()
}
