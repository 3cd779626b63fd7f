//! Context Enricher
//!
//! Grounds reasoning about an empty result in what the active table really
//! holds: distinct values of the columns the query filters on, and the
//! overall timestamp range. Everything here is best-effort; the
//! pipeline-facing methods never fail, the `try_*` variants say why.

use crate::error::{ReflectError, Result};
use crate::execution::result::any_value_to_text;
use crate::execution::store::{quote_identifier, BackingStore};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

lazy_static! {
    static ref FILTERED_COLUMN: Regex =
        Regex::new(r"(?i)\b(?:WHERE|AND|OR)\s+(?:\w+\.)?(\w+)\b\s*(?:=|LIKE\b|IN\b)").unwrap();
    static ref EQUALS_LITERAL: Regex =
        Regex::new(r"(?i)\b(?:WHERE|AND|OR)\s+(?:\w+\.)?(\w+)\s*=\s*'((?:[^']|'')*)'").unwrap();
    static ref LIKE_LITERAL: Regex =
        Regex::new(r"(?i)\b(?:WHERE|AND|OR)\s+(?:\w+\.)?(\w+)\s+LIKE\s+'((?:[^']|'')*)'").unwrap();
    static ref IN_LIST: Regex =
        Regex::new(r"(?i)\b(?:WHERE|AND|OR)\s+(?:\w+\.)?(\w+)\s+IN\s*\(([^)]*)\)").unwrap();
    static ref QUOTED: Regex = Regex::new(r"'((?:[^']|'')*)'").unwrap();
}

/// Column names compared with `=`, `LIKE` or `IN` after WHERE/AND/OR,
/// in first-seen order without duplicates.
pub fn filtered_columns(query: &str) -> Vec<String> {
    FILTERED_COLUMN
        .captures_iter(query)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unique_by(|name| name.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterKind {
    Equals,
    Like,
    In,
}

/// A text literal the query filters a column by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiteralFilter {
    pub column: String,
    pub kind: FilterKind,
    /// Unescaped literal(s); for LIKE the raw pattern.
    pub values: Vec<String>,
}

impl LiteralFilter {
    /// Whether `candidate` would satisfy this filter for one of its values.
    fn admits(&self, candidate: &str) -> bool {
        self.values.iter().any(|value| match self.kind {
            FilterKind::Equals | FilterKind::In => candidate == value,
            FilterKind::Like => like_matches(value, candidate),
        })
    }
}

fn unescape_literal(raw: &str) -> String {
    raw.replace("''", "'")
}

/// Single-quoted text filters in the query.
pub fn literal_filters(query: &str) -> Vec<LiteralFilter> {
    let mut filters = Vec::new();
    for caps in EQUALS_LITERAL.captures_iter(query) {
        filters.push(LiteralFilter {
            column: caps[1].to_string(),
            kind: FilterKind::Equals,
            values: vec![unescape_literal(&caps[2])],
        });
    }
    for caps in LIKE_LITERAL.captures_iter(query) {
        filters.push(LiteralFilter {
            column: caps[1].to_string(),
            kind: FilterKind::Like,
            values: vec![unescape_literal(&caps[2])],
        });
    }
    for caps in IN_LIST.captures_iter(query) {
        let values: Vec<String> = QUOTED
            .captures_iter(&caps[2])
            .map(|v| unescape_literal(&v[1]))
            .collect();
        if !values.is_empty() {
            filters.push(LiteralFilter {
                column: caps[1].to_string(),
                kind: FilterKind::In,
                values,
            });
        }
    }
    filters
}

/// SQLite-style LIKE for the common `%text%` / `text%` / `%text` shapes,
/// ASCII case-insensitive. Other wildcard placements count as a match so
/// they are never reported absent.
fn like_matches(pattern: &str, candidate: &str) -> bool {
    let leading = pattern.starts_with('%');
    let trailing = pattern.len() > 1 && pattern.ends_with('%');
    let core = pattern.trim_matches('%');
    if core.contains('%') || core.contains('_') {
        return true;
    }
    let core = core.to_ascii_lowercase();
    let candidate = candidate.to_ascii_lowercase();
    match (leading, trailing) {
        (true, true) => candidate.contains(&core),
        (false, true) => candidate.starts_with(&core),
        (true, false) => candidate.ends_with(&core),
        (false, false) => candidate == core,
    }
}

/// A filter value the table provably does not contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbsentValue {
    pub column: String,
    pub value: String,
    pub available: Vec<String>,
    /// The sample hit its limit, so `available` may not list every value.
    pub truncated: bool,
}

/// What enrichment found for one empty result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentContext {
    /// (column, distinct values) in filter order
    pub column_values: Vec<(String, Vec<String>)>,
    pub date_range: String,
    pub sample_limit: usize,
}

impl EnrichmentContext {
    pub fn is_empty(&self) -> bool {
        self.column_values.is_empty() && self.date_range.is_empty()
    }

    pub fn values_for(&self, column: &str) -> Option<&[String]> {
        self.column_values
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, values)| values.as_slice())
    }

    /// Prompt section; empty when nothing was found.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for (column, values) in &self.column_values {
            lines.push(format!(
                "- Distinct values of {} in the table: [{}]",
                column,
                values.join(", ")
            ));
        }
        if !self.date_range.is_empty() {
            lines.push(format!("- {}", self.date_range));
        }
        lines.join("\n")
    }

    /// Literal filter values missing from their column's sample.
    ///
    /// An IN list counts as absent only when none of its values exist. A
    /// sample that reached the limit is still used, flagged as truncated.
    pub fn absent_filter_values(&self, query: &str) -> Vec<AbsentValue> {
        let mut absent = Vec::new();
        for filter in literal_filters(query) {
            let Some(values) = self.values_for(&filter.column) else {
                continue;
            };
            if values.iter().any(|candidate| filter.admits(candidate)) {
                continue;
            }
            let truncated = self.sample_limit > 0 && values.len() >= self.sample_limit;
            for value in &filter.values {
                absent.push(AbsentValue {
                    column: filter.column.clone(),
                    value: value.clone(),
                    available: values.to_vec(),
                    truncated,
                });
            }
        }
        absent
    }

    /// Whether `value` is one of the sampled values of any column.
    pub fn contains_value(&self, value: &str) -> bool {
        self.column_values
            .iter()
            .any(|(_, values)| values.iter().any(|v| v == value))
    }
}

/// Backing-store lookups scoped to the active table.
pub struct ContextEnricher {
    store: Box<dyn BackingStore>,
    active_table: String,
    timestamp_column: String,
    sample_cache: HashMap<(String, String, usize), Vec<String>>,
}

impl ContextEnricher {
    pub fn new(
        store: Box<dyn BackingStore>,
        active_table: impl Into<String>,
        timestamp_column: impl Into<String>,
    ) -> Self {
        Self {
            store,
            active_table: active_table.into(),
            timestamp_column: timestamp_column.into(),
            sample_cache: HashMap::new(),
        }
    }

    pub fn store(&self) -> &dyn BackingStore {
        self.store.as_ref()
    }

    pub fn active_table(&self) -> &str {
        &self.active_table
    }

    /// Switch tables; sampled values of the previous table are dropped.
    pub fn set_active_table(&mut self, table: impl Into<String>) {
        let table = table.into();
        if table != self.active_table {
            debug!(
                "Active table {} -> {}, dropping {} sampled column(s)",
                self.active_table,
                table,
                self.sample_cache.len()
            );
            self.active_table = table;
            self.sample_cache.clear();
        }
    }

    pub fn try_sample_column_values(&mut self, column: &str, limit: usize) -> Result<Vec<String>> {
        let key = (self.active_table.clone(), column.to_string(), limit);
        if let Some(values) = self.sample_cache.get(&key) {
            return Ok(values.clone());
        }

        let column = self.resolve_column(column)?;
        let column_ident = quote_identifier(&column);
        let sql = format!(
            "SELECT DISTINCT {col} FROM {table} WHERE {col} IS NOT NULL LIMIT {limit}",
            col = column_ident,
            table = quote_identifier(&self.active_table),
            limit = limit
        );
        let df = self.store.query(&sql)?;
        let series = df
            .get_columns()
            .first()
            .ok_or_else(|| ReflectError::Store(format!("No column returned for {}", column)))?;

        let mut values = Vec::with_capacity(series.len());
        for idx in 0..series.len() {
            let value = series
                .get(idx)
                .map_err(|e| ReflectError::Polars(format!("Failed to read {}: {}", column, e)))?;
            if let Some(text) = any_value_to_text(&value) {
                values.push(text);
            }
        }

        self.sample_cache.insert(key, values.clone());
        Ok(values)
    }

    /// Up to `limit` distinct non-null values; empty on any failure.
    pub fn sample_column_values(&mut self, column: &str, limit: usize) -> Vec<String> {
        match self.try_sample_column_values(column, limit) {
            Ok(values) => values,
            Err(e) => {
                warn!("Could not sample {}.{}: {}", self.active_table, column, e);
                Vec::new()
            }
        }
    }

    /// Canonical spelling of `column` in the active table.
    ///
    /// SQLite reads an unknown double-quoted identifier as a string literal,
    /// so existence is checked before any column is interpolated.
    fn resolve_column(&self, column: &str) -> Result<String> {
        let schema = self.store.table_schema(&self.active_table)?;
        schema
            .columns()
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column))
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                ReflectError::Store(format!(
                    "Column '{}' does not exist in {}",
                    column, self.active_table
                ))
            })
    }

    pub fn try_date_range_stats(&self) -> Result<String> {
        let ts = quote_identifier(&self.resolve_column(&self.timestamp_column)?);
        let sql = format!(
            "SELECT MIN({ts}) AS min_ts, MAX({ts}) AS max_ts, COUNT(*) AS row_count FROM {table}",
            ts = ts,
            table = quote_identifier(&self.active_table)
        );
        let df = self.store.query(&sql)?;
        if df.height() == 0 || df.width() < 3 {
            return Err(ReflectError::Store("Date range query returned no row".to_string()));
        }

        let cell = |idx: usize| -> Result<Option<String>> {
            let value = df.get_columns()[idx]
                .get(0)
                .map_err(|e| ReflectError::Polars(format!("Failed to read date range: {}", e)))?;
            Ok(any_value_to_text(&value))
        };
        let rows = cell(2)?.unwrap_or_else(|| "0".to_string());
        match (cell(0)?, cell(1)?) {
            (Some(min), Some(max)) => Ok(format!(
                "Data in {} spans {} to {} ({} rows)",
                self.active_table, min, max, rows
            )),
            _ => Ok(format!(
                "Data in {} has no {} values ({} rows)",
                self.active_table, self.timestamp_column, rows
            )),
        }
    }

    /// Min/max timestamp and row count, or "" on failure.
    pub fn date_range_stats(&self) -> String {
        self.try_date_range_stats().unwrap_or_else(|e| {
            warn!("Could not read date range of {}: {}", self.active_table, e);
            String::new()
        })
    }

    /// Enrichment for an empty result of `query`.
    pub fn gather(&mut self, query: &str, limit: usize) -> EnrichmentContext {
        let column_values = filtered_columns(query)
            .into_iter()
            .filter_map(|column| {
                let values = self.sample_column_values(&column, limit);
                (!values.is_empty()).then_some((column, values))
            })
            .collect();

        EnrichmentContext {
            column_values,
            date_range: self.date_range_stats(),
            sample_limit: limit,
        }
    }

    pub fn cache_len(&self) -> usize {
        self.sample_cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.sample_cache.clear();
    }
}
