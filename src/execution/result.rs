//! Query Result - immutable view over the rows a generated query returned

use crate::error::{ReflectError, Result};
use polars::prelude::*;

/// Marker shown to the model in place of sample rows when nothing came back.
pub const NO_OUTPUT_MARKER: &str = "No output (the query returned an empty result set)";

/// Rows produced by executing a query against the active table.
///
/// Never mutated once built; the reflection pipeline only reads it.
#[derive(Debug, Clone)]
pub struct QueryResult {
    frame: DataFrame,
}

impl QueryResult {
    pub fn new(frame: DataFrame) -> Self {
        Self { frame }
    }

    /// An empty result that still carries its column names.
    pub fn empty(columns: &[&str]) -> Self {
        let series: Vec<Series> = columns
            .iter()
            .map(|name| Series::new_empty(name, &DataType::String))
            .collect();
        let frame = DataFrame::new(series).unwrap_or_else(|_| DataFrame::empty());
        Self { frame }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }

    pub fn row_count(&self) -> usize {
        self.frame.height()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.frame
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// First `limit` rows as JSON objects keyed by column name.
    pub fn sample_rows(&self, limit: usize) -> Result<Vec<serde_json::Value>> {
        let sample = self.frame.head(Some(limit));
        dataframe_to_json_rows(&sample)
    }

    /// Text form of the sample handed to prompts and used in fingerprints.
    pub fn render_sample(&self, limit: usize) -> String {
        if self.is_empty() {
            return NO_OUTPUT_MARKER.to_string();
        }
        match self.sample_rows(limit) {
            Ok(rows) => serde_json::to_string(&rows)
                .unwrap_or_else(|_| format!("{}", self.frame.head(Some(limit)))),
            Err(_) => format!("{}", self.frame.head(Some(limit))),
        }
    }

    /// One key per row that is equal for rows with identical values in
    /// every column (nulls included).
    pub fn row_keys(&self) -> Vec<String> {
        let columns = self.frame.get_columns();
        (0..self.frame.height())
            .map(|row_idx| {
                columns
                    .iter()
                    .map(|series| match series.get(row_idx) {
                        Ok(value) => format!("{:?}", value),
                        Err(_) => "?".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\u{1f}")
            })
            .collect()
    }

    /// Full textual content (column names, dtypes, every row) for cache keys.
    pub fn content_signature(&self) -> String {
        let header = self
            .frame
            .get_columns()
            .iter()
            .map(|s| format!("{}:{}", s.name(), s.dtype()))
            .collect::<Vec<_>>()
            .join(",");
        let mut signature = header;
        for key in self.row_keys() {
            signature.push('\n');
            signature.push_str(&key);
        }
        signature
    }
}

impl From<DataFrame> for QueryResult {
    fn from(frame: DataFrame) -> Self {
        Self::new(frame)
    }
}

/// Plain text for a cell, `None` for nulls. Strings come back unquoted.
pub fn any_value_to_text(value: &AnyValue) -> Option<String> {
    match value {
        AnyValue::Null => None,
        AnyValue::String(s) => Some(s.to_string()),
        other => Some(format!("{}", other)),
    }
}

fn dataframe_to_json_rows(df: &DataFrame) -> Result<Vec<serde_json::Value>> {
    let mut rows = Vec::with_capacity(df.height());
    let columns = df.get_columns();

    for row_idx in 0..df.height() {
        let mut row = serde_json::Map::new();
        for series in columns {
            let value = series_to_json_value(series, row_idx)?;
            row.insert(series.name().to_string(), value);
        }
        rows.push(serde_json::Value::Object(row));
    }

    Ok(rows)
}

fn series_to_json_value(series: &Series, row_idx: usize) -> Result<serde_json::Value> {
    let any_val = series
        .get(row_idx)
        .map_err(|e| ReflectError::Polars(format!("Failed to get value: {}", e)))?;

    match any_val {
        AnyValue::Null => Ok(serde_json::Value::Null),
        AnyValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        AnyValue::String(s) => Ok(serde_json::Value::String(s.to_string())),
        AnyValue::Int8(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::Int16(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::Int32(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::Int64(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::UInt8(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::UInt16(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::UInt32(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::UInt64(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::Float32(f) => Ok(serde_json::Number::from_f64(f as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        AnyValue::Float64(f) => Ok(serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        other => Ok(any_value_to_text(&other)
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_sample_for_empty_result() {
        let result = QueryResult::empty(&["region", "revenue"]);
        assert!(result.is_empty());
        assert_eq!(result.column_names(), vec!["region", "revenue"]);
        assert_eq!(result.render_sample(3), NO_OUTPUT_MARKER);
    }

    #[test]
    fn test_sample_rows_are_limited() {
        let df = df![
            "product_name" => ["iPhone 15 Pro", "AirPods Pro", "MacBook Air M3", "Apple Watch"],
            "revenue" => [999.0, 249.0, 1299.0, 399.0]
        ]
        .unwrap();
        let result = QueryResult::new(df);
        let rows = result.sample_rows(3).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1]["product_name"], "AirPods Pro");
        assert_eq!(rows[1]["revenue"], 249.0);
    }

    #[test]
    fn test_row_keys_match_for_identical_rows() {
        let df = df![
            "region" => [Some("North"), Some("North"), None],
            "qty" => [1i64, 1, 1]
        ]
        .unwrap();
        let keys = QueryResult::new(df).row_keys();
        assert_eq!(keys[0], keys[1]);
        assert_ne!(keys[0], keys[2]);
    }

    #[test]
    fn test_content_signature_differs_by_rows() {
        let a = QueryResult::new(df!["revenue" => [1.0]].unwrap());
        let b = QueryResult::new(df!["revenue" => [2.0]].unwrap());
        assert_ne!(a.content_signature(), b.content_signature());
    }
}
