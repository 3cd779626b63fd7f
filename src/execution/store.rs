//! Backing Store
//!
//! Read-only SQL access to the table the assistant queries. The reflection
//! pipeline only issues small probes here (distinct values, timestamp range);
//! the assistant loop also executes generated queries through it.

use crate::error::{ReflectError, Result};
use crate::schema::{ColumnDef, Schema};
use lazy_static::lazy_static;
use polars::prelude::*;
use polars::sql::SQLContext;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

lazy_static! {
    static ref NON_WORD: Regex = Regex::new(r"\W+").unwrap();
}

/// Anything that can run a read-only query and describe a table.
pub trait BackingStore: Send {
    fn name(&self) -> &'static str;

    fn query(&self, sql: &str) -> Result<DataFrame>;

    fn table_schema(&self, table: &str) -> Result<Schema>;
}

/// Double-quote an identifier for interpolation into SQL text.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            ReflectError::Store(format!("Failed to open SQLite database {:?}: {}", path, e))
        })?;
        info!("Opened SQLite store at {:?}", path);
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ReflectError::Store(format!("Failed to open in-memory SQLite: {}", e)))?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl BackingStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn query(&self, sql: &str) -> Result<DataFrame> {
        debug!("sqlite query: {}", sql);
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| ReflectError::Sql(format!("Failed to prepare '{}': {}", sql, e)))?;

        let names = dedupe_column_names(stmt.column_names().iter().map(|s| s.to_string()).collect());
        let mut columns: Vec<Vec<Value>> = vec![Vec::new(); names.len()];

        let mut rows = stmt
            .query([])
            .map_err(|e| ReflectError::Sql(format!("Failed to execute '{}': {}", sql, e)))?;
        while let Some(row) = rows
            .next()
            .map_err(|e| ReflectError::Sql(format!("Failed to read row: {}", e)))?
        {
            for (idx, column) in columns.iter_mut().enumerate() {
                let value: Value = row
                    .get(idx)
                    .map_err(|e| ReflectError::Sql(format!("Failed to read column {}: {}", idx, e)))?;
                column.push(value);
            }
        }

        let series: Vec<Series> = names
            .iter()
            .zip(columns)
            .map(|(name, values)| values_to_series(name, values))
            .collect();

        DataFrame::new(series)
            .map_err(|e| ReflectError::Polars(format!("Failed to build result frame: {}", e)))
    }

    fn table_schema(&self, table: &str) -> Result<Schema> {
        let sql = format!("PRAGMA table_info({})", quote_identifier(table));
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| ReflectError::Sql(format!("Failed to prepare '{}': {}", sql, e)))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnDef::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(|e| ReflectError::Sql(format!("Failed to read schema of {}: {}", table, e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ReflectError::Sql(format!("Failed to read schema of {}: {}", table, e)))?;

        if columns.is_empty() {
            return Err(ReflectError::Store(format!("Table '{}' does not exist", table)));
        }
        Ok(Schema::new(columns))
    }
}

/// Type a SQLite column the way its values allow: Int64 when every
/// non-null value is an integer, Float64 when every one is numeric, String
/// otherwise.
fn values_to_series(name: &str, values: Vec<Value>) -> Series {
    let all_integer = values
        .iter()
        .all(|v| matches!(v, Value::Null | Value::Integer(_)));
    let all_numeric = values
        .iter()
        .all(|v| matches!(v, Value::Null | Value::Integer(_) | Value::Real(_)));

    if all_integer {
        let data: Vec<Option<i64>> = values
            .iter()
            .map(|v| match v {
                Value::Integer(i) => Some(*i),
                _ => None,
            })
            .collect();
        Series::new(name, data)
    } else if all_numeric {
        let data: Vec<Option<f64>> = values
            .iter()
            .map(|v| match v {
                Value::Integer(i) => Some(*i as f64),
                Value::Real(f) => Some(*f),
                _ => None,
            })
            .collect();
        Series::new(name, data)
    } else {
        let data: Vec<Option<String>> = values
            .into_iter()
            .map(|v| match v {
                Value::Null => None,
                Value::Integer(i) => Some(i.to_string()),
                Value::Real(f) => Some(f.to_string()),
                Value::Text(s) => Some(s),
                Value::Blob(b) => Some(format!("<{} bytes>", b.len())),
            })
            .collect();
        Series::new(name, data)
    }
}

fn dedupe_column_names(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let mut candidate = name.clone();
            let mut suffix = 1;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{}_{}", name, suffix);
                suffix += 1;
            }
            candidate
        })
        .collect()
}

/// In-memory polars frames queried through polars SQL.
#[derive(Default)]
pub struct FrameStore {
    frames: HashMap<String, DataFrame>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: impl Into<String>, frame: DataFrame) {
        self.frames.insert(table.into(), frame);
    }

    /// Load a CSV file as `table`, with column names reduced to word
    /// characters (runs of anything else become `_`).
    pub fn from_csv(table: impl Into<String>, csv_path: &Path) -> Result<Self> {
        let mut df = LazyCsvReader::new(csv_path)
            .with_infer_schema_length(Some(10000))
            .finish()
            .map_err(|e| {
                ReflectError::Polars(format!("Failed to read CSV file {:?}: {}", csv_path, e))
            })?
            .collect()
            .map_err(|e| ReflectError::Polars(format!("Failed to collect CSV data: {}", e)))?;

        let names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|name| sanitize_column_name(name))
            .collect();
        df.set_column_names(names.as_slice())
            .map_err(|e| ReflectError::Polars(format!("Failed to rename CSV columns: {}", e)))?;

        let table = table.into();
        info!(
            "Loaded {:?} as table '{}': {} rows, {} columns",
            csv_path,
            table,
            df.height(),
            df.width()
        );

        let mut store = Self::new();
        store.register(table, df);
        Ok(store)
    }
}

pub fn sanitize_column_name(name: &str) -> String {
    NON_WORD.replace_all(name.trim(), "_").to_string()
}

impl BackingStore for FrameStore {
    fn name(&self) -> &'static str {
        "polars"
    }

    fn query(&self, sql: &str) -> Result<DataFrame> {
        debug!("polars sql query: {}", sql);
        let mut ctx = SQLContext::new();
        for (table, frame) in &self.frames {
            ctx.register(table, frame.clone().lazy());
        }
        ctx.execute(sql)
            .map_err(|e| ReflectError::Sql(format!("Failed to plan '{}': {}", sql, e)))?
            .collect()
            .map_err(|e| ReflectError::Sql(format!("Failed to execute '{}': {}", sql, e)))
    }

    fn table_schema(&self, table: &str) -> Result<Schema> {
        let frame = self
            .frames
            .get(table)
            .ok_or_else(|| ReflectError::Store(format!("Table '{}' does not exist", table)))?;
        let columns = frame
            .get_columns()
            .iter()
            .map(|series| ColumnDef::new(series.name(), sql_type_name(series.dtype())))
            .collect();
        Ok(Schema::new(columns))
    }
}

fn sql_type_name(dtype: &DataType) -> String {
    match dtype {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => "INTEGER".to_string(),
        DataType::Float32 | DataType::Float64 => "REAL".to_string(),
        DataType::String => "TEXT".to_string(),
        DataType::Boolean => "BOOLEAN".to_string(),
        DataType::Date | DataType::Datetime(_, _) => "DATETIME".to_string(),
        other => other.to_string().to_uppercase(),
    }
}
