//! Table schema as seen by prompts and the static field checker.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub declared_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
        }
    }
}

/// Ordered `(column name, declared type)` pairs for the active table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnDef>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|(name, declared_type)| ColumnDef::new(*name, *declared_type))
                .collect(),
        )
    }

    /// Parse the `name (TYPE)` line format produced by [`Schema::render`].
    /// Lines without a parenthesised type are ignored.
    pub fn parse(text: &str) -> Self {
        let columns = text
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                let open = line.find('(')?;
                let name = line[..open].trim();
                let declared_type = line[open + 1..].trim_end_matches(')').trim();
                if name.is_empty() {
                    return None;
                }
                Some(ColumnDef::new(name, declared_type))
            })
            .collect();
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// One `name (TYPE)` line per column.
    pub fn render(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.declared_type))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}
