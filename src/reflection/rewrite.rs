//! Query text helpers: aggregate rewrite, WHERE-clause comparison, syntax check.
//!
//! The aggregate rewrite walks the text with a small quote- and
//! parenthesis-aware scanner instead of a regex, so nested calls such as
//! `SUM(qty * (price - discount))` are wrapped whole.

use crate::error::{ReflectError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

lazy_static! {
    static ref WHERE_CLAUSE: Regex = Regex::new(
        r"(?is)\bWHERE\b(.*?)(?:\bGROUP\s+BY\b|\bORDER\s+BY\b|\bHAVING\b|\bLIMIT\b|\bUNION\b|;|$)"
    )
    .unwrap();
}

/// Wrap the argument of every `function(...)` call in `wrapper(...)`,
/// matching the function name case-insensitively.
///
/// Arguments already wrapped are left alone, `DISTINCT` stays in front of
/// the wrapper, and names that merely end in `function` (`CHECKSUM`) are
/// not touched.
pub fn wrap_aggregate_arguments(sql: &str, function: &str, wrapper: &str) -> String {
    let bytes = sql.as_bytes();
    let name = function.as_bytes();
    let mut out = String::with_capacity(sql.len() + 16);
    let mut last = 0;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if b == b'\'' || b == b'"' || b == b'`' {
            quote = Some(b);
            i += 1;
            continue;
        }

        let starts_call = i + name.len() <= bytes.len()
            && bytes[i..i + name.len()].eq_ignore_ascii_case(name)
            && (i == 0 || !is_identifier_byte(bytes[i - 1]));
        if starts_call {
            let mut open = i + name.len();
            while open < bytes.len() && bytes[open].is_ascii_whitespace() {
                open += 1;
            }
            if open < bytes.len() && bytes[open] == b'(' {
                if let Some(close) = matching_paren(bytes, open) {
                    let argument = &sql[open + 1..close];
                    if !is_call_of(argument, wrapper) {
                        let (distinct, expression) = split_distinct(argument);
                        out.push_str(&sql[last..open + 1]);
                        out.push_str(distinct);
                        out.push_str(wrapper);
                        out.push('(');
                        out.push_str(expression);
                        out.push(')');
                        last = close;
                    }
                    i = close;
                    continue;
                }
            }
        }
        i += 1;
    }

    out.push_str(&sql[last..]);
    out
}

/// `SUM(x)` → `SUM(ABS(x))` for every SUM call.
pub fn absolute_sums(sql: &str) -> String {
    wrap_aggregate_arguments(sql, "SUM", "ABS")
}

fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

/// Index of the `)` closing the `(` at `open`, skipping quoted text.
fn matching_paren(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    for (idx, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// True when `expression` is exactly one call of `function(...)`.
fn is_call_of(expression: &str, function: &str) -> bool {
    let trimmed = expression.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() <= function.len()
        || !bytes[..function.len()].eq_ignore_ascii_case(function.as_bytes())
    {
        return false;
    }
    let mut open = function.len();
    while open < bytes.len() && bytes[open].is_ascii_whitespace() {
        open += 1;
    }
    open < bytes.len()
        && bytes[open] == b'('
        && matching_paren(bytes, open) == Some(bytes.len() - 1)
}

fn split_distinct(argument: &str) -> (&str, &str) {
    let leading = argument.len() - argument.trim_start().len();
    let rest = &argument[leading..];
    let bytes = rest.as_bytes();
    if bytes.len() > 8
        && bytes[..8].eq_ignore_ascii_case(b"DISTINCT")
        && bytes[8].is_ascii_whitespace()
    {
        let after = rest[8..].trim_start();
        let split = argument.len() - after.len();
        (&argument[..split], after)
    } else {
        ("", argument)
    }
}

/// Body of the first WHERE clause, up to GROUP BY / ORDER BY / HAVING /
/// LIMIT / UNION / `;` or the end of the text.
pub fn where_clause(sql: &str) -> Option<String> {
    WHERE_CLAUSE
        .captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether two queries filter identically once whitespace is normalized.
/// Two queries without a WHERE clause count as identical.
pub fn same_filter_logic(original: &str, refined: &str) -> bool {
    let normalized = |sql: &str| where_clause(sql).map(|w| normalize_whitespace(&w));
    normalized(original) == normalized(refined)
}

/// Same query text up to whitespace, letter case and a trailing `;`.
pub fn same_query(a: &str, b: &str) -> bool {
    let canonical = |sql: &str| normalize_whitespace(sql.trim().trim_end_matches(';')).to_uppercase();
    canonical(a) == canonical(b)
}

/// Parse-only syntax check.
pub fn validate_sql(sql: &str) -> Result<()> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| ReflectError::Sql(format!("Invalid SQL '{}': {}", sql, e)))?;
    if statements.is_empty() {
        return Err(ReflectError::Sql("No SQL statement found".to_string()));
    }
    Ok(())
}
