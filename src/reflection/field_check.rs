//! Static Field Checker
//!
//! Schema keyword matcher used only when the semantic check came back as a
//! generic "no issues" while the question names an attribute the table
//! plainly lacks.

use crate::schema::Schema;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref WORD: Regex = Regex::new(r"[a-zA-Z_]+").unwrap();
}

/// Attributes models tend to assume exist.
pub const COMMONLY_HALLUCINATED: &[&str] = &["color", "rating", "brand", "model", "size", "version"];

/// Question terms from the closed vocabulary that the schema does not have.
pub fn find_unknown_terms(question: &str, schema: &Schema) -> Vec<String> {
    let question = question.to_lowercase();
    WORD.find_iter(&question)
        .map(|m| m.as_str())
        .filter(|word| word.len() > 3)
        .filter(|word| !schema.contains(word))
        .filter(|word| COMMONLY_HALLUCINATED.contains(word))
        .unique()
        .map(|word| word.to_string())
        .collect()
}
