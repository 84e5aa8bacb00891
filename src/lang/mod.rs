//! Failure association rule language.
//!
//! Rules are boolean predicates over the attributes of a test failure,
//! written in a small SQL-like syntax:
//!
//! ```text
//! test = "ninja://chrome/test:browser_tests/FooTest.Bar"
//! reason LIKE "Failed to connect to %.%.%.%." AND NOT test IN ("a", "b")
//! REGEXP_CONTAINS(test, "^ninja://.*/webgl_conformance")
//! ```
//!
//! Keywords are case-insensitive. The available fields are `test` and
//! `reason`. A failure without a reason compares as the empty string.

mod lexer;
mod parser;

pub use parser::{Expr, Field};

use crate::error::ParseError;
use std::fmt;

/// The attributes of a test failure that rules are evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failure {
    pub test_id: String,
    pub reason: Option<String>,
}

impl Failure {
    pub fn new(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A parsed rule definition, ready for evaluation.
///
/// Displays as the definition text it was compiled from.
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    definition: String,
    expr: Expr,
}

impl CompiledPredicate {
    /// Returns true if the failure satisfies the rule.
    pub fn matches(&self, failure: &Failure) -> bool {
        self.expr.evaluate(failure)
    }

    /// The definition text this was compiled from.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

impl fmt::Display for CompiledPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.definition)
    }
}

/// Parses and compiles a rule definition.
pub fn parse(definition: &str) -> Result<CompiledPredicate, ParseError> {
    let expr = parser::parse_expr(definition)?;
    Ok(CompiledPredicate {
        definition: definition.to_string(),
        expr,
    })
}

/// Validates a LIKE pattern without compiling it.
pub fn validate_like_pattern(pattern: &str) -> Result<(), ParseError> {
    like_pattern_to_regex(pattern).map(|_| ())
}

/// Translates a LIKE pattern into an anchored regular expression.
///
/// `%` matches any sequence of characters (including newlines), `_` matches
/// exactly one, and `\` escapes `%`, `_` or `\`.
pub(crate) fn like_pattern_to_regex(pattern: &str) -> Result<String, ParseError> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("^(?s:");

    let mut chars = pattern.char_indices();
    while let Some((pos, c)) = chars.next() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '\\' => match chars.next() {
                Some((_, escaped @ ('%' | '_' | '\\'))) => {
                    out.push_str(&regex::escape(&escaped.to_string()))
                }
                Some((_, other)) => {
                    return Err(ParseError::new(
                        format!("invalid use of escape sequence '\\{}' in LIKE pattern", other),
                        pos,
                    ))
                }
                None => {
                    return Err(ParseError::new(
                        "unfinished escape sequence at end of LIKE pattern",
                        pos,
                    ))
                }
            },
            other => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }

    out.push_str(")$");
    Ok(out)
}
