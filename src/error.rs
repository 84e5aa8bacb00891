//! Error types for the ruleset cache, the rule store and the rule language.

use std::fmt;
use thiserror::Error;

/// Errors surfaced by a ruleset refresh.
///
/// Both variants are fatal to the refresh that produced them: no partial
/// ruleset is ever installed, and the cache keeps serving the previous one.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A stored rule definition failed to compile.
    #[error("invalid rule definition for rule {rule_id}: {source}")]
    InvalidRuleDefinition {
        rule_id: String,
        #[source]
        source: ParseError,
    },

    /// The rule store could not be read.
    #[error("rule store read failed: {0}")]
    StoreRead(#[from] StoreError),
}

impl CacheError {
    /// Returns true if the error came from the store rather than rule content.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, CacheError::StoreRead(_))
    }
}

/// Errors returned by rule store implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("read cancelled")]
    Cancelled,

    #[error("read deadline exceeded")]
    DeadlineExceeded,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("no matching rule exists: {project}/{rule_id}")]
    NotFound { project: String, rule_id: String },

    #[error("no rule exists for bug {0}")]
    BugNotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A rule definition that could not be parsed or compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Human readable description of the problem
    pub message: String,
    /// Byte offset into the definition text where the problem was found
    pub position: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at byte {})", self.message, self.position)
    }
}

impl std::error::Error for ParseError {}

/// Errors loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}
