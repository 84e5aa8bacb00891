//! Rule records read from the store and their compiled form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CacheError;
use crate::lang::{self, CompiledPredicate, Failure};

// ================================================================================================
// STORE RECORDS
// ================================================================================================

/// An active rule as returned by a full read of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    pub rule_id: String,
    pub last_updated: DateTime<Utc>,
    pub rule_definition: String,
}

/// A rule touched since some version, active or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRecord {
    pub rule_id: String,
    pub last_updated: DateTime<Utc>,
    pub rule_definition: String,
    pub is_active: bool,
}

impl DeltaRecord {
    pub fn to_rule_record(&self) -> RuleRecord {
        RuleRecord {
            rule_id: self.rule_id.clone(),
            last_updated: self.last_updated,
            rule_definition: self.rule_definition.clone(),
        }
    }
}

/// Identifies a bug in a bug tracking system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BugId {
    /// Tracker name, e.g. "monorail" or "buganizer"
    pub system: String,
    /// Tracker-specific identifier, e.g. "chromium/123"
    pub id: String,
}

impl fmt::Display for BugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.system, self.id)
    }
}

impl std::str::FromStr for BugId {
    type Err = String;

    /// Parses `system/id`, splitting at the first slash.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((system, id)) if !system.is_empty() && !id.is_empty() => Ok(BugId {
                system: system.to_string(),
                id: id.to_string(),
            }),
            _ => Err(format!("bug must be of the form system/id, got {:?}", s)),
        }
    }
}

/// Identifies a cluster produced by a clustering algorithm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId {
    /// Algorithm name, e.g. "reason-v1"
    pub algorithm: String,
    /// Lowercase hexadecimal cluster identifier
    pub id: String,
}

impl ClusterId {
    /// Longest permitted identifier, in bytes once hex-decoded.
    pub const MAX_ID_BYTES: usize = 16;

    pub fn new(algorithm: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            id: id.into(),
        }
    }

    /// True if neither the algorithm nor the ID is set.
    pub fn is_empty(&self) -> bool {
        self.algorithm.is_empty() && self.id.is_empty()
    }

    /// Checks the algorithm name and that the ID is lowercase hex of at most
    /// [`Self::MAX_ID_BYTES`] bytes.
    pub fn validate(&self) -> Result<(), String> {
        let algorithm_ok = !self.algorithm.is_empty()
            && self
                .algorithm
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !algorithm_ok {
            return Err("algorithm not valid".to_string());
        }
        if self.id.is_empty() {
            return Err("ID is empty".to_string());
        }
        if self.id.len() % 2 != 0
            || !self
                .id
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err("ID is not valid lowercase hexadecimal bytes".to_string());
        }
        let bytes = self.id.len() / 2;
        if bytes > Self::MAX_ID_BYTES {
            return Err(format!(
                "ID is too long (got {} bytes, want at most {} bytes)",
                bytes,
                Self::MAX_ID_BYTES
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.id)
    }
}

/// A failure association rule as persisted in the store.
///
/// Associates the failures matched by `rule_definition` with a bug. The
/// audit fields (`creation_*`, `last_updated*`) are assigned by the store on
/// write and ignored on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAssociationRule {
    pub project: String,
    pub rule_id: String,
    pub rule_definition: String,
    pub bug_id: BugId,
    pub is_active: bool,
    pub creation_time: DateTime<Utc>,
    pub creation_user: String,
    pub last_updated: DateTime<Utc>,
    pub last_updated_user: String,
    /// Cluster the rule was created from, if any. Empty otherwise.
    #[serde(default)]
    pub source_cluster: ClusterId,
}

impl FailureAssociationRule {
    /// An active rule with empty audit fields, stamped at the starting epoch.
    pub fn new(
        project: impl Into<String>,
        rule_id: impl Into<String>,
        rule_definition: impl Into<String>,
    ) -> Self {
        let epoch = crate::types::starting_epoch();
        Self {
            project: project.into(),
            rule_id: rule_id.into(),
            rule_definition: rule_definition.into(),
            bug_id: BugId::default(),
            is_active: true,
            creation_time: epoch,
            creation_user: String::new(),
            last_updated: epoch,
            last_updated_user: String::new(),
            source_cluster: ClusterId::default(),
        }
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn with_last_updated(mut self, last_updated: DateTime<Utc>) -> Self {
        self.last_updated = last_updated;
        self
    }

    pub fn with_rule_definition(mut self, rule_definition: impl Into<String>) -> Self {
        self.rule_definition = rule_definition.into();
        self
    }

    pub fn with_bug(mut self, bug_id: BugId) -> Self {
        self.bug_id = bug_id;
        self
    }

    pub fn with_source_cluster(mut self, source_cluster: ClusterId) -> Self {
        self.source_cluster = source_cluster;
        self
    }

    pub fn to_delta_record(&self) -> DeltaRecord {
        DeltaRecord {
            rule_id: self.rule_id.clone(),
            last_updated: self.last_updated,
            rule_definition: self.rule_definition.clone(),
            is_active: self.is_active,
        }
    }
}

// ================================================================================================
// COMPILED RULE
// ================================================================================================

/// One active rule, compiled and ready for matching. Immutable.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule_id: String,
    last_updated: DateTime<Utc>,
    predicate: CompiledPredicate,
}

impl CompiledRule {
    /// Compiles a rule record.
    ///
    /// A definition that fails to parse yields
    /// [`CacheError::InvalidRuleDefinition`]; callers propagate it so the
    /// enclosing refresh is abandoned instead of silently dropping the rule.
    pub fn new(record: &RuleRecord) -> Result<Self, CacheError> {
        let predicate = lang::parse(&record.rule_definition).map_err(|source| {
            CacheError::InvalidRuleDefinition {
                rule_id: record.rule_id.clone(),
                source,
            }
        })?;
        Ok(Self {
            rule_id: record.rule_id.clone(),
            last_updated: record.last_updated,
            predicate,
        })
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn predicate(&self) -> &CompiledPredicate {
        &self.predicate
    }

    /// Returns true if the failure is matched by this rule.
    pub fn matches(&self, failure: &Failure) -> bool {
        self.predicate.matches(failure)
    }

    /// True if this is the compiled form of the given rule revision.
    ///
    /// Definitions only change together with `last_updated`, so a matching
    /// id and timestamp means the compiled predicate is still current.
    pub fn is_same_version(&self, rule_id: &str, last_updated: DateTime<Utc>) -> bool {
        self.rule_id == rule_id && self.last_updated == last_updated
    }
}
