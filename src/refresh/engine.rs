//! Builds a new ruleset from the previous one and the store.
//!
//! **Algorithm**:
//! 1. Open one read-only transaction; every read below uses it.
//! 2. If the previous ruleset is at the starting epoch, read and compile all
//!    active rules (full load).
//! 3. Otherwise read only rules changed after the previous version and merge
//!    them into a fresh map seeded with the previous compiled rules (delta
//!    load). Rules whose `last_updated` did not change are reused as-is.
//! 4. Read the project's last-updated version in the same transaction.
//! 5. Return a new ruleset stamped with that version and the current time.
//!
//! The previous ruleset is only read, never modified.

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::CacheError;
use crate::rule::{CompiledRule, DeltaRecord, RuleRecord};
use crate::ruleset::Ruleset;
use crate::store::{ReadContext, RuleStore};
use crate::types::{now_ms, starting_epoch};

/// How a refresh obtained its rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// All active rules were read and compiled.
    Full,
    /// Only rules changed since the previous version were read.
    Delta,
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshMode::Full => f.write_str("full"),
            RefreshMode::Delta => f.write_str("delta"),
        }
    }
}

/// Statistics from a refresh operation.
#[derive(Debug, Clone)]
pub struct RefreshStats {
    pub mode: RefreshMode,
    /// Rules parsed and compiled during this refresh
    pub rules_compiled: usize,
    /// Compiled rules carried over from the previous ruleset
    pub rules_reused: usize,
    /// Rules dropped because they became inactive
    pub rules_removed: usize,
    /// Active rules in the new ruleset
    pub active_rules: usize,
    /// Version of the new ruleset
    pub rules_version: DateTime<Utc>,
    /// Duration of refresh operation in milliseconds
    pub duration_ms: u64,
}

/// A freshly built ruleset and how it was built.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub ruleset: Ruleset,
    pub stats: RefreshStats,
}

/// Produces up-to-date rulesets from the rule store.
pub struct RefreshEngine {
    store: Arc<dyn RuleStore>,
    clock: Arc<dyn Clock>,
}

impl RefreshEngine {
    pub fn new(store: Arc<dyn RuleStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Builds the successor of `old`.
    ///
    /// # Errors
    /// - `CacheError::StoreRead` if any store read fails, is cancelled, or
    ///   times out.
    /// - `CacheError::InvalidRuleDefinition` if any new or changed rule fails
    ///   to compile. One bad rule fails the whole refresh.
    pub fn refresh(&self, ctx: &ReadContext, old: &Ruleset) -> Result<RefreshOutcome, CacheError> {
        let start = now_ms();
        let project = old.project();

        let mut txn = self.store.read_only_transaction(ctx)?;

        let (rules, mut stats) = if old.rules_version() == starting_epoch() {
            let records = txn.read_active(ctx, project)?;
            full_load(&records)?
        } else {
            let delta = txn.read_delta(ctx, project, old.rules_version())?;
            merge_delta(old, &delta)?
        };

        // Must come from the same transaction as the rule reads, or the
        // version could describe changes the rules above do not contain.
        let rules_version = txn.read_last_updated(ctx, project)?;
        drop(txn);

        let ruleset = Ruleset::new(project, rules, rules_version, self.clock.now());

        stats.active_rules = ruleset.len();
        stats.rules_version = rules_version;
        stats.duration_ms = now_ms().saturating_sub(start);

        match stats.mode {
            RefreshMode::Full => info!(
                "Loaded {} active rules for project {} (version {}) in {}ms",
                stats.active_rules, project, rules_version, stats.duration_ms
            ),
            RefreshMode::Delta => debug!(
                "Refreshed project {}: {} compiled, {} reused, {} removed, version {}",
                project, stats.rules_compiled, stats.rules_reused, stats.rules_removed, rules_version
            ),
        }

        Ok(RefreshOutcome { ruleset, stats })
    }
}

fn empty_stats(mode: RefreshMode) -> RefreshStats {
    RefreshStats {
        mode,
        rules_compiled: 0,
        rules_reused: 0,
        rules_removed: 0,
        active_rules: 0,
        rules_version: starting_epoch(),
        duration_ms: 0,
    }
}

/// Compiles every active rule.
fn full_load(records: &[RuleRecord]) -> Result<(Vec<Arc<CompiledRule>>, RefreshStats), CacheError> {
    let mut stats = empty_stats(RefreshMode::Full);
    let rules = records
        .iter()
        .map(|record| CompiledRule::new(record).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;
    stats.rules_compiled = rules.len();
    Ok((rules, stats))
}

/// Applies a delta on top of the rules of `old`, producing a new rule list.
///
/// The working map is freshly allocated; `old` keeps its own rules.
fn merge_delta(
    old: &Ruleset,
    delta: &[DeltaRecord],
) -> Result<(Vec<Arc<CompiledRule>>, RefreshStats), CacheError> {
    let mut stats = empty_stats(RefreshMode::Delta);
    let mut by_id: HashMap<&str, Arc<CompiledRule>> = old
        .active_rules_sorted()
        .iter()
        .map(|rule| (rule.rule_id(), Arc::clone(rule)))
        .collect();

    for record in delta {
        let unchanged = by_id
            .get(record.rule_id.as_str())
            .is_some_and(|existing| existing.is_same_version(&record.rule_id, record.last_updated));
        if unchanged {
            continue;
        }

        if record.is_active {
            let compiled = CompiledRule::new(&record.to_rule_record())?;
            by_id.insert(record.rule_id.as_str(), Arc::new(compiled));
            stats.rules_compiled += 1;
        } else if by_id.remove(record.rule_id.as_str()).is_some() {
            stats.rules_removed += 1;
        }
    }

    let rules: Vec<Arc<CompiledRule>> = by_id.into_values().collect();
    stats.rules_reused = rules.len() - stats.rules_compiled.min(rules.len());
    Ok((rules, stats))
}

// ================================================================================================
// TESTS
// ================================================================================================
