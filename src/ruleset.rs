//! Immutable per-project snapshot of active compiled rules.
//!
//! A [`Ruleset`] answers queries without touching the store. Refreshing never
//! modifies an existing ruleset: the refresh engine always builds a new one,
//! so a reference obtained from the cache stays valid and unchanged for as
//! long as the caller holds it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::rule::CompiledRule;
use crate::types::{starting_epoch, zero_time};

/// The active rules of one project as of some store version.
#[derive(Debug, Clone)]
pub struct Ruleset {
    /// Project the rules belong to
    project: String,
    /// Active rules, most recently updated first (ties by ascending rule ID)
    active_rules_sorted: Vec<Arc<CompiledRule>>,
    /// Rule ID -> position in `active_rules_sorted`
    active_rule_ids: HashMap<String, usize>,
    /// Store timestamp of the latest rule change reflected here
    rules_version: DateTime<Utc>,
    /// When this snapshot was built (process-local wall clock)
    last_refresh: DateTime<Utc>,
}

impl Ruleset {
    /// Builds a ruleset from a set of compiled rules.
    ///
    /// If the same rule ID appears more than once, the most recently updated
    /// revision is kept.
    pub fn new(
        project: impl Into<String>,
        rules: Vec<Arc<CompiledRule>>,
        rules_version: DateTime<Utc>,
        last_refresh: DateTime<Utc>,
    ) -> Self {
        let mut newest: HashMap<String, Arc<CompiledRule>> = HashMap::with_capacity(rules.len());
        for rule in rules {
            match newest.get(rule.rule_id()) {
                Some(existing) if existing.last_updated() >= rule.last_updated() => {}
                _ => {
                    newest.insert(rule.rule_id().to_string(), rule);
                }
            }
        }

        let mut active_rules_sorted: Vec<Arc<CompiledRule>> = newest.into_values().collect();
        active_rules_sorted.sort_by(|a, b| {
            b.last_updated()
                .cmp(&a.last_updated())
                .then_with(|| a.rule_id().cmp(b.rule_id()))
        });

        let active_rule_ids = active_rules_sorted
            .iter()
            .enumerate()
            .map(|(idx, rule)| (rule.rule_id().to_string(), idx))
            .collect();

        Self {
            project: project.into(),
            active_rules_sorted,
            active_rule_ids,
            rules_version,
            last_refresh,
        }
    }

    /// An empty placeholder for a project that has never been loaded.
    ///
    /// Its version is the starting epoch, so the first refresh performs a
    /// full load, and its refresh time is the zero time, so it is always stale.
    pub fn empty(project: impl Into<String>) -> Self {
        Self::new(project, Vec::new(), starting_epoch(), zero_time())
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn rules_version(&self) -> DateTime<Utc> {
        self.rules_version
    }

    pub fn last_refresh(&self) -> DateTime<Utc> {
        self.last_refresh
    }

    /// All active rules, most recently updated first.
    pub fn active_rules_sorted(&self) -> &[Arc<CompiledRule>] {
        &self.active_rules_sorted
    }

    /// IDs of all active rules, in no particular order.
    pub fn active_rule_ids(&self) -> impl Iterator<Item = &str> {
        self.active_rule_ids.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.active_rules_sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_rules_sorted.is_empty()
    }

    // ============================================================================================
    // QUERIES
    // ============================================================================================

    /// Returns the active rules updated strictly after `t`.
    ///
    /// Because rules are sorted by descending update time this is a prefix of
    /// [`Ruleset::active_rules_sorted`], found by scanning from the front.
    pub fn active_rules_updated_since(&self, t: DateTime<Utc>) -> &[Arc<CompiledRule>] {
        let end = self
            .active_rules_sorted
            .iter()
            .position(|rule| rule.last_updated() <= t)
            .unwrap_or(self.active_rules_sorted.len());
        &self.active_rules_sorted[..end]
    }

    /// Returns true if the rule with the given ID is active.
    pub fn is_rule_active(&self, rule_id: &str) -> bool {
        self.active_rule_ids.contains_key(rule_id)
    }

    /// Looks up an active rule by ID.
    pub fn active_rule(&self, rule_id: &str) -> Option<&Arc<CompiledRule>> {
        self.active_rule_ids
            .get(rule_id)
            .map(|&idx| &self.active_rules_sorted[idx])
    }

    /// Summary suitable for logging or JSON output.
    pub fn summary(&self) -> RulesetSummary {
        RulesetSummary {
            project: self.project.clone(),
            rules_version: self.rules_version,
            last_refresh: self.last_refresh,
            active_rules: self.active_rules_sorted.len(),
        }
    }
}

/// Serializable summary of a ruleset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RulesetSummary {
    pub project: String,
    pub rules_version: DateTime<Utc>,
    pub last_refresh: DateTime<Utc>,
    pub active_rules: usize,
}

// ================================================================================================
// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleRecord;
    use chrono::{Duration, TimeZone};

    fn reference_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 8, 1, 8, 0, 0).unwrap()
    }

    fn compiled(id: &str, last_updated: DateTime<Utc>) -> Arc<CompiledRule> {
        let record = RuleRecord {
            rule_id: id.to_string(),
            last_updated,
            rule_definition: format!(r#"test = "{}""#, id),
        };
        Arc::new(CompiledRule::new(&record).unwrap())
    }

    fn ids(rules: &[Arc<CompiledRule>]) -> Vec<&str> {
        rules.iter().map(|r| r.rule_id()).collect()
    }

    fn three_rule_ruleset() -> Ruleset {
        let t = reference_time();
        Ruleset::new(
            "project",
            vec![
                compiled("a", t - Duration::hours(1)),
                compiled("b", t),
                compiled("c", t - Duration::hours(2)),
            ],
            t,
            t,
        )
    }

    #[test]
    fn test_sorted_descending_by_last_updated() {
        let ruleset = three_rule_ruleset();
        assert_eq!(ids(ruleset.active_rules_sorted()), vec!["b", "a", "c"]);
        for pair in ruleset.active_rules_sorted().windows(2) {
            assert!(pair[0].last_updated() >= pair[1].last_updated());
        }
    }

    #[test]
    fn test_ties_broken_by_rule_id() {
        let t = reference_time();
        let ruleset = Ruleset::new(
            "project",
            vec![compiled("z", t), compiled("m", t), compiled("a", t)],
            t,
            t,
        );
        assert_eq!(ids(ruleset.active_rules_sorted()), vec!["a", "m", "z"]);
    }

    #[test]
    fn test_updated_since_boundaries() {
        let t = reference_time();
        let ruleset = three_rule_ruleset();

        assert_eq!(ids(ruleset.active_rules_updated_since(t - Duration::hours(1))), vec!["b"]);
        assert!(ruleset.active_rules_updated_since(t).is_empty());
        assert!(ruleset
            .active_rules_updated_since(t + Duration::hours(1))
            .is_empty());
        assert_eq!(
            ids(ruleset.active_rules_updated_since(t - Duration::hours(3))),
            vec!["b", "a", "c"]
        );
    }

    #[test]
    fn test_active_membership() {
        let ruleset = three_rule_ruleset();
        assert!(ruleset.is_rule_active("a"));
        assert!(!ruleset.is_rule_active("d"));
        assert_eq!(ruleset.active_rule("c").map(|r| r.rule_id()), Some("c"));

        let mut all: Vec<&str> = ruleset.active_rule_ids().collect();
        all.sort();
        assert_eq!(all, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicates_keep_newest() {
        let t = reference_time();
        let ruleset = Ruleset::new(
            "project",
            vec![
                compiled("a", t - Duration::hours(1)),
                compiled("a", t),
                compiled("a", t - Duration::hours(2)),
            ],
            t,
            t,
        );
        assert_eq!(ruleset.len(), 1);
        assert_eq!(ruleset.active_rules_sorted()[0].last_updated(), t);
    }

    #[test]
    fn test_empty_ruleset_uses_epoch() {
        let ruleset = Ruleset::empty("project");
        assert!(ruleset.is_empty());
        assert_eq!(ruleset.rules_version(), starting_epoch());
        assert_eq!(ruleset.last_refresh(), zero_time());
        assert!(ruleset
            .active_rules_updated_since(starting_epoch())
            .is_empty());
    }

    #[test]
    fn test_summary() {
        let summary = three_rule_ruleset().summary();
        assert_eq!(summary.project, "project");
        assert_eq!(summary.active_rules, 3);
        assert_eq!(summary.rules_version, reference_time());
    }
}
