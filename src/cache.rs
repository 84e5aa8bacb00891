//! Process-wide cache of rulesets, keyed by project.
//!
//! # Thread Safety
//! - The project map is behind a mutex that is held only for lookups and
//!   inserts, never across a store read, so a refresh of one project does
//!   not block readers of another.
//! - Each project's current ruleset is an `Arc<Ruleset>` replaced wholesale;
//!   readers see either the old or the new snapshot, never a mix.
//! - With `coalesce_refreshes`, a per-project mutex serializes refreshes and
//!   callers that waited behind a successful refresh reuse its result. Without
//!   it, concurrent stale callers each refresh and the newest version wins.
//!
//! # Failure Handling
//! A failed refresh is returned to the caller that attempted it. The cached
//! ruleset is left exactly as it was, so other callers keep being served the
//! last good snapshot, and the next call after the failure retries.

use chrono::TimeDelta;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::refresh::RefreshEngine;
use crate::ruleset::Ruleset;
use crate::store::{ReadContext, RuleStore};

/// Cache state for one project.
struct ProjectEntry {
    current: RwLock<Arc<Ruleset>>,
    refresh_lock: Mutex<()>,
}

impl ProjectEntry {
    fn new(project: &str) -> Self {
        Self {
            current: RwLock::new(Arc::new(Ruleset::empty(project))),
            refresh_lock: Mutex::new(()),
        }
    }

    fn current(&self) -> Arc<Ruleset> {
        Arc::clone(&self.current.read())
    }
}

/// Shared, lazily-populated cache of per-project rulesets.
///
/// Constructed once at startup and handed to request handlers as
/// `Arc<RulesetCache>`.
pub struct RulesetCache {
    engine: RefreshEngine,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    coalesce_refreshes: bool,
    entries: Mutex<HashMap<String, Arc<ProjectEntry>>>,
}

impl RulesetCache {
    pub fn new(store: Arc<dyn RuleStore>, clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
        Self {
            engine: RefreshEngine::new(store, Arc::clone(&clock)),
            clock,
            refresh_interval: config.refresh_interval(),
            coalesce_refreshes: config.coalesce_refreshes,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the ruleset for `project`, refreshing it first if it is older
    /// than the refresh interval.
    ///
    /// # Errors
    /// The error of a refresh attempted by this call. The cached ruleset is
    /// unchanged in that case.
    pub fn ruleset(&self, ctx: &ReadContext, project: &str) -> Result<Arc<Ruleset>, CacheError> {
        let entry = self.entry(project);

        let current = entry.current();
        if !self.is_stale(&current) {
            debug!("Ruleset cache hit for project {}", project);
            return Ok(current);
        }

        if !self.coalesce_refreshes {
            return self.refresh_entry(ctx, &entry, &current);
        }

        let _refreshing = entry.refresh_lock.lock();
        // Another caller may have refreshed while we waited for the lock.
        let current = entry.current();
        if !self.is_stale(&current) {
            return Ok(current);
        }
        self.refresh_entry(ctx, &entry, &current)
    }

    /// Returns the cached ruleset without refreshing it, if the project has
    /// been requested before.
    pub fn peek(&self, project: &str) -> Option<Arc<Ruleset>> {
        let entry = self.entries.lock().get(project).cloned();
        entry.map(|e| e.current())
    }

    /// Projects that have been requested at least once, sorted.
    pub fn projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = self.entries.lock().keys().cloned().collect();
        projects.sort();
        projects
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    fn entry(&self, project: &str) -> Arc<ProjectEntry> {
        let mut entries = self.entries.lock();
        Arc::clone(
            entries
                .entry(project.to_string())
                .or_insert_with(|| Arc::new(ProjectEntry::new(project))),
        )
    }

    fn is_stale(&self, ruleset: &Ruleset) -> bool {
        let age = self.clock.now().signed_duration_since(ruleset.last_refresh());
        match TimeDelta::from_std(self.refresh_interval) {
            Ok(interval) => age >= interval,
            // An interval too large to represent never expires.
            Err(_) => false,
        }
    }

    fn refresh_entry(
        &self,
        ctx: &ReadContext,
        entry: &ProjectEntry,
        old: &Arc<Ruleset>,
    ) -> Result<Arc<Ruleset>, CacheError> {
        let outcome = match self.engine.refresh(ctx, old) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Refresh of project {} failed, keeping ruleset at version {}: {}",
                    old.project(),
                    old.rules_version(),
                    e
                );
                return Err(e);
            }
        };

        let fresh = Arc::new(outcome.ruleset);
        let mut current = entry.current.write();
        // Without coalescing a slower refresh can finish after a newer one;
        // never move the project back to an older version.
        if current.rules_version() <= fresh.rules_version() {
            *current = Arc::clone(&fresh);
        }
        Ok(fresh)
    }
}

// ================================================================================================
// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::rule::FailureAssociationRule;
    use crate::store::{InMemoryRuleStore, ReadTransaction};
    use crate::types::starting_epoch;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;
    use tokio_util::sync::CancellationToken;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 10, 1, 9, 0, 0).unwrap()
    }

    fn config(coalesce: bool) -> CacheConfig {
        CacheConfig {
            refresh_interval_secs: 40,
            read_timeout_secs: 0,
            coalesce_refreshes: coalesce,
        }
    }

    fn setup(coalesce: bool) -> (Arc<InMemoryRuleStore>, Arc<ManualClock>, RulesetCache) {
        let store = Arc::new(InMemoryRuleStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let cache = RulesetCache::new(store.clone(), clock.clone(), &config(coalesce));
        (store, clock, cache)
    }

    fn rule(id: &str, definition: &str, minutes_ago: i64) -> FailureAssociationRule {
        FailureAssociationRule::new("proj", id, definition)
            .with_last_updated(start() - chrono::Duration::minutes(minutes_ago))
    }

    #[test]
    fn test_first_call_loads_and_second_is_cached() {
        let (store, _clock, cache) = setup(true);
        store.put_rule(rule("a", r#"test = "a""#, 10));
        let ctx = ReadContext::background();

        let first = cache.ruleset(&ctx, "proj").unwrap();
        let second = cache.ruleset(&ctx, "proj").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.counters().rule_reads(), 1);
        assert_eq!(store.counters().transactions, 1);
    }

    #[test]
    fn test_refresh_after_interval() {
        let (store, clock, cache) = setup(true);
        store.put_rule(rule("a", r#"test = "a""#, 10));
        let ctx = ReadContext::background();

        cache.ruleset(&ctx, "proj").unwrap();
        clock.advance(chrono::Duration::seconds(39));
        cache.ruleset(&ctx, "proj").unwrap();
        assert_eq!(store.counters().rule_reads(), 1);

        clock.advance(chrono::Duration::seconds(1));
        cache.ruleset(&ctx, "proj").unwrap();
        assert_eq!(store.counters().rule_reads(), 2);
        assert_eq!(store.counters().delta_reads, 1);
    }

    #[test]
    fn test_failed_refresh_keeps_previous_ruleset() {
        let (store, clock, cache) = setup(true);
        store.put_rule(rule("a", r#"test = "a""#, 10));
        let ctx = ReadContext::background();

        let good = cache.ruleset(&ctx, "proj").unwrap();
        clock.advance(chrono::Duration::minutes(5));
        store.set_unavailable(true);

        assert!(cache.ruleset(&ctx, "proj").is_err());
        assert!(Arc::ptr_eq(&cache.peek("proj").unwrap(), &good));

        store.set_unavailable(false);
        let recovered = cache.ruleset(&ctx, "proj").unwrap();
        assert!(!Arc::ptr_eq(&recovered, &good));
        assert_eq!(recovered.last_refresh(), clock.now());
    }

    #[test]
    fn test_first_call_fails_without_fallback() {
        let (store, _clock, cache) = setup(true);
        store.set_unavailable(true);
        let err = cache
            .ruleset(&ReadContext::background(), "proj")
            .unwrap_err();
        assert!(err.is_store_failure());

        let placeholder = cache.peek("proj").unwrap();
        assert!(placeholder.is_empty());
        assert_eq!(placeholder.rules_version(), starting_epoch());
    }

    #[test]
    fn test_projects_are_independent() {
        let (store, _clock, cache) = setup(false);
        store.put_rule(rule("a", r#"test = "a""#, 10));
        store.put_rule(
            FailureAssociationRule::new("other", "b", "test = ")
                .with_last_updated(start()),
        );
        let ctx = ReadContext::background();

        assert!(cache.ruleset(&ctx, "other").is_err());
        assert_eq!(cache.ruleset(&ctx, "proj").unwrap().len(), 1);
        assert_eq!(cache.projects(), vec!["other".to_string(), "proj".to_string()]);
        assert!(cache.peek("unknown").is_none());
    }

    #[test]
    fn test_concurrent_callers_share_one_refresh() {
        let (store, _clock, cache) = setup(true);
        for i in 0..50 {
            store.put_rule(rule(&format!("r{}", i), r#"reason LIKE "%boom%""#, i));
        }
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    cache
                        .ruleset(&ReadContext::background(), "proj")
                        .map(|r| r.len())
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 50);
        }
        assert_eq!(store.counters().transactions, 1);
    }

    /// Parks the next transaction after its snapshot is taken, until the test
    /// has passed the gate twice.
    struct PausingStore {
        inner: InMemoryRuleStore,
        pause_next: AtomicBool,
        gate: Barrier,
    }

    impl RuleStore for PausingStore {
        fn read_only_transaction(
            &self,
            ctx: &ReadContext,
        ) -> Result<Box<dyn ReadTransaction + '_>, StoreError> {
            let txn = self.inner.read_only_transaction(ctx)?;
            if self.pause_next.swap(false, Ordering::SeqCst) {
                self.gate.wait();
                self.gate.wait();
            }
            Ok(txn)
        }
    }

    #[test]
    fn test_late_refresh_never_replaces_newer_ruleset() {
        let store = Arc::new(PausingStore {
            inner: InMemoryRuleStore::new(),
            pause_next: AtomicBool::new(false),
            gate: Barrier::new(2),
        });
        let clock = Arc::new(ManualClock::new(start()));
        let cache = Arc::new(RulesetCache::new(store.clone(), clock.clone(), &config(false)));
        let ctx = ReadContext::background();

        store.inner.put_rule(rule("a", r#"test = "a""#, 10));
        let initial = cache.ruleset(&ctx, "proj").unwrap();
        clock.advance(chrono::Duration::minutes(1));

        store.pause_next.store(true, Ordering::SeqCst);
        let slow = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.ruleset(&ReadContext::background(), "proj"))
        };
        // The slow refresh now holds a snapshot without rule b.
        store.gate.wait();

        store.inner.put_rule(rule("b", r#"test = "b""#, 0));
        let newer = cache.ruleset(&ctx, "proj").unwrap();
        assert_eq!(newer.rules_version(), start());
        assert!(Arc::ptr_eq(&cache.peek("proj").unwrap(), &newer));

        store.gate.wait();
        let late = slow.join().unwrap().unwrap();
        assert_eq!(late.rules_version(), initial.rules_version());
        assert!(!late.is_rule_active("b"));

        let current = cache.peek("proj").unwrap();
        assert!(Arc::ptr_eq(&current, &newer));
        assert!(current.is_rule_active("b"));
    }

    #[test]
    fn test_cancelled_refresh_keeps_previous_ruleset() {
        let (store, clock, cache) = setup(false);
        store.put_rule(rule("a", r#"test = "a""#, 10));
        let previous = cache.ruleset(&ReadContext::background(), "proj").unwrap();
        clock.advance(chrono::Duration::minutes(1));
        store.reset_counters();

        let token = CancellationToken::new();
        token.cancel();
        let ctx = ReadContext::background().cancellation(token);

        let err = cache.ruleset(&ctx, "proj").unwrap_err();
        assert!(matches!(err, CacheError::StoreRead(StoreError::Cancelled)));
        assert!(Arc::ptr_eq(&cache.peek("proj").unwrap(), &previous));
        assert_eq!(store.counters().transactions, 0);
    }
}
