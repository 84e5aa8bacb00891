//! In-memory rule store.
//!
//! Rows live behind a copy-on-write `Arc`: a transaction captures the current
//! `Arc` when it opens and reads only from it, so every read in one
//! transaction sees the same snapshot even while writers replace the map.
//! Operation counters and an availability switch make cache behaviour
//! observable in tests and benchmarks.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{ReadContext, ReadTransaction, RuleStore};
use crate::error::StoreError;
use crate::rule::{DeltaRecord, FailureAssociationRule, RuleRecord};
use crate::types::starting_epoch;

/// Project -> rule ID -> rule.
type Rows = HashMap<String, BTreeMap<String, FailureAssociationRule>>;

/// Point-in-time copy of the store's operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounters {
    pub transactions: usize,
    pub active_reads: usize,
    pub delta_reads: usize,
    pub last_updated_reads: usize,
}

impl StoreCounters {
    /// Reads of rule rows, full or delta.
    pub fn rule_reads(&self) -> usize {
        self.active_reads + self.delta_reads
    }
}

#[derive(Debug, Default)]
struct Counters {
    transactions: AtomicUsize,
    active_reads: AtomicUsize,
    delta_reads: AtomicUsize,
    last_updated_reads: AtomicUsize,
}

/// Rule store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rows: RwLock<Arc<Rows>>,
    unavailable: AtomicBool,
    counters: Counters,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a rule exactly as given, timestamps included.
    pub fn put_rule(&self, rule: FailureAssociationRule) {
        let mut guard = self.rows.write();
        Arc::make_mut(&mut *guard)
            .entry(rule.project.clone())
            .or_default()
            .insert(rule.rule_id.clone(), rule);
    }

    /// Returns a stored rule, active or not.
    pub fn rule(&self, project: &str, rule_id: &str) -> Option<FailureAssociationRule> {
        self.rows
            .read()
            .get(project)
            .and_then(|rules| rules.get(rule_id))
            .cloned()
    }

    /// When set, every transaction and read fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn counters(&self) -> StoreCounters {
        StoreCounters {
            transactions: self.counters.transactions.load(Ordering::SeqCst),
            active_reads: self.counters.active_reads.load(Ordering::SeqCst),
            delta_reads: self.counters.delta_reads.load(Ordering::SeqCst),
            last_updated_reads: self.counters.last_updated_reads.load(Ordering::SeqCst),
        }
    }

    pub fn reset_counters(&self) {
        self.counters.transactions.store(0, Ordering::SeqCst);
        self.counters.active_reads.store(0, Ordering::SeqCst);
        self.counters.delta_reads.store(0, Ordering::SeqCst);
        self.counters.last_updated_reads.store(0, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl RuleStore for InMemoryRuleStore {
    fn read_only_transaction(
        &self,
        ctx: &ReadContext,
    ) -> Result<Box<dyn ReadTransaction + '_>, StoreError> {
        ctx.check()?;
        self.check_available()?;
        self.counters.transactions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            store: self,
            snapshot: Arc::clone(&*self.rows.read()),
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a InMemoryRuleStore,
    snapshot: Arc<Rows>,
}

impl MemoryTransaction<'_> {
    fn project_rules(&self, project: &str) -> impl Iterator<Item = &FailureAssociationRule> {
        self.snapshot
            .get(project)
            .into_iter()
            .flat_map(|rules| rules.values())
    }
}

impl ReadTransaction for MemoryTransaction<'_> {
    fn read_active(
        &mut self,
        ctx: &ReadContext,
        project: &str,
    ) -> Result<Vec<RuleRecord>, StoreError> {
        ctx.check()?;
        self.store.check_available()?;
        self.store.counters.active_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .project_rules(project)
            .filter(|r| r.is_active)
            .map(|r| RuleRecord {
                rule_id: r.rule_id.clone(),
                last_updated: r.last_updated,
                rule_definition: r.rule_definition.clone(),
            })
            .collect())
    }

    fn read_delta(
        &mut self,
        ctx: &ReadContext,
        project: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeltaRecord>, StoreError> {
        ctx.check()?;
        if since < starting_epoch() {
            return Err(StoreError::InvalidArgument(
                "cannot query rule deltas from before project inception".to_string(),
            ));
        }
        self.store.check_available()?;
        self.store.counters.delta_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .project_rules(project)
            .filter(|r| r.last_updated > since)
            .map(FailureAssociationRule::to_delta_record)
            .collect())
    }

    fn read_last_updated(
        &mut self,
        ctx: &ReadContext,
        project: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        ctx.check()?;
        self.store.check_available()?;
        self.store
            .counters
            .last_updated_reads
            .fetch_add(1, Ordering::SeqCst);
        Ok(self
            .project_rules(project)
            .map(|r| r.last_updated)
            .max()
            .unwrap_or_else(starting_epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap()
    }

    fn rule(id: &str, active: bool, last_updated: DateTime<Utc>) -> FailureAssociationRule {
        FailureAssociationRule::new("proj", id, r#"test = "x""#)
            .with_active(active)
            .with_last_updated(last_updated)
    }

    #[test]
    fn test_reads_filter_by_project_and_activity() {
        let store = InMemoryRuleStore::new();
        store.put_rule(rule("a", true, t0()));
        store.put_rule(rule("b", false, t0() + Duration::minutes(1)));
        store.put_rule(
            FailureAssociationRule::new("other", "c", r#"test = "y""#)
                .with_last_updated(t0() + Duration::hours(5)),
        );

        let ctx = ReadContext::background();
        let mut txn = store.read_only_transaction(&ctx).unwrap();

        let active = txn.read_active(&ctx, "proj").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_id, "a");

        let delta = txn.read_delta(&ctx, "proj", t0()).unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].rule_id, "b");
        assert!(!delta[0].is_active);

        assert_eq!(
            txn.read_last_updated(&ctx, "proj").unwrap(),
            t0() + Duration::minutes(1)
        );
        assert_eq!(txn.read_last_updated(&ctx, "none").unwrap(), starting_epoch());
    }

    #[test]
    fn test_transaction_sees_snapshot() {
        let store = InMemoryRuleStore::new();
        store.put_rule(rule("a", true, t0()));

        let ctx = ReadContext::background();
        let mut txn = store.read_only_transaction(&ctx).unwrap();
        store.put_rule(rule("b", true, t0() + Duration::hours(1)));

        assert_eq!(txn.read_active(&ctx, "proj").unwrap().len(), 1);
        assert_eq!(txn.read_last_updated(&ctx, "proj").unwrap(), t0());
    }

    #[test]
    fn test_delta_before_epoch_rejected() {
        let store = InMemoryRuleStore::new();
        let ctx = ReadContext::background();
        let mut txn = store.read_only_transaction(&ctx).unwrap();
        let err = txn
            .read_delta(&ctx, "proj", starting_epoch() - Duration::seconds(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_unavailable_and_counters() {
        let store = InMemoryRuleStore::new();
        let ctx = ReadContext::background();

        store.set_unavailable(true);
        assert!(matches!(
            store.read_only_transaction(&ctx).err(),
            Some(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);

        {
            let mut txn = store.read_only_transaction(&ctx).unwrap();
            txn.read_active(&ctx, "proj").unwrap();
            txn.read_last_updated(&ctx, "proj").unwrap();
        }
        let counters = store.counters();
        assert_eq!(counters.transactions, 1);
        assert_eq!(counters.rule_reads(), 1);
        assert_eq!(counters.last_updated_reads, 1);

        store.reset_counters();
        assert_eq!(store.counters(), StoreCounters::default());
    }
}
