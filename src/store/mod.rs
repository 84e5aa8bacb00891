//! Rule store interface consumed by the refresh engine.
//!
//! All reads of one refresh go through a single [`ReadTransaction`], so the
//! rule rows and the project's last-updated version are observed from the
//! same snapshot. Transactions are released when dropped, on every exit path.
//!
//! Implementations:
//! - [`SqliteRuleStore`]: persistent store backed by SQLite
//! - [`InMemoryRuleStore`]: snapshot-per-transaction store with operation
//!   counters and fault injection

pub mod memory;
pub mod sqlite;
pub mod validation;

pub use memory::{InMemoryRuleStore, StoreCounters};
pub use sqlite::SqliteRuleStore;

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::rule::{DeltaRecord, RuleRecord};

// ================================================================================================
// STORE TRAITS
// ================================================================================================

/// A source of failure association rules.
pub trait RuleStore: Send + Sync {
    /// Opens a read-only transaction over a consistent snapshot of the store.
    fn read_only_transaction(
        &self,
        ctx: &ReadContext,
    ) -> Result<Box<dyn ReadTransaction + '_>, StoreError>;
}

/// Reads against one consistent store snapshot.
pub trait ReadTransaction {
    /// Reads all currently active rules of the project.
    fn read_active(
        &mut self,
        ctx: &ReadContext,
        project: &str,
    ) -> Result<Vec<RuleRecord>, StoreError>;

    /// Reads every rule of the project, active or not, last updated strictly
    /// after `since`.
    fn read_delta(
        &mut self,
        ctx: &ReadContext,
        project: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeltaRecord>, StoreError>;

    /// Reads the latest `last_updated` of any rule in the project, or the
    /// starting epoch if the project has no rules at all.
    ///
    /// The maximum over *all* rules is needed, not just active ones: the most
    /// recent change may have been a rule becoming inactive.
    fn read_last_updated(
        &mut self,
        ctx: &ReadContext,
        project: &str,
    ) -> Result<DateTime<Utc>, StoreError>;
}

// ================================================================================================
// READ CONTEXT
// ================================================================================================

/// Caller-scoped deadline and cancellation for store reads.
#[derive(Debug, Clone, Default)]
pub struct ReadContext {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl ReadContext {
    /// A context with no deadline that cannot be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline(Instant::now() + timeout)
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Ties the context to a token; reads fail once it is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Fails if the caller has cancelled or the deadline has passed.
    ///
    /// Stores call this before each read and periodically while reading rows.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(StoreError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StoreError::DeadlineExceeded);
        }
        Ok(())
    }
}
