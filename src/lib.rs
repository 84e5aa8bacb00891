//! # Ruleset Cache
//!
//! In-process cache of compiled failure association rules, one versioned
//! snapshot per project, kept current by incremental (delta) reads from the
//! rule store.
//!
//! ## Architecture
//!
//! ```text
//! RulesetCache ──▶ RefreshEngine ──▶ RuleStore (SQLite / in-memory)
//!      │                 │
//!      ▼                 ▼
//!  Arc<Ruleset>  ◀── CompiledRule ◀── lang::parse
//! ```
//!
//! - [`RulesetCache`]: lazily refreshes a project when its snapshot is older
//!   than the refresh interval and swaps in the new snapshot atomically.
//! - [`RefreshEngine`]: full load for a never-loaded project, delta merge
//!   otherwise, reusing compiled rules that did not change.
//! - [`Ruleset`]: immutable, sorted by last update, with O(1) lookup by ID.
//! - [`RefreshScheduler`]: optional background warm-up of configured projects.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod lang;
pub mod refresh;
pub mod rule;
pub mod ruleset;
pub mod store;
pub mod types;

pub use cache::RulesetCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{CacheError, ConfigError, ParseError, StoreError};
pub use lang::{CompiledPredicate, Failure};
pub use refresh::{RefreshEngine, RefreshMode, RefreshOutcome, RefreshScheduler, RefreshStats};
pub use rule::{BugId, ClusterId, CompiledRule, DeltaRecord, FailureAssociationRule, RuleRecord};
pub use ruleset::{Ruleset, RulesetSummary};
pub use store::{InMemoryRuleStore, ReadContext, ReadTransaction, RuleStore, SqliteRuleStore};
pub use types::starting_epoch;
