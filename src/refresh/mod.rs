//! Ruleset refresh - rebuild rulesets from the rule store.
//!
//! Provides two pieces:
//! 1. **RefreshEngine**: full or delta refresh of one project's ruleset
//! 2. **RefreshScheduler**: periodic background warm-up of the ruleset cache

pub mod engine;
pub mod scheduler;

pub use engine::{RefreshEngine, RefreshMode, RefreshOutcome, RefreshStats};
pub use scheduler::{RefreshScheduler, WarmStats};
