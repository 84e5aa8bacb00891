//! Scheduled cache warm-up - background task that keeps configured projects fresh.
//!
//! Rulesets are normally refreshed lazily, by the first request that finds
//! them stale. For busy projects that request then pays for the store round
//! trip. The scheduler requests each configured project on a fixed interval
//! so the refresh usually happens in the background instead.
//!
//! The scheduler only calls [`RulesetCache::ruleset`]; it has no refresh
//! logic of its own, and a warm-up of a still-fresh project is a cache hit.
//! A failed warm-up is logged and leaves the cache as it was.

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::RulesetCache;
use crate::config::SchedulerConfig;
use crate::store::ReadContext;

/// Result of one warm-up pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmStats {
    pub warmed: usize,
    pub failed: usize,
}

/// Periodically refreshes a fixed list of projects in the ruleset cache.
///
/// Runs as a background task spawned during server initialization.
pub struct RefreshScheduler {
    cache: Arc<RulesetCache>,
    config: SchedulerConfig,
    read_timeout: Option<Duration>,
    /// Refresh time of the newest ruleset produced by a warm-up
    last_refresh_at: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl RefreshScheduler {
    pub fn new(cache: Arc<RulesetCache>, config: SchedulerConfig) -> Self {
        Self {
            cache,
            config,
            read_timeout: None,
            last_refresh_at: Arc::new(RwLock::new(None)),
        }
    }

    /// Applies a timeout to every store read issued by a warm-up.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Returns the refresh time of the newest ruleset seen by a successful
    /// warm-up, or `None` if no warm-up has succeeded yet.
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh_at.read()
    }

    /// Starts the scheduler background task.
    ///
    /// Runs until `cancel` fires and should be spawned as a tokio task.
    /// Returns immediately if the scheduler is disabled or has no projects.
    /// Cancelling also aborts the store reads of a warm-up in progress.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use rulecache::{RefreshScheduler, RulesetCache};
    /// # use rulecache::config::SchedulerConfig;
    /// # use tokio_util::sync::CancellationToken;
    /// # fn run(cache: Arc<RulesetCache>, config: SchedulerConfig) {
    /// let shutdown = CancellationToken::new();
    /// let scheduler = Arc::new(RefreshScheduler::new(cache, config));
    /// tokio::spawn(scheduler.start(shutdown.child_token()));
    /// // ...
    /// shutdown.cancel();
    /// # }
    /// ```
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Scheduled warm-up is disabled, skipping");
            return;
        }
        if self.config.projects.is_empty() {
            info!("No projects configured for scheduled warm-up, skipping");
            return;
        }

        let period = self.config.warm_interval().max(Duration::from_secs(1));
        info!(
            "Starting scheduled warm-up of {} projects with {}-second interval",
            self.config.projects.len(),
            period.as_secs()
        );

        // Spread the first pass so replicas started together do not hit the
        // store at the same moment.
        let jitter_ms = rand::thread_rng().gen_range(0..=period.as_millis().min(5_000) as u64);
        let mut ticker = interval_at(Instant::now() + Duration::from_millis(jitter_ms), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Scheduled warm-up shutting down (cancelled)");
                    break;
                }

                _ = ticker.tick() => {
                    let stats = self.warm_once(&cancel).await;
                    if stats.failed == 0 {
                        debug!("Scheduled warm-up completed: {} projects", stats.warmed);
                    }
                }
            }
        }
    }

    /// Runs one warm-up pass over every configured project.
    ///
    /// Stops early, without counting the remaining projects, once `cancel`
    /// fires.
    pub async fn warm_once(&self, cancel: &CancellationToken) -> WarmStats {
        let mut stats = WarmStats::default();

        for project in &self.config.projects {
            if cancel.is_cancelled() {
                break;
            }
            let cache = Arc::clone(&self.cache);
            let ctx = match self.read_timeout {
                Some(timeout) => ReadContext::with_timeout(timeout),
                None => ReadContext::background(),
            }
            .cancellation(cancel.child_token());
            let name = project.clone();

            // Refreshes block on the store; keep them off the async workers.
            let result =
                tokio::task::spawn_blocking(move || cache.ruleset(&ctx, &name)).await;

            match result {
                Ok(Ok(ruleset)) => {
                    stats.warmed += 1;
                    let mut last = self.last_refresh_at.write();
                    if last.map_or(true, |t| t < ruleset.last_refresh()) {
                        *last = Some(ruleset.last_refresh());
                    }
                }
                Ok(Err(e)) => {
                    stats.failed += 1;
                    error!("Scheduled warm-up of project {} failed: {}", project, e);
                }
                Err(e) => {
                    stats.failed += 1;
                    error!("Scheduled warm-up of project {} panicked: {}", project, e);
                }
            }
        }

        if stats.failed > 0 {
            info!(
                "Scheduled warm-up completed: {} warmed, {} failed",
                stats.warmed, stats.failed
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::rule::FailureAssociationRule;
    use crate::store::InMemoryRuleStore;
    use chrono::TimeZone;

    fn setup(projects: &[&str]) -> (Arc<InMemoryRuleStore>, Arc<RulesetCache>, RefreshScheduler) {
        let store = Arc::new(InMemoryRuleStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap(),
        ));
        let cache = Arc::new(RulesetCache::new(
            store.clone(),
            clock,
            &CacheConfig::default(),
        ));
        let config = SchedulerConfig {
            enabled: true,
            warm_interval_secs: 1,
            projects: projects.iter().map(|p| p.to_string()).collect(),
        };
        let scheduler = RefreshScheduler::new(Arc::clone(&cache), config);
        (store, cache, scheduler)
    }

    #[tokio::test]
    async fn test_warm_once_loads_projects() {
        let (store, cache, scheduler) = setup(&["alpha", "beta"]);
        store.put_rule(FailureAssociationRule::new("alpha", "r1", r#"test = "x""#));

        assert_eq!(scheduler.last_refresh(), None);
        let stats = scheduler.warm_once(&CancellationToken::new()).await;

        assert_eq!(stats, WarmStats { warmed: 2, failed: 0 });
        assert_eq!(cache.peek("alpha").unwrap().len(), 1);
        assert!(cache.peek("beta").unwrap().is_empty());
        assert_eq!(
            scheduler.last_refresh(),
            Some(Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_warm_once_reports_failures() {
        let (store, cache, scheduler) = setup(&["alpha"]);
        store.set_unavailable(true);

        let stats = scheduler.warm_once(&CancellationToken::new()).await;
        assert_eq!(stats, WarmStats { warmed: 0, failed: 1 });
        assert_eq!(scheduler.last_refresh(), None);
        assert!(cache.peek("alpha").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_scheduler_returns() {
        let (_store, cache, _) = setup(&["alpha"]);
        let config = SchedulerConfig {
            enabled: false,
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(RefreshScheduler::new(cache, config));
        // Would never finish if the loop started.
        scheduler.start(CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_no_projects_returns() {
        let (_store, _cache, scheduler) = setup(&[]);
        Arc::new(scheduler).start(CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_cancelled_warm_once_skips_projects() {
        let (store, cache, scheduler) = setup(&["alpha", "beta"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = scheduler.warm_once(&cancel).await;
        assert_eq!(stats, WarmStats::default());
        assert_eq!(store.counters().transactions, 0);
        assert!(cache.peek("alpha").is_none());
    }

    #[tokio::test]
    async fn test_start_stops_on_cancel() {
        let (_store, _cache, scheduler) = setup(&["alpha"]);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::new(scheduler).start(shutdown.child_token()));

        shutdown.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }
}
