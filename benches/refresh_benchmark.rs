//! Refresh benchmarks.
//!
//! Compares a full load of a large project against a delta refresh that
//! touches only a handful of rules, and measures the cached read path.

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rulecache::config::CacheConfig;
use rulecache::{
    FailureAssociationRule, InMemoryRuleStore, ManualClock, ReadContext, RefreshEngine, Ruleset,
    RulesetCache,
};
use std::sync::Arc;

fn populated_store(rule_count: usize) -> Arc<InMemoryRuleStore> {
    let base = Utc.with_ymd_and_hms(2022, 5, 1, 0, 0, 0).unwrap();
    let store = Arc::new(InMemoryRuleStore::new());
    for i in 0..rule_count {
        store.put_rule(
            FailureAssociationRule::new(
                "bench",
                format!("{:032x}", i),
                format!(r#"reason LIKE "%failure signature {}%" OR test = "suite.case_{}""#, i, i),
            )
            .with_last_updated(base + Duration::seconds(i as i64)),
        );
    }
    store
}

fn bench_full_vs_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("refresh");
    let ctx = ReadContext::background();

    for rule_count in [100usize, 1_000, 10_000] {
        let store = populated_store(rule_count);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = RefreshEngine::new(store.clone(), clock);
        let empty = Ruleset::empty("bench");

        group.bench_with_input(BenchmarkId::new("full", rule_count), &empty, |b, empty| {
            b.iter(|| engine.refresh(&ctx, black_box(empty)));
        });

        let loaded = match engine.refresh(&ctx, &empty) {
            Ok(outcome) => outcome.ruleset,
            Err(e) => panic!("initial load failed: {}", e),
        };
        let latest = loaded.rules_version();
        for i in 0..5 {
            store.put_rule(
                FailureAssociationRule::new("bench", format!("{:032x}", i), r#"test = "changed""#)
                    .with_last_updated(latest + Duration::seconds(i + 1)),
            );
        }

        group.bench_with_input(BenchmarkId::new("delta", rule_count), &loaded, |b, loaded| {
            b.iter(|| engine.refresh(&ctx, black_box(loaded)));
        });
    }

    group.finish();
}

fn bench_cached_read(c: &mut Criterion) {
    let store = populated_store(1_000);
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let cache = RulesetCache::new(store, clock, &CacheConfig::default());
    let ctx = ReadContext::background();
    if let Err(e) = cache.ruleset(&ctx, "bench") {
        panic!("initial load failed: {}", e);
    }

    c.bench_function("cache/hit", |b| {
        b.iter(|| cache.ruleset(&ctx, black_box("bench")));
    });
}

criterion_group!(benches, bench_full_vs_delta, bench_cached_read);
criterion_main!(benches);
