//! Property-based tests for metrics, templating and config invariants.
//!
//! These tests use proptest to verify that core invariants hold
//! across a wide range of random inputs.

use proptest::prelude::*;
use std::time::{Duration, Instant};

use loadstorm::loadtest::config::TestPlan;
use loadstorm::loadtest::error::{ErrorKind, RequestError};
use loadstorm::loadtest::metrics::{
    MetricsCollector, MetricsRecorder, RequestResult, ResponseData,
};
use loadstorm::loadtest::template::{resolve, ScenarioContext};

fn success(latency: Duration) -> RequestResult {
    RequestResult::completed(Instant::now(), latency, 200, ResponseData::default())
}

fn timeout(latency: Duration) -> RequestResult {
    RequestResult::failed(
        Instant::now(),
        latency,
        RequestError::new(ErrorKind::Timeout, "timed out"),
    )
}

proptest! {
    /// Total requests in snapshot equals number of results recorded.
    #[test]
    fn metrics_total_matches_result_count(
        success_count in 0u32..100,
        error_count in 0u32..50,
        latency_ms in 1u64..500,
    ) {
        let mut recorder = MetricsRecorder::new(None);
        for _ in 0..success_count {
            recorder.record(&success(Duration::from_millis(latency_ms)));
        }
        for _ in 0..error_count {
            recorder.record(&timeout(Duration::from_millis(latency_ms)));
        }
        let snap = recorder.snapshot();
        prop_assert_eq!(snap.success_count, success_count as u64);
        prop_assert_eq!(snap.error_count, error_count as u64);
        prop_assert_eq!(snap.total_requests, (success_count + error_count) as u64);
        prop_assert_eq!(snap.errors_of(ErrorKind::Timeout), error_count as u64);
    }

    /// Error rate is always between 0.0 and 1.0 inclusive.
    #[test]
    fn error_rate_bounded(
        success_count in 0u32..100,
        error_count in 0u32..100,
    ) {
        let mut recorder = MetricsRecorder::new(None);
        for _ in 0..success_count {
            recorder.record(&success(Duration::from_millis(50)));
        }
        for _ in 0..error_count {
            recorder.record(&timeout(Duration::from_millis(50)));
        }
        let snap = recorder.snapshot();
        prop_assert!(snap.error_rate >= 0.0);
        prop_assert!(snap.error_rate <= 1.0);
    }

    /// P50 <= P90 <= P95 <= P99 always (monotonicity of percentiles).
    #[test]
    fn percentiles_monotonic(
        latencies in prop::collection::vec(1u64..10_000, 1..200),
    ) {
        let mut recorder = MetricsRecorder::new(None);
        for lat in &latencies {
            recorder.record(&success(Duration::from_millis(*lat)));
        }
        let l = recorder.snapshot().latency;
        prop_assert!(l.min_ms <= l.p50_ms, "min ({}) > p50 ({})", l.min_ms, l.p50_ms);
        prop_assert!(l.p50_ms <= l.p90_ms, "p50 ({}) > p90 ({})", l.p50_ms, l.p90_ms);
        prop_assert!(l.p90_ms <= l.p95_ms, "p90 ({}) > p95 ({})", l.p90_ms, l.p95_ms);
        prop_assert!(l.p95_ms <= l.p99_ms, "p95 ({}) > p99 ({})", l.p95_ms, l.p99_ms);
        prop_assert!(l.p99_ms <= l.max_ms, "p99 ({}) > max ({})", l.p99_ms, l.max_ms);
    }

    /// Reported maximum stays within 0.1% of the true maximum.
    #[test]
    fn max_latency_within_precision(
        latencies in prop::collection::vec(1u64..60_000_000, 1..100),
    ) {
        let mut recorder = MetricsRecorder::new(None);
        for us in &latencies {
            recorder.record(&success(Duration::from_micros(*us)));
        }
        let true_max_ms = *latencies.iter().max().unwrap() as f64 / 1000.0;
        let reported = recorder.snapshot().latency.max_ms;
        let relative = (reported - true_max_ms).abs() / true_max_ms;
        prop_assert!(relative <= 0.001, "max {} vs {} ({})", reported, true_max_ms, relative);
    }

    /// Sharding does not change the totals.
    #[test]
    fn collector_shards_sum_to_total(
        per_user in prop::collection::vec(0u32..30, 1..20),
        shards in 1usize..8,
    ) {
        let collector = MetricsCollector::new(shards, None);
        for (vu, count) in per_user.iter().enumerate() {
            for _ in 0..*count {
                collector.record(vu, &success(Duration::from_millis(5)));
            }
        }
        let expected: u64 = per_user.iter().map(|c| *c as u64).sum();
        prop_assert_eq!(collector.total_requests(), expected);
        prop_assert_eq!(collector.snapshot().total_requests, expected);
    }

    /// A resolved template never keeps a `${` token for a known variable.
    #[test]
    fn resolution_replaces_every_token(
        prefix in "[a-z /?=&]{0,12}",
        name in "[a-z][a-z0-9_]{0,8}",
        value in "[A-Za-z0-9]{0,16}",
        repeats in 1usize..4,
    ) {
        let template = format!("{prefix}${{{name}}}").repeat(repeats);
        let context = ScenarioContext::new([(name.clone(), value.clone())]);
        let resolved = resolve(&template, &context).unwrap();
        prop_assert!(!resolved.contains("${"), "unresolved placeholder in {:?}", resolved);
        prop_assert_eq!(resolved, format!("{prefix}{value}").repeat(repeats));
    }

    /// A missing variable is always reported by name.
    #[test]
    fn missing_variable_reported(name in "[a-z][a-z0-9_]{0,8}") {
        let template = format!("/items/${{{name}}}");
        let err = resolve(&template, &ScenarioContext::default()).unwrap_err();
        prop_assert_eq!(err.kind, ErrorKind::UnresolvedVariable);
        prop_assert!(err.message.contains(&name));
    }

    /// Any valid settings combination parses and validates.
    #[test]
    fn valid_plan_roundtrips(
        users in 1u32..500,
        duration in 1u64..3600,
        timeout in 1u64..30_000,
        think_min in 0.0f64..2.0,
        think_extra in 0.0f64..2.0,
    ) {
        let toml_str = format!(
            r#"
[settings]
users = {users}
duration_secs = {duration}
timeout_ms = {timeout}

[target]
url = "http://localhost:8080/health"

[think_time]
min_secs = {think_min:?}
max_secs = {:?}
"#,
            think_min + think_extra
        );
        let plan = TestPlan::from_toml(&toml_str).unwrap();
        prop_assert_eq!(plan.settings.users, users);
        prop_assert_eq!(plan.duration(), Duration::from_secs(duration));
        prop_assert_eq!(plan.timeout(), Duration::from_millis(timeout));
    }
}
