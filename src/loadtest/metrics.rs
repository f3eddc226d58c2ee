//! Sharded HdrHistogram metrics pipeline.
//!
//! Provides [`RequestResult`], the single outcome every send attempt produces,
//! [`MetricsRecorder`] which folds results into success/error histograms and
//! counters, and [`MetricsCollector`] which spreads recording across a fixed
//! set of mutex-guarded recorders so virtual users rarely contend.
//!
//! # Design
//!
//! - **Bounded memory**: no raw results are kept. Latencies go into
//!   auto-resizing histograms with 3 significant figures, so memory depends on
//!   the value range and not on the number of requests.
//! - **Microsecond resolution**: recorded in microseconds, reported in
//!   milliseconds. Relative error is at most 0.1% at every percentile.
//! - **Separate buckets**: success and error latencies are tracked in
//!   independent histograms so error spikes don't pollute success percentiles.
//!   Failures that never reached the network (configuration, exhaustion) are
//!   counted but not timed.
//! - **Mergeable**: a snapshot merges every shard into a fresh recorder, so the
//!   order in which results were recorded is irrelevant.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use crate::loadtest::error::{ErrorClass, ErrorKind, RequestError};

/// Headers and body of a received response, kept only until extraction and
/// validation have run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseData {
    /// Response headers in arrival order. Names are lowercase for HTTP.
    pub headers: Vec<(String, String)>,
    /// Response body decoded as UTF-8 (lossy).
    pub body: String,
}

/// Outcome of a single send attempt.
///
/// Every attempt produces exactly one, whether the request succeeded, timed
/// out, failed at the transport layer, or was never sent.
#[derive(Debug, Clone)]
pub struct RequestResult {
    /// When the attempt started.
    pub start_time: Instant,
    /// Time from send to full response (or failure).
    pub latency: Duration,
    /// HTTP status, or 101 for a WebSocket exchange.
    pub status: Option<u16>,
    /// Set for any failure, including validation failures.
    pub error: Option<RequestError>,
    /// Response body size in bytes.
    pub bytes_received: u64,
    /// `false` once a validation rule has rejected the response.
    pub validation_passed: bool,
    /// Workflow step name, when the request belongs to a named step.
    pub step: Option<String>,
    /// Response content for extraction and validation.
    pub response: Option<ResponseData>,
    /// Non-fatal problems observed while processing the result.
    pub warnings: Vec<String>,
    /// `false` when the attempt was abandoned before touching the network.
    pub sent: bool,
}

impl RequestResult {
    /// A response was received.
    pub fn completed(
        start_time: Instant,
        latency: Duration,
        status: u16,
        response: ResponseData,
    ) -> Self {
        Self {
            start_time,
            latency,
            status: Some(status),
            error: None,
            bytes_received: response.body.len() as u64,
            validation_passed: true,
            step: None,
            response: Some(response),
            warnings: Vec::new(),
            sent: true,
        }
    }

    /// The attempt failed before a response arrived.
    pub fn failed(start_time: Instant, latency: Duration, error: RequestError) -> Self {
        Self {
            start_time,
            latency,
            status: None,
            error: Some(error),
            bytes_received: 0,
            validation_passed: false,
            step: None,
            response: None,
            warnings: Vec::new(),
            sent: true,
        }
    }

    /// The attempt was abandoned before any network activity. Counted as an
    /// error but never timed.
    pub fn not_sent(error: RequestError) -> Self {
        Self {
            sent: false,
            ..Self::failed(Instant::now(), Duration::ZERO, error)
        }
    }

    /// Tags the result with its workflow step name.
    pub fn with_step(mut self, step: Option<String>) -> Self {
        self.step = step;
        self
    }

    /// Marks the result as failed when the verdict did not pass.
    ///
    /// A transport error already present is kept; validation never masks it.
    pub fn apply_verdict(&mut self, verdict: &crate::loadtest::validator::Verdict) {
        if verdict.passed {
            return;
        }
        self.validation_passed = false;
        if self.error.is_none() {
            self.error = Some(RequestError::new(
                ErrorKind::ValidationFailed,
                verdict.reasons.join("; "),
            ));
        }
    }

    /// `true` when no error of any kind was recorded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Response body, or an empty string when nothing was received.
    pub fn body(&self) -> &str {
        self.response.as_ref().map_or("", |r| r.body.as_str())
    }

    /// Returns the first response header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response.as_ref().and_then(|r| {
            r.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }
}

/// Latency distribution of one histogram. All values are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Number of values in the histogram (including synthetic fill-ins when
    /// coordinated omission correction is enabled).
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencySummary {
    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }
        let ms = |us: u64| us as f64 / 1000.0;
        Self {
            count: histogram.len(),
            min_ms: ms(histogram.min()),
            max_ms: ms(histogram.max()),
            mean_ms: histogram.mean() / 1000.0,
            p50_ms: ms(histogram.value_at_quantile(0.50)),
            p90_ms: ms(histogram.value_at_quantile(0.90)),
            p95_ms: ms(histogram.value_at_quantile(0.95)),
            p99_ms: ms(histogram.value_at_quantile(0.99)),
        }
    }
}

/// Per-step metrics, sorted alphabetically by step name in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSnapshot {
    pub name: String,
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    /// Success latency for this step.
    pub latency: LatencySummary,
}

/// Point-in-time aggregate of everything recorded so far.
///
/// Derived on demand; two snapshots taken with no record in between are equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Request attempts recorded (one per result, never inflated).
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Fraction of attempts that failed (0.0..=1.0).
    pub error_rate: f64,
    /// Attempts per second over [`MetricsSnapshot::elapsed_secs`].
    pub throughput_rps: f64,
    /// Seconds from the start of the earliest attempt to the end of the latest.
    pub elapsed_secs: f64,
    /// Success latency.
    pub latency: LatencySummary,
    /// Latency of attempts that reached the network and then failed.
    pub error_latency: LatencySummary,
    /// Error counts keyed by [`ErrorKind::category`].
    pub errors_by_kind: BTreeMap<String, u64>,
    /// Error counts keyed by [`ErrorClass`].
    pub errors_by_class: BTreeMap<String, u64>,
    /// Response counts keyed by status code.
    pub status_codes: BTreeMap<u16, u64>,
    pub bytes_received: u64,
    /// Per-step breakdown, sorted by step name.
    pub per_step: Vec<StepSnapshot>,
}

impl MetricsSnapshot {
    /// Count for a single error kind.
    pub fn errors_of(&self, kind: ErrorKind) -> u64 {
        self.errors_by_kind
            .get(kind.category())
            .copied()
            .unwrap_or(0)
    }

    /// Count for a whole error class.
    pub fn errors_in(&self, class: ErrorClass) -> u64 {
        self.errors_by_class
            .get(&class.to_string())
            .copied()
            .unwrap_or(0)
    }
}

fn new_histogram() -> Histogram<u64> {
    let mut histogram = Histogram::<u64>::new(3).expect("3 sigfigs is always valid");
    histogram.auto(true);
    histogram
}

/// Per-step counters and success histogram.
#[derive(Clone)]
struct StepMetrics {
    histogram: Histogram<u64>,
    total: u64,
    errors: u64,
}

impl StepMetrics {
    fn new() -> Self {
        Self {
            histogram: new_histogram(),
            total: 0,
            errors: 0,
        }
    }
}

/// HdrHistogram-backed recorder for one shard.
///
/// No internal locking; [`MetricsCollector`] wraps each recorder in a mutex.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use loadstorm::loadtest::metrics::{MetricsRecorder, RequestResult, ResponseData};
///
/// let mut recorder = MetricsRecorder::new(None);
/// recorder.record(&RequestResult::completed(
///     Instant::now(),
///     Duration::from_millis(42),
///     200,
///     ResponseData::default(),
/// ));
///
/// let snapshot = recorder.snapshot();
/// assert_eq!(snapshot.success_count, 1);
/// assert!((snapshot.latency.p50_ms - 42.0).abs() < 0.05);
/// ```
#[derive(Clone)]
pub struct MetricsRecorder {
    success_histogram: Histogram<u64>,
    error_histogram: Histogram<u64>,
    /// Expected interval between requests in microseconds, for
    /// coordinated omission correction via `record_correct()`.
    expected_interval_us: Option<u64>,
    total: u64,
    success: u64,
    errors_by_kind: BTreeMap<ErrorKind, u64>,
    status_codes: BTreeMap<u16, u64>,
    bytes_received: u64,
    per_step: BTreeMap<String, StepMetrics>,
    first_start: Option<Instant>,
    last_end: Option<Instant>,
}

impl MetricsRecorder {
    /// Create an empty recorder.
    ///
    /// When `expected_interval` is set, a latency much longer than the interval
    /// also records the synthetic samples that a stalled sender would have
    /// produced.
    pub fn new(expected_interval: Option<Duration>) -> Self {
        Self {
            success_histogram: new_histogram(),
            error_histogram: new_histogram(),
            expected_interval_us: expected_interval
                .map(|d| d.as_micros() as u64)
                .filter(|us| *us > 0),
            total: 0,
            success: 0,
            errors_by_kind: BTreeMap::new(),
            status_codes: BTreeMap::new(),
            bytes_received: 0,
            per_step: BTreeMap::new(),
            first_start: None,
            last_end: None,
        }
    }

    fn record_latency(histogram: &mut Histogram<u64>, us: u64, expected_interval_us: Option<u64>) {
        let _ = match expected_interval_us {
            Some(interval) => histogram.record_correct(us, interval),
            None => histogram.record(us),
        };
    }

    /// Folds one result into the recorder.
    pub fn record(&mut self, result: &RequestResult) {
        let us = result.latency.as_micros() as u64;
        self.total += 1;

        let end = result.start_time + result.latency;
        self.first_start = Some(match self.first_start {
            Some(first) => first.min(result.start_time),
            None => result.start_time,
        });
        self.last_end = Some(match self.last_end {
            Some(last) => last.max(end),
            None => end,
        });

        if let Some(status) = result.status {
            *self.status_codes.entry(status).or_insert(0) += 1;
        }
        self.bytes_received += result.bytes_received;

        match &result.error {
            None => {
                Self::record_latency(&mut self.success_histogram, us, self.expected_interval_us);
                self.success += 1;
            },
            Some(err) => {
                *self.errors_by_kind.entry(err.kind).or_insert(0) += 1;
                let timed =
                    matches!(err.class(), ErrorClass::Transport | ErrorClass::Validation);
                if result.sent && timed {
                    Self::record_latency(&mut self.error_histogram, us, self.expected_interval_us);
                }
            },
        }

        if let Some(ref name) = result.step {
            let step = self
                .per_step
                .entry(name.clone())
                .or_insert_with(StepMetrics::new);
            step.total += 1;
            if result.error.is_none() {
                Self::record_latency(&mut step.histogram, us, self.expected_interval_us);
            } else {
                step.errors += 1;
            }
        }
    }

    /// Adds everything `other` has recorded into `self`.
    pub fn merge(&mut self, other: &MetricsRecorder) {
        let _ = self.success_histogram.add(&other.success_histogram);
        let _ = self.error_histogram.add(&other.error_histogram);
        self.total += other.total;
        self.success += other.success;
        for (kind, count) in &other.errors_by_kind {
            *self.errors_by_kind.entry(*kind).or_insert(0) += count;
        }
        for (status, count) in &other.status_codes {
            *self.status_codes.entry(*status).or_insert(0) += count;
        }
        self.bytes_received += other.bytes_received;
        for (name, step) in &other.per_step {
            let merged = self
                .per_step
                .entry(name.clone())
                .or_insert_with(StepMetrics::new);
            let _ = merged.histogram.add(&step.histogram);
            merged.total += step.total;
            merged.errors += step.errors;
        }
        self.first_start = match (self.first_start, other.first_start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_end = match (self.last_end, other.last_end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Request attempts recorded so far.
    pub fn total_requests(&self) -> u64 {
        self.total
    }

    /// Capture a point-in-time snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let error_count = self.total - self.success;
        let error_rate = if self.total == 0 {
            0.0
        } else {
            error_count as f64 / self.total as f64
        };

        let elapsed = match (self.first_start, self.last_end) {
            (Some(first), Some(last)) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        };
        let elapsed_secs = elapsed.as_secs_f64();
        let throughput_rps = if elapsed_secs > 0.0 {
            self.total as f64 / elapsed_secs
        } else {
            0.0
        };

        let mut errors_by_class = BTreeMap::new();
        for (kind, count) in &self.errors_by_kind {
            *errors_by_class
                .entry(kind.class().to_string())
                .or_insert(0) += count;
        }

        let per_step = self
            .per_step
            .iter()
            .map(|(name, step)| StepSnapshot {
                name: name.clone(),
                total_requests: step.total,
                success_count: step.total - step.errors,
                error_count: step.errors,
                error_rate: if step.total == 0 {
                    0.0
                } else {
                    step.errors as f64 / step.total as f64
                },
                latency: LatencySummary::from_histogram(&step.histogram),
            })
            .collect();

        MetricsSnapshot {
            total_requests: self.total,
            success_count: self.success,
            error_count,
            error_rate,
            throughput_rps,
            elapsed_secs,
            latency: LatencySummary::from_histogram(&self.success_histogram),
            error_latency: LatencySummary::from_histogram(&self.error_histogram),
            errors_by_kind: self
                .errors_by_kind
                .iter()
                .map(|(kind, count)| (kind.category().to_string(), *count))
                .collect(),
            errors_by_class,
            status_codes: self.status_codes.clone(),
            bytes_received: self.bytes_received,
            per_step,
        }
    }
}

/// Thread-safe, cheaply cloneable collector shared by all virtual users.
///
/// Each user records into shard `vu_id % shards`, so at most a handful of users
/// ever contend on one lock. A snapshot locks the shards one at a time.
#[derive(Clone)]
pub struct MetricsCollector {
    shards: Arc<[Mutex<MetricsRecorder>]>,
    expected_interval: Option<Duration>,
}

impl MetricsCollector {
    /// Create a collector with `shards` recorders (at least one).
    pub fn new(shards: usize, expected_interval: Option<Duration>) -> Self {
        let shards: Vec<_> = (0..shards.max(1))
            .map(|_| Mutex::new(MetricsRecorder::new(expected_interval)))
            .collect();
        Self {
            shards: Arc::from(shards),
            expected_interval,
        }
    }

    /// Create a collector with one shard per available CPU.
    pub fn with_default_shards(expected_interval: Option<Duration>) -> Self {
        let shards = std::thread::available_parallelism().map_or(4, |n| n.get());
        Self::new(shards, expected_interval)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Records a result into the shard selected by `shard_hint`.
    pub fn record(&self, shard_hint: usize, result: &RequestResult) {
        let index = shard_hint % self.shards.len();
        self.shards[index].lock().record(result);
    }

    /// Total attempts recorded across all shards.
    pub fn total_requests(&self) -> u64 {
        self.shards.iter().map(|s| s.lock().total_requests()).sum()
    }

    /// Merges every shard into a fresh recorder and snapshots it.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut merged = MetricsRecorder::new(self.expected_interval);
        for shard in self.shards.iter() {
            merged.merge(&shard.lock());
        }
        merged.snapshot()
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("shards", &self.shards.len())
            .field("expected_interval", &self.expected_interval)
            .finish()
    }
}
