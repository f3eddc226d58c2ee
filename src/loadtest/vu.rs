//! Virtual user (VU) task loop for load test execution.
//!
//! Each VU waits for its ramp-up slot, then owns one [`ProtocolExecutor`] and
//! one [`ScenarioContext`] for the rest of the run. It walks the workflow step
//! by step: resolve, acquire a rate token, send, validate, extract, record,
//! think. Request failures are recorded and never end the loop.
//!
//! [`ProtocolExecutor`]: crate::loadtest::executor::ProtocolExecutor

use crate::loadtest::config::{TestMode, TestPlan};
use crate::loadtest::error::ErrorKind;
use crate::loadtest::executor::ExecutorFactory;
use crate::loadtest::metrics::{MetricsCollector, RequestResult};
use crate::loadtest::rate::RateLimiter;
use crate::loadtest::template::ScenarioContext;
use crate::loadtest::workflow::{extract, NextStep, Workflow, WorkflowCursor};

use parking_lot::Mutex;
use rand::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Atomic counter tracking the number of currently active virtual users.
///
/// Lightweight wrapper around `Arc<AtomicU32>` for clone-friendly sharing
/// across VU tasks and the engine orchestrator.
#[derive(Clone)]
pub struct ActiveVuCounter(Arc<AtomicU32>);

impl ActiveVuCounter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(0)))
    }

    /// Increments the active VU count by one.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the active VU count by one.
    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns the current number of active VUs.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for ActiveVuCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Run-level warnings, deduplicated and kept in arrival order.
#[derive(Clone, Default)]
pub struct RunWarnings {
    inner: Arc<Mutex<WarningLog>>,
}

#[derive(Default)]
struct WarningLog {
    seen: BTreeSet<String>,
    messages: Vec<String>,
}

impl RunWarnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores and logs `message` unless an identical warning exists.
    ///
    /// Returns `true` if the warning was new.
    pub fn warn(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut log = self.inner.lock();
        if !log.seen.insert(message.clone()) {
            return false;
        }
        tracing::warn!(warning = %message, "run warning");
        log.messages.push(message);
        true
    }

    pub fn messages(&self) -> Vec<String> {
        self.inner.lock().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consecutive persistent failures seen by one user.
#[derive(Debug, Clone)]
pub struct FailureStreak {
    threshold: u32,
    count: u32,
}

impl FailureStreak {
    /// A threshold of 0 disables escalation.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            count: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Updates the streak with one outcome.
    ///
    /// Returns the kind and length of the streak when it has just reached the
    /// threshold. Any outcome that is not a persistent failure resets it.
    pub fn observe(&mut self, result: &RequestResult) -> Option<(ErrorKind, u32)> {
        match result.error_kind().filter(ErrorKind::is_persistent) {
            Some(kind) => {
                self.count += 1;
                (self.threshold > 0 && self.count == self.threshold).then_some((kind, self.count))
            },
            None => {
                self.count = 0;
                None
            },
        }
    }
}

/// Start delay of user `index` out of `users` with a ramp-up `window`.
///
/// Linear stagger: `index * window / users`.
pub fn ramp_delay(index: u32, users: u32, window: Duration) -> Duration {
    if users == 0 || window.is_zero() {
        return Duration::ZERO;
    }
    window.mul_f64(f64::from(index) / f64::from(users))
}

/// `start + offset`, or roughly thirty years out when that overflows.
pub fn offset_instant(start: Instant, offset: Duration) -> Instant {
    start
        .checked_add(offset)
        .unwrap_or_else(|| start + Duration::from_secs(86_400 * 365 * 30))
}

/// Sleeps a uniformly random duration in `[min, max]`.
///
/// Returns `false` if cancelled first.
pub async fn think(min: Duration, max: Duration, cancel: &CancellationToken) -> bool {
    let pause = if max > min {
        Duration::from_secs_f64(rand::rng().random_range(min.as_secs_f64()..=max.as_secs_f64()))
    } else {
        min
    };
    if pause.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(pause) => true,
    }
}

/// Everything a virtual user task needs, shared by all users of a run.
pub struct RunContext {
    pub plan: Arc<TestPlan>,
    pub workflow: Arc<Workflow>,
    pub collector: MetricsCollector,
    pub limiter: Arc<RateLimiter>,
    pub executors: ExecutorFactory,
    pub cancel: CancellationToken,
    pub active: ActiveVuCounter,
    pub warnings: RunWarnings,
    /// Seed for `${base_url}`.
    pub base_url: String,
    pub started: Instant,
}

/// Main virtual user task loop.
///
/// The `active` counter is incremented once the user's ramp-up slot arrives
/// and decremented on every exit path.
pub async fn vu_loop(vu_id: u32, run: Arc<RunContext>) {
    let start_at = offset_instant(
        run.started,
        ramp_delay(vu_id, run.plan.settings.users, run.plan.ramp_up()),
    );
    tokio::select! {
        biased;
        _ = run.cancel.cancelled() => return,
        _ = tokio::time::sleep_until(start_at) => {},
    }

    run.active.increment();
    tracing::debug!(vu_id, "virtual user started");

    let attempts = vu_loop_inner(vu_id, &run).await;

    tracing::debug!(vu_id, attempts, "virtual user stopped");
    run.active.decrement();
}

/// Returns the number of attempts made.
async fn vu_loop_inner(vu_id: u32, run: &RunContext) -> u32 {
    let plan = &run.plan;
    let limit = match plan.settings.mode {
        TestMode::Fixed => Some(plan.settings.requests_per_user),
        TestMode::Loop => None,
    };
    let (think_min, think_max) = plan.think_range();

    let mut executor = run.executors.create(vu_id, run.cancel.clone());
    let mut context = ScenarioContext::seeded(&run.base_url, vu_id);
    let mut cursor = WorkflowCursor::new(run.workflow.clone());
    let mut streak = FailureStreak::new(plan.settings.fatal_failure_threshold);
    let mut attempts = 0u32;

    loop {
        if run.cancel.is_cancelled() {
            break;
        }

        let (name, result) = match cursor.next_step(&context) {
            NextStep::EndOfWorkflow => {
                cursor.restart(&mut context);
                continue;
            },
            NextStep::Failed { name, error } => {
                if error.kind == ErrorKind::UnresolvedVariable {
                    run.warnings.warn(format!(
                        "step '{}': {}",
                        name.as_deref().unwrap_or("unnamed"),
                        error.message
                    ));
                }
                cursor.abort();
                (name, RequestResult::not_sent(error))
            },
            NextStep::Ready(step) => match run.limiter.acquire(&run.cancel).await {
                Ok(None) => break,
                Err(error) => {
                    cursor.abort();
                    (step.name, RequestResult::not_sent(error))
                },
                Ok(Some(_token)) => {
                    let mut result = executor.execute(&step.request).await;
                    if let Some(compiled) = run.workflow.step(step.index) {
                        let verdict = compiled.validator().validate(&result);
                        result.apply_verdict(&verdict);
                        if result.error.is_none() {
                            let warnings = extract(&mut context, &result, compiled.extractors());
                            result.warnings.extend(warnings);
                        }
                    }
                    if let Some(response) = &result.response {
                        context.absorb_set_cookies(&response.headers);
                    }
                    if result.error.is_some() {
                        cursor.abort();
                    }
                    (step.name, result)
                },
            },
        };

        finish(vu_id, run, &mut streak, result.with_step(name));
        attempts += 1;
        if reached(limit, attempts) {
            break;
        }
        if !think(think_min, think_max, &run.cancel).await {
            break;
        }
    }

    executor.close().await;
    attempts
}

fn reached(limit: Option<u32>, attempts: u32) -> bool {
    limit.is_some_and(|max| attempts >= max)
}

/// Records one attempt and escalates persistent failure streaks.
fn finish(vu_id: u32, run: &RunContext, streak: &mut FailureStreak, result: RequestResult) {
    for warning in &result.warnings {
        run.warnings.warn(warning.clone());
    }
    tracing::trace!(
        vu_id,
        step = result.step.as_deref().unwrap_or(""),
        status = result.status.unwrap_or(0),
        error_kind = result.error_kind().map_or("", |k| k.category()),
        latency_ms = result.latency.as_secs_f64() * 1000.0,
        "attempt recorded"
    );
    run.collector.record(vu_id as usize, &result);

    if let Some((kind, count)) = streak.observe(&result) {
        run.warnings.warn(format!(
            "virtual user {vu_id}: {count} consecutive {kind} failures"
        ));
    }
}
