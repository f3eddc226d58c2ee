//! Load test execution engine with live status and graceful shutdown.
//!
//! [`LoadTestEngine`] is the top-level orchestrator that:
//! - Spawns N virtual user tasks via [`tokio_util::task::TaskTracker`]
//! - Shares one rate limiter, one connection pool and one sharded
//!   [`MetricsCollector`] between them
//! - Publishes [`RunStatus`] through a watch channel for live display
//! - Coordinates graceful shutdown via [`CancellationToken`]
//!
//! A run stops on the first of: loop-mode duration expiry, every fixed-mode
//! user finishing, the fixed-mode safety timeout, or [`RunHandle::stop`].

use crate::loadtest::config::{TestMode, TestPlan};
use crate::loadtest::error::LoadTestError;
use crate::loadtest::executor::ExecutorFactory;
use crate::loadtest::metrics::{MetricsCollector, MetricsSnapshot};
use crate::loadtest::rate::RateLimiter;
use crate::loadtest::vu::{offset_instant, vu_loop, ActiveVuCounter, RunContext, RunWarnings};
use crate::loadtest::workflow::{Workflow, WorkflowDefinition};

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Upper bound on retained history points.
pub const MAX_HISTORY_POINTS: usize = 3600;

/// Compile-time Send bounds verification for channel-transported types.
fn _assert_send<T: Send>() {}
#[allow(dead_code)]
fn _check_send_bounds() {
    _assert_send::<RunStatus>();
    _assert_send::<LoadTestResult>();
}

/// Live view published through the watch channel.
#[derive(Debug, Clone, Default)]
pub struct RunStatus {
    pub snapshot: MetricsSnapshot,
    pub active_users: u32,
    pub elapsed: Duration,
    /// Fraction complete in `[0, 1]`.
    pub progress: f64,
    pub warnings: Vec<String>,
}

/// One sample of the run history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    /// Seconds since test start.
    pub elapsed_secs: f64,
    /// Attempts per second over the preceding interval.
    pub rps: f64,
    pub active_users: u32,
    pub p95_ms: f64,
}

/// Result of a completed load test run.
#[derive(Debug, Clone)]
pub struct LoadTestResult {
    /// Final metrics snapshot.
    pub snapshot: MetricsSnapshot,
    /// Total elapsed time of the test.
    pub elapsed: Duration,
    /// Run-level warnings in the order they were first raised.
    pub warnings: Vec<String>,
    pub history: Vec<HistoryPoint>,
    /// Highest per-interval throughput seen in the history.
    pub max_rps: f64,
    /// Number of users still active when the result was taken.
    pub final_active_users: u32,
}

/// Top-level load test engine configuration and entry point.
pub struct LoadTestEngine {
    plan: TestPlan,
    workflow: WorkflowDefinition,
    executors: Option<ExecutorFactory>,
    history_interval: Option<Duration>,
}

impl LoadTestEngine {
    /// Creates an engine for `plan` running `workflow`.
    pub fn new(plan: TestPlan, workflow: WorkflowDefinition) -> Self {
        Self {
            plan,
            workflow,
            executors: None,
            history_interval: None,
        }
    }

    /// Replaces the protocol executors derived from the plan.
    pub fn with_executor_factory(mut self, factory: ExecutorFactory) -> Self {
        self.executors = Some(factory);
        self
    }

    /// Overrides the plan's history sampling interval.
    pub fn with_history_interval(mut self, interval: Duration) -> Self {
        self.history_interval = Some(interval);
        self
    }

    pub fn plan(&self) -> &TestPlan {
        &self.plan
    }

    /// Validates the plan and workflow, then spawns every virtual user.
    ///
    /// Configuration problems are returned before any user starts. Must be
    /// called inside a tokio runtime.
    pub fn start(self) -> Result<RunHandle, LoadTestError> {
        self.plan.validate()?;
        let workflow = Arc::new(Workflow::compile(self.workflow, &self.plan)?);
        for name in workflow.unbound_variables() {
            tracing::warn!(variable = %name, "no step extracts this variable; requests using it will fail");
        }
        let executors = match self.executors {
            Some(factory) => factory,
            None => ExecutorFactory::from_plan(&self.plan)?,
        };
        let base_url = self.plan.origin()?;
        let history_interval = self
            .history_interval
            .unwrap_or_else(|| self.plan.history_interval())
            .max(Duration::from_millis(1));

        let plan = Arc::new(self.plan);
        let collector = MetricsCollector::with_default_shards(plan.expected_interval());
        let limiter = Arc::new(RateLimiter::new(
            plan.rate_limit.requests_per_second,
            plan.acquire_timeout(),
        ));
        let cancel = CancellationToken::new();
        let active = ActiveVuCounter::new();
        let warnings = RunWarnings::new();
        let started = Instant::now();

        tracing::info!(
            users = plan.settings.users,
            mode = ?plan.settings.mode,
            protocol = %plan.target.protocol,
            target = %plan.target.url,
            steps = workflow.len(),
            "load test starting"
        );

        let run = Arc::new(RunContext {
            plan: plan.clone(),
            workflow,
            collector: collector.clone(),
            limiter,
            executors,
            cancel: cancel.clone(),
            active: active.clone(),
            warnings: warnings.clone(),
            base_url,
            started,
        });

        let tracker = TaskTracker::new();
        for vu_id in 0..plan.settings.users {
            tracker.spawn(vu_loop(vu_id, run.clone()));
        }
        tracker.close();

        let (status_tx, status_rx) = watch::channel(RunStatus::default());
        let progress = Progress {
            mode: plan.settings.mode,
            duration: plan.duration(),
            planned: plan.planned_requests(),
        };
        let deadline = match plan.settings.mode {
            TestMode::Loop => plan.duration(),
            TestMode::Fixed => plan.safety_timeout(),
        };

        let supervisor = tokio::spawn(supervise(Supervisor {
            tracker,
            cancel: cancel.clone(),
            collector: collector.clone(),
            active: active.clone(),
            warnings: warnings.clone(),
            status_tx,
            started,
            deadline,
            mode: plan.settings.mode,
            history_interval,
            progress,
        }));

        Ok(RunHandle {
            cancel,
            collector,
            active,
            warnings,
            status_rx,
            started,
            progress,
            supervisor,
        })
    }

    /// Starts the run and waits for it, stopping gracefully on Ctrl+C.
    pub async fn run(self) -> Result<LoadTestResult, LoadTestError> {
        Ok(self.start()?.wait_with_ctrl_c().await)
    }
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    mode: TestMode,
    duration: Duration,
    planned: Option<u64>,
}

impl Progress {
    fn fraction(&self, elapsed: Duration, completed: u64) -> f64 {
        let fraction = match (self.mode, self.planned) {
            (TestMode::Fixed, Some(planned)) if planned > 0 => completed as f64 / planned as f64,
            _ if self.duration.is_zero() => 1.0,
            _ => elapsed.as_secs_f64() / self.duration.as_secs_f64(),
        };
        fraction.clamp(0.0, 1.0)
    }
}

/// Handle to a running load test.
pub struct RunHandle {
    cancel: CancellationToken,
    collector: MetricsCollector,
    active: ActiveVuCounter,
    warnings: RunWarnings,
    status_rx: watch::Receiver<RunStatus>,
    started: Instant,
    progress: Progress,
    supervisor: JoinHandle<LoadTestResult>,
}

impl RunHandle {
    /// Signals every user to finish its in-flight request and exit.
    ///
    /// Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that stops the run when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Point-in-time metrics, queryable while the run is in progress.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.collector.snapshot()
    }

    /// Receives a [`RunStatus`] every history interval. The sender closes
    /// when the run is over.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status_rx.clone()
    }

    pub fn active_users(&self) -> u32 {
        self.active.get()
    }

    /// Fraction complete in `[0, 1]`: time-based in loop mode, attempt-based
    /// in fixed mode.
    pub fn progress(&self) -> f64 {
        self.progress
            .fraction(self.started.elapsed(), self.collector.total_requests())
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.messages()
    }

    /// Like [`RunHandle::wait`], with Ctrl+C wired to [`RunHandle::stop`].
    pub async fn wait_with_ctrl_c(self) -> LoadTestResult {
        let ctrl_c = tokio::spawn(handle_ctrl_c(self.cancel.clone()));
        let result = self.wait().await;
        ctrl_c.abort();
        result
    }

    /// Waits until every user has exited and returns the final result.
    pub async fn wait(self) -> LoadTestResult {
        match self.supervisor.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "run supervisor failed");
                self.cancel.cancel();
                LoadTestResult {
                    snapshot: self.collector.snapshot(),
                    elapsed: self.started.elapsed(),
                    warnings: self.warnings.messages(),
                    history: Vec::new(),
                    max_rps: 0.0,
                    final_active_users: self.active.get(),
                }
            },
        }
    }
}

struct Supervisor {
    tracker: TaskTracker,
    cancel: CancellationToken,
    collector: MetricsCollector,
    active: ActiveVuCounter,
    warnings: RunWarnings,
    status_tx: watch::Sender<RunStatus>,
    started: Instant,
    deadline: Duration,
    mode: TestMode,
    history_interval: Duration,
    progress: Progress,
}

/// Run controller: first-limit-wins between the deadline, all users finishing
/// and an external stop. Samples history while it waits.
async fn supervise(s: Supervisor) -> LoadTestResult {
    let mut history = History::new(s.started);
    let mut tick = tokio::time::interval_at(
        offset_instant(s.started, s.history_interval),
        s.history_interval,
    );
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep_until(offset_instant(s.started, s.deadline));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            _ = s.tracker.wait() => break,
            _ = s.cancel.cancelled() => break,
            _ = &mut deadline => {
                if s.mode == TestMode::Fixed {
                    s.warnings.warn(format!(
                        "safety timeout of {:.0}s reached before every user finished",
                        s.deadline.as_secs_f64()
                    ));
                }
                break;
            }
            _ = tick.tick() => {
                let snapshot = s.collector.snapshot();
                history.sample(&snapshot, s.active.get());
                publish(&s, snapshot);
            }
        }
    }

    s.cancel.cancel();
    s.tracker.wait().await;

    let snapshot = s.collector.snapshot();
    history.sample(&snapshot, s.active.get());
    publish(&s, snapshot.clone());

    let elapsed = s.started.elapsed();
    tracing::info!(
        total_requests = snapshot.total_requests,
        errors = snapshot.error_count,
        elapsed_secs = elapsed.as_secs_f64(),
        "load test finished"
    );

    LoadTestResult {
        snapshot,
        elapsed,
        warnings: s.warnings.messages(),
        max_rps: history.max_rps(),
        history: history.into_points(),
        final_active_users: s.active.get(),
    }
}

fn publish(s: &Supervisor, snapshot: MetricsSnapshot) {
    let elapsed = s.started.elapsed();
    let progress = s.progress.fraction(elapsed, snapshot.total_requests);
    let _ = s.status_tx.send(RunStatus {
        snapshot,
        active_users: s.active.get(),
        elapsed,
        progress,
        warnings: s.warnings.messages(),
    });
}

/// Bounded run history with per-interval throughput.
struct History {
    started: Instant,
    points: VecDeque<HistoryPoint>,
    last_at: Instant,
    last_total: u64,
}

impl History {
    fn new(started: Instant) -> Self {
        Self {
            started,
            points: VecDeque::new(),
            last_at: started,
            last_total: 0,
        }
    }

    fn sample(&mut self, snapshot: &MetricsSnapshot, active_users: u32) {
        let now = Instant::now();
        let interval = now.saturating_duration_since(self.last_at).as_secs_f64();
        if interval <= 0.0 {
            return;
        }
        let delta = snapshot.total_requests.saturating_sub(self.last_total);
        if self.points.len() == MAX_HISTORY_POINTS {
            self.points.pop_front();
        }
        self.points.push_back(HistoryPoint {
            elapsed_secs: now.saturating_duration_since(self.started).as_secs_f64(),
            rps: delta as f64 / interval,
            active_users,
            p95_ms: snapshot.latency.p95_ms,
        });
        self.last_at = now;
        self.last_total = snapshot.total_requests;
    }

    fn max_rps(&self) -> f64 {
        self.points.iter().map(|p| p.rps).fold(0.0, f64::max)
    }

    fn into_points(self) -> Vec<HistoryPoint> {
        self.points.into()
    }
}

/// Ctrl+C handler with two-phase shutdown.
///
/// First Ctrl+C triggers graceful drain via the cancellation token.
/// Second Ctrl+C performs a hard abort via `std::process::exit(1)`.
async fn handle_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("\nReceived Ctrl+C, stopping gracefully...");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("\nReceived second Ctrl+C, aborting immediately.");
    std::process::exit(1);
}
