//! Live terminal display for load test progress.
//!
//! Renders a compact, in-place updating line showing active users, requests
//! per second, P95 latency, error count/rate, elapsed time and progress.
//! Driven by the engine's [`RunStatus`] watch channel, not per request.

use crate::loadtest::engine::RunStatus;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;
use tokio::sync::watch;

/// Live terminal display for load test progress.
pub struct LiveDisplay {
    status_bar: ProgressBar,
}

impl LiveDisplay {
    /// Create a new live display.
    ///
    /// If `no_color` is true or stderr is not a terminal (piped),
    /// color output is disabled.
    pub fn new(no_color: bool) -> Self {
        if no_color || !std::io::stderr().is_terminal() {
            colored::control::set_override(false);
        }

        let status_bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {wide_msg}") {
            status_bar.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        status_bar.enable_steady_tick(Duration::from_millis(100));

        Self { status_bar }
    }

    /// Format a single line of live status.
    ///
    /// Green for healthy values, red once errors appear, yellow for a P95
    /// above one second.
    pub fn format_status(status: &RunStatus, target_users: u32) -> String {
        let snap = &status.snapshot;
        let elapsed_secs = status.elapsed.as_secs_f64();
        let rps = if elapsed_secs > 0.0 {
            snap.total_requests as f64 / elapsed_secs
        } else {
            0.0
        };

        let users = format!("{}/{}", status.active_users, target_users).green();
        let rps = format!("{rps:.1}").green();
        let p95 = format!("{:.0}ms", snap.latency.p95_ms);
        let p95 = if snap.latency.p95_ms > 1000.0 {
            p95.yellow().to_string()
        } else {
            p95.green().to_string()
        };
        let count = snap.error_count.to_string();
        let rate = format!("{:.1}%", snap.error_rate * 100.0);
        let errors = if snap.error_count > 0 {
            format!("{} ({})", count.red(), rate.red())
        } else {
            format!("{count} ({rate})")
        };

        format!(
            "  users: {users}  |  rps: {rps}  |  p95: {p95}  |  errors: {errors}  |  elapsed: {}s  |  {:.0}%",
            status.elapsed.as_secs(),
            status.progress * 100.0
        )
    }

    pub fn update(&self, status: &RunStatus, target_users: u32) {
        self.status_bar
            .set_message(Self::format_status(status, target_users));
    }

    /// Stop the display and clear the spinner.
    pub fn finish(&self) {
        self.status_bar.finish_and_clear();
    }
}

/// Run the live display loop until the engine drops the status sender.
///
/// Each new run warning is printed once to stderr.
pub async fn display_loop(
    mut status_rx: watch::Receiver<RunStatus>,
    target_users: u32,
    no_color: bool,
) {
    let display = LiveDisplay::new(no_color);
    let mut warnings_shown = 0;

    eprintln!();
    eprintln!("  Running load test...");
    eprintln!();

    while status_rx.changed().await.is_ok() {
        let status = status_rx.borrow_and_update().clone();
        display.update(&status, target_users);
        for warning in status.warnings.iter().skip(warnings_shown) {
            display
                .status_bar
                .println(format!("  {} {warning}", "WARNING:".yellow().bold()));
        }
        warnings_shown = status.warnings.len();
    }

    display.finish();
}
