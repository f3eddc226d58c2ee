//! Terminal summary renderer for load test results.
//!
//! [`render_summary`] is a pure function: it takes a [`LoadTestResult`] and the
//! plan that produced it and returns a formatted [`String`], so it can be unit
//! tested without a terminal. Colors go through the `colored` crate, which
//! honors `colored::control::set_override(false)` when `--no-color` is active
//! or stdout is piped.

use colored::Colorize;

use crate::loadtest::config::{TestMode, TestPlan};
use crate::loadtest::engine::LoadTestResult;
use crate::loadtest::metrics::LatencySummary;

/// Width for dotted metric row padding.
const PAD_WIDTH: usize = 36;

/// Render a terminal summary from load test results.
///
/// # Layout
///
/// ```text
///   loadstorm
///
///   target:    http://localhost:3000
///   users:     10
///   mode:      loop (30s)
///   workflow:  2 steps
///
///   req_duration......................: p50=45.0ms  p90=80.1ms  p95=120.0ms  p99=450.2ms
///   req_duration_range................: min=2.1ms  mean=51.3ms  max=980.0ms
///   req_success_count.................: 950
///   req_error_count...................: 50
///   req_error_rate....................: 5.0%
///   req_throughput....................: 15.8 req/s (max 19.0)
///   req_total.........................: 1000
///   data_received.....................: 1.2 MB
///   elapsed...........................: 60.0s
///
///   errors:
///     timeout.........................: 30
/// ```
pub fn render_summary(result: &LoadTestResult, plan: &TestPlan, steps: usize) -> String {
    let snap = &result.snapshot;
    let mut lines = vec![render_header(plan, steps)];

    let latency = &snap.latency;
    let latency_value = format!(
        "p50={:.1}ms  p90={:.1}ms  p95={:.1}ms  p99={:.1}ms",
        latency.p50_ms, latency.p90_ms, latency.p95_ms, latency.p99_ms
    );
    let latency_colored = if latency.p99_ms < 1000.0 {
        latency_value.green().to_string()
    } else {
        latency_value.yellow().to_string()
    };
    lines.push(format_metric_row("req_duration", &latency_colored, PAD_WIDTH));
    lines.push(format_metric_row("req_duration_range", &range(latency), PAD_WIDTH));
    if snap.error_latency.count > 0 {
        lines.push(format_metric_row(
            "req_failed_duration",
            &format!(
                "p50={:.1}ms  p95={:.1}ms  p99={:.1}ms",
                snap.error_latency.p50_ms, snap.error_latency.p95_ms, snap.error_latency.p99_ms
            ),
            PAD_WIDTH,
        ));
    }

    lines.push(format_metric_row(
        "req_success_count",
        &snap.success_count.to_string().green().to_string(),
        PAD_WIDTH,
    ));

    let error_count = if snap.error_count > 0 {
        snap.error_count.to_string().red().to_string()
    } else {
        snap.error_count.to_string()
    };
    lines.push(format_metric_row("req_error_count", &error_count, PAD_WIDTH));

    let error_rate_pct = snap.error_rate * 100.0;
    let error_rate = format!("{error_rate_pct:.1}%");
    let error_rate = if error_rate_pct > 5.0 {
        error_rate.red().to_string()
    } else if error_rate_pct > 1.0 {
        error_rate.yellow().to_string()
    } else {
        error_rate.green().to_string()
    };
    lines.push(format_metric_row("req_error_rate", &error_rate, PAD_WIDTH));

    let throughput = format!("{:.1} req/s (max {:.1})", snap.throughput_rps, result.max_rps);
    lines.push(format_metric_row(
        "req_throughput",
        &throughput.green().to_string(),
        PAD_WIDTH,
    ));
    lines.push(format_metric_row(
        "req_total",
        &snap.total_requests.to_string(),
        PAD_WIDTH,
    ));
    lines.push(format_metric_row(
        "data_received",
        &format_bytes(snap.bytes_received),
        PAD_WIDTH,
    ));
    lines.push(format_metric_row(
        "elapsed",
        &format!("{:.1}s", result.elapsed.as_secs_f64()),
        PAD_WIDTH,
    ));

    if !snap.status_codes.is_empty() {
        lines.push(String::new());
        lines.push("  status codes:".to_string());
        for (status, count) in &snap.status_codes {
            let value = if *status >= 400 {
                count.to_string().red().to_string()
            } else {
                count.to_string()
            };
            lines.push(format_metric_row(&format!("    {status}"), &value, PAD_WIDTH));
        }
    }

    if !snap.errors_by_kind.is_empty() {
        lines.push(String::new());
        lines.push("  errors:".to_string());
        let mut kinds: Vec<_> = snap.errors_by_kind.iter().collect();
        kinds.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (kind, count) in kinds {
            lines.push(format_metric_row(
                &format!("    {kind}"),
                &count.to_string().red().to_string(),
                PAD_WIDTH,
            ));
        }
    }

    if snap.per_step.len() > 1 || (steps > 1 && !snap.per_step.is_empty()) {
        lines.push(String::new());
        lines.push("  per-step metrics:".to_string());
        lines.push(String::new());
        lines.push(format!(
            "  {:<30} {:>7} {:>6} {:>9} {:>9} {:>9}",
            "step", "reqs", "err%", "p50", "p95", "p99"
        ));
        lines.push(format!("  {}", "\u{2500}".repeat(75)));
        for step in &snap.per_step {
            let err_pct = step.error_rate * 100.0;
            let err = format!("{err_pct:.1}%");
            let err = if err_pct > 5.0 {
                err.red().to_string()
            } else if err_pct > 1.0 {
                err.yellow().to_string()
            } else {
                err.green().to_string()
            };
            let name = if step.name.chars().count() > 30 {
                format!("{}...", step.name.chars().take(27).collect::<String>())
            } else {
                step.name.clone()
            };
            lines.push(format!(
                "  {:<30} {:>7} {:>6} {:>9} {:>9} {:>9}",
                name,
                step.total_requests,
                err,
                format!("{:.1}ms", step.latency.p50_ms),
                format!("{:.1}ms", step.latency.p95_ms),
                format!("{:.1}ms", step.latency.p99_ms),
            ));
        }
    }

    if !result.warnings.is_empty() {
        lines.push(String::new());
        lines.push(format!("  {}", "warnings:".yellow().bold()));
        for warning in &result.warnings {
            lines.push(format!("    - {warning}"));
        }
    }

    lines.join("\n")
}

fn range(latency: &LatencySummary) -> String {
    format!(
        "min={:.1}ms  mean={:.1}ms  max={:.1}ms",
        latency.min_ms, latency.mean_ms, latency.max_ms
    )
}

fn render_header(plan: &TestPlan, steps: usize) -> String {
    let mode = match plan.settings.mode {
        TestMode::Loop => format!("loop ({}s)", plan.settings.duration_secs),
        TestMode::Fixed => format!("fixed ({} per user)", plan.settings.requests_per_user),
    };
    let rate = plan
        .rate_limit
        .requests_per_second
        .map_or_else(|| "unlimited".to_string(), |r| format!("{r} req/s"));
    format!(
        "\n  {}\n\n  target:    {}\n  protocol:  {}\n  users:     {}\n  mode:      {}\n  rate:      {}\n  workflow:  {} steps\n",
        "loadstorm".bold(),
        plan.target.url,
        plan.target.protocol,
        plan.settings.users,
        mode,
        rate,
        steps,
    )
}

/// Format a single metric row with dot-padding.
///
/// Produces: `"  metric_name..................: value_string"`
fn format_metric_row(name: &str, value: &str, pad_width: usize) -> String {
    format!("  {name:.<pad_width$}: {value}")
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
