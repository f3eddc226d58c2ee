//! CSV export of a finished run.
//!
//! The summary file is a two-column `metric,value` sheet followed by blank-line
//! separated sections for status codes, errors and workflow steps. The history
//! file has one row per sampled [`HistoryPoint`].

use std::path::Path;

use csv::{Writer, WriterBuilder};

use crate::loadtest::engine::HistoryPoint;
use crate::loadtest::metrics::LatencySummary;
use crate::loadtest::report::LoadTestReport;

/// Writes the summary sheet to `path`.
pub fn write_summary(report: &LoadTestReport, path: &Path) -> Result<(), csv::Error> {
    // Sections have different widths.
    let mut wtr = WriterBuilder::new().flexible(true).from_path(path)?;
    let info = &report.test_info;
    let summary = &report.summary;

    wtr.write_record(["metric", "value"])?;
    wtr.write_record(["url", info.target_url.as_str()])?;
    wtr.write_record(["protocol", info.protocol.as_str()])?;
    wtr.write_record(["mode", info.mode.as_str()])?;
    if let Some(workflow) = &info.workflow {
        wtr.write_record(["workflow", workflow.as_str()])?;
    }
    wtr.write_record(["users", &info.users.to_string()])?;
    wtr.write_record(["duration_secs", &format!("{:.2}", info.duration_secs)])?;
    wtr.write_record(["total_requests", &summary.total_requests.to_string()])?;
    wtr.write_record(["success_count", &summary.success_count.to_string()])?;
    wtr.write_record(["error_count", &summary.error_count.to_string()])?;
    wtr.write_record(["error_rate_percent", &format!("{:.2}", summary.error_rate * 100.0)])?;
    wtr.write_record(["throughput_rps", &format!("{:.2}", summary.throughput_rps)])?;
    wtr.write_record(["max_rps", &format!("{:.2}", summary.max_rps)])?;
    wtr.write_record(["bytes_received", &summary.bytes_received.to_string()])?;
    write_latency(&mut wtr, "latency", &report.latency)?;
    write_latency(&mut wtr, "error_latency", &report.error_latency)?;

    wtr.write_record([""])?;
    wtr.write_record(["status_code", "count"])?;
    for (status, count) in &report.status_codes {
        wtr.write_record([status.to_string(), count.to_string()])?;
    }

    wtr.write_record([""])?;
    wtr.write_record(["error_kind", "count"])?;
    for (kind, count) in &report.errors {
        wtr.write_record([kind.as_str(), &count.to_string()])?;
    }

    if !report.per_step.is_empty() {
        wtr.write_record([""])?;
        wtr.write_record(["step", "requests", "errors", "p50_ms", "p95_ms", "p99_ms"])?;
        for step in &report.per_step {
            wtr.write_record([
                step.name.clone(),
                step.total_requests.to_string(),
                step.error_count.to_string(),
                format!("{:.2}", step.latency.p50_ms),
                format!("{:.2}", step.latency.p95_ms),
                format!("{:.2}", step.latency.p99_ms),
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}

fn write_latency<W: std::io::Write>(
    wtr: &mut Writer<W>,
    prefix: &str,
    latency: &LatencySummary,
) -> Result<(), csv::Error> {
    for (name, value) in [
        ("min_ms", latency.min_ms),
        ("mean_ms", latency.mean_ms),
        ("p50_ms", latency.p50_ms),
        ("p90_ms", latency.p90_ms),
        ("p95_ms", latency.p95_ms),
        ("p99_ms", latency.p99_ms),
        ("max_ms", latency.max_ms),
    ] {
        wtr.write_record([format!("{prefix}_{name}"), format!("{value:.2}")])?;
    }
    Ok(())
}

/// Writes one row per history sample, headed by the field names.
pub fn write_history(history: &[HistoryPoint], path: &Path) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_path(path)?;
    if history.is_empty() {
        wtr.write_record(["elapsed_secs", "rps", "active_users", "p95_ms"])?;
    }
    for point in history {
        wtr.serialize(point)?;
    }
    wtr.flush()?;
    Ok(())
}
