//! Standalone HTML report with inline CSS.
//!
//! The page has no external assets and can be opened directly from disk.

use std::fmt::Write as _;

use crate::loadtest::metrics::LatencySummary;
use crate::loadtest::report::LoadTestReport;
use crate::loadtest::summary::format_bytes;

/// Renders `report` as a complete HTML document.
pub fn render(report: &LoadTestReport) -> String {
    let info = &report.test_info;
    let summary = &report.summary;
    let error_pct = summary.error_rate * 100.0;
    let error_class = if error_pct < 1.0 {
        "good"
    } else if error_pct < 5.0 {
        "warn"
    } else {
        "bad"
    };

    let mut body = String::new();
    let _ = write!(
        body,
        r#"<h1>{url}</h1>
<div class="meta">
  <span>Protocol: {protocol}</span>
  <span>Mode: {mode}</span>
  <span>Users: {users}</span>
  <span>Duration: {duration:.2}s</span>
  <span>Generated: {timestamp}</span>
</div>
<div class="stats">
  <div class="card"><div class="label">Total Requests</div><div class="value">{total}</div></div>
  <div class="card {error_class}"><div class="label">Error Rate</div><div class="value">{error_pct:.2}%</div></div>
  <div class="card"><div class="label">Throughput</div><div class="value">{rps:.2} req/s</div></div>
  <div class="card"><div class="label">Peak</div><div class="value">{max_rps:.2} req/s</div></div>
  <div class="card"><div class="label">Received</div><div class="value">{bytes}</div></div>
</div>
"#,
        url = escape(&info.target_url),
        protocol = escape(&info.protocol),
        mode = escape(&info.mode),
        users = info.users,
        duration = info.duration_secs,
        timestamp = escape(&info.timestamp),
        total = summary.total_requests,
        rps = summary.throughput_rps,
        max_rps = summary.max_rps,
        bytes = format_bytes(summary.bytes_received),
    );
    if let Some(workflow) = &info.workflow {
        let _ = writeln!(body, "<p>Workflow: {}</p>", escape(workflow));
    }

    body.push_str("<h2>Latency (ms)</h2>\n");
    let mut rows = Vec::new();
    for (label, latency) in [("success", &report.latency), ("error", &report.error_latency)] {
        rows.push(latency_row(label, latency));
    }
    push_table(
        &mut body,
        &["", "count", "min", "mean", "p50", "p90", "p95", "p99", "max"],
        &rows,
    );

    if !report.per_step.is_empty() {
        body.push_str("<h2>Steps</h2>\n");
        let rows: Vec<Vec<String>> = report
            .per_step
            .iter()
            .map(|step| {
                vec![
                    escape(&step.name),
                    step.total_requests.to_string(),
                    step.error_count.to_string(),
                    format!("{:.2}", step.latency.p50_ms),
                    format!("{:.2}", step.latency.p95_ms),
                    format!("{:.2}", step.latency.p99_ms),
                ]
            })
            .collect();
        push_table(&mut body, &["step", "requests", "errors", "p50", "p95", "p99"], &rows);
    }

    body.push_str("<h2>Status Codes</h2>\n");
    let rows: Vec<Vec<String>> = report
        .status_codes
        .iter()
        .map(|(status, count)| vec![status.to_string(), count.to_string()])
        .collect();
    push_table(&mut body, &["status", "count"], &rows);

    if !report.errors.is_empty() {
        body.push_str("<h2>Errors</h2>\n");
        let rows: Vec<Vec<String>> = report
            .errors
            .iter()
            .map(|(kind, count)| vec![escape(kind), count.to_string()])
            .collect();
        push_table(&mut body, &["kind", "count"], &rows);
    }

    if !report.warnings.is_empty() {
        body.push_str("<h2>Warnings</h2>\n<ul>\n");
        for warning in &report.warnings {
            let _ = writeln!(body, "  <li>{}</li>", escape(warning));
        }
        body.push_str("</ul>\n");
    }

    if !report.history.is_empty() {
        body.push_str("<h2>History</h2>\n");
        let rows: Vec<Vec<String>> = report
            .history
            .iter()
            .map(|point| {
                vec![
                    format!("{:.1}", point.elapsed_secs),
                    format!("{:.2}", point.rps),
                    point.active_users.to_string(),
                    format!("{:.2}", point.p95_ms),
                ]
            })
            .collect();
        push_table(&mut body, &["elapsed (s)", "rps", "active users", "p95 (ms)"], &rows);
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>loadstorm report: {title}</title>
<style>
  body {{ font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; margin: 2rem; color: #1e293b; }}
  h2 {{ font-size: 1rem; text-transform: uppercase; color: #475569; margin-top: 2rem; }}
  .meta span {{ margin-right: 1.5rem; color: #64748b; }}
  .stats {{ display: grid; grid-template-columns: repeat(auto-fill, minmax(160px, 1fr)); gap: 1rem; margin: 1.5rem 0; }}
  .card {{ border: 1px solid #cbd5e1; border-radius: 0.5rem; padding: 0.75rem 1rem; }}
  .card .label {{ font-size: 0.75rem; text-transform: uppercase; color: #64748b; }}
  .card .value {{ font-size: 1.4rem; font-weight: 700; }}
  .card.good .value {{ color: #059669; }}
  .card.warn .value {{ color: #d97706; }}
  .card.bad .value {{ color: #dc2626; }}
  table {{ border-collapse: collapse; font-size: 0.85rem; }}
  th, td {{ padding: 0.35rem 0.8rem; border-bottom: 1px solid #e2e8f0; text-align: right; }}
  th:first-child, td:first-child {{ text-align: left; }}
</style>
</head>
<body>
{body}</body>
</html>
"#,
        title = escape(&info.target_url),
    )
}

fn latency_row(label: &str, latency: &LatencySummary) -> Vec<String> {
    let mut row = vec![label.to_string(), latency.count.to_string()];
    row.extend(
        [
            latency.min_ms,
            latency.mean_ms,
            latency.p50_ms,
            latency.p90_ms,
            latency.p95_ms,
            latency.p99_ms,
            latency.max_ms,
        ]
        .iter()
        .map(|ms| format!("{ms:.2}")),
    );
    row
}

/// Cells must already be escaped.
fn push_table(out: &mut String, headers: &[&str], rows: &[Vec<String>]) {
    out.push_str("<table>\n<thead><tr>");
    for header in headers {
        let _ = write!(out, "<th>{header}</th>");
    }
    out.push_str("</tr></thead>\n<tbody>\n");
    for row in rows {
        out.push_str("<tr>");
        for cell in row {
            let _ = write!(out, "<td>{cell}</td>");
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</tbody>\n</table>\n");
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
