//! Report files for load test results.
//!
//! Produces a schema-versioned JSON report containing latency percentiles,
//! throughput, error classification, run history and the full resolved plan
//! for reproducibility. Designed for CI/CD pipeline consumption. The same
//! [`LoadTestReport`] also feeds the CSV and HTML writers, selected with an
//! [`OutputFormat`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::loadtest::config::TestPlan;
use crate::loadtest::{csv_export, html_report};
use crate::loadtest::engine::{HistoryPoint, LoadTestResult};
use crate::loadtest::metrics::{LatencySummary, StepSnapshot};

/// Schema version for the JSON report format.
///
/// Increment when making breaking changes to the report structure.
const SCHEMA_VERSION: &str = "1.0";

/// Directory reports are written to, relative to the base directory.
pub const REPORTS_DIR: &str = "loadstorm-reports";

/// Top-level JSON report structure.
///
/// Self-contained: anyone reading just the JSON file should understand the
/// test configuration and outcomes.
#[derive(Debug, Serialize)]
pub struct LoadTestReport {
    /// Report format version for parser compatibility.
    pub schema_version: String,
    pub test_info: TestInfo,
    /// Resolved plan with CLI overrides applied. Credentials are removed.
    pub plan: serde_json::Value,
    pub summary: ReportSummary,
    /// Latency of successful requests.
    pub latency: LatencySummary,
    /// Latency of failed requests that reached the network.
    pub error_latency: LatencySummary,
    pub status_codes: BTreeMap<u16, u64>,
    /// Error counts by kind (`timeout`, `validation_failed`, ...).
    pub errors: BTreeMap<String, u64>,
    /// Error counts by class (`transport`, `validation`, ...).
    pub error_classes: BTreeMap<String, u64>,
    pub per_step: Vec<StepSnapshot>,
    pub warnings: Vec<String>,
    pub history: Vec<HistoryPoint>,
}

#[derive(Debug, Serialize)]
pub struct TestInfo {
    /// ISO-8601 timestamp when the report was generated.
    pub timestamp: String,
    pub target_url: String,
    pub protocol: String,
    pub users: u32,
    pub mode: String,
    /// Workflow name, if the workflow file declared one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Actual test duration in seconds.
    pub duration_secs: f64,
}

#[derive(Debug, Serialize)]
pub struct ReportSummary {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Fraction in `0.0..=1.0`.
    pub error_rate: f64,
    pub throughput_rps: f64,
    pub max_rps: f64,
    pub bytes_received: u64,
}

impl LoadTestReport {
    /// Build a report from a finished run and the plan that drove it.
    pub fn from_result(result: &LoadTestResult, plan: &TestPlan, workflow: Option<&str>) -> Self {
        let snap = &result.snapshot;
        let mode = serde_json::to_value(plan.settings.mode)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            test_info: TestInfo {
                timestamp: chrono::Utc::now().to_rfc3339(),
                target_url: plan.target.url.clone(),
                protocol: plan.target.protocol.to_string(),
                users: plan.settings.users,
                mode,
                workflow: workflow.map(str::to_string),
                duration_secs: result.elapsed.as_secs_f64(),
            },
            plan: redacted_plan(plan),
            summary: ReportSummary {
                total_requests: snap.total_requests,
                success_count: snap.success_count,
                error_count: snap.error_count,
                error_rate: snap.error_rate,
                throughput_rps: snap.throughput_rps,
                max_rps: result.max_rps,
                bytes_received: snap.bytes_received,
            },
            latency: snap.latency.clone(),
            error_latency: snap.error_latency.clone(),
            status_codes: snap.status_codes.clone(),
            errors: snap.errors_by_kind.clone(),
            error_classes: snap.errors_by_class.clone(),
            per_step: snap.per_step.clone(),
            warnings: result.warnings.clone(),
            history: result.history.clone(),
        }
    }
}

/// The plan as JSON with auth reduced to its type.
fn redacted_plan(plan: &TestPlan) -> serde_json::Value {
    let mut value = serde_json::to_value(plan).unwrap_or(serde_json::Value::Null);
    if let Some(auth) = value.get_mut("auth").and_then(|a| a.as_object_mut()) {
        auth.retain(|key, _| key == "type");
    }
    value
}

/// Which report files a run writes next to the console summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Console summary only.
    Console,
    /// `<base>_summary.csv` and `<base>_history.csv`.
    Csv,
    #[default]
    Json,
    Html,
    /// JSON, CSV and HTML.
    All,
}

impl OutputFormat {
    fn includes(self, format: OutputFormat) -> bool {
        self == format || self == Self::All
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "html" => Ok(Self::Html),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown output format '{other}' (expected console, csv, json, html or all)"
            )),
        }
    }
}

/// Path, without extension, that every report file of a run derives from.
///
/// An explicit `output_file` is taken relative to `base_dir`; otherwise a
/// timestamped name under `<base_dir>/loadstorm-reports/` is used.
pub fn report_base(
    base_dir: &Path,
    output_file: Option<&Path>,
    timestamp: &chrono::DateTime<chrono::Utc>,
) -> PathBuf {
    match output_file {
        Some(file) => base_dir.join(file),
        None => base_dir.join(REPORTS_DIR).join(report_stem(timestamp)),
    }
}

/// Write the files `format` selects. Returns their paths in write order.
///
/// Creates the parent directory of `base` if it does not exist.
pub fn write_reports(
    report: &LoadTestReport,
    format: OutputFormat,
    base: &Path,
) -> Result<Vec<PathBuf>, std::io::Error> {
    if format == OutputFormat::Console {
        return Ok(Vec::new());
    }
    if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut written = Vec::new();
    if format.includes(OutputFormat::Json) {
        let path = with_suffix(base, ".json");
        let json = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
        std::fs::write(&path, json)?;
        written.push(path);
    }
    if format.includes(OutputFormat::Csv) {
        let summary = with_suffix(base, "_summary.csv");
        csv_export::write_summary(report, &summary)?;
        written.push(summary);
        let history = with_suffix(base, "_history.csv");
        csv_export::write_history(&report.history, &history)?;
        written.push(history);
    }
    if format.includes(OutputFormat::Html) {
        let path = with_suffix(base, ".html");
        std::fs::write(&path, html_report::render(report))?;
        written.push(path);
    }
    Ok(written)
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Report file stem for a given timestamp.
///
/// Uses hyphens instead of colons for cross-platform filename compatibility.
pub fn report_stem(timestamp: &chrono::DateTime<chrono::Utc>) -> String {
    format!("loadstorm-{}", timestamp.format("%Y-%m-%dT%H-%M-%S"))
}
