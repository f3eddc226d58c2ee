//! `loadstorm run` command implementation.

use anyhow::{Context, Result};
use clap::Args;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::task::JoinHandle;

use loadstorm::loadtest::auth::AuthSpec;
use loadstorm::loadtest::config::{Protocol, TestMode, TestPlan, UrlMode};
use loadstorm::loadtest::display::display_loop;
use loadstorm::loadtest::engine::LoadTestEngine;
use loadstorm::loadtest::report::{report_base, write_reports, LoadTestReport, OutputFormat};
use loadstorm::loadtest::summary::render_summary;
use loadstorm::loadtest::workflow::WorkflowDefinition;

use super::EXIT_THRESHOLD;

/// Flags for `loadstorm run`. Every flag overrides the matching plan field.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Target URL (overrides [target] url)
    pub url: Option<String>,

    /// Path to a TOML test plan
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Path to a JSON workflow file
    #[arg(long, short)]
    pub workflow: Option<PathBuf>,

    /// Number of concurrent virtual users
    #[arg(long, short)]
    pub users: Option<u32>,

    /// Test mode
    #[arg(long, value_parser = ["loop", "fixed"])]
    pub mode: Option<String>,

    /// How request URLs are derived from the target URL
    #[arg(long, value_parser = ["exact", "paths", "default"])]
    pub url_mode: Option<String>,

    /// Paths on the target's origin (implies --url-mode paths)
    #[arg(long, num_args = 1..)]
    pub paths: Vec<String>,

    /// Requests per user in fixed mode
    #[arg(long, short = 'n')]
    pub requests: Option<u32>,

    /// Test duration in seconds (loop mode)
    #[arg(long, short)]
    pub duration: Option<u64>,

    /// Ramp-up window in seconds
    #[arg(long)]
    pub ramp_up: Option<f64>,

    /// Rate limit in requests per second
    #[arg(long)]
    pub rate: Option<f64>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Minimum think time in seconds
    #[arg(long)]
    pub think_min: Option<f64>,

    /// Maximum think time in seconds
    #[arg(long)]
    pub think_max: Option<f64>,

    /// Maximum concurrent connections per host
    #[arg(long)]
    pub connections_per_host: Option<usize>,

    /// Maximum concurrent connections in total
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Protocol (inferred from the URL scheme when omitted)
    #[arg(long, value_parser = ["http", "websocket", "ws"])]
    pub protocol: Option<String>,

    /// HTTP method for single-URL runs
    #[arg(long, short = 'X')]
    pub method: Option<String>,

    /// Request body template for single-URL runs
    #[arg(long, conflicts_with = "payload_file")]
    pub payload: Option<String>,

    /// Read the request body template from a file
    #[arg(long)]
    pub payload_file: Option<PathBuf>,

    /// Content type of the request body
    #[arg(long)]
    pub content_type: Option<String>,

    /// Extra header, as `Name: value` (repeatable)
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Cookie sent with every request, as `name=value` (repeatable)
    #[arg(long = "cookie")]
    pub cookies: Vec<String>,

    /// Authentication scheme (inferred from the credential flags when omitted)
    #[arg(long, value_parser = ["none", "basic", "bearer", "custom"])]
    pub auth_type: Option<String>,

    /// Username for basic auth
    #[arg(long)]
    pub auth_username: Option<String>,

    /// Password for basic auth
    #[arg(long, env = "LOADSTORM_AUTH_PASSWORD")]
    pub auth_password: Option<String>,

    /// Custom auth header, as `Name: value`
    #[arg(long)]
    pub auth_header: Option<String>,

    /// Bearer token for the Authorization header
    #[arg(long, alias = "auth-token", env = "LOADSTORM_BEARER_TOKEN")]
    pub bearer: Option<String>,

    /// Expected response status code
    #[arg(long)]
    pub validate_status: Option<u16>,

    /// Text every response body must contain
    #[arg(long)]
    pub validate_text: Option<String>,

    /// Pattern every response body must match
    #[arg(long)]
    pub validate_regex: Option<String>,

    /// JSONPath that must select a node in every response
    #[arg(long)]
    pub validate_json_path: Option<String>,

    /// Expected value at --validate-json-path (JSON literal or plain text)
    #[arg(long, requires = "validate_json_path")]
    pub validate_json_value: Option<String>,

    /// Report files to write besides the console summary
    #[arg(long, value_parser = ["console", "csv", "json", "html", "all"])]
    pub output_format: Option<String>,

    /// Report path without extension (default: loadstorm-reports/loadstorm-<timestamp>)
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Write no report files (same as --output-format console)
    #[arg(long)]
    pub no_report: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Exit with status 2 when the error rate (0.0-1.0) exceeds this value
    #[arg(long)]
    pub max_error_rate: Option<f64>,
}

/// Execute the `run` command.
///
/// Loads the plan, applies CLI overrides, runs the engine with a live
/// display, prints the summary and writes the selected report files.
pub async fn execute_run(args: RunArgs) -> Result<ExitCode> {
    let format = output_format(&args)?;
    let mut plan = match &args.config {
        Some(path) => {
            eprintln!("Loading plan from: {}", path.display());
            TestPlan::load(path)?
        },
        None => TestPlan::default(),
    };

    apply_overrides(&mut plan, &args)?;
    if plan.target.url.is_empty() {
        anyhow::bail!("no target URL: pass one as an argument or set [target] url in the plan");
    }
    plan.validate().context("invalid test plan")?;

    let workflow = match &args.workflow {
        Some(path) => WorkflowDefinition::load_json(path)?,
        None => WorkflowDefinition::single_url(&plan)?,
    };
    let steps = workflow.steps.len();
    let workflow_name = workflow.name.clone();

    let handle = LoadTestEngine::new(plan.clone(), workflow).start()?;
    let display = tokio::spawn(display_loop(
        handle.subscribe(),
        plan.settings.users,
        args.no_color,
    ));
    let result = handle.wait_with_ctrl_c().await;
    join_display(display).await;

    if args.no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }
    println!("{}", render_summary(&result, &plan, steps));

    if format != OutputFormat::Console {
        let report = LoadTestReport::from_result(&result, &plan, workflow_name.as_deref());
        let cwd = std::env::current_dir()?;
        let base = report_base(&cwd, args.output_file.as_deref(), &chrono::Utc::now());
        eprintln!();
        match write_reports(&report, format, &base) {
            Ok(paths) => {
                for path in paths {
                    eprintln!("Report written to: {}", path.display());
                }
            },
            Err(e) => eprintln!("Warning: Failed to write report: {e}"),
        }
    }

    if let Some(max) = args.max_error_rate {
        if result.snapshot.error_rate > max {
            eprintln!(
                "Error rate {:.2}% exceeds --max-error-rate {:.2}%",
                result.snapshot.error_rate * 100.0,
                max * 100.0
            );
            return Ok(ExitCode::from(EXIT_THRESHOLD));
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Waits for the live display to finish. Returns `false` if it panicked or
/// was cancelled.
async fn join_display(display: JoinHandle<()>) -> bool {
    match display.await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "live display task failed");
            false
        },
    }
}

fn output_format(args: &RunArgs) -> Result<OutputFormat> {
    if args.no_report {
        return Ok(OutputFormat::Console);
    }
    match args.output_format.as_deref() {
        Some(name) => name.parse().map_err(anyhow::Error::msg),
        None => Ok(OutputFormat::default()),
    }
}

/// Apply CLI flag overrides to a loaded plan.
///
/// A URL given on the command line also re-infers the protocol from its
/// scheme unless `--protocol` is set.
pub fn apply_overrides(plan: &mut TestPlan, args: &RunArgs) -> Result<()> {
    if let Some(url) = &args.url {
        plan.target.url = url.clone();
        plan.target.protocol = Protocol::infer(url);
    }
    if let Some(protocol) = args.protocol.as_deref() {
        plan.target.protocol = match protocol {
            "websocket" | "ws" => Protocol::WebSocket,
            _ => Protocol::Http,
        };
    }
    if let Some(mode) = args.mode.as_deref() {
        plan.settings.mode = match mode {
            "fixed" => TestMode::Fixed,
            _ => TestMode::Loop,
        };
    }
    if !args.paths.is_empty() {
        plan.target.paths = args.paths.clone();
        plan.target.mode = UrlMode::Paths;
    }
    if let Some(url_mode) = args.url_mode.as_deref() {
        plan.target.mode = match url_mode {
            "paths" => UrlMode::Paths,
            "default" => UrlMode::DefaultPaths,
            _ => UrlMode::Exact,
        };
    }
    if let Some(per_host) = args.connections_per_host {
        plan.connections.per_host = per_host;
    }
    if let Some(max_total) = args.max_connections {
        plan.connections.max_total = max_total;
    }
    if let Some(users) = args.users {
        plan.settings.users = users;
    }
    if let Some(requests) = args.requests {
        plan.settings.requests_per_user = requests;
    }
    if let Some(duration) = args.duration {
        plan.settings.duration_secs = duration;
    }
    if let Some(ramp_up) = args.ramp_up {
        plan.settings.ramp_up_secs = ramp_up;
    }
    if let Some(rate) = args.rate {
        plan.rate_limit.requests_per_second = Some(rate);
    }
    if let Some(timeout) = args.timeout {
        plan.settings.timeout_ms = timeout;
    }
    if let Some(min) = args.think_min {
        plan.think_time.min_secs = min;
    }
    if let Some(max) = args.think_max {
        plan.think_time.max_secs = max;
    }
    if let Some(method) = &args.method {
        plan.target.method = method.to_uppercase();
    }
    if let Some(payload) = &args.payload {
        plan.target.payload = Some(payload.clone());
    }
    if let Some(path) = &args.payload_file {
        let payload = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read payload file {}", path.display()))?;
        plan.target.payload = Some(payload);
    }
    if let Some(content_type) = &args.content_type {
        plan.target.content_type = content_type.clone();
    }
    for header in &args.headers {
        if let AuthSpec::Custom { name, value } = AuthSpec::parse_custom(header)? {
            plan.headers.insert(name, value);
        }
    }
    for cookie in &args.cookies {
        let (name, value) = cookie
            .split_once('=')
            .with_context(|| format!("cookie '{cookie}' must have the form 'name=value'"))?;
        plan.cookies.insert(name.trim().to_string(), value.trim().to_string());
    }
    if let Some(auth) = auth_override(args)? {
        plan.auth = auth;
    }
    apply_validation_overrides(plan, args);
    Ok(())
}

/// The auth scheme selected by the credential flags, if any.
fn auth_override(args: &RunArgs) -> Result<Option<AuthSpec>> {
    let basic = || AuthSpec::Basic {
        username: args.auth_username.clone().unwrap_or_default(),
        password: args.auth_password.clone().unwrap_or_default(),
    };
    let bearer = || AuthSpec::Bearer {
        token: args.bearer.clone().unwrap_or_default(),
    };
    let custom = |header: &str| AuthSpec::parse_custom(header).map_err(anyhow::Error::from);

    let spec = match args.auth_type.as_deref() {
        Some("none") => AuthSpec::None,
        Some("basic") => basic(),
        Some("bearer") => bearer(),
        Some("custom") => match &args.auth_header {
            Some(header) => custom(header)?,
            None => anyhow::bail!("--auth-type custom requires --auth-header"),
        },
        _ => {
            if args.bearer.is_some() {
                bearer()
            } else if args.auth_username.is_some() || args.auth_password.is_some() {
                basic()
            } else if let Some(header) = &args.auth_header {
                custom(header)?
            } else {
                return Ok(None);
            }
        },
    };
    Ok(Some(spec))
}

fn apply_validation_overrides(plan: &mut TestPlan, args: &RunArgs) {
    let rules = &mut plan.validation;
    if let Some(status) = args.validate_status {
        rules.status = Some(status);
    }
    if let Some(text) = &args.validate_text {
        rules.contains = Some(text.clone());
    }
    if let Some(pattern) = &args.validate_regex {
        rules.regex = Some(pattern.clone());
    }
    if let Some(path) = &args.validate_json_path {
        rules.json_path = Some(path.clone());
    }
    if let Some(value) = &args.validate_json_value {
        rules.json_value = Some(
            serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.clone())),
        );
    }
}
