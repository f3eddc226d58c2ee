//! TOML-based test plan configuration.
//!
//! A [`TestPlan`] is created once before a run, validated, and then shared
//! read-only by every virtual user. Every section is optional; missing values
//! fall back to the defaults documented on each field.
//!
//! # Example TOML
//!
//! ```toml
//! [settings]
//! users = 50
//! mode = "loop"            # or "fixed"
//! duration_secs = 120
//! ramp_up_secs = 10.0
//! timeout_ms = 5000
//!
//! [target]
//! url = "https://api.example.com"
//! mode = "paths"
//! paths = ["/health", "/v1/items"]
//!
//! [think_time]
//! min_secs = 0.5
//! max_secs = 2.0
//!
//! [rate_limit]
//! requests_per_second = 200.0
//!
//! [auth]
//! type = "bearer"
//! token = "${token}"
//!
//! [headers]
//! X-Env = "staging"
//!
//! [validation]
//! status = 200
//! ```
//!
//! The target URL may also be given on the command line, which takes
//! precedence over the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::loadtest::auth::AuthSpec;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::validator::{ValidationRules, Validator};
use crate::loadtest::workflow::ContextPolicy;

/// Upper bound for every time setting of a plan (one year).
pub const MAX_PLAN_SECS: u64 = 365 * 24 * 60 * 60;

/// Slack added to a fixed-mode run's computed safety timeout.
const SAFETY_SLACK: Duration = Duration::from_secs(30);

/// Seconds as a duration, saturating instead of panicking on huge or NaN input.
fn secs_f64(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn check_secs(name: &str, secs: f64) -> Result<(), LoadTestError> {
    if secs.is_finite() && secs <= MAX_PLAN_SECS as f64 {
        Ok(())
    } else {
        Err(LoadTestError::validation(format!(
            "{name} ({secs}) must be at most {MAX_PLAN_SECS} seconds"
        )))
    }
}

/// How long each virtual user keeps sending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    /// Until the test duration elapses.
    #[default]
    Loop,
    /// Exactly `requests_per_user` attempts per user.
    Fixed,
}

/// Wire protocol for every request of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    #[serde(alias = "ws")]
    WebSocket,
}

impl Protocol {
    /// Picks the protocol implied by a URL scheme.
    pub fn infer(url: &str) -> Self {
        let lower = url.trim_start().to_ascii_lowercase();
        if lower.starts_with("ws://") || lower.starts_with("wss://") {
            Self::WebSocket
        } else {
            Self::Http
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::WebSocket => "websocket",
        })
    }
}

/// How request URLs are derived from the target URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlMode {
    /// The target URL as given.
    #[default]
    Exact,
    /// `paths` appended to the target's origin, one chosen per request.
    Paths,
    /// `/`, `/about` and `/contact` on the target's origin.
    #[serde(rename = "default")]
    DefaultPaths,
}

/// Paths requested in [`UrlMode::DefaultPaths`].
pub const DEFAULT_PATHS: [&str; 3] = ["/", "/about", "/contact"];

fn default_users() -> u32 {
    10
}

fn default_requests_per_user() -> u32 {
    10
}

fn default_duration_secs() -> u64 {
    30
}

fn default_ramp_up_secs() -> f64 {
    5.0
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_fatal_failure_threshold() -> u32 {
    10
}

fn default_history_interval_ms() -> u64 {
    1000
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_user_agent() -> String {
    concat!("loadstorm/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_think_min() -> f64 {
    1.0
}

fn default_think_max() -> f64 {
    5.0
}

fn default_per_host() -> usize {
    100
}

fn default_max_total() -> usize {
    10_000
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_backoff_ms() -> u64 {
    500
}

/// General run settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Number of concurrent virtual users.
    #[serde(default = "default_users")]
    pub users: u32,
    #[serde(default)]
    pub mode: TestMode,
    /// Attempts per user in fixed mode.
    #[serde(default = "default_requests_per_user")]
    pub requests_per_user: u32,
    /// Total test duration in loop mode, counted from test start.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// Window over which user starts are spread linearly.
    #[serde(default = "default_ramp_up_secs")]
    pub ramp_up_secs: f64,
    /// Per-attempt timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Overrides the computed fixed-mode safety timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_timeout_secs: Option<u64>,
    /// Consecutive persistent failures per user before a run warning.
    #[serde(default = "default_fatal_failure_threshold")]
    pub fatal_failure_threshold: u32,
    #[serde(default)]
    pub context_policy: ContextPolicy,
    /// Enables coordinated omission correction with this expected interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_interval_ms: Option<u64>,
    /// Sampling interval of the run history.
    #[serde(default = "default_history_interval_ms")]
    pub history_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            users: default_users(),
            mode: TestMode::default(),
            requests_per_user: default_requests_per_user(),
            duration_secs: default_duration_secs(),
            ramp_up_secs: default_ramp_up_secs(),
            timeout_ms: default_timeout_ms(),
            safety_timeout_secs: None,
            fatal_failure_threshold: default_fatal_failure_threshold(),
            context_policy: ContextPolicy::default(),
            expected_interval_ms: None,
            history_interval_ms: default_history_interval_ms(),
        }
    }
}

/// What to hit and how.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Target {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub mode: UrlMode,
    /// Paths for [`UrlMode::Paths`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_method")]
    pub method: String,
    /// Body template for single-URL runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            url: String::new(),
            mode: UrlMode::default(),
            paths: Vec::new(),
            protocol: Protocol::default(),
            method: default_method(),
            payload: None,
            content_type: default_content_type(),
            user_agent: default_user_agent(),
        }
    }
}

/// Pause between a user's consecutive requests, drawn uniformly.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ThinkTime {
    #[serde(default = "default_think_min")]
    pub min_secs: f64,
    #[serde(default = "default_think_max")]
    pub max_secs: f64,
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self {
            min_secs: default_think_min(),
            max_secs: default_think_max(),
        }
    }
}

/// Run-wide request rate cap.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RateLimitSettings {
    /// Unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<f64>,
    /// Longest a user waits for a token before recording `rate_limit_exhausted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,
}

/// Connection pool caps shared by every user.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Connections {
    #[serde(default = "default_per_host")]
    pub per_host: usize,
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    /// Longest a request queues for a slot before recording `pool_exhausted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_timeout_ms: Option<u64>,
}

impl Default for Connections {
    fn default() -> Self {
        Self {
            per_host: default_per_host(),
            max_total: default_max_total(),
            pool_timeout_ms: None,
        }
    }
}

impl Connections {
    pub fn pool_timeout(&self) -> Option<Duration> {
        self.pool_timeout_ms.map(Duration::from_millis)
    }
}

/// WebSocket reconnect behaviour.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebSocketSettings {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// First reconnect backoff; doubles per attempt with +/-25% jitter.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

/// Complete, immutable description of a load test run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TestPlan {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub think_time: ThinkTime,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub connections: Connections,
    #[serde(default)]
    pub auth: AuthSpec,
    /// Headers sent with every request. Values are templates.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Cookies sent with every request. Values are templates.
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub validation: ValidationRules,
    #[serde(default)]
    pub websocket: WebSocketSettings,
}

impl TestPlan {
    /// A plan with every default, targeting `url`. The protocol follows the
    /// URL scheme.
    pub fn for_url(url: &str) -> Self {
        let mut plan = Self::default();
        plan.target.url = url.to_string();
        plan.target.protocol = Protocol::infer(url);
        plan
    }

    /// Parse a TOML string into a validated [`TestPlan`].
    pub fn from_toml(content: &str) -> Result<Self, LoadTestError> {
        let plan = Self::parse(content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Parse a TOML string without validating, for callers that apply
    /// overrides before validation.
    pub fn parse(content: &str) -> Result<Self, LoadTestError> {
        let mut plan: Self = toml::from_str(content)?;
        if plan.target.protocol == Protocol::Http && !plan.target.url.is_empty() {
            plan.target.protocol = Protocol::infer(&plan.target.url);
        }
        Ok(plan)
    }

    /// Load a plan from a file path without validating it.
    ///
    /// Returns [`LoadTestError::ConfigIo`] if the file cannot be read or
    /// [`LoadTestError::ConfigParse`] if the TOML is malformed.
    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        Self::parse(&content)
    }

    /// Validate that the plan is semantically correct.
    pub fn validate(&self) -> Result<(), LoadTestError> {
        let url = url::Url::parse(&self.target.url).map_err(|e| {
            LoadTestError::validation(format!("invalid target URL '{}': {e}", self.target.url))
        })?;
        let scheme = url.scheme();
        match (self.target.protocol, scheme) {
            (Protocol::Http, "http" | "https") | (Protocol::WebSocket, "ws" | "wss") => {},
            (_, "http" | "https" | "ws" | "wss") => {
                return Err(LoadTestError::validation(format!(
                    "URL scheme '{scheme}' does not match protocol '{}'",
                    self.target.protocol
                )));
            },
            _ => {
                return Err(LoadTestError::validation(format!(
                    "unsupported URL scheme '{scheme}' (expected http, https, ws or wss)"
                )));
            },
        }

        let s = &self.settings;
        if s.users == 0 {
            return Err(LoadTestError::validation("users must be greater than 0"));
        }
        match s.mode {
            TestMode::Fixed if s.requests_per_user == 0 => {
                return Err(LoadTestError::validation(
                    "requests_per_user must be greater than 0 in fixed mode",
                ));
            },
            TestMode::Loop if s.duration_secs == 0 => {
                return Err(LoadTestError::validation(
                    "duration_secs must be greater than 0 in loop mode",
                ));
            },
            _ => {},
        }
        if s.timeout_ms == 0 {
            return Err(LoadTestError::validation("timeout_ms must be greater than 0"));
        }
        if !(s.ramp_up_secs.is_finite() && s.ramp_up_secs >= 0.0) {
            return Err(LoadTestError::validation("ramp_up_secs must be 0 or greater"));
        }
        check_secs("duration_secs", s.duration_secs as f64)?;
        check_secs("ramp_up_secs", s.ramp_up_secs)?;
        check_secs("timeout_ms", s.timeout_ms as f64 / 1000.0)?;
        check_secs("history_interval_ms", s.history_interval_ms as f64 / 1000.0)?;
        if let Some(secs) = s.safety_timeout_secs {
            check_secs("safety_timeout_secs", secs as f64)?;
        }

        let think = &self.think_time;
        if !(think.min_secs.is_finite() && think.max_secs.is_finite()) || think.min_secs < 0.0 {
            return Err(LoadTestError::validation(
                "think time bounds must be finite and non-negative",
            ));
        }
        if think.max_secs < think.min_secs {
            return Err(LoadTestError::validation(format!(
                "think_time max_secs ({}) must not be less than min_secs ({})",
                think.max_secs, think.min_secs
            )));
        }
        check_secs("think_time max_secs", think.max_secs)?;

        if let Some(rate) = self.rate_limit.requests_per_second {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(LoadTestError::validation(
                    "rate_limit requests_per_second must be greater than 0",
                ));
            }
        }

        let c = &self.connections;
        if c.per_host == 0 || c.per_host > c.max_total {
            return Err(LoadTestError::validation(format!(
                "connections per_host ({}) must be between 1 and max_total ({})",
                c.per_host, c.max_total
            )));
        }

        if self.target.mode == UrlMode::Paths && self.target.paths.is_empty() {
            return Err(LoadTestError::validation(
                "target mode \"paths\" requires at least one path",
            ));
        }

        self.auth.validate()?;
        Validator::new(&self.validation)?;
        Ok(())
    }

    /// The target's `scheme://host[:port]`.
    pub fn origin(&self) -> Result<String, LoadTestError> {
        let url = url::Url::parse(&self.target.url).map_err(|e| {
            LoadTestError::validation(format!("invalid target URL '{}': {e}", self.target.url))
        })?;
        Ok(url.origin().ascii_serialization())
    }

    /// URLs a single-URL run picks from.
    pub fn target_urls(&self) -> Result<Vec<String>, LoadTestError> {
        let paths: Vec<&str> = match self.target.mode {
            UrlMode::Exact => return Ok(vec![self.target.url.clone()]),
            UrlMode::Paths => self.target.paths.iter().map(String::as_str).collect(),
            UrlMode::DefaultPaths => DEFAULT_PATHS.to_vec(),
        };
        let origin = self.origin()?;
        Ok(paths
            .into_iter()
            .map(|path| {
                if path.starts_with('/') {
                    format!("{origin}{path}")
                } else {
                    format!("{origin}/{path}")
                }
            })
            .collect())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.settings.timeout_ms)
    }

    pub fn ramp_up(&self) -> Duration {
        secs_f64(self.settings.ramp_up_secs)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.settings.duration_secs)
    }

    /// Think-time bounds as durations.
    pub fn think_range(&self) -> (Duration, Duration) {
        (secs_f64(self.think_time.min_secs), secs_f64(self.think_time.max_secs))
    }

    /// Longest a fixed-mode run may take before it is stopped, unless
    /// configured: `ramp_up + R * (timeout + think_max) + 30s`, or
    /// `ramp_up + users * R / rps + 30s` when a rate limit makes that longer.
    pub fn safety_timeout(&self) -> Duration {
        if let Some(secs) = self.settings.safety_timeout_secs {
            return Duration::from_secs(secs);
        }
        let (_, think_max) = self.think_range();
        let per_request = self.timeout().saturating_add(think_max);
        let mut busy = per_request.saturating_mul(self.settings.requests_per_user);
        if let Some(rps) = self.rate_limit.requests_per_second {
            let attempts =
                f64::from(self.settings.users) * f64::from(self.settings.requests_per_user);
            busy = busy.max(secs_f64(attempts / rps));
        }
        self.ramp_up().saturating_add(busy).saturating_add(SAFETY_SLACK)
    }

    pub fn expected_interval(&self) -> Option<Duration> {
        self.settings.expected_interval_ms.map(Duration::from_millis)
    }

    pub fn history_interval(&self) -> Duration {
        Duration::from_millis(self.settings.history_interval_ms.max(1))
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.rate_limit.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Total attempts a fixed-mode run makes, `None` in loop mode.
    pub fn planned_requests(&self) -> Option<u64> {
        match self.settings.mode {
            TestMode::Fixed => {
                Some(u64::from(self.settings.users) * u64::from(self.settings.requests_per_user))
            },
            TestMode::Loop => None,
        }
    }
}
