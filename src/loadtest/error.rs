//! Error types for the load testing engine.
//!
//! Defines [`LoadTestError`] for configuration-time failures that abort a run
//! before any virtual user is scheduled, and [`RequestError`] for per-request
//! failures that are recorded into metrics and never terminate the run.

use serde::Serialize;
use std::fmt;

/// Errors that occur while loading, parsing, or validating a test plan or
/// workflow, or while building the shared run resources.
#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    /// TOML parse failure -- the plan contains invalid TOML syntax
    /// or does not match the expected schema.
    #[error("Failed to parse test plan TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// Semantic validation failure -- the plan parsed successfully but
    /// contains contradictory or out-of-range values.
    #[error("Test plan validation error: {message}")]
    ConfigValidation { message: String },

    /// File I/O failure -- a plan or workflow file could not be read.
    #[error("Failed to read file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },

    /// The workflow JSON is malformed.
    #[error("Failed to parse workflow '{path}': {source}")]
    WorkflowParse {
        source: serde_json::Error,
        path: String,
    },

    /// The workflow parsed but is unusable (no steps, bad extraction rule, ...).
    #[error("Workflow error: {message}")]
    Workflow { message: String },

    /// The shared HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {source}")]
    Client {
        #[from]
        source: reqwest::Error,
    },
}

impl LoadTestError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }
}

/// Coarse error taxonomy used for aggregate reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The request could not be built (unresolved template, bad URL).
    Configuration,
    /// Connect failure, timeout, or send/receive failure.
    Transport,
    /// A response arrived but failed its assertions.
    Validation,
    /// The connection pool or rate limiter could not grant in time.
    ResourceExhaustion,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Transport => "transport",
            Self::Validation => "validation",
            Self::ResourceExhaustion => "resource_exhaustion",
        };
        f.write_str(s)
    }
}

/// Fine-grained error kind carried by every failed [`RequestResult`].
///
/// [`ErrorKind::category`] is the stable string used as a metrics key.
///
/// [`RequestResult`]: crate::loadtest::metrics::RequestResult
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A `${name}` template referenced a variable that is not set.
    UnresolvedVariable,
    /// The resolved request is malformed (invalid URL, bad method, bad header).
    InvalidRequest,
    /// The per-attempt timeout elapsed.
    Timeout,
    /// The remote host actively refused the connection.
    ConnectionRefused,
    /// Host name resolution failed.
    Dns,
    /// Any other connect-level failure (TLS, reset, closed).
    Connection,
    /// Send or receive failed after the connection was established.
    Protocol,
    /// No WebSocket response message arrived within the timeout.
    WsTimeout,
    /// The WebSocket peer sent an error frame or violated the protocol.
    WsProtocolError,
    /// Reconnect attempts are exhausted; the socket is considered dead.
    WsPersistentFailure,
    /// The response failed one or more validation rules.
    ValidationFailed,
    /// No connection slot became available within the pool timeout.
    PoolExhausted,
    /// No rate token became available within the acquire timeout.
    RateLimitExhausted,
}

impl ErrorKind {
    /// Returns the error category as a static string for metrics classification.
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnresolvedVariable => "unresolved_variable",
            Self::InvalidRequest => "invalid_request",
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::Dns => "dns",
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::WsTimeout => "ws_timeout",
            Self::WsProtocolError => "ws_protocol_error",
            Self::WsPersistentFailure => "ws_persistent_failure",
            Self::ValidationFailed => "validation_failed",
            Self::PoolExhausted => "pool_exhausted",
            Self::RateLimitExhausted => "rate_limit_exhausted",
        }
    }

    /// Returns the coarse class this kind belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnresolvedVariable | Self::InvalidRequest => ErrorClass::Configuration,
            Self::Timeout
            | Self::ConnectionRefused
            | Self::Dns
            | Self::Connection
            | Self::Protocol
            | Self::WsTimeout
            | Self::WsProtocolError
            | Self::WsPersistentFailure => ErrorClass::Transport,
            Self::ValidationFailed => ErrorClass::Validation,
            Self::PoolExhausted | Self::RateLimitExhausted => ErrorClass::ResourceExhaustion,
        }
    }

    /// Returns `true` for conditions that are unlikely to clear on their own.
    ///
    /// Consecutive occurrences of these kinds are counted per virtual user and
    /// escalated to a run-level warning once a threshold is reached.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            Self::Dns
                | Self::ConnectionRefused
                | Self::WsPersistentFailure
                | Self::PoolExhausted
                | Self::RateLimitExhausted
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category())
    }
}

/// A single per-request failure.
///
/// Cheap to clone so it can travel inside a [`RequestResult`] and be logged
/// without borrowing the executor.
///
/// [`RequestResult`]: crate::loadtest::metrics::RequestResult
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RequestError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl RequestError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A template referenced a variable that is not present in the context.
    pub fn unresolved(name: &str) -> Self {
        Self::new(
            ErrorKind::UnresolvedVariable,
            format!("variable '{name}' is not set"),
        )
    }

    /// Returns the coarse class of this error.
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Classify a [`reqwest::Error`] into the appropriate [`ErrorKind`].
    ///
    /// Timeouts are checked first, then connect failures are split into
    /// refused, DNS, and other by walking the source chain.
    pub fn classify_reqwest(err: &reqwest::Error) -> Self {
        let message = error_chain(err);
        if err.is_timeout() {
            Self::new(ErrorKind::Timeout, message)
        } else if err.is_connect() {
            Self::new(classify_connect_failure(err, &message), message)
        } else if err.is_builder() {
            Self::new(ErrorKind::InvalidRequest, message)
        } else {
            Self::new(ErrorKind::Protocol, message)
        }
    }

    /// Classify a WebSocket handshake or I/O error.
    pub fn classify_ws(err: &tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        let message = err.to_string();
        let kind = match err {
            WsError::Io(io) => classify_io(io, &message),
            WsError::ConnectionClosed | WsError::AlreadyClosed => ErrorKind::Connection,
            WsError::Url(_) => ErrorKind::InvalidRequest,
            _ => ErrorKind::WsProtocolError,
        };
        Self::new(kind, message)
    }
}

/// Renders an error with all its sources joined by `": "`.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn classify_connect_failure(err: &(dyn std::error::Error + 'static), message: &str) -> ErrorKind {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return ErrorKind::ConnectionRefused;
            }
        }
        source = inner.source();
    }
    if looks_like_dns_failure(message) {
        ErrorKind::Dns
    } else {
        ErrorKind::Connection
    }
}

fn classify_io(io: &std::io::Error, message: &str) -> ErrorKind {
    match io.kind() {
        std::io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
        std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
        _ if looks_like_dns_failure(message) => ErrorKind::Dns,
        _ => ErrorKind::Connection,
    }
}

fn looks_like_dns_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("dns error")
        || lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
}
