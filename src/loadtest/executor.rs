//! Protocol-agnostic request execution.
//!
//! A [`ProtocolExecutor`] turns a [`PreparedRequest`] into exactly one
//! [`RequestResult`]. [`ExecutorFactory`] builds one executor per virtual user;
//! every executor it builds shares the run's connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use tokio_util::sync::CancellationToken;

use crate::loadtest::config::{Protocol, TestPlan};
use crate::loadtest::error::LoadTestError;
use crate::loadtest::http::{HttpExecutor, HttpTransport};
use crate::loadtest::metrics::RequestResult;
use crate::loadtest::websocket::{WebSocketExecutor, WsSettings};

/// Request body, already encoded for its content type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// A fully resolved request: no templates left.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    /// Header name/value pairs, unique by case-insensitive name.
    pub headers: Vec<(String, String)>,
    pub payload: Payload,
}

impl PreparedRequest {
    /// A header-less `GET`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            payload: Payload::Empty,
        }
    }
}

/// Request/response transport owned by one virtual user.
#[async_trait]
pub trait ProtocolExecutor: Send {
    /// Sends one request and waits for its outcome.
    ///
    /// Never fails: transport problems are reported inside the result.
    async fn execute(&mut self, request: &PreparedRequest) -> RequestResult;

    /// Releases any connection held by this executor.
    async fn close(&mut self);
}

type CustomFactory = dyn Fn(u32) -> Box<dyn ProtocolExecutor> + Send + Sync;

#[derive(Clone)]
enum FactoryKind {
    Http(Arc<HttpTransport>),
    WebSocket(Arc<WsSettings>),
    Custom(Arc<CustomFactory>),
}

/// Builds one [`ProtocolExecutor`] per virtual user.
#[derive(Clone)]
pub struct ExecutorFactory {
    kind: FactoryKind,
}

impl ExecutorFactory {
    /// Builds the shared transport for the plan's protocol.
    pub fn from_plan(plan: &TestPlan) -> Result<Self, LoadTestError> {
        let kind = match plan.target.protocol {
            Protocol::Http => FactoryKind::Http(Arc::new(HttpTransport::from_plan(plan)?)),
            Protocol::WebSocket => FactoryKind::WebSocket(Arc::new(WsSettings::from_plan(plan))),
        };
        Ok(Self { kind })
    }

    /// Uses `build` to create each user's executor.
    pub fn custom<F>(build: F) -> Self
    where
        F: Fn(u32) -> Box<dyn ProtocolExecutor> + Send + Sync + 'static,
    {
        Self {
            kind: FactoryKind::Custom(Arc::new(build)),
        }
    }

    /// Creates the executor for virtual user `vu_id`.
    ///
    /// `cancel` interrupts WebSocket reconnect backoff on global stop.
    pub fn create(&self, vu_id: u32, cancel: CancellationToken) -> Box<dyn ProtocolExecutor> {
        match &self.kind {
            FactoryKind::Http(transport) => Box::new(HttpExecutor::new(transport.clone())),
            FactoryKind::WebSocket(settings) => {
                Box::new(WebSocketExecutor::new(vu_id, settings.clone(), cancel))
            },
            FactoryKind::Custom(build) => build(vu_id),
        }
    }
}

impl std::fmt::Debug for ExecutorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FactoryKind::Http(_) => "http",
            FactoryKind::WebSocket(_) => "websocket",
            FactoryKind::Custom(_) => "custom",
        };
        f.debug_struct("ExecutorFactory").field("kind", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::metrics::ResponseData;
    use std::time::{Duration, Instant};

    struct Echo {
        vu_id: u32,
    }

    #[async_trait]
    impl ProtocolExecutor for Echo {
        async fn execute(&mut self, request: &PreparedRequest) -> RequestResult {
            RequestResult::completed(
                Instant::now(),
                Duration::from_millis(1),
                200,
                ResponseData {
                    headers: Vec::new(),
                    body: format!("{}:{}", self.vu_id, request.url),
                },
            )
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_custom_factory_builds_per_user() {
        let factory = ExecutorFactory::custom(|vu_id| Box::new(Echo { vu_id }));
        let mut executor = factory.create(3, CancellationToken::new());
        let result = executor.execute(&PreparedRequest::get("http://x/")).await;
        assert_eq!(result.body(), "3:http://x/");
        executor.close().await;
    }

    #[test]
    fn test_from_plan_selects_protocol() {
        let http = TestPlan::from_toml("[target]\nurl = \"http://localhost:1\"").unwrap();
        let factory = ExecutorFactory::from_plan(&http).unwrap();
        assert_eq!(format!("{factory:?}"), "ExecutorFactory { kind: \"http\" }");

        let ws = TestPlan::from_toml("[target]\nurl = \"ws://localhost:1\"\nprotocol = \"websocket\"")
            .unwrap();
        let factory = ExecutorFactory::from_plan(&ws).unwrap();
        assert_eq!(format!("{factory:?}"), "ExecutorFactory { kind: \"websocket\" }");
    }

    #[test]
    fn test_payload_is_empty() {
        assert!(Payload::Empty.is_empty());
        assert!(!Payload::Text(String::new()).is_empty());
    }
}
