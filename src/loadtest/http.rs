//! HTTP(S) executor.
//!
//! All virtual users share one [`HttpTransport`]: a single `reqwest::Client`
//! (and therefore one keep-alive pool) plus a [`ConnectionPool`] that caps
//! in-flight requests per host and in total. When the caps are reached callers
//! queue; a caller that waits longer than the pool timeout records
//! `pool_exhausted` instead of sending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::loadtest::config::TestPlan;
use crate::loadtest::error::{ErrorKind, LoadTestError, RequestError};
use crate::loadtest::executor::{Payload, PreparedRequest, ProtocolExecutor};
use crate::loadtest::metrics::{RequestResult, ResponseData};

/// Host entries kept before idle ones are pruned.
const MAX_TRACKED_HOSTS: usize = 256;

/// Per-host and global caps on concurrent connections.
#[derive(Debug)]
pub struct ConnectionPool {
    per_host: usize,
    global: Arc<Semaphore>,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    wait_timeout: Option<Duration>,
}

/// A granted connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    _host: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl ConnectionPool {
    pub fn new(per_host: usize, max_total: usize, wait_timeout: Option<Duration>) -> Self {
        Self {
            per_host: per_host.max(1),
            global: Arc::new(Semaphore::new(max_total.max(1))),
            hosts: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock();
        if let Some(slots) = hosts.get(host) {
            return slots.clone();
        }
        // Templated URLs can name unbounded hosts. An entry only referenced by
        // the map has no permit holder or waiter and can be recreated later.
        if hosts.len() >= MAX_TRACKED_HOSTS {
            hosts.retain(|_, slots| Arc::strong_count(slots) > 1);
        }
        let slots = Arc::new(Semaphore::new(self.per_host));
        hosts.insert(host.to_string(), slots.clone());
        slots
    }

    /// Slots currently free for `host`.
    pub fn available(&self, host: &str) -> usize {
        let host_free = self
            .hosts
            .lock()
            .get(host)
            .map_or(self.per_host, |slots| slots.available_permits());
        host_free.min(self.global.available_permits())
    }

    /// Hosts with a tracked slot count.
    pub fn tracked_hosts(&self) -> usize {
        self.hosts.lock().len()
    }

    /// Waits for a slot on `host`, then for a global slot.
    pub async fn acquire(&self, host: &str) -> Result<ConnectionPermit, RequestError> {
        let host_slots = self.host_semaphore(host);
        let global = self.global.clone();
        let wait = async move {
            let host_permit = host_slots.acquire_owned().await.ok()?;
            let global_permit = global.acquire_owned().await.ok()?;
            Some(ConnectionPermit {
                _host: host_permit,
                _global: global_permit,
            })
        };
        let granted = match self.wait_timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok().flatten(),
            None => wait.await,
        };
        granted.ok_or_else(|| {
            RequestError::new(
                ErrorKind::PoolExhausted,
                format!("no connection slot for {host}"),
            )
        })
    }
}

/// Key used to group requests per host.
fn host_key(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => format!(
            "{}:{}",
            parsed.host_str().unwrap_or_default(),
            parsed.port_or_known_default().unwrap_or_default()
        ),
        Err(_) => url.to_string(),
    }
}

/// HTTP state shared by every virtual user of a run.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    pool: ConnectionPool,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, pool: ConnectionPool, timeout: Duration) -> Self {
        Self {
            client,
            pool,
            timeout,
        }
    }

    pub fn from_plan(plan: &TestPlan) -> Result<Self, LoadTestError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(plan.connections.per_host)
            .connect_timeout(plan.timeout())
            .build()?;
        let pool = ConnectionPool::new(
            plan.connections.per_host,
            plan.connections.max_total,
            plan.connections.pool_timeout(),
        );
        Ok(Self::new(client, pool, plan.timeout()))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn send(&self, request: &PreparedRequest) -> RequestResult {
        let queued = Instant::now();
        let _permit = match self.pool.acquire(&host_key(&request.url)).await {
            Ok(permit) => permit,
            Err(err) => return RequestResult::failed(queued, queued.elapsed(), err),
        };

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.payload {
            Payload::Empty => builder,
            Payload::Json(value) => builder.json(value),
            Payload::Form(pairs) => builder.form(pairs),
            Payload::Text(text) => builder.body(text.clone()),
            Payload::Binary(bytes) => builder.body(bytes.clone()),
        };

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                return RequestResult::failed(
                    start,
                    start.elapsed(),
                    RequestError::classify_reqwest(&err),
                )
            },
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        match response.bytes().await {
            Ok(body) => {
                let mut result = RequestResult::completed(
                    start,
                    start.elapsed(),
                    status,
                    ResponseData {
                        headers,
                        body: String::from_utf8_lossy(&body).into_owned(),
                    },
                );
                result.bytes_received = body.len() as u64;
                result
            },
            Err(err) => {
                let mut result =
                    RequestResult::failed(start, start.elapsed(), RequestError::classify_reqwest(&err));
                result.status = Some(status);
                result
            },
        }
    }
}

/// Per-user HTTP executor. Holds no connection of its own.
pub struct HttpExecutor {
    transport: Arc<HttpTransport>,
}

impl HttpExecutor {
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProtocolExecutor for HttpExecutor {
    async fn execute(&mut self, request: &PreparedRequest) -> RequestResult {
        tracing::trace!(method = %request.method, url = %request.url, "sending HTTP request");
        self.transport.send(request).await
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::error::ErrorClass;
    use reqwest::Method;

    fn transport(timeout: Duration) -> Arc<HttpTransport> {
        Arc::new(HttpTransport::new(
            reqwest::Client::new(),
            ConnectionPool::new(10, 100, Some(Duration::from_secs(1))),
            timeout,
        ))
    }

    #[test]
    fn test_host_key_includes_default_port() {
        assert_eq!(host_key("http://example.com/a"), "example.com:80");
        assert_eq!(host_key("https://example.com/a"), "example.com:443");
        assert_eq!(host_key("http://127.0.0.1:8080/"), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_pool_exhaustion_after_wait_timeout() {
        let pool = ConnectionPool::new(1, 10, Some(Duration::from_millis(50)));
        let held = pool.acquire("h:80").await.unwrap();
        assert_eq!(pool.available("h:80"), 0);
        let err = pool.acquire("h:80").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PoolExhausted);
        assert_eq!(err.class(), ErrorClass::ResourceExhaustion);

        // Other hosts are unaffected by the per-host cap.
        assert!(pool.acquire("other:80").await.is_ok());
        drop(held);
        assert!(pool.acquire("h:80").await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_host_entries_are_pruned() {
        let pool = ConnectionPool::new(1, 10, Some(Duration::from_millis(50)));
        let held = pool.acquire("busy:80").await.unwrap();
        for i in 0..(MAX_TRACKED_HOSTS * 3) {
            drop(pool.acquire(&format!("host-{i}:80")).await.unwrap());
        }
        assert!(pool.tracked_hosts() <= MAX_TRACKED_HOSTS, "{}", pool.tracked_hosts());

        // The busy host keeps its entry, so its cap still holds.
        assert_eq!(pool.available("busy:80"), 0);
        assert_eq!(pool.acquire("busy:80").await.unwrap_err().kind, ErrorKind::PoolExhausted);
        drop(held);
        assert!(pool.acquire("busy:80").await.is_ok());
    }

    #[tokio::test]
    async fn test_global_cap_applies_across_hosts() {
        let pool = ConnectionPool::new(5, 1, Some(Duration::from_millis(50)));
        let _held = pool.acquire("a:80").await.unwrap();
        let err = pool.acquire("b:80").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PoolExhausted);
    }

    #[tokio::test]
    async fn test_get_records_status_body_and_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/hello")
            .with_status(200)
            .with_header("x-request-id", "r-1")
            .with_body("hello world")
            .create_async()
            .await;

        let mut executor = HttpExecutor::new(transport(Duration::from_secs(5)));
        let result = executor
            .execute(&PreparedRequest::get(format!("{}/hello", server.url())))
            .await;

        mock.assert_async().await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.status, Some(200));
        assert_eq!(result.body(), "hello world");
        assert_eq!(result.bytes_received, 11);
        assert_eq!(result.header("X-Request-Id"), Some("r-1"));
    }

    #[tokio::test]
    async fn test_non_2xx_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;
        let mut executor = HttpExecutor::new(transport(Duration::from_secs(5)));
        let result = executor
            .execute(&PreparedRequest::get(format!("{}/missing", server.url())))
            .await;
        assert!(result.is_success());
        assert_eq!(result.status, Some(404));
    }

    #[tokio::test]
    async fn test_post_sends_json_payload_and_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/items")
            .match_header("authorization", "Bearer abc")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::Json(serde_json::json!({"name": "widget"})))
            .with_status(201)
            .create_async()
            .await;

        let mut executor = HttpExecutor::new(transport(Duration::from_secs(5)));
        let request = PreparedRequest {
            method: Method::POST,
            url: format!("{}/items", server.url()),
            headers: vec![
                ("Authorization".to_string(), "Bearer abc".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            payload: Payload::Json(serde_json::json!({"name": "widget"})),
        };
        let result = executor.execute(&request).await;
        mock.assert_async().await;
        assert_eq!(result.status, Some(201));
    }

    #[tokio::test]
    async fn test_form_payload_is_urlencoded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/login")
            .match_body("user=alice&pass=s3cret")
            .with_status(200)
            .create_async()
            .await;
        let mut executor = HttpExecutor::new(transport(Duration::from_secs(5)));
        let request = PreparedRequest {
            method: Method::POST,
            url: format!("{}/login", server.url()),
            headers: Vec::new(),
            payload: Payload::Form(vec![
                ("user".to_string(), "alice".to_string()),
                ("pass".to_string(), "s3cret".to_string()),
            ]),
        };
        let result = executor.execute(&request).await;
        mock.assert_async().await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut executor = HttpExecutor::new(transport(Duration::from_millis(200)));
        let result = executor
            .execute(&PreparedRequest::get(format!("http://{addr}/")))
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert!(result.latency >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_closed_port_is_connection_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut executor = HttpExecutor::new(transport(Duration::from_secs(2)));
        let result = executor
            .execute(&PreparedRequest::get(format!("http://{addr}/")))
            .await;
        assert!(
            matches!(
                result.error_kind(),
                Some(ErrorKind::ConnectionRefused | ErrorKind::Connection)
            ),
            "got {:?}",
            result.error
        );
    }
}
