//! WebSocket executor.
//!
//! Each virtual user keeps one connection for the whole run. A request sends
//! the payload as one message and waits for one data message back. When the
//! connection fails or a reply times out, the connection is discarded and the
//! next request reconnects with exponential backoff; once the attempts are
//! exhausted the user is dead and every later request reports
//! `ws_persistent_failure` without touching the network.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::prelude::*;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::loadtest::config::TestPlan;
use crate::loadtest::error::{ErrorKind, RequestError};
use crate::loadtest::executor::{Payload, PreparedRequest, ProtocolExecutor};
use crate::loadtest::metrics::{RequestResult, ResponseData};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Status reported for a completed WebSocket exchange.
pub const SWITCHING_PROTOCOLS: u16 = 101;

/// Connection settings shared by every WebSocket executor of a run.
#[derive(Debug, Clone)]
pub struct WsSettings {
    /// Handshake and per-message response timeout.
    pub timeout: Duration,
    /// Reconnect attempts after a connection failure before the user is dead.
    pub max_reconnect_attempts: u32,
    /// First backoff delay; doubles on every attempt.
    pub reconnect_base: Duration,
}

impl WsSettings {
    pub fn from_plan(plan: &TestPlan) -> Self {
        Self {
            timeout: plan.timeout(),
            max_reconnect_attempts: plan.websocket.max_reconnect_attempts,
            reconnect_base: Duration::from_millis(plan.websocket.reconnect_backoff_ms),
        }
    }
}

/// Backoff before reconnect attempt `attempt` (0-based): `base * 2^attempt`
/// with +/-25% jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let backoff = base.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let jitter_range = backoff / 4;
    let jitter = if jitter_range > 0 {
        rand::rng().random_range(0..=jitter_range * 2) as i64 - jitter_range as i64
    } else {
        0
    };
    Duration::from_millis((backoff as i64 + jitter).max(0) as u64)
}

/// Waits out a backoff. Returns `false` if cancelled.
async fn wait_backoff(base: Duration, attempt: u32, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(backoff_delay(base, attempt)) => true,
        _ = cancel.cancelled() => false,
    }
}

fn to_message(payload: &Payload) -> Message {
    match payload {
        Payload::Empty => Message::text(String::new()),
        Payload::Json(value) => Message::text(value.to_string()),
        Payload::Form(pairs) => Message::text(
            url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish(),
        ),
        Payload::Text(text) => Message::text(text.clone()),
        Payload::Binary(bytes) => Message::binary(bytes.clone()),
    }
}

/// Per-user WebSocket executor.
pub struct WebSocketExecutor {
    vu_id: u32,
    settings: Arc<WsSettings>,
    cancel: CancellationToken,
    socket: Option<WsStream>,
    connected_url: Option<String>,
    dead: bool,
}

impl WebSocketExecutor {
    pub fn new(vu_id: u32, settings: Arc<WsSettings>, cancel: CancellationToken) -> Self {
        Self {
            vu_id,
            settings,
            cancel,
            socket: None,
            connected_url: None,
            dead: false,
        }
    }

    /// `true` once reconnect attempts are exhausted.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    async fn connect_once(&self, request: &PreparedRequest) -> Result<WsStream, RequestError> {
        let mut handshake = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RequestError::classify_ws(&e))?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                RequestError::new(ErrorKind::InvalidRequest, format!("header '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                RequestError::new(ErrorKind::InvalidRequest, format!("header '{name}': {e}"))
            })?;
            handshake.headers_mut().insert(name, value);
        }

        match tokio::time::timeout(
            self.settings.timeout,
            tokio_tungstenite::connect_async(handshake),
        )
        .await
        {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(err)) => Err(RequestError::classify_ws(&err)),
            Err(_) => Err(RequestError::new(
                ErrorKind::Timeout,
                format!("WebSocket handshake exceeded {}ms", self.settings.timeout.as_millis()),
            )),
        }
    }

    /// Connects, retrying with backoff. Marks the executor dead on exhaustion.
    async fn connect(&mut self, request: &PreparedRequest) -> Result<(), RequestError> {
        let mut attempt = 0;
        loop {
            match self.connect_once(request).await {
                Ok(stream) => {
                    tracing::debug!(vu_id = self.vu_id, url = %request.url, "WebSocket connected");
                    self.socket = Some(stream);
                    self.connected_url = Some(request.url.clone());
                    return Ok(());
                },
                Err(err) if err.kind == ErrorKind::InvalidRequest => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        vu_id = self.vu_id,
                        attempt,
                        error_kind = %err.kind,
                        "WebSocket connect failed"
                    );
                    if attempt >= self.settings.max_reconnect_attempts {
                        self.dead = true;
                        return Err(err);
                    }
                    if !wait_backoff(self.settings.reconnect_base, attempt, &self.cancel).await {
                        return Err(err);
                    }
                    attempt += 1;
                },
            }
        }
    }

    fn drop_connection(&mut self) {
        self.socket = None;
        self.connected_url = None;
    }

    async fn exchange(&mut self, message: Message) -> Result<String, RequestError> {
        let timeout = self.settings.timeout;
        let Some(socket) = self.socket.as_mut() else {
            return Err(RequestError::new(ErrorKind::Connection, "not connected"));
        };

        match tokio::time::timeout(timeout, socket.send(message)).await {
            Ok(Ok(())) => {},
            Ok(Err(err)) => {
                self.drop_connection();
                return Err(RequestError::classify_ws(&err));
            },
            Err(_) => {
                self.drop_connection();
                return Err(RequestError::new(
                    ErrorKind::WsTimeout,
                    format!("send exceeded {}ms", timeout.as_millis()),
                ));
            },
        }

        let receive = async {
            while let Some(frame) = socket.next().await {
                match frame {
                    Ok(Message::Text(text)) => return Ok(text.as_str().to_string()),
                    Ok(Message::Binary(bytes)) => {
                        return Ok(String::from_utf8_lossy(&bytes).into_owned())
                    },
                    Ok(Message::Close(_)) => {
                        return Err(RequestError::new(
                            ErrorKind::Connection,
                            "server closed the connection",
                        ))
                    },
                    Ok(_) => continue,
                    Err(err) => return Err(RequestError::classify_ws(&err)),
                }
            }
            Err(RequestError::new(ErrorKind::Connection, "connection closed"))
        };

        match tokio::time::timeout(timeout, receive).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(err)) => {
                self.drop_connection();
                Err(err)
            },
            Err(_) => {
                // A late reply would otherwise be paired with the next request.
                self.drop_connection();
                Err(RequestError::new(
                    ErrorKind::WsTimeout,
                    format!("no response message within {}ms", timeout.as_millis()),
                ))
            },
        }
    }
}

#[async_trait]
impl ProtocolExecutor for WebSocketExecutor {
    async fn execute(&mut self, request: &PreparedRequest) -> RequestResult {
        if self.dead {
            return RequestResult::not_sent(RequestError::new(
                ErrorKind::WsPersistentFailure,
                "reconnect attempts exhausted",
            ));
        }

        let connect_start = Instant::now();
        if self.connected_url.as_deref() != Some(request.url.as_str()) {
            self.close().await;
            if let Err(err) = self.connect(request).await {
                return RequestResult::failed(connect_start, connect_start.elapsed(), err);
            }
        }

        let start = Instant::now();
        match self.exchange(to_message(&request.payload)).await {
            Ok(body) => RequestResult::completed(
                start,
                start.elapsed(),
                SWITCHING_PROTOCOLS,
                ResponseData {
                    headers: Vec::new(),
                    body,
                },
            ),
            Err(err) => RequestResult::failed(start, start.elapsed(), err),
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
        self.connected_url = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::metrics::MetricsRecorder;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::net::TcpListener;

    fn settings(timeout: Duration, attempts: u32) -> Arc<WsSettings> {
        Arc::new(WsSettings {
            timeout,
            max_reconnect_attempts: attempts,
            reconnect_base: Duration::from_millis(20),
        })
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Echo,
        /// Accepts the handshake and never answers.
        Silent,
        /// Holds the first reply of the whole server back by this long.
        DelayFirst(Duration),
        /// Closes each connection after this many replies.
        CloseAfter(usize),
    }

    /// Echo server that counts accepted connections.
    async fn spawn_server(behavior: Behavior) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicU32::new(0));
        let counter = connections.clone();
        let delayed = Arc::new(AtomicBool::new(false));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let delayed = delayed.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let mut replies = 0;
                    while let Some(Ok(msg)) = ws.next().await {
                        if !(msg.is_text() || msg.is_binary()) {
                            continue;
                        }
                        match behavior {
                            Behavior::Silent => continue,
                            Behavior::DelayFirst(delay) if !delayed.swap(true, Ordering::SeqCst) => {
                                tokio::time::sleep(delay).await;
                            },
                            _ => {},
                        }
                        if ws.send(msg).await.is_err() {
                            return;
                        }
                        replies += 1;
                        if let Behavior::CloseAfter(limit) = behavior {
                            if replies >= limit {
                                let _ = ws.close(None).await;
                                return;
                            }
                        }
                    }
                });
            }
        });
        (format!("ws://{addr}/"), connections)
    }

    fn text_request(url: &str, body: &str) -> PreparedRequest {
        PreparedRequest {
            payload: Payload::Text(body.to_string()),
            ..PreparedRequest::get(url)
        }
    }

    #[test]
    fn test_backoff_delay_within_jitter() {
        let base = Duration::from_millis(500);
        for attempt in 0..3 {
            let nominal = 500.0 * 2f64.powi(attempt as i32);
            let delay = backoff_delay(base, attempt).as_millis() as f64;
            assert!(delay >= nominal * 0.75 && delay <= nominal * 1.25, "{delay}");
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (url, _) = spawn_server(Behavior::Echo).await;
        let mut executor = WebSocketExecutor::new(0, settings(Duration::from_secs(2), 3), CancellationToken::new());
        let result = executor.execute(&text_request(&url, "ping")).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.status, Some(SWITCHING_PROTOCOLS));
        assert_eq!(result.body(), "ping");
        assert_eq!(result.bytes_received, 4);
        executor.close().await;
    }

    #[tokio::test]
    async fn test_one_connection_per_user() {
        let (url, connections) = spawn_server(Behavior::Echo).await;
        let mut executor = WebSocketExecutor::new(0, settings(Duration::from_secs(2), 3), CancellationToken::new());
        for i in 0..5 {
            let result = executor.execute(&text_request(&url, &format!("m{i}"))).await;
            assert_eq!(result.body(), format!("m{i}"));
        }
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_json_payload_sent_as_text() {
        let (url, _) = spawn_server(Behavior::Echo).await;
        let mut executor = WebSocketExecutor::new(0, settings(Duration::from_secs(2), 3), CancellationToken::new());
        let request = PreparedRequest {
            payload: Payload::Json(serde_json::json!({"op": "sub"})),
            ..PreparedRequest::get(url.as_str())
        };
        let result = executor.execute(&request).await;
        assert_eq!(result.body(), r#"{"op":"sub"}"#);
    }

    #[tokio::test]
    async fn test_silent_server_is_ws_timeout() {
        let (url, _) = spawn_server(Behavior::Silent).await;
        let mut executor = WebSocketExecutor::new(0, settings(Duration::from_millis(150), 3), CancellationToken::new());
        let result = executor.execute(&text_request(&url, "hello?")).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::WsTimeout));
        assert!(!executor.is_dead());
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_become_persistent_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        drop(listener);

        let mut executor = WebSocketExecutor::new(0, settings(Duration::from_secs(1), 2), CancellationToken::new());
        let first = executor.execute(&text_request(&url, "x")).await;
        assert!(
            matches!(
                first.error_kind(),
                Some(ErrorKind::ConnectionRefused | ErrorKind::Connection)
            ),
            "{:?}",
            first.error
        );
        assert!(executor.is_dead());

        let second = executor.execute(&text_request(&url, "x")).await;
        assert_eq!(second.error_kind(), Some(ErrorKind::WsPersistentFailure));
        assert_eq!(second.latency, Duration::ZERO);
        assert!(!second.sent);
    }

    #[tokio::test]
    async fn test_dead_user_does_not_skew_error_latency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        drop(listener);

        let mut executor = WebSocketExecutor::new(0, settings(Duration::from_secs(1), 0), CancellationToken::new());
        let mut recorder = MetricsRecorder::new(None);
        recorder.record(&executor.execute(&text_request(&url, "x")).await);
        assert!(executor.is_dead());
        for _ in 0..10 {
            recorder.record(&executor.execute(&text_request(&url, "x")).await);
        }

        let snap = recorder.snapshot();
        assert_eq!(snap.error_count, 11);
        assert_eq!(snap.errors_of(ErrorKind::WsPersistentFailure), 10);
        assert_eq!(snap.error_latency.count, 1, "only the real connect attempt is timed");
    }

    #[tokio::test]
    async fn test_late_reply_is_not_paired_with_next_request() {
        let (url, connections) = spawn_server(Behavior::DelayFirst(Duration::from_millis(300))).await;
        let mut executor = WebSocketExecutor::new(0, settings(Duration::from_millis(100), 3), CancellationToken::new());

        let first = executor.execute(&text_request(&url, "first")).await;
        assert_eq!(first.error_kind(), Some(ErrorKind::WsTimeout));
        assert!(!executor.is_dead());

        let second = executor.execute(&text_request(&url, "second")).await;
        assert!(second.is_success(), "{:?}", second.error);
        assert_eq!(second.body(), "second");
        let third = executor.execute(&text_request(&url, "third")).await;
        assert_eq!(third.body(), "third");
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_close_reconnects_on_next_request() {
        let (url, connections) = spawn_server(Behavior::CloseAfter(2)).await;
        let mut executor = WebSocketExecutor::new(0, settings(Duration::from_secs(2), 3), CancellationToken::new());

        for body in ["m0", "m1"] {
            assert_eq!(executor.execute(&text_request(&url, body)).await.body(), body);
        }
        let dropped = executor.execute(&text_request(&url, "m2")).await;
        assert!(!dropped.is_success());
        assert!(dropped.sent);

        for body in ["m3", "m4"] {
            let result = executor.execute(&text_request(&url, body)).await;
            assert!(result.is_success(), "{:?}", result.error);
            assert_eq!(result.body(), body);
        }
        assert_eq!(connections.load(Ordering::SeqCst), 2);
        assert!(!executor.is_dead());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        drop(listener);

        let cancel = CancellationToken::new();
        let slow = Arc::new(WsSettings {
            timeout: Duration::from_secs(1),
            max_reconnect_attempts: 3,
            reconnect_base: Duration::from_secs(30),
        });
        let mut executor = WebSocketExecutor::new(0, slow, cancel.clone());
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let result = executor.execute(&text_request(&url, "x")).await;
        assert!(!result.is_success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
