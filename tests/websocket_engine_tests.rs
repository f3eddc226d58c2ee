//! End-to-end engine runs against a local WebSocket echo server.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;

use loadstorm::loadtest::config::{Protocol, TestMode, TestPlan};
use loadstorm::loadtest::engine::LoadTestEngine;
use loadstorm::loadtest::error::ErrorKind;
use loadstorm::loadtest::websocket::SWITCHING_PROTOCOLS;
use loadstorm::loadtest::workflow::WorkflowDefinition;

/// Echo server. Returns its URL and the number of accepted connections.
async fn echo_server() -> (String, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicU32::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (format!("ws://{addr}/feed"), connections)
}

fn fixed_ws_plan(url: &str, users: u32, requests: u32) -> TestPlan {
    let mut plan = TestPlan::for_url(url);
    plan.settings.mode = TestMode::Fixed;
    plan.settings.users = users;
    plan.settings.requests_per_user = requests;
    plan.settings.ramp_up_secs = 0.0;
    plan.settings.timeout_ms = 2_000;
    plan.think_time.min_secs = 0.0;
    plan.think_time.max_secs = 0.0;
    plan.target.payload = Some(r#"{"op":"tick"}"#.to_string());
    plan
}

#[tokio::test]
async fn test_fixed_mode_over_websocket() {
    let (url, connections) = echo_server().await;
    let mut plan = fixed_ws_plan(&url, 3, 4);
    plan.validation.contains = Some("tick".to_string());
    assert_eq!(plan.target.protocol, Protocol::WebSocket);

    let workflow = WorkflowDefinition::single_url(&plan).unwrap();
    let result = LoadTestEngine::new(plan, workflow)
        .start()
        .expect("plan should be valid")
        .wait()
        .await;

    assert_eq!(result.snapshot.total_requests, 12);
    assert_eq!(result.snapshot.success_count, 12, "{:?}", result.snapshot.errors_by_kind);
    assert_eq!(
        result.snapshot.status_codes.get(&SWITCHING_PROTOCOLS),
        Some(&12)
    );
    assert_eq!(result.snapshot.bytes_received, 12 * 13);
    assert_eq!(connections.load(Ordering::SeqCst), 3, "one connection per user");
    assert_eq!(result.final_active_users, 0);
}

#[tokio::test]
async fn test_unreachable_websocket_users_fail_fast() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let mut plan = fixed_ws_plan(&format!("ws://127.0.0.1:{port}/"), 2, 5);
    plan.websocket.max_reconnect_attempts = 0;

    let workflow = WorkflowDefinition::single_url(&plan).unwrap();
    let result = LoadTestEngine::new(plan, workflow)
        .start()
        .expect("plan should be valid")
        .wait()
        .await;

    assert_eq!(result.snapshot.total_requests, 10);
    assert_eq!(result.snapshot.success_count, 0);
    assert_eq!(result.snapshot.errors_of(ErrorKind::WsPersistentFailure), 8);
    assert_eq!(result.snapshot.error_latency.count, 2);
}
