mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::time::Instant;

use common::{client_for, dead_endpoint, fast_config, spawn_server};
use toolgate::{ClientError, ConnectionState};

// ═══════════════════════════════════════════════════════════════════════════
//  Mock session service
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct Mock {
    init_hits: Arc<AtomicUsize>,
    healthy: Arc<AtomicBool>,
    init_delay: Duration,
}

impl Mock {
    fn new(init_delay: Duration) -> Self {
        Self {
            init_hits: Arc::new(AtomicUsize::new(0)),
            healthy: Arc::new(AtomicBool::new(true)),
            init_delay,
        }
    }
}

async fn initialize(State(mock): State<Mock>, Json(body): Json<Value>) -> impl IntoResponse {
    mock.init_hits.fetch_add(1, Ordering::SeqCst);
    if !mock.init_delay.is_zero() {
        tokio::time::sleep(mock.init_delay).await;
    }
    assert!(body.get("clientInfo").is_some());
    (
        [("mcp-session-id", "sess-42")],
        Json(json!({
            "serverInfo": {"name": "mock-tools", "version": "1.0"},
            "capabilities": {"tools": {}},
        })),
    )
}

async fn tools(State(mock): State<Mock>) -> impl IntoResponse {
    if mock.healthy.load(Ordering::SeqCst) {
        Json(json!([{"name": "echo"}])).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {"message": "draining"}})),
        )
            .into_response()
    }
}

fn mock_router(mock: Mock) -> Router {
    Router::new()
        .route("/initialize", post(initialize))
        .route("/tools", get(tools))
        .with_state(mock)
}

// ═══════════════════════════════════════════════════════════════════════════
//  Connect / close lifecycle
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connect_reaches_connected_and_captures_server_info() {
    let mock = Mock::new(Duration::ZERO);
    let (base, _server) = spawn_server(mock_router(mock.clone())).await;
    let client = client_for("svc", &base, fast_config());

    assert_eq!(client.connection_state("svc"), ConnectionState::Disconnected);
    client.connect("svc").await.unwrap();
    assert_eq!(client.connection_state("svc"), ConnectionState::Connected);

    let info = client.session("svc").server_info().unwrap();
    assert_eq!(info["serverInfo"]["name"], "mock-tools");
    assert_eq!(mock.init_hits.load(Ordering::SeqCst), 1);

    // reconnecting while connected is a no-op
    client.connect("svc").await.unwrap();
    assert_eq!(mock.init_hits.load(Ordering::SeqCst), 1);

    client.close("svc").await;
    assert_eq!(client.connection_state("svc"), ConnectionState::Disconnected);
    // idempotent
    client.close("svc").await;
}

#[tokio::test]
async fn connecting_is_observable_while_the_handshake_is_in_flight() {
    let mock = Mock::new(Duration::from_millis(300));
    let (base, _server) = spawn_server(mock_router(mock)).await;
    let client = Arc::new(client_for("svc", &base, fast_config()));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.connect("svc").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.connection_state("svc"), ConnectionState::Connecting);

    pending.await.unwrap().unwrap();
    assert_eq!(client.connection_state("svc"), ConnectionState::Connected);
    client.close("svc").await;
}

#[tokio::test]
async fn close_racing_a_slow_connect_leaves_the_session_closed() {
    let mock = Mock::new(Duration::from_millis(300));
    let (base, _server) = spawn_server(mock_router(mock)).await;
    let client = Arc::new(client_for("svc", &base, fast_config()));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.connect("svc").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    // teardown serializes behind the in-flight handshake, so once close()
    // returns the late handshake cannot resurrect the session
    client.close("svc").await;
    pending.await.unwrap().unwrap();
    assert_eq!(client.connection_state("svc"), ConnectionState::Disconnected);
}

#[tokio::test]
async fn failed_handshake_lands_in_error_state() {
    let base = dead_endpoint().await;
    let client = client_for("svc", &base, fast_config());

    let err = client.connect("svc").await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)));
    assert_eq!(client.connection_state("svc"), ConnectionState::Error);
    assert!(client.session("svc").last_error().is_some());
}

#[tokio::test]
async fn unresolvable_service_cannot_connect() {
    let mock = Mock::new(Duration::ZERO);
    let (base, _server) = spawn_server(mock_router(mock)).await;
    let client = client_for("svc", &base, fast_config());

    let err = client.connect("ghost").await.unwrap_err();
    assert!(matches!(err, ClientError::ServiceNotFound(ref s) if s == "ghost"));
}

// ═══════════════════════════════════════════════════════════════════════════
//  Session-scoped calls
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn session_list_tools_connects_on_demand() {
    let mock = Mock::new(Duration::ZERO);
    let (base, _server) = spawn_server(mock_router(mock.clone())).await;
    let client = client_for("svc", &base, fast_config());

    let out = client.session("svc").list_tools().await.unwrap();
    assert_eq!(out, json!({"items": [{"name": "echo"}]}));
    // the call triggered the handshake itself
    assert_eq!(mock.init_hits.load(Ordering::SeqCst), 1);
    assert_eq!(client.connection_state("svc"), ConnectionState::Connected);
    client.close("svc").await;
}

// ═══════════════════════════════════════════════════════════════════════════
//  Health monitor
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn failed_probe_triggers_a_reconnect() {
    let mock = Mock::new(Duration::ZERO);
    let (base, _server) = spawn_server(mock_router(mock.clone())).await;
    let client = client_for("svc", &base, fast_config());

    client.connect("svc").await.unwrap();
    assert_eq!(mock.init_hits.load(Ordering::SeqCst), 1);

    // next probe fails, forcing the monitor through reconnect
    mock.healthy.store(false, Ordering::SeqCst);
    let deadline = Instant::now() + Duration::from_secs(5);
    while mock.init_hits.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(
        mock.init_hits.load(Ordering::SeqCst) >= 2,
        "monitor never re-ran the handshake"
    );

    mock.healthy.store(true, Ordering::SeqCst);
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.connection_state("svc") != ConnectionState::Connected && Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(client.connection_state("svc"), ConnectionState::Connected);
    client.close("svc").await;
}
