#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use toolgate::{ClientConfig, StaticDiscovery, ToolClient};

/// Serve a mock router on an ephemeral port; returns its base URL.
pub async fn spawn_server(router: Router) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), handle)
}

/// A client wired to a single mock service, with test-friendly timings.
pub fn client_for(service: &str, base_url: &str, config: ClientConfig) -> ToolClient {
    init_tracing();
    let discovery = StaticDiscovery::new().with_service(service, base_url);
    ToolClient::new(Arc::new(discovery), config)
}

/// `RUST_LOG`-driven log capture for failing tests. Safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Defaults shrunk so tests finish in milliseconds, not minutes.
pub fn fast_config() -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.pool.min_size = 0;
    cfg.retry.base_delay = Duration::from_millis(10);
    cfg.session.handshake_timeout = Duration::from_secs(2);
    cfg.session.call_timeout = Duration::from_secs(2);
    cfg.session.backoff_base = Duration::from_millis(10);
    cfg.session.close_grace = Duration::from_millis(500);
    cfg.health.interval = Duration::from_millis(100);
    cfg.health.jitter_frac = 0.0;
    cfg.health.probe_timeout = Duration::from_secs(1);
    cfg.health.reconnect_timeout = Duration::from_secs(5);
    cfg
}

/// A local address nothing is listening on (bind, read the port, drop).
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}
