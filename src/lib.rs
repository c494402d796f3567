//! Resilient client for HTTP tool services.
//!
//! Wraps tool invocation and resource streaming against a fleet of services
//! in three independent resilience layers:
//!
//! * a per-service [`CircuitBreaker`] that fails fast after repeated errors,
//! * a bounded [`ConnectionPool`] per endpoint with blocking checkout,
//! * a per-service [`ServiceConnection`] session with handshake, background
//!   health probing, and reconnect with exponential backoff.
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolgate::{ClientConfig, StaticDiscovery, ToolClient};
//!
//! # async fn run() -> Result<(), toolgate::ClientError> {
//! let discovery = StaticDiscovery::new().with_service("search", "http://localhost:9000");
//! let client = ToolClient::new(Arc::new(discovery), ClientConfig::from_env());
//! let hits = client
//!     .call_tool("search", "query", serde_json::json!({"q": "rust"}))
//!     .await?;
//! # let _ = hits;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
mod monitor;
pub mod pool;
pub mod session;
mod sse;

pub use breaker::{BreakerState, CircuitBreaker};
pub use client::ToolClient;
pub use config::{
    BreakerConfig, ClientConfig, HealthConfig, PoolConfig, RetryConfig, SessionConfig,
};
pub use discovery::{ServiceDiscovery, ServiceEndpoint, StaticDiscovery};
pub use error::ClientError;
pub use pool::{ConnectionPool, PooledConnection};
pub use session::{ConnectionState, ServiceConnection};
