//! Client error taxonomy.
//!
//! Transport-level failures (connect/timeout/refused) are caught at the
//! client boundary and re-wrapped here — callers never see a raw
//! `reqwest::Error`.

use thiserror::Error;

/// Errors surfaced by the tool client and its resilience layers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Discovery returned no address for the service. Never retried.
    #[error("service '{0}' not found in discovery")]
    ServiceNotFound(String),

    /// The tool endpoint answered 404. Permanent — never retried.
    #[error("tool '{tool}' not found on service '{service}'")]
    ToolNotFound { service: String, tool: String },

    /// All retry attempts were exhausted; wraps the last underlying error.
    #[error("tool call failed after {attempts} attempt(s): {source}")]
    ToolExecution {
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    /// The resource endpoint answered 404.
    #[error("resource '{path}' not found on service '{service}'")]
    ResourceNotFound { service: String, path: String },

    /// The resource endpoint answered with another non-2xx status.
    #[error("resource access failed with HTTP {status}: {message}")]
    ResourceAccess { status: u16, message: String },

    /// Connect / timeout / network-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A non-404 error status from a tool call. Transient — retried, and
    /// counted against the circuit breaker.
    #[error("upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The circuit breaker is open — no network attempt was made.
    #[error("circuit open for service '{service}' — failing fast (retry in ~{retry_in_secs}s)")]
    CircuitOpen {
        service: String,
        retry_in_secs: u64,
    },

    /// Operation attempted after the pool was shut down.
    #[error("connection pool is closed")]
    PoolClosed,
}

/// Extract a human-readable message from an upstream error body.
/// Servers disagree on shape: both `{"error": {"message": ...}}` and
/// `{"detail": ...}` are tolerated; anything else falls back to the raw
/// body, truncated.
pub(crate) fn error_message_from_body(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = json.pointer("/error/message").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = json.get("detail").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = json.get("error").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
    }
    truncate_str(body, 300)
}

pub(crate) fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let boundary = s
            .char_indices()
            .take_while(|(i, _)| *i < max_len)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(max_len);
        format!("{}...", &s[..boundary])
    }
}
