//! Per-service logical session.
//!
//! One `ServiceConnection` per service the application explicitly connects
//! to. It owns the handshake, the session transport, and a background health
//! monitor, and is the only thing allowed to mutate its own state. Distinct
//! from the pooled stateless path in [`crate::client`] — the two resilience
//! layers are independent.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::normalize_result;
use crate::config::{HealthConfig, SessionConfig};
use crate::discovery::ServiceDiscovery;
use crate::error::{ClientError, error_message_from_body};
use crate::monitor;

/// Session lifecycle states.
///
/// `Disconnected -> Connecting -> Connected`, demoted to `Reconnecting` by a
/// failed health check, `Error` on handshake/reconnect failure, back to
/// `Disconnected` only via `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Live transport for one session: a dedicated HTTP client plus the session
/// id handed back by the handshake (echoed on every request when present).
#[derive(Debug, Clone)]
struct SessionTransport {
    http: reqwest::Client,
    base_url: String,
    session_id: Option<String>,
}

pub(crate) struct MonitorHandle {
    pub(crate) task: JoinHandle<()>,
    pub(crate) token: CancellationToken,
}

pub struct ServiceConnection {
    service: String,
    discovery: Arc<dyn ServiceDiscovery>,
    session_cfg: SessionConfig,
    health_cfg: HealthConfig,
    state: Mutex<ConnectionState>,
    /// Single-flight guard: only one handshake is ever in flight. A second
    /// caller blocks here, then observes `Connected` and returns.
    connect_lock: AsyncMutex<()>,
    attempts: AtomicU32,
    transport: RwLock<Option<SessionTransport>>,
    server_info: Mutex<Option<Value>>,
    last_error: Mutex<Option<String>>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl ServiceConnection {
    pub fn new(
        service: &str,
        discovery: Arc<dyn ServiceDiscovery>,
        session_cfg: SessionConfig,
        health_cfg: HealthConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            service: service.to_string(),
            discovery,
            session_cfg,
            health_cfg,
            state: Mutex::new(ConnectionState::Disconnected),
            connect_lock: AsyncMutex::new(()),
            attempts: AtomicU32::new(0),
            transport: RwLock::new(None),
            server_info: Mutex::new(None),
            last_error: Mutex::new(None),
            monitor: Mutex::new(None),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Server identity/capabilities captured from the handshake response.
    pub fn server_info(&self) -> Option<Value> {
        self.server_info
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub(crate) fn health_config(&self) -> &HealthConfig {
        &self.health_cfg
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != next {
            tracing::debug!("session[{}]: {} -> {}", self.service, *state, next);
            *state = next;
        }
    }

    /// Establish the session: resolve, open transport, handshake, start the
    /// health monitor. Returns immediately when already connected; a
    /// concurrent `connect()` waits for the in-flight attempt instead of
    /// starting a second handshake.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let _flight = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let prev = self.state();
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if prev == ConnectionState::Reconnecting && attempt > 1 {
            let delay = backoff_delay(
                self.session_cfg.backoff_base,
                self.session_cfg.backoff_cap,
                attempt - 1,
            );
            tracing::debug!(
                "session[{}]: reconnect attempt {} — backing off {:?}",
                self.service,
                attempt,
                delay
            );
            tokio::time::sleep(delay).await;
        }
        if prev != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }

        match self.handshake().await {
            Ok(transport) => {
                *self.transport.write().await = Some(transport);
                self.set_state(ConnectionState::Connected);
                self.attempts.store(0, Ordering::Release);
                self.start_monitor();
                tracing::info!("session[{}]: connected", self.service);
                Ok(())
            }
            Err(e) => {
                // partial transport (if any) is dropped here and closed by
                // ownership — no detached leak on the timeout path
                *self.transport.write().await = None;
                *self
                    .last_error
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                self.set_state(ConnectionState::Error);
                tracing::warn!("session[{}]: connect failed: {}", self.service, e);
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<SessionTransport, ClientError> {
        let endpoint = self
            .discovery
            .resolve(&self.service)
            .await
            .ok_or_else(|| ClientError::ServiceNotFound(self.service.clone()))?;

        let http = reqwest::Client::builder()
            .connect_timeout(self.session_cfg.handshake_timeout)
            .build()
            .map_err(|e| ClientError::Transport(format!("failed to open transport: {e}")))?;

        let url = format!("{}/initialize", endpoint.base_url);
        let body = json!({
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": { "tools": {}, "resources": {} },
        });

        let resp = tokio::time::timeout(
            self.session_cfg.handshake_timeout,
            http.post(&url).json(&body).send(),
        )
        .await
        .map_err(|_| {
            ClientError::Transport(format!(
                "handshake with '{}' timed out after {}s",
                self.service,
                self.session_cfg.handshake_timeout.as_secs()
            ))
        })?
        .map_err(|e| ClientError::Transport(format!("handshake request to '{url}' failed: {e}")))?;

        let status = resp.status();
        let session_id = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClientError::Transport(format!(
                "handshake with '{}' rejected: HTTP {} — {}",
                self.service,
                status,
                error_message_from_body(&text)
            )));
        }

        let info: Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Transport(format!("handshake response not JSON: {e}")))?;
        tracing::debug!(
            "session[{}]: handshake ok (server: {})",
            self.service,
            info.pointer("/serverInfo/name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
        );
        *self
            .server_info
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(info);

        Ok(SessionTransport {
            http,
            base_url: endpoint.base_url,
            session_id,
        })
    }

    fn start_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            // reconnect path — the existing monitor loop keeps running
            return;
        }
        let token = CancellationToken::new();
        let task = monitor::spawn(Arc::clone(self), token.clone());
        *slot = Some(MonitorHandle { task, token });
    }

    /// Tear the session down: cancel the health monitor (graceful, then
    /// forced), drop the transport, return to `Disconnected`. Idempotent.
    /// Serializes with `connect()` so a handshake finishing late cannot
    /// resurrect a session that was already closed.
    pub async fn close(&self) {
        let _flight = self.connect_lock.lock().await;
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(MonitorHandle { mut task, token }) = handle {
            token.cancel();
            if tokio::time::timeout(self.session_cfg.close_grace, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        *self.transport.write().await = None;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("session[{}]: closed", self.service);
    }

    pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.connect().await
    }

    /// List the tools the service exposes, normalized.
    pub async fn list_tools(self: &Arc<Self>) -> Result<Value, ClientError> {
        self.ensure_connected().await?;
        let transport = self.current_transport().await?;
        let value = self.get_json(&transport, "tools").await?;
        Ok(normalize_result(value))
    }

    /// Invoke a tool over the session transport.
    pub async fn call_tool(self: &Arc<Self>, tool: &str, arguments: Value) -> Result<Value, ClientError> {
        self.ensure_connected().await?;
        let transport = self.current_transport().await?;
        let url = format!("{}/tool/{}", transport.base_url, tool);
        let mut req = transport
            .http
            .post(&url)
            .timeout(self.session_cfg.call_timeout)
            .json(&json!({ "arguments": arguments }));
        if let Some(sid) = &transport.session_id {
            req = req.header("Mcp-Session-Id", sid);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("request to '{url}' failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::ToolNotFound {
                service: self.service.clone(),
                tool: tool.to_string(),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClientError::Upstream {
                status: status.as_u16(),
                message: error_message_from_body(&text),
            });
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Transport(format!("invalid JSON from '{url}': {e}")))?;
        let payload = body.get("result").cloned().unwrap_or(body);
        Ok(normalize_result(payload))
    }

    /// Read a resource as a single JSON document, normalized.
    pub async fn read_resource(self: &Arc<Self>, uri: &str) -> Result<Value, ClientError> {
        self.ensure_connected().await?;
        let transport = self.current_transport().await?;
        let path = format!("resource/{}", uri.trim_start_matches('/'));
        let url = format!("{}/{}", transport.base_url, path);
        let mut req = transport
            .http
            .get(&url)
            .timeout(self.session_cfg.call_timeout);
        if let Some(sid) = &transport.session_id {
            req = req.header("Mcp-Session-Id", sid);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("request to '{url}' failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::ResourceNotFound {
                service: self.service.clone(),
                path: uri.to_string(),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClientError::ResourceAccess {
                status: status.as_u16(),
                message: error_message_from_body(&text),
            });
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Transport(format!("invalid JSON from '{url}': {e}")))?;
        Ok(normalize_result(body))
    }

    /// Liveness probe for the health monitor: a plain `tools` fetch that
    /// never triggers a connect on its own.
    pub(crate) async fn probe(&self) -> Result<(), ClientError> {
        let transport = self.current_transport().await?;
        self.get_json(&transport, "tools").await.map(|_| ())
    }

    /// Demote to `Reconnecting` and drop the stale transport.
    pub(crate) async fn begin_reconnect(&self) {
        self.set_state(ConnectionState::Reconnecting);
        *self.transport.write().await = None;
    }

    pub(crate) fn mark_error(&self, reason: &str) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(reason.to_string());
        self.set_state(ConnectionState::Error);
    }

    async fn current_transport(&self) -> Result<SessionTransport, ClientError> {
        self.transport.read().await.clone().ok_or_else(|| {
            ClientError::Transport(format!("session '{}' has no live transport", self.service))
        })
    }

    async fn get_json(&self, transport: &SessionTransport, path: &str) -> Result<Value, ClientError> {
        let url = format!("{}/{}", transport.base_url, path);
        let mut req = transport
            .http
            .get(&url)
            .timeout(self.session_cfg.call_timeout);
        if let Some(sid) = &transport.session_id {
            req = req.header("Mcp-Session-Id", sid);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("request to '{url}' failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClientError::Upstream {
                status: status.as_u16(),
                message: error_message_from_body(&text),
            });
        }
        resp.json()
            .await
            .map_err(|e| ClientError::Transport(format!("invalid JSON from '{url}': {e}")))
    }
}

/// `min(base * 2^(attempt-1), cap)`
pub(crate) fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(cap)
}
