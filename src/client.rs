//! Client facade.
//!
//! `ToolClient` owns one pool, one circuit breaker, and (lazily) one session
//! per service, keyed by logical service name. The stateless tool/resource
//! paths go through the pool and breaker; the stateful session path
//! (connect/close, session-scoped calls) goes through `ServiceConnection`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::StreamExt;
use serde_json::{Value, json};

use crate::breaker::CircuitBreaker;
use crate::config::{ClientConfig, RetryConfig};
use crate::discovery::ServiceDiscovery;
use crate::error::{ClientError, error_message_from_body};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::session::{ConnectionState, ServiceConnection};
use crate::sse::SseAccumulator;

pub struct ToolClient {
    discovery: Arc<dyn ServiceDiscovery>,
    config: ClientConfig,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    sessions: RwLock<HashMap<String, Arc<ServiceConnection>>>,
}

impl ToolClient {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>, config: ClientConfig) -> Self {
        Self {
            discovery,
            config,
            pools: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    // ── Tool invocation path ────────────────────────────────────────────────

    /// Invoke a tool with the configured retry policy.
    pub async fn call_tool(
        &self,
        service: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, ClientError> {
        self.call_tool_with(service, tool, arguments, self.config.retry.clone())
            .await
    }

    /// Invoke a tool with an explicit retry policy.
    ///
    /// Fails fast with `CircuitOpen` when the service's breaker is tripped —
    /// no connection is checked out and no request is sent. Otherwise each
    /// attempt checks a connection out of the pool, sends the request, and
    /// returns the connection before deciding whether to retry. A 404 is
    /// permanent: it aborts the retry loop immediately and does not count
    /// against the breaker.
    pub async fn call_tool_with(
        &self,
        service: &str,
        tool: &str,
        arguments: Value,
        retry: RetryConfig,
    ) -> Result<Value, ClientError> {
        let breaker = self.breaker_for(service);
        if breaker.is_open() {
            return Err(ClientError::CircuitOpen {
                service: service.to_string(),
                retry_in_secs: breaker.retry_in_secs(),
            });
        }

        let pool = self.pool_for(service).await?;
        let attempts = retry.max_retries.max(1);
        let mut last_err: Option<ClientError> = None;

        for attempt in 0..attempts {
            let conn = pool.get_connection().await?;
            let outcome = self.invoke_once(&conn, service, tool, &arguments).await;
            pool.release_connection(conn);

            match outcome {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(e @ ClientError::ToolNotFound { .. }) => return Err(e),
                Err(e) => {
                    breaker.record_failure();
                    tracing::warn!(
                        "tool_call[{}/{}]: attempt {}/{} failed: {}",
                        service,
                        tool,
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        let delay = retry.base_delay.saturating_mul(1 << attempt.min(16));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let source = last_err.unwrap_or_else(|| ClientError::Transport("no attempt made".into()));
        Err(ClientError::ToolExecution {
            attempts,
            source: Box::new(source),
        })
    }

    async fn invoke_once(
        &self,
        conn: &PooledConnection,
        service: &str,
        tool: &str,
        arguments: &Value,
    ) -> Result<Value, ClientError> {
        let url = format!("{}/tool/{}", conn.base_url(), tool);
        let resp = conn
            .http()
            .post(&url)
            .timeout(self.config.session.call_timeout)
            .json(&json!({ "arguments": arguments }))
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("request to '{url}' failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::ToolNotFound {
                service: service.to_string(),
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

    /// List the tools a service exposes, over the pooled path.
    pub async fn list_tools(&self, service: &str) -> Result<Value, ClientError> {
        let pool = self.pool_for(service).await?;
        let conn = pool.get_connection().await?;
        let url = format!("{}/tools", conn.base_url());
        let outcome = async {
            let resp = conn
                .http()
                .get(&url)
                .timeout(self.config.session.call_timeout)
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
            resp.json::<Value>()
                .await
                .map_err(|e| ClientError::Transport(format!("invalid JSON from '{url}': {e}")))
        }
        .await;
        pool.release_connection(conn);
        outcome.map(normalize_result)
    }

    // ── Resource streaming path ─────────────────────────────────────────────

    /// Fetch a resource delivered as a server-sent-event stream.
    ///
    /// The connection stays checked out for the entire lifetime of the
    /// stream and is returned to the pool exactly once, after the stream
    /// ends or errors. A stream that yields a single JSON object resolves to
    /// that object; anything else resolves to the list of decoded events.
    pub async fn get_resource(
        &self,
        service: &str,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        let breaker = self.breaker_for(service);
        if breaker.is_open() {
            return Err(ClientError::CircuitOpen {
                service: service.to_string(),
                retry_in_secs: breaker.retry_in_secs(),
            });
        }

        let pool = self.pool_for(service).await?;
        let conn = pool.get_connection().await?;
        let result = self.stream_resource(&conn, service, path, params).await;
        pool.release_connection(conn);

        match &result {
            Ok(_) => breaker.record_success(),
            // a missing resource says nothing about service health
            Err(ClientError::ResourceNotFound { .. }) => {}
            Err(_) => breaker.record_failure(),
        }
        result
    }

    async fn stream_resource(
        &self,
        conn: &PooledConnection,
        service: &str,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        let url = format!("{}/resource/{}", conn.base_url(), path.trim_start_matches('/'));
        let resp = conn
            .http()
            .get(&url)
            .query(params)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("request to '{url}' failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::ResourceNotFound {
                service: service.to_string(),
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClientError::ResourceAccess {
                status: status.as_u16(),
                message: error_message_from_body(&text),
            });
        }

        let is_sse = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        if !is_sse {
            // server answered with a plain document instead of a stream
            return resp
                .json::<Value>()
                .await
                .map_err(|e| ClientError::Transport(format!("invalid JSON from '{url}': {e}")));
        }

        let idle = self.config.session.stream_idle_timeout;
        let mut acc = SseAccumulator::new();
        let mut items = Vec::new();
        let mut stream = resp.bytes_stream();
        loop {
            // the stream has no overall deadline, but a server stalling
            // between chunks must not pin the connection forever
            let next = tokio::time::timeout(idle, stream.next()).await.map_err(|_| {
                ClientError::Transport(format!(
                    "resource stream from '{url}' stalled for {}s",
                    idle.as_secs()
                ))
            })?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| {
                ClientError::Transport(format!("resource stream from '{url}' broke: {e}"))
            })?;
            items.extend(acc.feed(&chunk));
        }
        items.extend(acc.flush());
        tracing::debug!(
            "resource[{}/{}]: stream ended ({} event(s))",
            service,
            path,
            items.len()
        );
        Ok(collect_stream(items))
    }

    // ── Session path ────────────────────────────────────────────────────────

    /// Explicitly establish a session with a service.
    pub async fn connect(&self, service: &str) -> Result<(), ClientError> {
        self.session_for(service).connect().await
    }

    /// Close a service's session if one exists. Idempotent.
    pub async fn close(&self, service: &str) {
        let session = {
            let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
            sessions.get(service).cloned()
        };
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Close every session and pool. The client can still be used afterwards
    /// for services whose pools get recreated, but in-flight waiters fail
    /// with `PoolClosed`.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = {
            let map = self.sessions.read().unwrap_or_else(|p| p.into_inner());
            map.values().cloned().collect()
        };
        for session in sessions {
            session.close().await;
        }
        let pools: Vec<_> = {
            let mut map = self.pools.write().unwrap_or_else(|p| p.into_inner());
            map.drain().map(|(_, p)| p).collect()
        };
        for pool in pools {
            pool.close_all();
        }
    }

    /// Session-scoped tool invocation (no pool, no retry loop).
    pub async fn session_call_tool(
        &self,
        service: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, ClientError> {
        self.session_for(service).call_tool(tool, arguments).await
    }

    /// Read a resource as a single JSON document over the session.
    pub async fn read_resource(&self, service: &str, uri: &str) -> Result<Value, ClientError> {
        self.session_for(service).read_resource(uri).await
    }

    pub fn connection_state(&self, service: &str) -> ConnectionState {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        sessions
            .get(service)
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn session(&self, service: &str) -> Arc<ServiceConnection> {
        self.session_for(service)
    }

    // ── Per-service component registries ────────────────────────────────────

    pub fn breaker_for(&self, service: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
            if let Some(b) = breakers.get(service) {
                return Arc::clone(b);
            }
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(breakers.entry(service.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                service,
                self.config.breaker.failure_threshold,
                self.config.breaker.recovery_time,
            ))
        }))
    }

    /// The service's connection pool, created (and warmed) on first use.
    pub async fn pool_for(&self, service: &str) -> Result<Arc<ConnectionPool>, ClientError> {
        {
            let pools = self.pools.read().unwrap_or_else(|p| p.into_inner());
            if let Some(p) = pools.get(service) {
                return Ok(Arc::clone(p));
            }
        }
        let endpoint = self
            .discovery
            .resolve(service)
            .await
            .ok_or_else(|| ClientError::ServiceNotFound(service.to_string()))?;
        let fresh = Arc::new(ConnectionPool::new(endpoint, self.config.pool.clone()));
        fresh.initialize()?;

        let mut pools = self.pools.write().unwrap_or_else(|p| p.into_inner());
        match pools.get(service) {
            // lost the race; keep the winner and drop our warm connections
            Some(existing) => {
                fresh.close_all();
                Ok(Arc::clone(existing))
            }
            None => {
                pools.insert(service.to_string(), Arc::clone(&fresh));
                Ok(fresh)
            }
        }
    }

    fn session_for(&self, service: &str) -> Arc<ServiceConnection> {
        {
            let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
            if let Some(s) = sessions.get(service) {
                return Arc::clone(s);
            }
        }
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(sessions.entry(service.to_string()).or_insert_with(|| {
            ServiceConnection::new(
                service,
                Arc::clone(&self.discovery),
                self.config.session.clone(),
                self.config.health.clone(),
            )
        }))
    }
}

/// Shape every tool/resource result into a JSON object:
/// objects pass through, `null` becomes `{}`, arrays are wrapped as
/// `{"items": [...]}` with elements normalized recursively, and bare scalars
/// are wrapped as `{"value": ...}`.
pub(crate) fn normalize_result(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        Value::Null => json!({}),
        Value::Array(items) => {
            let items: Vec<Value> = items.into_iter().map(normalize_result).collect();
            json!({ "items": items })
        }
        scalar => json!({ "value": scalar }),
    }
}

/// Collapse a finished event stream: a single object resolves to that
/// object, everything else (including an empty stream) to the event list.
fn collect_stream(mut items: Vec<Value>) -> Value {
    if items.len() == 1 && items[0].is_object() {
        items.pop().unwrap_or(Value::Null)
    } else {
        Value::Array(items)
    }
}
