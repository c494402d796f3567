//! Client configuration.
//!
//! Plain structs with sensible defaults; `ClientConfig::from_env()` applies
//! `TOOLGATE_*` environment overrides (a `.env` file is honoured via
//! dotenvy, same as the rest of the stack).

use std::time::Duration;

/// Circuit breaker tuning, one breaker per service.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit trips OPEN.
    pub failure_threshold: u32,
    /// How long the circuit stays OPEN before a half-open probe is allowed.
    pub recovery_time: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time: Duration::from_secs(30),
        }
    }
}

/// Per-endpoint connection pool bounds.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on concurrently checked-out connections.
    pub max_size: usize,
    /// Connections opened eagerly on `initialize()`.
    pub min_size: usize,
    /// TCP connect timeout for each pooled transport.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_size: 1,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Retry policy for the tool invocation path.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Health monitor cadence and limits.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Base interval between liveness probes.
    pub interval: Duration,
    /// Jitter fraction applied to the interval (±). Derived deterministically
    /// from the service name so concurrent monitors don't synchronize.
    pub jitter_frac: f64,
    pub probe_timeout: Duration,
    pub reconnect_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            jitter_frac: 0.2,
            probe_timeout: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(60),
        }
    }
}

/// Session (connection state machine) timeouts and backoff.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on the post-open `initialize` exchange.
    pub handshake_timeout: Duration,
    /// Per-call timeout for session operations (list_tools etc.).
    pub call_timeout: Duration,
    /// Longest gap tolerated between resource-stream chunks before the
    /// stream is abandoned with a transport error.
    pub stream_idle_timeout: Duration,
    /// Reconnect backoff: `min(base * 2^(attempt-1), cap)`.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Grace period for the health monitor to exit during `close()` before
    /// it is force-cancelled.
    pub close_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
            stream_idle_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(30),
            close_grace: Duration::from_secs(2),
        }
    }
}

/// Aggregate configuration for a [`crate::ToolClient`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub breaker: BreakerConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub session: SessionConfig,
}

impl ClientConfig {
    /// Defaults with `TOOLGATE_*` environment overrides applied.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();

        if let Some(n) = env_u64("TOOLGATE_BREAKER_THRESHOLD") {
            cfg.breaker.failure_threshold = n as u32;
        }
        if let Some(n) = env_u64("TOOLGATE_BREAKER_RECOVERY_SECS") {
            cfg.breaker.recovery_time = Duration::from_secs(n);
        }
        if let Some(n) = env_u64("TOOLGATE_POOL_MAX_SIZE") {
            cfg.pool.max_size = (n as usize).max(1);
        }
        if let Some(n) = env_u64("TOOLGATE_POOL_MIN_SIZE") {
            cfg.pool.min_size = n as usize;
        }
        if let Some(n) = env_u64("TOOLGATE_MAX_RETRIES") {
            cfg.retry.max_retries = n as u32;
        }
        if let Some(n) = env_u64("TOOLGATE_RETRY_BASE_DELAY_MS") {
            cfg.retry.base_delay = Duration::from_millis(n);
        }
        if let Some(n) = env_u64("TOOLGATE_HEALTH_INTERVAL_SECS") {
            cfg.health.interval = Duration::from_secs(n);
        }
        if let Some(n) = env_u64("TOOLGATE_CALL_TIMEOUT_SECS") {
            cfg.session.call_timeout = Duration::from_secs(n.max(1));
        }
        if let Some(n) = env_u64("TOOLGATE_HANDSHAKE_TIMEOUT_SECS") {
            cfg.session.handshake_timeout = Duration::from_secs(n.max(1));
        }
        if let Some(n) = env_u64("TOOLGATE_STREAM_IDLE_TIMEOUT_SECS") {
            cfg.session.stream_idle_timeout = Duration::from_secs(n.max(1));
        }

        // min_size above max_size would deadlock nobody but makes no sense.
        cfg.pool.min_size = cfg.pool.min_size.min(cfg.pool.max_size);
        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
