//! Background health monitor for a connected session.
//!
//! One task per session, spawned on the first successful connect and kept
//! alive across reconnects. The probe interval is jittered per service so a
//! fleet of clients started together does not probe in lockstep.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::{ConnectionState, ServiceConnection};

pub(crate) fn spawn(conn: Arc<ServiceConnection>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let health = conn.health_config().clone();
        let interval = jittered_interval(conn.service(), health.interval, health.jitter_frac);
        tracing::debug!(
            "health[{}]: monitor started (interval {:?})",
            conn.service(),
            interval
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if conn.state() != ConnectionState::Connected {
                continue;
            }

            match tokio::time::timeout(health.probe_timeout, conn.probe()).await {
                Ok(Ok(())) => {
                    tracing::debug!("health[{}]: probe ok", conn.service());
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::warn!("health[{}]: liveness probe failed: {}", conn.service(), e);
                }
                Err(_) => {
                    tracing::warn!(
                        "health[{}]: liveness probe timed out after {}s",
                        conn.service(),
                        health.probe_timeout.as_secs()
                    );
                }
            }

            conn.begin_reconnect().await;
            match tokio::time::timeout(health.reconnect_timeout, conn.connect()).await {
                Ok(Ok(())) => tracing::info!("health[{}]: reconnected", conn.service()),
                // connect() already recorded the error state
                Ok(Err(e)) => {
                    tracing::error!("health[{}]: reconnect failed: {}", conn.service(), e);
                }
                Err(_) => {
                    let reason = format!(
                        "reconnect timed out after {}s",
                        health.reconnect_timeout.as_secs()
                    );
                    tracing::error!("health[{}]: {}", conn.service(), reason);
                    conn.mark_error(&reason);
                }
            }
        }

        tracing::debug!("health[{}]: monitor stopped", conn.service());
    })
}

/// Deterministic per-service jitter: the service name hashes to a factor in
/// `[1 - jitter_frac, 1 + jitter_frac]` applied to the base interval.
pub(crate) fn jittered_interval(service: &str, base: Duration, jitter_frac: f64) -> Duration {
    let mut hasher = DefaultHasher::new();
    service.hash(&mut hasher);
    let unit = (hasher.finish() % 1_000) as f64 / 999.0;
    let factor = 1.0 - jitter_frac + 2.0 * jitter_frac * unit;
    base.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(30);
        for name in ["search", "files", "weather", "a", ""] {
            let interval = jittered_interval(name, base, 0.2);
            assert!(interval >= Duration::from_secs(24), "{name}: {interval:?}");
            assert!(interval <= Duration::from_secs(36), "{name}: {interval:?}");
        }
    }

    #[test]
    fn jitter_is_deterministic_per_service() {
        let base = Duration::from_secs(30);
        assert_eq!(
            jittered_interval("search", base, 0.2),
            jittered_interval("search", base, 0.2)
        );
    }

    #[test]
    fn zero_jitter_returns_base() {
        let base = Duration::from_secs(30);
        assert_eq!(jittered_interval("search", base, 0.0), base);
    }
}
