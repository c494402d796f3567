//! Bounded connection pool for one service endpoint.
//!
//! A counting semaphore of capacity `max_size` is the single blocking point:
//! the `(max_size + 1)`th concurrent `get_connection()` suspends until a
//! connection is released. Free transports are reused LIFO; the permit held
//! by a checked-out connection is released exactly once — either by
//! `release_connection()` or, on early-return/error paths, when the
//! connection guard is dropped.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::discovery::ServiceEndpoint;
use crate::error::ClientError;

/// An opaque transport handle, owned either by the pool's free list or by
/// exactly one caller.
#[derive(Debug)]
pub struct PooledConnection {
    id: Uuid,
    endpoint: ServiceEndpoint,
    http: reqwest::Client,
    /// Present while checked out; dropping it frees a pool slot.
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    fn open(endpoint: &ServiceEndpoint, config: &PoolConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| {
                ClientError::Transport(format!(
                    "failed to open connection to '{}': {e}",
                    endpoint.base_url
                ))
            })?;
        Ok(Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.clone(),
            http,
            permit: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn base_url(&self) -> &str {
        &self.endpoint.base_url
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Bounded set of reusable transports to a single endpoint.
#[derive(Debug)]
pub struct ConnectionPool {
    endpoint: ServiceEndpoint,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    free: Mutex<Vec<PooledConnection>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(endpoint: ServiceEndpoint, mut config: PoolConfig) -> Self {
        config.max_size = config.max_size.max(1);
        let max_size = config.max_size;
        Self {
            endpoint,
            semaphore: Arc::new(Semaphore::new(max_size)),
            free: Mutex::new(Vec::with_capacity(max_size)),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Eagerly open `min_size` connections into the free list.
    pub fn initialize(&self) -> Result<(), ClientError> {
        let min = self.config.min_size.min(self.config.max_size);
        let mut free = self.lock_free();
        while free.len() < min {
            free.push(PooledConnection::open(&self.endpoint, &self.config)?);
        }
        tracing::debug!(
            "pool[{}]: initialized ({} warm, max {})",
            self.endpoint.service,
            free.len(),
            self.config.max_size
        );
        Ok(())
    }

    /// Check out a connection, suspending while all `max_size` slots are in
    /// use. Fails with `PoolClosed` once `close_all()` has run — including
    /// for callers already suspended on the semaphore.
    pub async fn get_connection(&self) -> Result<PooledConnection, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::PoolClosed);
        }
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::PoolClosed)?;
        if self.closed.load(Ordering::Acquire) {
            // closed while we were waiting; permit drops here
            return Err(ClientError::PoolClosed);
        }

        let mut conn = match self.lock_free().pop() {
            Some(conn) => conn,
            None => PooledConnection::open(&self.endpoint, &self.config)?,
        };
        conn.permit = Some(permit);
        Ok(conn)
    }

    /// Return a connection to the pool. The slot is freed exactly here; a
    /// connection returned to a closed pool, or while the free list is
    /// already full, is discarded instead of pooled.
    pub fn release_connection(&self, mut conn: PooledConnection) {
        let permit = conn.permit.take();
        if !self.closed.load(Ordering::Acquire) {
            let mut free = self.lock_free();
            if free.len() < self.config.max_size {
                free.push(conn);
            }
        }
        drop(permit);
    }

    /// Shut the pool down: wake suspended waiters with `PoolClosed`, drop
    /// every free connection, discard late returns. Idempotent.
    pub fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.semaphore.close();
        let drained = {
            let mut free = self.lock_free();
            std::mem::take(&mut *free)
        };
        tracing::info!(
            "pool[{}]: closed ({} idle connection(s) dropped)",
            self.endpoint.service,
            drained.len()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idle (not checked out) connection count.
    pub fn idle(&self) -> usize {
        self.lock_free().len()
    }

    fn lock_free(&self) -> std::sync::MutexGuard<'_, Vec<PooledConnection>> {
        self.free.lock().unwrap_or_else(|p| p.into_inner())
    }
}
