use super::ShardConnection;
use super::config::{PoolConfig, ShardDescriptor};
use crate::core::{Result, ShardError, ShardId, with_timeout};
use crate::storage::ShardConnector;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Connection pool for a single shard
///
/// Bounded by `max_connections`; connections are opened lazily through the
/// shard's connector and recycled until they expire or go idle too long.
pub struct ShardConnectionPool {
    descriptor: ShardDescriptor,
    config: PoolConfig,
    connector: Arc<dyn ShardConnector>,
    /// Available connections
    available: Arc<Mutex<VecDeque<PooledConnection>>>,
    /// Total number of connections created and not yet discarded
    total_connections: Arc<AtomicUsize>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// A connection from the pool
struct PooledConnection {
    connection: ShardConnection,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: ShardConnection) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        if let Some(lifetime) = max_lifetime {
            self.created_at.elapsed() > lifetime
        } else {
            false
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }

    fn refresh_last_used(&mut self) {
        self.last_used = Instant::now();
    }
}

impl ShardConnectionPool {
    pub fn new(
        descriptor: ShardDescriptor,
        config: PoolConfig,
        connector: Arc<dyn ShardConnector>,
    ) -> Result<Self> {
        config.validate()?;
        descriptor.validate()?;

        Ok(Self {
            descriptor,
            config,
            connector,
            available: Arc::new(Mutex::new(VecDeque::new())),
            total_connections: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.descriptor.id
    }

    pub fn descriptor(&self) -> &ShardDescriptor {
        &self.descriptor
    }

    /// Get a connection from the pool
    ///
    /// Waits up to `connect_timeout` for a free slot. An exhausted pool or an
    /// unreachable shard both surface as [`ShardError::ShardUnavailable`].
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ShardError::unavailable(self.shard_id(), "connection pool closed"));
            }

            // Try to get an available connection
            if let Some(mut pooled) = self.try_get_available()? {
                pooled.refresh_last_used();
                return Ok(self.guard(pooled));
            }

            // Try to create a new connection if under limit
            if self.reserve_slot() {
                return match self.open_connection().await {
                    Ok(connection) => Ok(self.guard(PooledConnection::new(connection))),
                    Err(err) => {
                        self.total_connections.fetch_sub(1, Ordering::SeqCst);
                        Err(match err {
                            ShardError::ShardUnavailable { .. } => err,
                            other => ShardError::unavailable(self.shard_id(), other.to_string()),
                        })
                    }
                };
            }

            // Check timeout
            if start.elapsed() > self.config.connect_timeout {
                return Err(ShardError::unavailable(
                    self.shard_id(),
                    format!(
                        "connection pool exhausted ({} connections in use)",
                        self.config.max_connections
                    ),
                ));
            }

            // Wait a bit before retrying
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Opens connections until `min_connections` are idle in the pool.
    pub async fn warm_up(&self) -> Result<()> {
        while self.total_connections.load(Ordering::SeqCst) < self.config.min_connections {
            if !self.reserve_slot() {
                break;
            }
            match self.open_connection().await {
                Ok(connection) => {
                    let mut available = self.available.lock()?;
                    available.push_back(PooledConnection::new(connection));
                }
                Err(err) => {
                    self.total_connections.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Try to get an available connection from the pool
    fn try_get_available(&self) -> Result<Option<PooledConnection>> {
        let mut available = self.available.lock()?;

        let mut kept = VecDeque::with_capacity(available.len());
        let mut removed = 0usize;
        while let Some(pooled) = available.pop_front() {
            if pooled.is_expired(self.config.max_lifetime)
                || pooled.is_idle_too_long(self.config.idle_timeout)
            {
                removed += 1;
            } else {
                kept.push_back(pooled);
            }
        }
        *available = kept;

        if removed > 0 {
            self.total_connections.fetch_sub(removed, Ordering::SeqCst);
            debug!(shard_id = self.shard_id(), removed, "evicted stale pooled connections");
        }

        Ok(available.pop_front())
    }

    fn reserve_slot(&self) -> bool {
        let max = self.config.max_connections;
        self.total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < max).then_some(total + 1)
            })
            .is_ok()
    }

    async fn open_connection(&self) -> Result<ShardConnection> {
        let backend = with_timeout(
            &format!("connect to shard {}", self.shard_id()),
            self.config.connect_timeout,
            self.connector.connect(&self.descriptor),
        )
        .await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(shard_id = self.shard_id(), connection_id = id, "opened pooled connection");
        Ok(ShardConnection::new(
            id,
            self.shard_id(),
            backend,
            self.config.query_timeout,
        ))
    }

    fn guard(&self, pooled: PooledConnection) -> PoolGuard {
        PoolGuard {
            pooled: Some(pooled),
            pool: self.available.clone(),
            total_connections: self.total_connections.clone(),
            broken: false,
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let available = self.available.lock().map(|a| a.len()).unwrap_or(0);
        let total = self.total_connections.load(Ordering::SeqCst);

        PoolStats {
            shard_id: self.shard_id(),
            total_connections: total,
            available_connections: available,
            active_connections: total.saturating_sub(available),
            max_connections: self.config.max_connections,
        }
    }

    /// Drops idle connections and refuses new checkouts.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut available) = self.available.lock() {
            let drained = available.len();
            available.clear();
            self.total_connections.fetch_sub(drained, Ordering::SeqCst);
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub shard_id: ShardId,
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Shard {} pool: {}/{} active, {} available, max {}",
            self.shard_id,
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// RAII guard for pooled connections
///
/// Returns the connection to the pool when dropped, unless it was marked
/// broken.
pub struct PoolGuard {
    pooled: Option<PooledConnection>,
    pool: Arc<Mutex<VecDeque<PooledConnection>>>,
    total_connections: Arc<AtomicUsize>,
    broken: bool,
}

impl PoolGuard {
    /// Get a reference to the connection
    pub fn connection(&self) -> Option<&ShardConnection> {
        self.pooled.as_ref().map(|p| &p.connection)
    }

    /// Discard the connection instead of recycling it, e.g. after the shard
    /// dropped it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PoolGuard {
    type Target = ShardConnection;

    fn deref(&self) -> &ShardConnection {
        match &self.pooled {
            Some(pooled) => &pooled.connection,
            // `pooled` is only taken in Drop.
            None => unreachable!("pool guard used after drop"),
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let Some(mut pooled) = self.pooled.take() else {
            return;
        };

        if self.broken {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        pooled.refresh_last_used();
        match self.pool.lock() {
            Ok(mut pool) => pool.push_back(pooled),
            Err(_) => {
                warn!("pool lock poisoned, dropping connection");
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
