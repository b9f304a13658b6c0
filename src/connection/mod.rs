pub mod config;
pub mod pool;

use crate::core::{Result, Row, ShardId, TenantRange, with_timeout};
use crate::storage::{ShardBackend, ShardConnector, ShardStats};
use config::ShardDescriptor;
use std::sync::Arc;
use std::time::Duration;

pub use pool::{PoolGuard, PoolStats, ShardConnectionPool};

/// Connection handle to one shard
///
/// Every operation runs under the connection's query timeout, so a stalled
/// shard surfaces as [`crate::core::ShardError::Timeout`] instead of a hang.
#[derive(Clone)]
pub struct ShardConnection {
    /// Unique connection ID within its pool
    id: u64,
    shard_id: ShardId,
    backend: Arc<dyn ShardBackend>,
    query_timeout: Duration,
}

impl ShardConnection {
    pub(crate) fn new(
        id: u64,
        shard_id: ShardId,
        backend: Arc<dyn ShardBackend>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            id,
            shard_id,
            backend,
            query_timeout,
        }
    }

    /// Opens a dedicated connection outside any pool. Health probes and
    /// migrations use these so they never compete with request traffic.
    pub async fn open(
        connector: &dyn ShardConnector,
        descriptor: &ShardDescriptor,
        timeout: Duration,
    ) -> Result<Self> {
        let backend = with_timeout(
            &format!("connect to shard {}", descriptor.id),
            timeout,
            connector.connect(descriptor),
        )
        .await?;
        Ok(Self::new(0, descriptor.id, backend, timeout))
    }

    /// Get connection ID
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn backend(&self) -> &Arc<dyn ShardBackend> {
        &self.backend
    }

    pub async fn ping(&self) -> Result<()> {
        with_timeout("ping", self.query_timeout, self.backend.ping()).await
    }

    pub async fn stats(&self, tables: &[String]) -> Result<ShardStats> {
        with_timeout("stats", self.query_timeout, self.backend.stats(tables)).await
    }

    pub async fn count_rows(&self, table: &str, range: &TenantRange) -> Result<u64> {
        with_timeout(
            &format!("count {}", table),
            self.query_timeout,
            self.backend.count_rows(table, range),
        )
        .await
    }

    pub async fn read_batch(
        &self,
        table: &str,
        range: &TenantRange,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        with_timeout(
            &format!("read batch from {}", table),
            self.query_timeout,
            self.backend.read_batch(table, range, after_id, limit),
        )
        .await
    }

    pub async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        with_timeout(
            &format!("insert batch into {}", table),
            self.query_timeout,
            self.backend.insert_rows(table, rows),
        )
        .await
    }

    pub async fn delete_range(
        &self,
        table: &str,
        range: &TenantRange,
        first_id: i64,
        last_id: i64,
    ) -> Result<u64> {
        with_timeout(
            &format!("delete range from {}", table),
            self.query_timeout,
            self.backend.delete_range(table, range, first_id, last_id),
        )
        .await
    }

    pub async fn get_row(&self, table: &str, id: i64) -> Result<Option<Row>> {
        with_timeout(
            &format!("get from {}", table),
            self.query_timeout,
            self.backend.get_row(table, id),
        )
        .await
    }

    pub async fn upsert_row(&self, table: &str, row: &Row) -> Result<()> {
        with_timeout(
            &format!("write to {}", table),
            self.query_timeout,
            self.backend.upsert_row(table, row),
        )
        .await
    }

    pub async fn delete_row(&self, table: &str, id: i64) -> Result<bool> {
        with_timeout(
            &format!("delete from {}", table),
            self.query_timeout,
            self.backend.delete_row(table, id),
        )
        .await
    }
}

impl std::fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConnection")
            .field("id", &self.id)
            .field("shard_id", &self.shard_id)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}
