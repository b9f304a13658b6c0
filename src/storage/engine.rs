use crate::connection::config::ShardDescriptor;
use crate::core::{Result, Row, ShardError, TenantRange};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Size information a probe collects from a shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    pub database_size_bytes: u64,
    pub record_count: u64,
}

/// Storage backend trait - the operations the router, health probes and
/// migrations need from one physical shard.
///
/// Bulk inserts are conflict-aware: a row whose id already exists is replaced
/// only when the incoming `updated_at` is newer, so copies and mirrored writes
/// can race without losing the most recent version.
#[async_trait]
pub trait ShardBackend: Send + Sync {
    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;

    /// Database size and the number of rows across `tables`.
    async fn stats(&self, tables: &[String]) -> Result<ShardStats>;

    async fn count_rows(&self, table: &str, range: &TenantRange) -> Result<u64>;

    /// Up to `limit` rows with `id > after_id`, ascending by id.
    async fn read_batch(
        &self,
        table: &str,
        range: &TenantRange,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Inserts rows, keeping the newer version on id conflicts. Returns the
    /// number of rows written.
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64>;

    /// Deletes rows of `range` with `first_id <= id <= last_id`.
    async fn delete_range(
        &self,
        table: &str,
        range: &TenantRange,
        first_id: i64,
        last_id: i64,
    ) -> Result<u64>;

    async fn get_row(&self, table: &str, id: i64) -> Result<Option<Row>>;

    /// Application write: insert or replace one row. A row the shard
    /// already holds at the same or a newer `updated_at` is left alone and
    /// the write fails with [`ShardError::StaleWrite`].
    async fn upsert_row(&self, table: &str, row: &Row) -> Result<()> {
        let written = self
            .insert_rows(table, std::slice::from_ref(row))
            .await?;
        if written == 0 {
            return Err(ShardError::StaleWrite {
                table: table.to_string(),
                id: row.id,
            });
        }
        Ok(())
    }

    async fn delete_row(&self, table: &str, id: i64) -> Result<bool>;
}

/// Opens backend handles for a shard descriptor. Pools, probes and migrations
/// each go through a connector so they never share a handle.
#[async_trait]
pub trait ShardConnector: Send + Sync {
    async fn connect(&self, descriptor: &ShardDescriptor) -> Result<Arc<dyn ShardBackend>>;
}
