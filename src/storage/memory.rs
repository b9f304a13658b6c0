use super::engine::{ShardBackend, ShardConnector, ShardStats};
use super::table::Table;
use crate::connection::config::ShardDescriptor;
use crate::core::{Result, Row, ShardError, ShardId, TenantRange};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::RwLock;

/// A shard held entirely in process memory.
///
/// Each table sits behind its own lock, so copying one table never blocks
/// writers of another. Fault knobs let tests make the shard slow, unreachable
/// or reject inserts, either the next few or those carrying a given row.
pub struct MemoryShard {
    shard_id: ShardId,
    tables: RwLock<HashMap<String, Arc<RwLock<Table>>>>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    failing_inserts: AtomicUsize,
    rejected_rows: Mutex<HashSet<i64>>,
}

impl MemoryShard {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            tables: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            failing_inserts: AtomicUsize::new(0),
            rejected_rows: Mutex::new(HashSet::new()),
        }
    }

    pub async fn with_tables(shard_id: ShardId, tables: &[&str]) -> Self {
        let shard = Self::new(shard_id);
        for table in tables {
            shard.create_table(table).await;
        }
        shard
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Creates the table if it does not exist yet.
    pub async fn create_table(&self, name: &str) {
        let mut tables = self.tables.write().await;
        tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Table::new(name))));
    }

    pub async fn table_names(&self) -> Vec<String> {
        let tables = self.tables.read().await;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of a table's rows in key order, bypassing fault injection.
    pub async fn dump(&self, table: &str) -> Result<Vec<Row>> {
        let handle = self.get_table(table).await?;
        let table = handle.read().await;
        Ok(table.scan_after(&TenantRange::All, None, usize::MAX))
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Delay applied to every operation, including connecting.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// The next `count` calls to `insert_rows` fail with a backend error.
    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// The next `insert_rows` call that carries row `id` fails; inserts of
    /// other rows are unaffected.
    pub fn reject_row(&self, id: i64) {
        if let Ok(mut rejected) = self.rejected_rows.lock() {
            rejected.insert(id);
        }
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.is_reachable() {
            return Err(ShardError::unavailable(self.shard_id, "connection refused"));
        }
        Ok(())
    }

    async fn get_table(&self, name: &str) -> Result<Arc<RwLock<Table>>> {
        let tables = self.tables.read().await;
        tables
            .get(name)
            .cloned()
            .ok_or_else(|| ShardError::TableNotFound(name.to_string()))
    }

    fn take_insert_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_rejected_row(&self, rows: &[Row]) -> Option<i64> {
        let mut rejected = self.rejected_rows.lock().ok()?;
        let id = rows.iter().map(|row| row.id).find(|id| rejected.contains(id))?;
        rejected.remove(&id);
        Some(id)
    }
}

#[async_trait]
impl ShardBackend for MemoryShard {
    async fn ping(&self) -> Result<()> {
        self.enter().await
    }

    async fn stats(&self, tables: &[String]) -> Result<ShardStats> {
        self.enter().await?;
        let handles: Vec<Arc<RwLock<Table>>> = {
            let all = self.tables.read().await;
            all.values().cloned().collect()
        };

        let mut stats = ShardStats::default();
        for handle in handles {
            let table = handle.read().await;
            stats.database_size_bytes += table.estimated_bytes() as u64;
            if tables.is_empty() || tables.iter().any(|t| t == table.name()) {
                stats.record_count += table.len() as u64;
            }
        }
        Ok(stats)
    }

    async fn count_rows(&self, table: &str, range: &TenantRange) -> Result<u64> {
        self.enter().await?;
        let handle = self.get_table(table).await?;
        let table = handle.read().await;
        Ok(table.count(range))
    }

    async fn read_batch(
        &self,
        table: &str,
        range: &TenantRange,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.enter().await?;
        let handle = self.get_table(table).await?;
        let table = handle.read().await;
        Ok(table.scan_after(range, after_id, limit))
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.enter().await?;
        if self.take_insert_failure() {
            return Err(ShardError::Backend(format!(
                "shard {}: insert into '{}' rejected",
                self.shard_id, table
            )));
        }
        if let Some(id) = self.take_rejected_row(rows) {
            return Err(ShardError::Backend(format!(
                "shard {}: row {} rejected by '{}'",
                self.shard_id, id, table
            )));
        }
        let handle = self.get_table(table).await?;
        // One write lock for the whole batch, so readers never see half of it.
        let mut table = handle.write().await;
        let written = rows
            .iter()
            .filter(|row| table.upsert((*row).clone()))
            .count();
        Ok(written as u64)
    }

    async fn delete_range(
        &self,
        table: &str,
        range: &TenantRange,
        first_id: i64,
        last_id: i64,
    ) -> Result<u64> {
        self.enter().await?;
        let handle = self.get_table(table).await?;
        let mut table = handle.write().await;
        Ok(table.remove_range(range, first_id, last_id))
    }

    async fn get_row(&self, table: &str, id: i64) -> Result<Option<Row>> {
        self.enter().await?;
        let handle = self.get_table(table).await?;
        let table = handle.read().await;
        Ok(table.get(id).cloned())
    }

    async fn delete_row(&self, table: &str, id: i64) -> Result<bool> {
        self.enter().await?;
        let handle = self.get_table(table).await?;
        let mut table = handle.write().await;
        Ok(table.remove(id))
    }
}

/// Hands out [`MemoryShard`] handles by shard id.
#[derive(Default)]
pub struct MemoryConnector {
    shards: StdRwLock<HashMap<ShardId, Arc<MemoryShard>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shard: Arc<MemoryShard>) -> Result<()> {
        let mut shards = self.shards.write()?;
        shards.insert(shard.shard_id(), shard);
        Ok(())
    }

    pub fn shard(&self, shard_id: ShardId) -> Option<Arc<MemoryShard>> {
        self.shards
            .read()
            .ok()
            .and_then(|shards| shards.get(&shard_id).cloned())
    }

    /// Registers one empty shard per id with the given tables.
    pub async fn provision(
        &self,
        shard_ids: impl IntoIterator<Item = ShardId>,
        tables: &[&str],
    ) -> Result<()> {
        for shard_id in shard_ids {
            let shard = MemoryShard::with_tables(shard_id, tables).await;
            self.register(Arc::new(shard))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ShardConnector for MemoryConnector {
    async fn connect(&self, descriptor: &ShardDescriptor) -> Result<Arc<dyn ShardBackend>> {
        let shard = self.shard(descriptor.id).ok_or_else(|| {
            ShardError::unavailable(
                descriptor.id,
                format!("no in-memory shard at {}", descriptor.address()),
            )
        })?;
        shard.enter().await?;
        Ok(shard as Arc<dyn ShardBackend>)
    }
}
