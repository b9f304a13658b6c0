use super::registry::ShardRegistry;
use super::routing::{RoutingChange, RoutingTable};
use super::store::{RoutingSnapshot, RoutingStore};
use crate::connection::config::{PoolConfig, ShardDescriptor};
use crate::connection::{PoolGuard, PoolStats, ShardConnectionPool};
use crate::core::{Result, ShardError, ShardId, TenantKey, TenantRange};
use crate::storage::ShardConnector;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use chrono::Utc;
use tracing::{debug, info};

/// Maps tenant keys to shards and owns one connection pool per shard.
///
/// Resolution is a pure function of the key, the hash bucket count and the
/// routing table, so every process with the same configuration and cutover
/// history agrees on where a tenant lives. With a [`RoutingStore`] attached,
/// every cutover and added shard is saved before it takes effect, and the
/// next process starts from it. Errors are never papered over by trying
/// another shard.
///
/// Writes should go through [`crate::migration::DualWriteCoordinator`];
/// connections handed out here do not mirror writes to a migration target.
pub struct ShardRouter {
    registry: Arc<ShardRegistry>,
    table: RwLock<RoutingTable>,
    pools: RwLock<HashMap<ShardId, Arc<ShardConnectionPool>>>,
    connector: Arc<dyn ShardConnector>,
    pool_config: PoolConfig,
    store: Option<RoutingStore>,
}

impl ShardRouter {
    pub fn new(
        registry: Arc<ShardRegistry>,
        connector: Arc<dyn ShardConnector>,
        pool_config: PoolConfig,
    ) -> Result<Self> {
        pool_config.validate()?;
        if registry.hash_buckets() == 0 {
            return Err(ShardError::Config(
                "router needs at least one shard".to_string(),
            ));
        }

        info!(
            shards = registry.len(),
            buckets = registry.hash_buckets(),
            "shard router initialized"
        );

        Ok(Self {
            registry,
            table: RwLock::new(RoutingTable::default()),
            pools: RwLock::new(HashMap::new()),
            connector,
            pool_config,
            store: None,
        })
    }

    /// Persists routing to `store` from now on, starting from `table` (the
    /// table a previous run saved, or an empty one). The current state is
    /// written immediately so the hash bucket count is pinned from the first
    /// start.
    pub fn with_store(mut self, store: RoutingStore, table: RoutingTable) -> Result<Self> {
        for shard in table.overrides.values().chain(table.redirects.values()) {
            if !self.registry.contains(*shard) {
                return Err(ShardError::Config(format!(
                    "routing state in {} points at unknown shard {}",
                    store.path().display(),
                    shard
                )));
            }
        }
        self.store = Some(store);
        self.save(&table)?;
        info!(
            epoch = table.epoch,
            overrides = table.overrides.len(),
            redirects = table.redirects.len(),
            "routing state restored"
        );
        self.table = RwLock::new(table);
        Ok(self)
    }

    fn save(&self, table: &RoutingTable) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = RoutingSnapshot {
            hash_buckets: self.registry.hash_buckets(),
            table: table.clone(),
            added_shards: self
                .registry
                .added()?
                .iter()
                .map(|descriptor| descriptor.as_ref().clone())
                .collect(),
            saved_at: Utc::now(),
        };
        store.save(&snapshot)
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// Shard id for `tenant`.
    pub fn shard_for(&self, tenant: &TenantKey) -> Result<ShardId> {
        let table = self.table.read()?;
        Ok(table.shard_for(tenant, self.registry.hash_buckets()))
    }

    /// Descriptor of the shard holding `tenant`.
    pub fn resolve_shard(&self, tenant: &TenantKey) -> Result<Arc<ShardDescriptor>> {
        let shard_id = self.shard_for(tenant)?;
        self.registry.get(shard_id)
    }

    /// Pooled connection to the shard holding `tenant`.
    pub async fn connection(&self, tenant: &TenantKey) -> Result<(ShardId, PoolGuard)> {
        let shard_id = self.shard_for(tenant)?;
        let conn = self.connection_for_shard(shard_id).await?;
        Ok((shard_id, conn))
    }

    pub async fn connection_for_shard(&self, shard_id: ShardId) -> Result<PoolGuard> {
        let pool = self.pool(shard_id)?;
        pool.get_connection().await
    }

    /// The pool for `shard_id`, created on first use.
    pub fn pool(&self, shard_id: ShardId) -> Result<Arc<ShardConnectionPool>> {
        let existing = self.pools.read()?.get(&shard_id).cloned();
        if let Some(pool) = existing {
            return Ok(pool);
        }

        let descriptor = self.registry.get(shard_id)?;
        let mut pools = self.pools.write()?;
        // Double-check after upgrading the lock.
        if let Some(pool) = pools.get(&shard_id) {
            return Ok(pool.clone());
        }

        let pool = Arc::new(ShardConnectionPool::new(
            descriptor.as_ref().clone(),
            self.pool_config.clone(),
            self.connector.clone(),
        )?);
        pools.insert(shard_id, pool.clone());
        debug!(shard_id, "created connection pool");
        Ok(pool)
    }

    /// Opens `min_connections` on every registered shard's pool.
    pub async fn warm_up(&self) -> Result<()> {
        for shard_id in self.registry.ids()? {
            self.pool(shard_id)?.warm_up().await?;
        }
        Ok(())
    }

    /// Atomically points `range` at `target`. Requests resolved after this
    /// returns go to `target`.
    pub fn repoint(
        &self,
        range: &TenantRange,
        source: ShardId,
        target: ShardId,
    ) -> Result<RoutingChange> {
        self.registry.get(target)?;
        let mut table = self.table.write()?;
        let mut next = table.clone();
        let change = next.repoint(range, source, target)?;
        self.save(&next)?;
        *table = next;
        info!(
            epoch = change.epoch,
            source,
            target,
            tenants = %change.tenants,
            "routing repointed"
        );
        Ok(change)
    }

    /// Registers a new, empty shard and saves it with the routing state.
    pub fn add_shard(&self, descriptor: ShardDescriptor) -> Result<Arc<ShardDescriptor>> {
        // Held so a concurrent repoint cannot save a snapshot in between.
        let table = self.table.write()?;
        let descriptor = self.registry.add_shard(descriptor)?;
        if let Err(err) = self.save(&table) {
            self.registry.forget(descriptor.id)?;
            return Err(err);
        }
        Ok(descriptor)
    }

    pub fn routing_table(&self) -> Result<RoutingTable> {
        Ok(self.table.read()?.clone())
    }

    pub fn is_drained(&self, shard_id: ShardId) -> bool {
        self.table
            .read()
            .map(|table| table.is_drained(shard_id))
            .unwrap_or(false)
    }

    pub fn all_shards(&self) -> Result<Vec<Arc<ShardDescriptor>>> {
        self.registry.all()
    }

    /// Connection string for a shard with the password masked.
    pub fn shard_dsn(&self, shard_id: ShardId) -> Result<String> {
        Ok(self.registry.get(shard_id)?.to_url())
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let Ok(pools) = self.pools.read() else {
            return Vec::new();
        };
        let mut stats: Vec<PoolStats> = pools.values().map(|pool| pool.stats()).collect();
        stats.sort_by_key(|s| s.shard_id);
        stats
    }

    /// Closes every pool.
    pub fn close(&self) {
        if let Ok(pools) = self.pools.read() {
            for pool in pools.values() {
                pool.close();
            }
        }
        info!("shard router closed");
    }
}
