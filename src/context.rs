//! Wiring of the sharding components for one process.

use crate::config::AppConfig;
use crate::connection::config::ShardDescriptor;
use crate::core::Result;
use crate::exporter::MetricsExporter;
use crate::health::HealthMonitor;
use crate::migration::{DualWriteCoordinator, MigrationEngine};
use crate::sharding::{RoutingStore, ShardRegistry, ShardRouter};
use crate::storage::{MemoryConnector, ShardConnector};
use std::sync::Arc;
use tracing::info;

/// Every long-lived component, shared by the HTTP layer and the CLI.
#[derive(Clone)]
pub struct ShardingContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ShardRegistry>,
    pub router: Arc<ShardRouter>,
    pub monitor: Arc<HealthMonitor>,
    pub dual_write: Arc<DualWriteCoordinator>,
    pub migrations: Arc<MigrationEngine>,
    pub exporter: Arc<MetricsExporter>,
    pub connector: Arc<dyn ShardConnector>,
    memory: Option<Arc<MemoryConnector>>,
}

impl ShardingContext {
    /// Wires every component. With `routing.state_path` set, routing picks
    /// up where the last process left off: same hash bucket count, same
    /// cutovers, same added shards.
    pub fn build(config: AppConfig, connector: Arc<dyn ShardConnector>) -> Result<Self> {
        config.validate()?;
        let store = config.routing.state_path.clone().map(RoutingStore::new);
        let snapshot = match &store {
            Some(store) => store.load()?,
            None => None,
        };
        let registry = Arc::new(match &snapshot {
            Some(snapshot) => ShardRegistry::restore(config.shards.clone(), snapshot)?,
            None => ShardRegistry::new(config.shards.clone())?,
        });
        let mut router =
            ShardRouter::new(registry.clone(), connector.clone(), config.pool.clone())?;
        if let Some(store) = store {
            let table = snapshot.map(|snapshot| snapshot.table).unwrap_or_default();
            router = router.with_store(store, table)?;
        }
        let router = Arc::new(router);
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            connector.clone(),
            config.health.clone(),
        )?);
        let dual_write = Arc::new(DualWriteCoordinator::new(
            router.clone(),
            Some(monitor.clone()),
        ));
        let migrations = Arc::new(MigrationEngine::new(
            router.clone(),
            connector.clone(),
            dual_write.clone(),
            config.migration.clone(),
        )?);
        let exporter = Arc::new(MetricsExporter::new(
            monitor.clone(),
            router.clone(),
            config.alerts.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            registry,
            router,
            monitor,
            dual_write,
            migrations,
            exporter,
            connector,
            memory: None,
        })
    }

    /// Context over in-memory shards, one per registered shard, each holding
    /// the migration tables.
    pub async fn in_memory(config: AppConfig) -> Result<Self> {
        let memory = Arc::new(MemoryConnector::new());
        let mut ctx = Self::build(config, memory.clone())?;
        let tables: Vec<&str> = ctx.config.migration.tables.iter().map(String::as_str).collect();
        memory.provision(ctx.registry.ids()?, &tables).await?;
        ctx.memory = Some(memory);
        Ok(ctx)
    }

    /// The in-memory shards, when the context was built by
    /// [`ShardingContext::in_memory`].
    pub fn memory(&self) -> Option<&Arc<MemoryConnector>> {
        self.memory.as_ref()
    }

    /// Registers a new, empty shard and starts monitoring it. It receives
    /// tenants only through migration.
    pub async fn add_shard(&self, descriptor: ShardDescriptor) -> Result<Arc<ShardDescriptor>> {
        if let Some(memory) = &self.memory {
            if !self.registry.contains(descriptor.id) {
                let tables: Vec<&str> =
                    self.config.migration.tables.iter().map(String::as_str).collect();
                memory.provision([descriptor.id], &tables).await?;
            }
        }
        let descriptor = self.router.add_shard(descriptor)?;
        self.monitor.track_shard(descriptor.id)?;
        Ok(descriptor)
    }

    pub async fn shutdown(&self) {
        if let Err(err) = self.monitor.stop().await {
            tracing::warn!(error = %err, "failed to stop health monitor");
        }
        self.router.close();
        info!("sharding context shut down");
    }
}
