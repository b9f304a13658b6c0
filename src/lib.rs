// ============================================================================
// shardwise
// ============================================================================
//
// Tenant sharding for multi-tenant relational data. A tenant key picks its
// shard through jump consistent hashing; a health monitor classifies every
// shard; a migration engine moves tenants between shards online, keeping the
// target current with dual-writes until routing cuts over.

pub mod config;
pub mod connection;
pub mod context;
pub mod core;
pub mod exporter;
pub mod health;
pub mod migration;
pub mod sharding;
pub mod storage;
pub mod web;

pub use config::AppConfig;
pub use connection::config::{PoolConfig, ShardDescriptor};
pub use connection::{PoolGuard, PoolStats, ShardConnection, ShardConnectionPool};
pub use context::ShardingContext;
pub use core::{Result, Row, ShardError, ShardId, TenantKey, TenantRange, Value};
pub use exporter::{Alert, MetricsExporter, Severity};
pub use health::{HealthMonitor, HealthStatus, HealthSummary, HealthThresholds, ShardHealth};
pub use migration::{
    DualWriteCoordinator, MigrationEngine, MigrationRequest, MigrationState, MigrationStatus,
};
pub use sharding::{
    ShardBinding, ShardRegistry, ShardRouter, TenantIdentity, tenant_routes, validate_access,
};
pub use storage::{MemoryConnector, MemoryShard, ShardBackend, ShardConnector};
