#![allow(dead_code)]

use shardwise::config::MigrationConfig;
use shardwise::sharding::bucket_for;
use shardwise::{AppConfig, MemoryShard, Row, ShardBackend, ShardId, ShardingContext, TenantKey};
use std::sync::Arc;
use std::time::Duration;

/// In-memory context with `shards` shards whose migrations only walk `orders`.
pub async fn context(shards: u32) -> ShardingContext {
    let mut config = AppConfig::for_testing(shards);
    config.migration = MigrationConfig {
        tables: vec!["orders".to_string()],
        operation_timeout: Duration::from_secs(5),
        ..MigrationConfig::default()
    };
    config.health.probe_tables = vec!["orders".to_string()];
    ShardingContext::in_memory(config).await.unwrap()
}

pub fn memory_shard(ctx: &ShardingContext, shard_id: ShardId) -> Arc<MemoryShard> {
    ctx.memory().unwrap().shard(shard_id).unwrap()
}

/// The first `count` tenant keys of the form `restaurant-N` that hash to
/// `shard` among `buckets` shards.
pub fn tenants_on(shard: ShardId, buckets: u32, count: usize) -> Vec<TenantKey> {
    (0..)
        .map(|i| format!("restaurant-{i}"))
        .filter(|key| bucket_for(key, buckets) == shard)
        .take(count)
        .map(|key| TenantKey::parse(key).unwrap())
        .collect()
}

/// Inserts `rows` orders with ids `1..=rows`, spread round-robin over
/// `tenants`, directly into a shard.
pub async fn seed_orders(shard: &MemoryShard, tenants: &[TenantKey], rows: i64) {
    let batch: Vec<Row> = (1..=rows)
        .map(|id| {
            let tenant = tenants[(id as usize) % tenants.len()].clone();
            Row::new(id, tenant).with_field("total_cents", id * 100)
        })
        .collect();
    shard.insert_rows("orders", &batch).await.unwrap();
}
