/// Shard routing tests
///
/// Hash placement properties, routing overrides, router behaviour as seen
/// from outside the crate, and routing state that survives a restart.
/// Run with: cargo test --test routing_tests
mod common;

use shardwise::config::MigrationConfig;
use shardwise::sharding::{bucket_for, stable_key_hash};
use shardwise::{
    AppConfig, MemoryConnector, MigrationRequest, MigrationState, ShardDescriptor, ShardError,
    ShardingContext, TenantKey, TenantRange,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_resolution_is_deterministic() {
    for i in 0..1_000 {
        let key = format!("restaurant-{i}");
        let first = bucket_for(&key, 16);
        for _ in 0..3 {
            assert_eq!(bucket_for(&key, 16), first);
        }
        assert_eq!(stable_key_hash(&key), stable_key_hash(&key.clone()));
    }
    assert_eq!(bucket_for("restaurant-1", 4), 2);
}

#[test]
fn test_distribution_is_even() {
    let buckets = 8u32;
    let keys = 100_000;
    let mut counts = vec![0usize; buckets as usize];
    for i in 0..keys {
        counts[bucket_for(&format!("restaurant-{i}"), buckets) as usize] += 1;
    }

    let expected = keys as f64 / buckets as f64;
    for (bucket, count) in counts.iter().enumerate() {
        let deviation = (*count as f64 - expected).abs() / expected;
        assert!(
            deviation <= 0.05,
            "bucket {bucket} holds {count} keys, {:.1}% off",
            deviation * 100.0
        );
    }
}

#[test]
fn test_adding_a_bucket_moves_few_keys() {
    for (buckets, keys) in [(8u32, 100_000usize), (10, 50_000)] {
        let mut moved = 0;
        for i in 0..keys {
            let key = format!("restaurant-{i}");
            let before = bucket_for(&key, buckets);
            let after = bucket_for(&key, buckets + 1);
            if before != after {
                assert_eq!(after, buckets, "{key} moved between old buckets");
                moved += 1;
            }
        }
        let fraction = moved as f64 / keys as f64;
        let bound = 1.0 / (buckets as f64 + 1.0) + 0.01;
        assert!(
            fraction <= bound,
            "{buckets}->{}: {fraction:.4} of keys moved, bound {bound:.4}",
            buckets + 1
        );
    }
}

#[tokio::test]
async fn test_router_matches_hash_until_cutover() {
    let ctx = common::context(4).await;
    for i in 0..200 {
        let tenant = TenantKey::parse(format!("restaurant-{i}")).unwrap();
        assert_eq!(
            ctx.router.shard_for(&tenant).unwrap(),
            bucket_for(tenant.as_str(), 4)
        );
    }
}

#[tokio::test]
async fn test_adding_a_shard_does_not_move_tenants() {
    let ctx = common::context(4).await;
    let tenants: Vec<TenantKey> = (0..500)
        .map(|i| TenantKey::parse(format!("restaurant-{i}")).unwrap())
        .collect();
    let before: Vec<u32> = tenants
        .iter()
        .map(|t| ctx.router.shard_for(t).unwrap())
        .collect();

    ctx.add_shard(ShardDescriptor::new(4, "memory-4")).await.unwrap();

    let after: Vec<u32> = tenants
        .iter()
        .map(|t| ctx.router.shard_for(t).unwrap())
        .collect();
    assert_eq!(before, after);
    assert_eq!(ctx.registry.len(), 5);
    assert_eq!(ctx.registry.hash_buckets(), 4);
}

#[tokio::test]
async fn test_repointed_tenants_follow_the_override() {
    let ctx = common::context(4).await;
    let tenant = common::tenants_on(0, 4, 1).remove(0);
    let neighbour = common::tenants_on(0, 4, 2).remove(1);

    let change = ctx
        .router
        .repoint(&TenantRange::Keys([tenant.clone()].into()), 0, 3)
        .unwrap();
    assert_eq!(change.epoch, 1);
    assert_eq!(ctx.router.shard_for(&tenant).unwrap(), 3);
    assert_eq!(ctx.router.shard_for(&neighbour).unwrap(), 0);
    assert!(!ctx.router.is_drained(0));
}

#[tokio::test]
async fn test_routing_errors_are_not_rerouted() {
    let ctx = common::context(4).await;
    let tenant = common::tenants_on(1, 4, 1).remove(0);
    common::memory_shard(&ctx, 1).set_reachable(false);

    match ctx.router.connection(&tenant).await {
        Err(ShardError::ShardUnavailable { shard_id, .. }) => assert_eq!(shard_id, 1),
        Err(other) => panic!("expected ShardUnavailable, got {other:?}"),
        Ok(_) => panic!("connection to an unreachable shard succeeded"),
    }

    assert!(matches!(
        ctx.router.connection_for_shard(9).await,
        Err(ShardError::UnknownShard(9))
    ));
}

#[test]
fn test_invalid_tenant_keys_are_rejected() {
    assert!(TenantKey::parse("").is_err());
    assert!(TenantKey::parse("   ").is_err());
    assert!(TenantKey::parse("bad\nkey").is_err());
    assert!(TenantKey::parse("x".repeat(200)).is_err());
    assert_eq!(TenantKey::parse("  restaurant-1 ").unwrap().as_str(), "restaurant-1");
}

fn persistent_config(state_path: &Path) -> AppConfig {
    let mut config = AppConfig::for_testing(4);
    config.migration = MigrationConfig {
        tables: vec!["orders".to_string()],
        operation_timeout: Duration::from_secs(5),
        ..MigrationConfig::default()
    };
    config.routing.state_path = Some(state_path.to_path_buf());
    config
}

#[tokio::test]
async fn test_routing_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("routing.json");
    let connector = Arc::new(MemoryConnector::new());
    connector.provision(0..5, &["orders"]).await.unwrap();

    let on_zero = common::tenants_on(0, 4, 2);
    let (mover, neighbour) = (on_zero[0].clone(), on_zero[1].clone());
    common::seed_orders(&connector.shard(0).unwrap(), &on_zero, 400).await;

    let ctx = ShardingContext::build(persistent_config(&state_path), connector.clone()).unwrap();
    ctx.add_shard(ShardDescriptor::new(4, "memory-4")).await.unwrap();
    let id = ctx
        .migrations
        .start(MigrationRequest::new(0, 4).range(TenantRange::Keys([mover.clone()].into())))
        .unwrap()
        .migration_id;
    let done = ctx.migrations.wait(&id).await.unwrap();
    assert_eq!(done.state, MigrationState::Completed, "{}", done.message);
    ctx.shutdown().await;
    assert!(state_path.exists());

    // Same configuration: the cutover and the added shard come back.
    let restarted =
        ShardingContext::build(persistent_config(&state_path), connector.clone()).unwrap();
    assert_eq!(restarted.router.shard_for(&mover).unwrap(), 4);
    assert_eq!(restarted.router.shard_for(&neighbour).unwrap(), 0);
    assert!(restarted.registry.contains(4));
    assert_eq!(restarted.registry.hash_buckets(), 4);
    assert_eq!(restarted.router.routing_table().unwrap().epoch, 1);
    restarted.shutdown().await;

    // Listing the added shard in the configuration must not rehash tenants.
    let mut config = persistent_config(&state_path);
    config.shards.push(ShardDescriptor::new(4, "memory-4"));
    let relisted = ShardingContext::build(config, connector).unwrap();
    assert_eq!(relisted.registry.hash_buckets(), 4);
    assert_eq!(relisted.router.shard_for(&mover).unwrap(), 4);
    for tenant in common::tenants_on(0, 4, 200).iter().skip(1) {
        assert_eq!(relisted.router.shard_for(tenant).unwrap(), 0, "{tenant}");
    }
}
