/// Health monitor tests
///
/// Probe classification against in-memory shards with injected latency,
/// handler-reported error rates and runtime threshold changes.
/// Run with: cargo test --test health_tests
mod common;

use shardwise::{AppConfig, HealthStatus, HealthThresholds, ShardError, ShardingContext};
use std::time::{Duration, Instant};

async fn context_with_probe_timeout(shards: u32, probe_timeout: Duration) -> ShardingContext {
    let mut config = AppConfig::for_testing(shards);
    config.health.probe_timeout = probe_timeout;
    config.health.probe_tables = vec!["orders".to_string()];
    ShardingContext::in_memory(config).await.unwrap()
}

fn record_outcomes(ctx: &ShardingContext, shard_id: u32, ok: usize, failed: usize) {
    let error = ShardError::Backend("query failed".to_string());
    for _ in 0..ok {
        ctx.monitor
            .record_query(shard_id, Duration::from_millis(3), None);
    }
    for _ in 0..failed {
        ctx.monitor
            .record_query(shard_id, Duration::from_millis(3), Some(&error));
    }
}

#[tokio::test]
async fn test_slow_shard_is_degraded() {
    let ctx = context_with_probe_timeout(2, Duration::from_secs(5)).await;
    common::memory_shard(&ctx, 1).set_latency(Duration::from_millis(600));

    let health = ctx.monitor.probe_shard(1).await.unwrap();
    assert_eq!(health.status, HealthStatus::Degraded, "{}", health.message);
    assert!(health.reachable);
    assert!(health.response_time >= Duration::from_millis(600));
    assert!(health.response_time < Duration::from_millis(2_000));
    assert_eq!(health.error_rate, 0.0);
}

#[tokio::test]
async fn test_error_rate_above_ten_percent_is_unhealthy() {
    let ctx = context_with_probe_timeout(2, Duration::from_secs(5)).await;
    common::memory_shard(&ctx, 0).set_latency(Duration::from_millis(50));
    record_outcomes(&ctx, 0, 88, 12);

    let health = ctx.monitor.probe_shard(0).await.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!((health.error_rate - 0.12).abs() < 1e-9);
    assert!(health.message.contains("Error rate"));

    let metrics = ctx.monitor.metrics(0).unwrap();
    assert_eq!(metrics.total_queries, 100);
    assert_eq!(metrics.failed_queries, 12);
}

#[tokio::test]
async fn test_moderate_error_rate_is_degraded() {
    let ctx = context_with_probe_timeout(1, Duration::from_secs(1)).await;
    record_outcomes(&ctx, 0, 93, 7);

    let health = ctx.monitor.probe_shard(0).await.unwrap();
    assert_eq!(health.status, HealthStatus::Degraded);
}

#[tokio::test]
async fn test_hanging_shard_costs_one_timeout() {
    let timeout = Duration::from_millis(300);
    let ctx = context_with_probe_timeout(4, timeout).await;
    common::memory_shard(&ctx, 2).set_latency(Duration::from_secs(5));

    let started = Instant::now();
    ctx.monitor.probe_all().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= timeout, "probe returned after {elapsed:?}");
    assert!(elapsed < timeout * 3, "probes ran sequentially: {elapsed:?}");

    for health in ctx.monitor.all_health().unwrap() {
        if health.shard_id == 2 {
            assert_eq!(health.status, HealthStatus::Unhealthy);
            assert!(!health.reachable);
            assert!(health.message.contains("unreachable"));
        } else {
            assert_eq!(health.status, HealthStatus::Healthy, "shard {}", health.shard_id);
        }
    }
}

#[tokio::test]
async fn test_unreachable_shard_and_summary() {
    let ctx = context_with_probe_timeout(4, Duration::from_secs(1)).await;
    common::memory_shard(&ctx, 3).set_reachable(false);

    let before = ctx.monitor.summary().unwrap();
    assert_eq!(before.unknown, 4);
    assert!(before.system_healthy);

    ctx.monitor.probe_all().await;
    let summary = ctx.monitor.summary().unwrap();
    assert_eq!(summary.total_shards, 4);
    assert_eq!(summary.healthy, 3);
    assert_eq!(summary.unhealthy, 1);
    assert_eq!(summary.unknown, 0);
    assert!(!summary.system_healthy);
    assert_eq!(summary.status_label(), "DEGRADED");

    common::memory_shard(&ctx, 3).set_reachable(true);
    let recovered = ctx.monitor.probe_shard(3).await.unwrap();
    assert_eq!(recovered.status, HealthStatus::Healthy);
    assert!(ctx.monitor.summary().unwrap().system_healthy);
}

#[tokio::test]
async fn test_threshold_update_applies_to_next_probe() {
    let ctx = context_with_probe_timeout(1, Duration::from_secs(2)).await;
    common::memory_shard(&ctx, 0).set_latency(Duration::from_millis(120));

    assert_eq!(
        ctx.monitor.probe_shard(0).await.unwrap().status,
        HealthStatus::Healthy
    );

    let strict = HealthThresholds {
        degraded_latency: Duration::from_millis(50),
        unhealthy_latency: Duration::from_millis(100),
        ..HealthThresholds::default()
    };
    ctx.monitor.set_thresholds(strict).unwrap();
    // Stored statuses are not reclassified until the next probe.
    assert_eq!(
        ctx.monitor.shard_health(0).unwrap().status,
        HealthStatus::Healthy
    );
    assert_eq!(
        ctx.monitor.probe_shard(0).await.unwrap().status,
        HealthStatus::Unhealthy
    );

    let inverted = HealthThresholds {
        degraded_latency: Duration::from_millis(900),
        unhealthy_latency: Duration::from_millis(100),
        ..HealthThresholds::default()
    };
    assert!(matches!(
        ctx.monitor.set_thresholds(inverted),
        Err(ShardError::Config(_))
    ));
    assert_eq!(ctx.monitor.thresholds().unwrap(), strict);
}

#[tokio::test]
async fn test_probe_loop_updates_health_in_background() {
    let ctx = context_with_probe_timeout(2, Duration::from_millis(500)).await;
    ctx.monitor.start().unwrap();
    assert!(ctx.monitor.is_running());
    assert!(ctx.monitor.start().is_err());

    let mut probed = false;
    for _ in 0..50 {
        let summary = ctx.monitor.summary().unwrap();
        if summary.healthy == 2 {
            probed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(probed, "probe loop never classified the shards");

    assert!(ctx.monitor.stop().await.unwrap());
    assert!(!ctx.monitor.is_running());
    assert!(!ctx.monitor.stop().await.unwrap());
}
