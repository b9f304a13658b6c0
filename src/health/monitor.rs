use super::metrics::{MetricsSnapshot, ShardMetrics};
use super::thresholds::{HealthStatus, HealthThresholds};
use crate::config::{HealthConfig, millis};
use crate::connection::ShardConnection;
use crate::connection::config::ShardDescriptor;
use crate::core::{Result, ShardError, ShardId};
use crate::sharding::ShardRegistry;
use crate::storage::{ShardConnector, ShardStats};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Latest classification of one shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardHealth {
    pub shard_id: ShardId,
    pub status: HealthStatus,
    #[serde(rename = "response_time_ms", with = "millis")]
    pub response_time: Duration,
    pub error_rate: f64,
    pub queries_per_second: f64,
    pub reachable: bool,
    pub database_size_bytes: u64,
    pub record_count: u64,
    pub last_checked: Option<DateTime<Utc>>,
    pub message: String,
}

impl ShardHealth {
    fn unknown(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            status: HealthStatus::Unknown,
            response_time: Duration::ZERO,
            error_rate: 0.0,
            queries_per_second: 0.0,
            reachable: false,
            database_size_bytes: 0,
            record_count: 0,
            last_checked: None,
            message: "Not checked yet".to_string(),
        }
    }
}

/// Counts per status across all shards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total_shards: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    /// Mean probe latency over reachable, already-probed shards.
    pub average_latency_ms: f64,
    /// No shard is unhealthy.
    pub system_healthy: bool,
    pub checked_at: DateTime<Utc>,
}

impl HealthSummary {
    /// `UP` when every shard is healthy or not yet probed, `DEGRADED` otherwise.
    pub fn status_label(&self) -> &'static str {
        if self.unhealthy == 0 && self.degraded == 0 {
            "UP"
        } else {
            "DEGRADED"
        }
    }
}

/// Per-shard state. Probe results and query counters have separate locks so
/// the probe loop and request handlers never contend.
struct ShardSlot {
    health: RwLock<ShardHealth>,
    metrics: Mutex<ShardMetrics>,
}

struct ProbeTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct ProbeOutcome {
    reachable: bool,
    latency: Duration,
    stats: Option<ShardStats>,
    failure: Option<String>,
}

/// Periodically probes every registered shard and folds the results, along
/// with handler-reported query outcomes, into a per-shard health status.
pub struct HealthMonitor {
    registry: Arc<ShardRegistry>,
    connector: Arc<dyn ShardConnector>,
    config: HealthConfig,
    thresholds: RwLock<HealthThresholds>,
    slots: RwLock<HashMap<ShardId, Arc<ShardSlot>>>,
    task: Mutex<Option<ProbeTask>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ShardRegistry>,
        connector: Arc<dyn ShardConnector>,
        config: HealthConfig,
    ) -> Result<Self> {
        config.validate()?;
        let monitor = Self {
            registry,
            connector,
            thresholds: RwLock::new(config.thresholds),
            config,
            slots: RwLock::new(HashMap::new()),
            task: Mutex::new(None),
        };
        for shard_id in monitor.registry.ids()? {
            monitor.track_shard(shard_id)?;
        }
        Ok(monitor)
    }

    /// Starts tracking a shard, e.g. after it was added to the registry.
    pub fn track_shard(&self, shard_id: ShardId) -> Result<()> {
        self.slot(shard_id).map(|_| ())
    }

    fn slot(&self, shard_id: ShardId) -> Result<Arc<ShardSlot>> {
        let existing = self.slots.read()?.get(&shard_id).cloned();
        if let Some(slot) = existing {
            return Ok(slot);
        }
        if !self.registry.contains(shard_id) {
            return Err(ShardError::UnknownShard(shard_id));
        }

        let mut slots = self.slots.write()?;
        let slot = slots
            .entry(shard_id)
            .or_insert_with(|| {
                Arc::new(ShardSlot {
                    health: RwLock::new(ShardHealth::unknown(shard_id)),
                    metrics: Mutex::new(ShardMetrics::new(self.config.error_window)),
                })
            })
            .clone();
        Ok(slot)
    }

    /// Records the outcome of one application query against a shard.
    pub fn record_query(&self, shard_id: ShardId, latency: Duration, error: Option<&ShardError>) {
        let slot = match self.slot(shard_id) {
            Ok(slot) => slot,
            Err(err) => {
                debug!(shard_id, error = %err, "dropping query outcome for untracked shard");
                return;
            }
        };
        match slot.metrics.lock() {
            Ok(mut metrics) => metrics.record(latency, error.is_some()),
            Err(_) => warn!(shard_id, "metrics lock poisoned, query outcome dropped"),
        };
    }

    /// Runs `query`, timing it and recording its outcome for `shard_id`.
    pub async fn observe<T, F>(&self, shard_id: ShardId, query: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = query.await;
        self.record_query(shard_id, started.elapsed(), result.as_ref().err());
        result
    }

    /// Probes every registered shard concurrently, each under its own
    /// timeout, and updates their health records.
    pub async fn probe_all(&self) {
        let shards = match self.registry.all() {
            Ok(shards) => shards,
            Err(err) => {
                warn!(error = %err, "cannot list shards for probing");
                return;
            }
        };

        let probes = shards.iter().map(|descriptor| async move {
            let outcome = self.probe(descriptor).await;
            (descriptor.id, outcome)
        });

        for (shard_id, outcome) in join_all(probes).await {
            if let Err(err) = self.apply_probe(shard_id, outcome) {
                warn!(shard_id, error = %err, "failed to record probe result");
            }
        }
    }

    /// Probes a single shard now.
    pub async fn probe_shard(&self, shard_id: ShardId) -> Result<ShardHealth> {
        let descriptor = self.registry.get(shard_id)?;
        let outcome = self.probe(&descriptor).await;
        self.apply_probe(shard_id, outcome)?;
        self.shard_health(shard_id)
    }

    async fn probe(&self, descriptor: &ShardDescriptor) -> ProbeOutcome {
        let timeout = self.config.probe_timeout;
        let tables = &self.config.probe_tables;
        let connector = self.connector.as_ref();

        let attempt = async {
            let conn = ShardConnection::open(connector, descriptor, timeout).await?;
            let started = Instant::now();
            conn.ping().await?;
            let latency = started.elapsed();
            let stats = conn.stats(tables).await;
            Ok::<_, ShardError>((latency, stats))
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok((latency, Ok(stats)))) => ProbeOutcome {
                reachable: true,
                latency,
                stats: Some(stats),
                failure: None,
            },
            Ok(Ok((latency, Err(err)))) => ProbeOutcome {
                reachable: true,
                latency,
                stats: None,
                failure: Some(format!("size query failed: {}", err)),
            },
            Ok(Err(err)) => ProbeOutcome {
                reachable: false,
                latency: Duration::ZERO,
                stats: None,
                failure: Some(err.to_string()),
            },
            Err(_) => ProbeOutcome {
                reachable: false,
                latency: timeout,
                stats: None,
                failure: Some(format!("probe timed out after {:?}", timeout)),
            },
        }
    }

    fn apply_probe(&self, shard_id: ShardId, outcome: ProbeOutcome) -> Result<()> {
        let slot = self.slot(shard_id)?;
        let (error_rate, qps) = slot.metrics.lock()?.rolling_rates();
        let thresholds = *self.thresholds.read()?;
        let (status, mut message) =
            thresholds.classify(outcome.reachable, outcome.latency, error_rate);
        if let Some(failure) = &outcome.failure {
            message = format!("{}: {}", message, failure);
        }

        let mut health = slot.health.write()?;
        let previous = health.status;
        health.status = status;
        health.response_time = outcome.latency;
        health.error_rate = error_rate;
        health.queries_per_second = qps;
        health.reachable = outcome.reachable;
        if let Some(stats) = outcome.stats {
            health.database_size_bytes = stats.database_size_bytes;
            health.record_count = stats.record_count;
        }
        health.last_checked = Some(Utc::now());
        health.message = message;

        if previous != status {
            if status == HealthStatus::Unhealthy {
                warn!(
                    shard_id,
                    %previous,
                    %status,
                    reason = %health.message,
                    "shard health changed"
                );
            } else {
                info!(
                    shard_id,
                    %previous,
                    %status,
                    reason = %health.message,
                    "shard health changed"
                );
            }
        }
        Ok(())
    }

    pub fn shard_health(&self, shard_id: ShardId) -> Result<ShardHealth> {
        let slot = self.slot(shard_id)?;
        let health = slot.health.read()?.clone();
        Ok(health)
    }

    /// Health of every tracked shard, ordered by id.
    pub fn all_health(&self) -> Result<Vec<ShardHealth>> {
        let slots: Vec<Arc<ShardSlot>> = self.slots.read()?.values().cloned().collect();
        let mut all = slots
            .iter()
            .map(|slot| slot.health.read().map(|h| h.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        all.sort_by_key(|h| h.shard_id);
        Ok(all)
    }

    pub fn summary(&self) -> Result<HealthSummary> {
        let all = self.all_health()?;
        let count = |status: HealthStatus| all.iter().filter(|h| h.status == status).count();

        let probed: Vec<&ShardHealth> = all
            .iter()
            .filter(|h| h.reachable && h.last_checked.is_some())
            .collect();
        let average_latency_ms = if probed.is_empty() {
            0.0
        } else {
            probed
                .iter()
                .map(|h| h.response_time.as_secs_f64() * 1000.0)
                .sum::<f64>()
                / probed.len() as f64
        };

        let unhealthy = count(HealthStatus::Unhealthy);
        Ok(HealthSummary {
            total_shards: all.len(),
            healthy: count(HealthStatus::Healthy),
            degraded: count(HealthStatus::Degraded),
            unhealthy,
            unknown: count(HealthStatus::Unknown),
            average_latency_ms,
            system_healthy: unhealthy == 0,
            checked_at: Utc::now(),
        })
    }

    pub fn metrics(&self, shard_id: ShardId) -> Result<MetricsSnapshot> {
        let slot = self.slot(shard_id)?;
        let snapshot = slot.metrics.lock()?.snapshot(shard_id);
        Ok(snapshot)
    }

    /// Zeroes a shard's query counters; its health status is left alone.
    pub fn reset_metrics(&self, shard_id: ShardId) -> Result<()> {
        let slot = self.slot(shard_id)?;
        slot.metrics.lock()?.reset();
        info!(shard_id, "shard metrics reset");
        Ok(())
    }

    pub fn thresholds(&self) -> Result<HealthThresholds> {
        Ok(*self.thresholds.read()?)
    }

    /// Replaces the thresholds. Takes effect from the next probe cycle;
    /// current statuses are not reclassified.
    pub fn set_thresholds(&self, thresholds: HealthThresholds) -> Result<()> {
        thresholds.validate()?;
        *self.thresholds.write()? = thresholds;
        info!(
            degraded_ms = thresholds.degraded_latency.as_millis() as u64,
            unhealthy_ms = thresholds.unhealthy_latency.as_millis() as u64,
            degraded_error_rate = thresholds.degraded_error_rate,
            unhealthy_error_rate = thresholds.unhealthy_error_rate,
            "health thresholds updated"
        );
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        self.config.interval
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|t| !t.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Starts the background probe loop. The first cycle runs immediately.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut task = self.task.lock()?;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Err(ShardError::InvalidState(
                "health monitor is already running".to_string(),
            ));
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let monitor = Arc::clone(self);
        let interval = self.config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = monitor.probe_all() => {}
                }
            }
            debug!("health probe loop exited");
        });

        *task = Some(ProbeTask { token, handle });
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");
        Ok(())
    }

    /// Stops the probe loop and waits for it to exit. Returns false if it was
    /// not running.
    pub async fn stop(&self) -> Result<bool> {
        let task = self.task.lock()?.take();
        let Some(task) = task else {
            return Ok(false);
        };
        task.token.cancel();
        if let Err(err) = task.handle.await {
            warn!(error = %err, "health probe loop ended abnormally");
        }
        info!("health monitor stopped");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryConnector;

    async fn monitor(shards: u32) -> (Arc<MemoryConnector>, Arc<HealthMonitor>) {
        let connector = Arc::new(MemoryConnector::new());
        connector.provision(0..shards, &["orders"]).await.unwrap();
        let registry = Arc::new(
            ShardRegistry::new(
                (0..shards)
                    .map(|id| ShardDescriptor::new(id, &format!("shard-{id}")))
                    .collect(),
            )
            .unwrap(),
        );
        let config = HealthConfig {
            probe_timeout: Duration::from_millis(300),
            interval: Duration::from_millis(50),
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::new(registry, connector.clone(), config).unwrap();
        (connector, Arc::new(monitor))
    }

    #[tokio::test]
    async fn shards_start_unknown() {
        let (_, monitor) = monitor(2).await;
        let summary = monitor.summary().unwrap();
        assert_eq!(summary.unknown, 2);
        assert!(summary.system_healthy);
        assert_eq!(summary.status_label(), "UP");
    }

    #[tokio::test]
    async fn probe_classifies_reachable_and_unreachable_shards() {
        let (connector, monitor) = monitor(2).await;
        connector.shard(1).unwrap().set_reachable(false);

        monitor.probe_all().await;

        assert_eq!(monitor.shard_health(0).unwrap().status, HealthStatus::Healthy);
        let down = monitor.shard_health(1).unwrap();
        assert_eq!(down.status, HealthStatus::Unhealthy);
        assert!(!down.reachable);
        assert!(down.message.starts_with("Shard is unreachable"));

        let summary = monitor.summary().unwrap();
        assert_eq!((summary.healthy, summary.unhealthy), (1, 1));
        assert!(!summary.system_healthy);
    }

    #[tokio::test]
    async fn error_rate_feeds_classification() {
        let (_, monitor) = monitor(1).await;
        let failure = ShardError::Backend("boom".into());
        for i in 0..100 {
            let error = (i < 12).then_some(&failure);
            monitor.record_query(0, Duration::from_millis(2), error);
        }

        let health = monitor.probe_shard(0).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!((health.error_rate - 0.12).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reset_metrics_leaves_status() {
        let (_, monitor) = monitor(1).await;
        monitor.probe_all().await;
        monitor.record_query(0, Duration::from_millis(3), None);

        monitor.reset_metrics(0).unwrap();
        assert_eq!(monitor.metrics(0).unwrap().total_queries, 0);
        assert_eq!(monitor.shard_health(0).unwrap().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn unknown_shard_is_an_error() {
        let (_, monitor) = monitor(1).await;
        assert!(matches!(monitor.shard_health(5), Err(ShardError::UnknownShard(5))));
        monitor.record_query(5, Duration::from_millis(1), None);
    }

    #[tokio::test]
    async fn start_and_stop_probe_loop() {
        let (_, monitor) = monitor(1).await;
        monitor.start().unwrap();
        assert!(monitor.is_running());
        assert!(monitor.start().is_err());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(monitor.shard_health(0).unwrap().status, HealthStatus::Healthy);

        assert!(monitor.stop().await.unwrap());
        assert!(!monitor.is_running());
        assert!(!monitor.stop().await.unwrap());
    }

    #[tokio::test]
    async fn invalid_thresholds_are_rejected() {
        let (_, monitor) = monitor(1).await;
        let mut thresholds = monitor.thresholds().unwrap();
        thresholds.degraded_error_rate = 0.5;
        thresholds.unhealthy_error_rate = 0.1;
        assert!(monitor.set_thresholds(thresholds).is_err());
        assert_eq!(monitor.thresholds().unwrap(), HealthThresholds::default());
    }
}
