//! Read-only export of shard health: Prometheus text, a JSON snapshot and
//! alert evaluation.

use crate::config::AlertConfig;
use crate::connection::PoolStats;
use crate::core::{Result, ShardId};
use crate::health::{HealthMonitor, HealthStatus, HealthSummary, MetricsSnapshot, ShardHealth};
use crate::sharding::ShardRouter;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::{self, Write};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => f.write_str("WARNING"),
            Self::Critical => f.write_str("CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub shard_id: Option<ShardId>,
    pub message: String,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardReport {
    #[serde(flatten)]
    pub health: ShardHealth,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub timestamp: DateTime<Utc>,
    pub status: &'static str,
    pub summary: HealthSummary,
    pub shards: Vec<ShardReport>,
    pub pools: Vec<PoolStats>,
    pub alerts: Vec<Alert>,
}

pub struct MetricsExporter {
    monitor: Arc<HealthMonitor>,
    router: Arc<ShardRouter>,
    alerts: AlertConfig,
}

impl MetricsExporter {
    pub fn new(monitor: Arc<HealthMonitor>, router: Arc<ShardRouter>, alerts: AlertConfig) -> Self {
        Self {
            monitor,
            router,
            alerts,
        }
    }

    /// Prometheus text exposition of every shard and the system totals.
    pub fn prometheus(&self) -> Result<String> {
        let shards = self.monitor.all_health()?;
        let summary = self.monitor.summary()?;
        let mut out = String::new();

        let mut gauge = |name: &str, help: &str, values: &mut dyn Iterator<Item = (ShardId, f64)>| {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            for (shard_id, value) in values {
                let _ = writeln!(out, "{}{{shard_id=\"{}\"}} {}", name, shard_id, value);
            }
        };

        gauge(
            "shard_health_status",
            "Shard health (0=unknown, 1=healthy, 2=degraded, 3=unhealthy)",
            &mut shards.iter().map(|h| (h.shard_id, h.status.as_gauge() as f64)),
        );
        gauge(
            "shard_response_time_ms",
            "Latency of the last health probe in milliseconds",
            &mut shards
                .iter()
                .map(|h| (h.shard_id, h.response_time.as_secs_f64() * 1000.0)),
        );
        gauge(
            "shard_error_rate_percentage",
            "Query error rate over the recent window in percent",
            &mut shards.iter().map(|h| (h.shard_id, h.error_rate * 100.0)),
        );
        gauge(
            "shard_queries_per_second",
            "Queries per second over the recent window",
            &mut shards.iter().map(|h| (h.shard_id, h.queries_per_second)),
        );
        gauge(
            "shard_database_size_bytes",
            "Approximate size of the shard's tenant tables",
            &mut shards.iter().map(|h| (h.shard_id, h.database_size_bytes as f64)),
        );
        gauge(
            "shard_record_count",
            "Rows in the shard's tenant tables",
            &mut shards.iter().map(|h| (h.shard_id, h.record_count as f64)),
        );
        gauge(
            "shard_reachable",
            "1 if the last probe reached the shard",
            &mut shards
                .iter()
                .map(|h| (h.shard_id, if h.reachable { 1.0 } else { 0.0 })),
        );

        let metrics = shards
            .iter()
            .map(|h| self.monitor.metrics(h.shard_id))
            .collect::<Result<Vec<_>>>()?;
        for (name, help, pick) in [
            (
                "shard_queries_total",
                "Queries recorded against the shard",
                (|m: &MetricsSnapshot| m.total_queries) as fn(&MetricsSnapshot) -> u64,
            ),
            (
                "shard_queries_failed_total",
                "Failed queries recorded against the shard",
                |m: &MetricsSnapshot| m.failed_queries,
            ),
        ] {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            for m in &metrics {
                let _ = writeln!(out, "{}{{shard_id=\"{}\"}} {}", name, m.shard_id, pick(m));
            }
        }

        let pools = self.router.pool_stats();
        if !pools.is_empty() {
            let _ = writeln!(out, "# HELP shard_pool_connections Pooled connections by state");
            let _ = writeln!(out, "# TYPE shard_pool_connections gauge");
            for pool in &pools {
                let _ = writeln!(
                    out,
                    "shard_pool_connections{{shard_id=\"{}\",state=\"active\"}} {}",
                    pool.shard_id, pool.active_connections
                );
                let _ = writeln!(
                    out,
                    "shard_pool_connections{{shard_id=\"{}\",state=\"idle\"}} {}",
                    pool.shard_id, pool.available_connections
                );
            }
        }

        for (name, help, value) in [
            ("system_shards_total", "Registered shards", summary.total_shards as f64),
            ("system_shards_healthy", "Healthy shards", summary.healthy as f64),
            ("system_shards_degraded", "Degraded shards", summary.degraded as f64),
            ("system_shards_unhealthy", "Unhealthy shards", summary.unhealthy as f64),
            (
                "system_average_latency_ms",
                "Mean probe latency over reachable shards",
                summary.average_latency_ms,
            ),
            (
                "system_health",
                "1 if no shard is unhealthy",
                if summary.system_healthy { 1.0 } else { 0.0 },
            ),
        ] {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        Ok(out)
    }

    pub fn report(&self) -> Result<MetricsReport> {
        let summary = self.monitor.summary()?;
        let shards = self
            .monitor
            .all_health()?
            .into_iter()
            .map(|health| {
                let metrics = self.monitor.metrics(health.shard_id)?;
                Ok(ShardReport { health, metrics })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(MetricsReport {
            timestamp: Utc::now(),
            status: summary.status_label(),
            alerts: self.evaluate(&summary, shards.iter().map(|s| &s.health)),
            summary,
            shards,
            pools: self.router.pool_stats(),
        })
    }

    /// Current alerts, most severe first.
    pub fn alerts(&self) -> Result<Vec<Alert>> {
        let summary = self.monitor.summary()?;
        let shards = self.monitor.all_health()?;
        Ok(self.evaluate(&summary, shards.iter()))
    }

    fn evaluate<'a>(
        &self,
        summary: &HealthSummary,
        shards: impl Iterator<Item = &'a ShardHealth>,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for health in shards {
            let shard_alert = |severity, message| Alert {
                severity,
                shard_id: Some(health.shard_id),
                message,
            };
            if health.last_checked.is_some() && !health.reachable {
                alerts.push(shard_alert(
                    Severity::Critical,
                    format!("Shard {} is unreachable", health.shard_id),
                ));
            } else if health.status == HealthStatus::Unhealthy {
                alerts.push(shard_alert(
                    Severity::Critical,
                    format!("Shard {} is unhealthy - {}", health.shard_id, health.message),
                ));
            } else if health.status == HealthStatus::Degraded {
                alerts.push(shard_alert(
                    Severity::Warning,
                    format!("Shard {} is degraded - {}", health.shard_id, health.message),
                ));
            }
        }

        if !summary.system_healthy {
            alerts.push(Alert {
                severity: Severity::Critical,
                shard_id: None,
                message: format!(
                    "System is not healthy - {} of {} shards unhealthy",
                    summary.unhealthy, summary.total_shards
                ),
            });
        }

        let limit_ms = self.alerts.max_average_latency.as_secs_f64() * 1000.0;
        if summary.average_latency_ms > limit_ms {
            alerts.push(Alert {
                severity: Severity::Warning,
                shard_id: None,
                message: format!(
                    "High average latency: {:.0}ms exceeds {:.0}ms",
                    summary.average_latency_ms, limit_ms
                ),
            });
        }

        alerts.sort_by(|a, b| b.severity.cmp(&a.severity));
        alerts
    }

    /// Writes the summary and any alerts to the log.
    pub fn log_metrics(&self) -> Result<()> {
        let summary = self.monitor.summary()?;
        info!(
            status = summary.status_label(),
            total = summary.total_shards,
            healthy = summary.healthy,
            degraded = summary.degraded,
            unhealthy = summary.unhealthy,
            average_latency_ms = summary.average_latency_ms,
            "shard health summary"
        );
        for alert in self.alerts()? {
            match alert.severity {
                Severity::Critical => error!(shard_id = ?alert.shard_id, "{}", alert),
                Severity::Warning => warn!(shard_id = ?alert.shard_id, "{}", alert),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::connection::config::{PoolConfig, ShardDescriptor};
    use crate::sharding::ShardRegistry;
    use crate::storage::MemoryConnector;
    use std::time::Duration;

    async fn exporter() -> (
        Arc<MemoryConnector>,
        Arc<HealthMonitor>,
        Arc<ShardRouter>,
        MetricsExporter,
    ) {
        let connector = Arc::new(MemoryConnector::new());
        connector.provision(0..3, &["orders"]).await.unwrap();
        let registry = Arc::new(
            ShardRegistry::new((0..3).map(|id| ShardDescriptor::new(id, "mem")).collect()).unwrap(),
        );
        let config = HealthConfig {
            probe_timeout: Duration::from_millis(200),
            ..HealthConfig::default()
        };
        let monitor =
            Arc::new(HealthMonitor::new(registry.clone(), connector.clone(), config).unwrap());
        let router =
            Arc::new(ShardRouter::new(registry, connector.clone(), PoolConfig::new()).unwrap());
        let exporter =
            MetricsExporter::new(monitor.clone(), router.clone(), AlertConfig::default());
        (connector, monitor, router, exporter)
    }

    #[tokio::test]
    async fn prometheus_text_has_per_shard_and_system_gauges() {
        let (_, monitor, _, exporter) = exporter().await;
        monitor.probe_all().await;

        let text = exporter.prometheus().unwrap();
        assert!(text.contains("# TYPE shard_health_status gauge"));
        assert!(text.contains("shard_health_status{shard_id=\"2\"} 1"));
        assert!(text.contains("shard_reachable{shard_id=\"0\"} 1"));
        assert!(text.contains("shard_queries_total{shard_id=\"1\"} 0"));
        assert!(text.contains("system_shards_total 3"));
        assert!(text.contains("system_health 1"));
    }

    #[tokio::test]
    async fn alerts_follow_shard_status() {
        let (connector, monitor, _, exporter) = exporter().await;
        connector.shard(1).unwrap().set_reachable(false);
        monitor.probe_all().await;

        let alerts = exporter.alerts().unwrap();
        let rendered: Vec<String> = alerts.iter().map(|a| a.to_string()).collect();
        assert!(rendered.contains(&"CRITICAL: Shard 1 is unreachable".to_string()));
        assert!(rendered.iter().any(|a| a.starts_with("CRITICAL: System is not healthy")));
        assert!(alerts.iter().all(|a| a.severity == Severity::Critical));

        let report = exporter.report().unwrap();
        assert_eq!(report.status, "DEGRADED");
        assert_eq!(report.shards.len(), 3);
        exporter.log_metrics().unwrap();
    }

    #[tokio::test]
    async fn no_alerts_before_first_probe() {
        let (_, _, _, exporter) = exporter().await;
        assert!(exporter.alerts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn prometheus_text_reports_pool_connections() {
        let (_, _, router, exporter) = exporter().await;
        let checked_out = router.connection_for_shard(1).await.unwrap();

        let text = exporter.prometheus().unwrap();
        assert!(text.contains("shard_pool_connections{shard_id=\"1\",state=\"active\"} 1"));
        assert!(text.contains("shard_pool_connections{shard_id=\"1\",state=\"idle\"} 0"));

        drop(checked_out);
        let text = exporter.prometheus().unwrap();
        assert!(text.contains("shard_pool_connections{shard_id=\"1\",state=\"active\"} 0"));
        assert!(text.contains("shard_pool_connections{shard_id=\"1\",state=\"idle\"} 1"));
    }
}
