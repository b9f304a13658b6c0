use crate::config::millis;
use crate::core::{Result, ShardError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Numeric form used by the metrics exporter.
    pub fn as_gauge(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Healthy => 1,
            Self::Degraded => 2,
            Self::Unhealthy => 3,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Classification thresholds, adjustable at runtime.
///
/// Error rates are fractions (`0.05` = 5%). A shard is unhealthy above the
/// unhealthy bounds and degraded from the degraded bounds upward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    #[serde(rename = "degraded_threshold_ms", with = "millis")]
    pub degraded_latency: Duration,
    #[serde(rename = "unhealthy_threshold_ms", with = "millis")]
    pub unhealthy_latency: Duration,
    pub degraded_error_rate: f64,
    #[serde(alias = "max_error_rate")]
    pub unhealthy_error_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_latency: Duration::from_millis(500),
            unhealthy_latency: Duration::from_millis(2000),
            degraded_error_rate: 0.05,
            unhealthy_error_rate: 0.10,
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.degraded_latency > self.unhealthy_latency {
            return Err(ShardError::Config(
                "degraded latency threshold cannot exceed the unhealthy threshold".to_string(),
            ));
        }
        for rate in [self.degraded_error_rate, self.unhealthy_error_rate] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ShardError::Config(format!(
                    "error rate threshold {} must be within 0.0..=1.0",
                    rate
                )));
            }
        }
        if self.degraded_error_rate > self.unhealthy_error_rate {
            return Err(ShardError::Config(
                "degraded error rate cannot exceed the unhealthy error rate".to_string(),
            ));
        }
        Ok(())
    }

    /// Status and a human-readable reason for one probe measurement.
    pub fn classify(
        &self,
        reachable: bool,
        latency: Duration,
        error_rate: f64,
    ) -> (HealthStatus, String) {
        if !reachable {
            return (HealthStatus::Unhealthy, "Shard is unreachable".to_string());
        }
        if latency > self.unhealthy_latency {
            return (
                HealthStatus::Unhealthy,
                format!("Response time too high: {}ms", latency.as_millis()),
            );
        }
        if error_rate > self.unhealthy_error_rate {
            return (
                HealthStatus::Unhealthy,
                format!("Error rate too high: {:.1}%", error_rate * 100.0),
            );
        }
        if latency >= self.degraded_latency {
            return (
                HealthStatus::Degraded,
                format!("Response time degraded: {}ms", latency.as_millis()),
            );
        }
        if error_rate >= self.degraded_error_rate {
            return (
                HealthStatus::Degraded,
                format!("Error rate elevated: {:.1}%", error_rate * 100.0),
            );
        }
        (HealthStatus::Healthy, "Shard is healthy".to_string())
    }
}
