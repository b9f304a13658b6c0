pub mod metrics;
pub mod monitor;
pub mod thresholds;

pub use metrics::{MetricsSnapshot, RollingWindow, ShardMetrics};
pub use monitor::{HealthMonitor, HealthSummary, ShardHealth};
pub use thresholds::{HealthStatus, HealthThresholds};
