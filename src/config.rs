//! Process configuration.
//!
//! Loaded from a JSON file (`--config` or `SHARDWISE_CONFIG`) and then
//! overridden from the environment. Durations are written in milliseconds
//! (`*_ms` keys). Every section has defaults, so `{}` plus one shard is a
//! valid file.

use crate::connection::config::{PoolConfig, ShardDescriptor};
use crate::core::{Result, ShardError, validate_identifier};
use crate::health::HealthThresholds;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `Duration` as integer milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// `Option<Duration>` as integer milliseconds or `null`.
pub mod option_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Postgres,
}

/// Tables every migration walks, parents before children.
pub fn default_tables() -> Vec<String> {
    ["restaurants", "customers", "orders", "order_items", "payments"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_dependencies() -> BTreeMap<String, Vec<String>> {
    let mut deps = BTreeMap::new();
    deps.insert("customers".to_string(), vec!["restaurants".to_string()]);
    deps.insert(
        "orders".to_string(),
        vec!["restaurants".to_string(), "customers".to_string()],
    );
    deps.insert("order_items".to_string(), vec!["orders".to_string()]);
    deps.insert("payments".to_string(), vec!["orders".to_string()]);
    deps
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
    /// Span of the rolling error-rate window used for classification.
    #[serde(rename = "error_window_ms", with = "millis")]
    pub error_window: Duration,
    /// Tables whose rows are counted by the probe's size query.
    pub probe_tables: Vec<String>,
    pub thresholds: HealthThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            error_window: Duration::from_secs(60),
            probe_tables: default_tables(),
            thresholds: HealthThresholds::default(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(ShardError::Config(
                "health interval and probe timeout must be non-zero".to_string(),
            ));
        }
        for table in &self.probe_tables {
            validate_identifier(table)?;
        }
        self.thresholds.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub batch_size: usize,
    /// Timeout for every connect, batch and verification query.
    #[serde(rename = "operation_timeout_ms", with = "millis")]
    pub operation_timeout: Duration,
    pub tables: Vec<String>,
    /// child table -> parent tables it references
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            operation_timeout: Duration::from_secs(30),
            tables: default_tables(),
            dependencies: default_dependencies(),
        }
    }
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ShardError::Config("batch_size must be > 0".to_string()));
        }
        if self.operation_timeout.is_zero() {
            return Err(ShardError::Config(
                "operation timeout must be non-zero".to_string(),
            ));
        }
        crate::migration::TablePlan::resolve(&self.tables, &self.dependencies).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// System-wide average probe latency above which a warning is raised.
    #[serde(rename = "max_average_latency_ms", with = "millis")]
    pub max_average_latency: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_average_latency: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// File holding cutovers, added shards and the hash bucket count. When
    /// unset, routing changes last only as long as the process.
    pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_addr: String,
    pub backend: BackendKind,
    pub shards: Vec<ShardDescriptor>,
    pub pool: PoolConfig,
    pub health: HealthConfig,
    pub migration: MigrationConfig,
    pub alerts: AlertConfig,
    pub routing: RoutingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            backend: BackendKind::Memory,
            shards: Vec::new(),
            pool: PoolConfig::default(),
            health: HealthConfig::default(),
            migration: MigrationConfig::default(),
            alerts: AlertConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads `path` (or `SHARDWISE_CONFIG`) if given, then applies
    /// environment overrides and validates.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let env_path = std::env::var("SHARDWISE_CONFIG").ok();
        let path = path.or(env_path.as_deref().map(Path::new));

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(bind) = std::env::var("SHARDWISE_BIND_ADDR") {
            self.bind_addr = bind;
        }
        if let Ok(backend) = std::env::var("SHARDWISE_BACKEND") {
            self.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => BackendKind::Memory,
                "postgres" => BackendKind::Postgres,
                other => anyhow::bail!("SHARDWISE_BACKEND must be memory|postgres, got {}", other),
            };
        }
        if let Ok(path) = std::env::var("SHARDWISE_ROUTING_STATE") {
            self.routing.state_path = Some(PathBuf::from(path));
        }
        // Comma-separated connection URLs; shard ids follow list position.
        if let Ok(urls) = std::env::var("SHARDWISE_SHARDS") {
            self.shards = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .enumerate()
                .map(|(id, url)| ShardDescriptor::from_url(id as u32, url))
                .collect::<Result<Vec<_>>>()
                .context("SHARDWISE_SHARDS must be a list of postgres:// URLs")?;
        }
        Ok(())
    }

    /// In-memory configuration with `shards` shards and test-friendly timings.
    pub fn for_testing(shards: u32) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            shards: (0..shards)
                .map(|id| ShardDescriptor::new(id, &format!("memory-{id}")))
                .collect(),
            health: HealthConfig {
                interval: Duration::from_millis(100),
                probe_timeout: Duration::from_millis(500),
                ..HealthConfig::default()
            },
            migration: MigrationConfig {
                operation_timeout: Duration::from_secs(5),
                ..MigrationConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .map_err(|_| ShardError::Config(format!("invalid bind address '{}'", self.bind_addr)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(ShardError::Config(
                "no shards configured".to_string(),
            ));
        }
        self.bind_addr()?;
        self.pool.validate()?;
        self.health.validate()?;
        self.migration.validate()?;
        for shard in &self.shards {
            shard.validate()?;
        }
        if self.backend == BackendKind::Postgres && !cfg!(feature = "postgres") {
            return Err(ShardError::Config(
                "backend 'postgres' requires building with the `postgres` feature".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gets_defaults_but_needs_shards() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.migration.batch_size, 1000);
        assert_eq!(config.health.probe_timeout, Duration::from_secs(5));
        assert!(config.routing.state_path.is_none());
        assert!(matches!(config.validate(), Err(ShardError::Config(_))));
    }

    #[test]
    fn reads_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "bind_addr": "0.0.0.0:9000",
                "shards": [
                    {{"id": 0, "host": "db-0", "password": "pw"}},
                    {{"id": 1, "host": "db-1", "port": 6432}}
                ],
                "health": {{"interval_ms": 1000, "thresholds": {{"degraded_threshold_ms": 250}}}},
                "migration": {{"batch_size": 500, "tables": ["orders"]}},
                "routing": {{"state_path": "/var/lib/shardwise/routing.json"}}
            }}"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.shards.len(), 2);
        assert_eq!(config.shards[0].password, "pw");
        assert_eq!(config.shards[1].port, 6432);
        assert_eq!(config.health.interval, Duration::from_secs(1));
        assert_eq!(
            config.health.thresholds.degraded_latency,
            Duration::from_millis(250)
        );
        assert_eq!(config.migration.batch_size, 500);
        assert_eq!(
            config.routing.state_path.as_deref(),
            Some(Path::new("/var/lib/shardwise/routing.json"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = AppConfig::for_testing(2);
        assert!(config.validate().is_ok());

        config.migration.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::for_testing(2);
        config.bind_addr = "nowhere".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::for_testing(2);
        config.health.probe_tables = vec!["bad name".to_string()];
        assert!(config.validate().is_err());
    }
}
