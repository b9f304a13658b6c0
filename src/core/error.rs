use crate::core::types::ShardId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ShardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid tenant key: {0}")]
    InvalidTenantKey(String),

    #[error("Shard {0} is not registered")]
    UnknownShard(ShardId),

    #[error("Shard {shard_id} unavailable: {reason}")]
    ShardUnavailable { shard_id: ShardId, reason: String },

    #[error("Cross-shard access denied: request bound to shard {request_shard}, resource lives on shard {resource_shard}")]
    CrossShardAccess {
        request_shard: ShardId,
        resource_shard: ShardId,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Stale write: row {id} in '{table}' already has a version at least as new")]
    StaleWrite { table: String, id: i64 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Migration '{0}' not found")]
    MigrationNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Verification mismatch on table '{table}': source has {source_count} rows, target has {target_count}")]
    VerificationMismatch {
        table: String,
        source_count: u64,
        target_count: u64,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Lock error: {0}")]
    LockError(String),
}

impl ShardError {
    pub fn unavailable(shard_id: ShardId, reason: impl Into<String>) -> Self {
        Self::ShardUnavailable {
            shard_id,
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// True for failures that mean "the shard could not serve this", as opposed
    /// to a bad request or a logic error.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ShardUnavailable { .. } | Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, ShardError>;

impl<T> From<std::sync::PoisonError<T>> for ShardError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

/// Runs `fut` under `after`, mapping expiry to [`ShardError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ShardError::timeout(operation, after)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_maps_elapsed_future_to_timeout_error() {
        let result: Result<()> = with_timeout("probe", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        match result {
            Err(ShardError::Timeout { operation, after }) => {
                assert_eq!(operation, "probe");
                assert_eq!(after, Duration::from_millis(10));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn unavailable_classification() {
        assert!(ShardError::unavailable(2, "down").is_unavailable());
        assert!(ShardError::timeout("ping", Duration::from_secs(1)).is_unavailable());
        assert!(!ShardError::UnknownShard(9).is_unavailable());
    }
}
