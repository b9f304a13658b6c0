use crate::core::{Result, ShardError, ShardId, TenantRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lifecycle of a migration job.
///
/// `Pending -> Initializing -> InProgress -> Verifying -> Cutover -> Completed`,
/// with `RolledBack` or `Failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Pending,
    Initializing,
    InProgress,
    Verifying,
    Cutover,
    Completed,
    RolledBack,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::InProgress => "in_progress",
            Self::Verifying => "verifying",
            Self::Cutover => "cutover",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

fn default_range() -> TenantRange {
    TenantRange::All
}

/// What to move, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub source: ShardId,
    pub target: ShardId,
    #[serde(default = "default_range")]
    pub range: TenantRange,
    /// Rows per copy batch; the configured default when absent.
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Purge copied rows from the target when the job fails.
    #[serde(default = "default_true")]
    pub rollback_on_error: bool,
    /// Count a failed insert batch and keep going instead of aborting.
    #[serde(default)]
    pub continue_on_batch_error: bool,
}

impl MigrationRequest {
    pub fn new(source: ShardId, target: ShardId) -> Self {
        Self {
            source,
            target,
            range: TenantRange::All,
            batch_size: None,
            verify: true,
            rollback_on_error: true,
            continue_on_batch_error: false,
        }
    }

    pub fn range(mut self, range: TenantRange) -> Self {
        self.range = range;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn rollback_on_error(mut self, rollback: bool) -> Self {
        self.rollback_on_error = rollback;
        self
    }

    pub fn continue_on_batch_error(mut self, keep_going: bool) -> Self {
        self.continue_on_batch_error = keep_going;
        self
    }
}

#[derive(Debug, Clone)]
struct Progress {
    state: MigrationState,
    total_records: u64,
    migrated_records: u64,
    verified_records: u64,
    failed_records: u64,
    current_table: Option<String>,
    cursor: Option<i64>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    message: String,
    error: Option<String>,
    routing_epoch: Option<u64>,
    target_purged: bool,
}

/// Snapshot of a job, as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub migration_id: String,
    pub source: ShardId,
    pub target: ShardId,
    pub tenants: TenantRange,
    pub batch_size: usize,
    pub state: MigrationState,
    /// Percentage of counted rows copied, 0 to 100.
    pub progress: f64,
    pub total_records: u64,
    pub migrated_records: u64,
    pub verified_records: u64,
    pub failed_records: u64,
    pub current_table: Option<String>,
    pub cursor: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
    pub eta_seconds: Option<f64>,
    pub message: String,
    pub error: Option<String>,
    pub routing_epoch: Option<u64>,
    pub target_purged: bool,
}

/// A running or finished migration.
pub struct MigrationJob {
    id: String,
    request: MigrationRequest,
    batch_size: usize,
    started: Instant,
    progress: RwLock<Progress>,
    /// table -> (first id, last id) written to the target
    written: Mutex<BTreeMap<String, (i64, i64)>>,
    token: CancellationToken,
    state_tx: watch::Sender<MigrationState>,
}

impl MigrationJob {
    pub(crate) fn new(request: MigrationRequest, batch_size: usize) -> Self {
        let (state_tx, _) = watch::channel(MigrationState::Pending);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            batch_size,
            started: Instant::now(),
            progress: RwLock::new(Progress {
                state: MigrationState::Pending,
                total_records: 0,
                migrated_records: 0,
                verified_records: 0,
                failed_records: 0,
                current_table: None,
                cursor: None,
                started_at: Utc::now(),
                finished_at: None,
                message: "Migration queued".to_string(),
                error: None,
                routing_epoch: None,
                target_purged: false,
            }),
            written: Mutex::new(BTreeMap::new()),
            token: CancellationToken::new(),
            state_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &MigrationRequest {
        &self.request
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn state(&self) -> MigrationState {
        *self.state_tx.borrow()
    }

    pub fn status(&self) -> Result<MigrationStatus> {
        let p = self.progress.read()?;
        let elapsed = match p.finished_at {
            Some(finished) => (finished - p.started_at)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            None => self.started.elapsed().as_secs_f64(),
        };
        let percent = if p.total_records == 0 {
            if p.state == MigrationState::Completed { 100.0 } else { 0.0 }
        } else {
            (p.migrated_records as f64 / p.total_records as f64 * 100.0).min(100.0)
        };
        let eta_seconds = (!p.state.is_terminal() && percent > 0.0 && percent < 100.0)
            .then(|| elapsed * (100.0 - percent) / percent);

        Ok(MigrationStatus {
            migration_id: self.id.clone(),
            source: self.request.source,
            target: self.request.target,
            tenants: self.request.range.clone(),
            batch_size: self.batch_size,
            state: p.state,
            progress: percent,
            total_records: p.total_records,
            migrated_records: p.migrated_records,
            verified_records: p.verified_records,
            failed_records: p.failed_records,
            current_table: p.current_table.clone(),
            cursor: p.cursor,
            started_at: p.started_at,
            finished_at: p.finished_at,
            elapsed_seconds: elapsed,
            eta_seconds,
            message: p.message.clone(),
            error: p.error.clone(),
            routing_epoch: p.routing_epoch,
            target_purged: p.target_purged,
        })
    }

    fn transition(&self, p: &mut Progress, state: MigrationState, message: String) {
        info!(
            migration_id = %self.id,
            from = %p.state,
            to = %state,
            "{}",
            message
        );
        p.state = state;
        p.message = message;
        if state.is_terminal() {
            p.finished_at = Some(Utc::now());
            p.current_table = None;
        }
        self.state_tx.send_replace(state);
    }

    /// Moves to a non-terminal phase. Fails if the job was cancelled, so a
    /// cancel between phases is never lost.
    pub(crate) fn enter(&self, state: MigrationState, message: impl Into<String>) -> Result<()> {
        let mut p = self.progress.write()?;
        if self.token.is_cancelled() {
            return Err(ShardError::Cancelled);
        }
        if p.state.is_terminal() {
            return Err(ShardError::InvalidState(format!(
                "migration {} already {}",
                self.id, p.state
            )));
        }
        self.transition(&mut p, state, message.into());
        Ok(())
    }

    pub(crate) fn finish(
        &self,
        state: MigrationState,
        message: impl Into<String>,
        error: Option<String>,
    ) -> Result<()> {
        let mut p = self.progress.write()?;
        p.error = error;
        self.transition(&mut p, state, message.into());
        Ok(())
    }

    /// Requests cancellation. Refused once cutover has begun or the job has
    /// finished.
    pub(crate) fn request_cancel(&self) -> Result<()> {
        let p = self.progress.read()?;
        match p.state {
            MigrationState::Cutover => Err(ShardError::InvalidState(
                "migration is cutting over and can no longer be cancelled".to_string(),
            )),
            state if state.is_terminal() => Err(ShardError::InvalidState(format!(
                "migration already {}",
                state
            ))),
            _ => {
                self.token.cancel();
                info!(migration_id = %self.id, "cancellation requested");
                Ok(())
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(ShardError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn set_total(&self, total: u64) -> Result<()> {
        self.progress.write()?.total_records = total;
        Ok(())
    }

    pub(crate) fn set_table(&self, table: &str) -> Result<()> {
        let mut p = self.progress.write()?;
        p.current_table = Some(table.to_string());
        p.cursor = None;
        Ok(())
    }

    /// Records a batch that reached (or may have partially reached) the
    /// target, widening the table's written id range.
    pub(crate) fn record_batch(
        &self,
        table: &str,
        first_id: i64,
        last_id: i64,
        rows: u64,
        failed: bool,
    ) -> Result<()> {
        self.record_written(table, first_id, last_id)?;
        let mut p = self.progress.write()?;
        if failed {
            p.failed_records += rows;
        } else {
            p.migrated_records += rows;
        }
        p.cursor = Some(last_id);
        Ok(())
    }

    pub(crate) fn record_written(&self, table: &str, first_id: i64, last_id: i64) -> Result<()> {
        let mut written = self.written.lock()?;
        written
            .entry(table.to_string())
            .and_modify(|(lo, hi)| {
                *lo = (*lo).min(first_id);
                *hi = (*hi).max(last_id);
            })
            .or_insert((first_id, last_id));
        Ok(())
    }

    pub(crate) fn written_range(&self, table: &str) -> Result<Option<(i64, i64)>> {
        Ok(self.written.lock()?.get(table).copied())
    }

    pub(crate) fn set_verified(&self, verified: u64) -> Result<()> {
        self.progress.write()?.verified_records = verified;
        Ok(())
    }

    pub(crate) fn set_routing_epoch(&self, epoch: u64) -> Result<()> {
        self.progress.write()?.routing_epoch = Some(epoch);
        Ok(())
    }

    pub fn target_purged(&self) -> Result<bool> {
        Ok(self.progress.read()?.target_purged)
    }

    pub(crate) fn mark_purged(&self, message: impl Into<String>) -> Result<()> {
        let mut p = self.progress.write()?;
        p.target_purged = true;
        let message = message.into();
        if p.state == MigrationState::Failed {
            self.transition(&mut p, MigrationState::RolledBack, message);
        } else {
            p.message = message;
        }
        Ok(())
    }

    /// Resolves once the job reaches a terminal state.
    pub async fn wait(&self) -> MigrationState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

impl fmt::Debug for MigrationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationJob")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("state", &self.state())
            .finish()
    }
}
