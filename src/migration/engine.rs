use super::dual_write::{DualWriteBinding, DualWriteCoordinator, MirrorFailure};
use super::job::{MigrationJob, MigrationRequest, MigrationState, MigrationStatus};
use super::plan::TablePlan;
use crate::config::MigrationConfig;
use crate::connection::ShardConnection;
use crate::core::{Result, ShardError, ShardId, TenantKey, TenantRange};
use crate::sharding::ShardRouter;
use crate::storage::ShardConnector;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

/// Row counts of one table on both sides of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableVerification {
    pub table: String,
    pub source_count: u64,
    pub target_count: u64,
}

impl TableVerification {
    pub fn matches(&self) -> bool {
        self.source_count == self.target_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub migration_id: String,
    pub tables: Vec<TableVerification>,
    pub verified_records: u64,
    pub mismatches: usize,
}

/// Source and target connections of a running job.
struct Endpoints {
    source: ShardConnection,
    target: ShardConnection,
}

/// Moves tenant rows between shards.
///
/// A job copies the tenants in its range table by table (parents first) in
/// primary-key batches, verifies row counts, and only then repoints routing.
/// Until cutover the source stays authoritative; a dual-write binding keeps
/// the target current with writes that land during the copy, and rows whose
/// mirror failed are copied again from the source before and after cutover.
pub struct MigrationEngine {
    router: Arc<ShardRouter>,
    connector: Arc<dyn ShardConnector>,
    dual_write: Arc<DualWriteCoordinator>,
    config: MigrationConfig,
    plan: TablePlan,
    jobs: RwLock<HashMap<String, Arc<MigrationJob>>>,
}

impl MigrationEngine {
    pub fn new(
        router: Arc<ShardRouter>,
        connector: Arc<dyn ShardConnector>,
        dual_write: Arc<DualWriteCoordinator>,
        config: MigrationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let plan = TablePlan::resolve(&config.tables, &config.dependencies)?;
        info!(tables = ?plan.tables(), batch_size = config.batch_size, "migration engine ready");
        Ok(Self {
            router,
            connector,
            dual_write,
            config,
            plan,
            jobs: RwLock::new(HashMap::new()),
        })
    }

    pub fn plan(&self) -> &TablePlan {
        &self.plan
    }

    /// Validates `request`, registers the job and runs it in the background.
    /// Returns as soon as the job is queued.
    pub fn start(self: &Arc<Self>, request: MigrationRequest) -> Result<MigrationStatus> {
        let batch_size = request.batch_size.unwrap_or(self.config.batch_size);
        if batch_size == 0 {
            return Err(ShardError::Config("batch_size must be > 0".to_string()));
        }
        self.check_request(&request)?;

        let job = {
            let mut jobs = self.jobs.write()?;
            if let Some(active) = jobs.values().find(|job| conflicts(job, &request)) {
                return Err(ShardError::InvalidState(format!(
                    "migration {} is already moving overlapping tenants",
                    active.id()
                )));
            }
            let job = Arc::new(MigrationJob::new(request, batch_size));
            jobs.insert(job.id().to_string(), job.clone());
            job
        };

        let request = job.request();
        info!(
            migration_id = %job.id(),
            source = request.source,
            target = request.target,
            tenants = %request.range,
            batch_size,
            "migration queued"
        );

        let engine = Arc::clone(self);
        let runner = job.clone();
        tokio::spawn(async move { engine.run(runner).await });

        job.status()
    }

    fn check_request(&self, request: &MigrationRequest) -> Result<()> {
        if request.source == request.target {
            return Err(ShardError::InvalidState(
                "source and target shard must differ".to_string(),
            ));
        }
        let registry = self.router.registry();
        registry.get(request.source)?;
        registry.get(request.target)?;
        for shard in [request.source, request.target] {
            if self.router.is_drained(shard) {
                return Err(ShardError::InvalidState(format!(
                    "shard {} has been drained",
                    shard
                )));
            }
        }
        if let TenantRange::Keys(keys) = &request.range {
            for key in keys {
                let current = self.router.shard_for(key)?;
                if current != request.source {
                    return Err(ShardError::InvalidState(format!(
                        "tenant {} is served by shard {}, not {}",
                        key, current, request.source
                    )));
                }
            }
        }
        Ok(())
    }

    fn job(&self, migration_id: &str) -> Result<Arc<MigrationJob>> {
        self.jobs
            .read()?
            .get(migration_id)
            .cloned()
            .ok_or_else(|| ShardError::MigrationNotFound(migration_id.to_string()))
    }

    pub fn status(&self, migration_id: &str) -> Result<MigrationStatus> {
        self.job(migration_id)?.status()
    }

    /// Every known job, oldest first.
    pub fn list(&self) -> Result<Vec<MigrationStatus>> {
        let jobs: Vec<Arc<MigrationJob>> = self.jobs.read()?.values().cloned().collect();
        let mut statuses = jobs
            .iter()
            .map(|job| job.status())
            .collect::<Result<Vec<_>>>()?;
        statuses.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(statuses)
    }

    /// Stops a running job at the next batch boundary. The job ends
    /// `rolled_back`; rows already copied stay on the target until
    /// [`MigrationEngine::rollback`] purges them.
    pub fn cancel(&self, migration_id: &str) -> Result<MigrationStatus> {
        let job = self.job(migration_id)?;
        job.request_cancel()?;
        job.status()
    }

    /// Waits for a job to finish and returns its final status.
    pub async fn wait(&self, migration_id: &str) -> Result<MigrationStatus> {
        let job = self.job(migration_id)?;
        job.wait().await;
        job.status()
    }

    /// Deletes the rows a failed or cancelled job wrote to its target.
    /// Rows of tenants the target serves by now (a later migration moved
    /// them there) are kept. Repeating it is a no-op.
    pub async fn rollback(&self, migration_id: &str) -> Result<MigrationStatus> {
        let job = self.job(migration_id)?;
        match job.state() {
            MigrationState::Completed => {
                return Err(ShardError::InvalidState(
                    "completed migrations cannot be rolled back; migrate the tenants back instead"
                        .to_string(),
                ));
            }
            state if !state.is_terminal() => {
                return Err(ShardError::InvalidState(format!(
                    "migration is {}; cancel it before rolling back",
                    state
                )));
            }
            _ => {}
        }
        self.purge_target(&job).await?;
        job.status()
    }

    /// Recounts source and target rows for a job's tenants without
    /// changing the job.
    pub async fn verify(&self, migration_id: &str) -> Result<VerificationReport> {
        let job = self.job(migration_id)?;
        let endpoints = self.connect(&job).await?;
        self.count_tables(&job, &endpoints).await
    }

    async fn run(self: Arc<Self>, job: Arc<MigrationJob>) {
        let outcome = self.execute(&job).await;
        let Err(err) = outcome else {
            return;
        };

        match self.dual_write.detach(job.id()) {
            Ok(Some(binding)) => {
                if let Err(absorb_err) = self.absorb_mirrors(&job, &binding) {
                    warn!(
                        migration_id = %job.id(),
                        error = %absorb_err,
                        "failed to record mirrored rows"
                    );
                }
                binding.wait_idle(self.config.operation_timeout).await;
            }
            Ok(None) => {}
            Err(detach_err) => {
                warn!(
                    migration_id = %job.id(),
                    error = %detach_err,
                    "failed to detach dual-write"
                );
            }
        }

        let request = job.request();
        let result = match err {
            ShardError::Cancelled => {
                job.finish(MigrationState::RolledBack, "Migration cancelled by operator", None)
            }
            err if request.rollback_on_error => {
                error!(migration_id = %job.id(), error = %err, "migration failed, rolling back");
                let message = format!("Migration failed: {}", err);
                match self.purge_target(&job).await {
                    Ok(()) => {
                        job.finish(MigrationState::RolledBack, message, Some(err.to_string()))
                    }
                    Err(purge_err) => {
                        error!(
                            migration_id = %job.id(),
                            error = %purge_err,
                            "rollback purge failed"
                        );
                        job.finish(
                            MigrationState::Failed,
                            format!("{}; rollback failed: {}", message, purge_err),
                            Some(err.to_string()),
                        )
                    }
                }
            }
            err => {
                error!(migration_id = %job.id(), error = %err, "migration failed");
                job.finish(
                    MigrationState::Failed,
                    format!("Migration failed: {}", err),
                    Some(err.to_string()),
                )
            }
        };
        if let Err(err) = result {
            error!(migration_id = %job.id(), error = %err, "failed to record migration outcome");
        }
    }

    async fn execute(&self, job: &Arc<MigrationJob>) -> Result<()> {
        let request = job.request().clone();

        // Phase 1: connect, bind dual-write, count.
        job.enter(MigrationState::Initializing, "Connecting to source and target")?;
        let endpoints = self.connect(job).await?;
        endpoints.source.ping().await?;
        endpoints.target.ping().await?;

        if request.range == TenantRange::All {
            for table in self.plan.tables() {
                let existing = endpoints.target.count_rows(table, &TenantRange::All).await?;
                if existing > 0 {
                    return Err(ShardError::InvalidState(format!(
                        "target shard {} already holds {} rows in '{}'; migrating all tenants needs an empty target",
                        request.target, existing, table
                    )));
                }
            }
        }

        self.dual_write.attach(DualWriteBinding::new(
            job.id(),
            request.range.clone(),
            request.source,
            endpoints.target.clone(),
        ))?;

        let mut total = 0;
        for table in self.plan.tables() {
            total += endpoints.source.count_rows(table, &request.range).await?;
        }
        job.set_total(total)?;

        // Phase 2: batched copy.
        job.enter(
            MigrationState::InProgress,
            format!("Copying {} rows", total),
        )?;
        for table in self.plan.tables() {
            self.copy_table(job, &endpoints, table).await?;
        }

        self.repair_mirrors(job, &endpoints).await?;

        // Phase 3: verification.
        if request.verify {
            job.enter(MigrationState::Verifying, "Verifying row counts")?;
            let mut report = self.count_tables(job, &endpoints).await?;
            if report.mismatches > 0 {
                // A mirror may still have been landing; recount once.
                self.repair_mirrors(job, &endpoints).await?;
                report = self.count_tables(job, &endpoints).await?;
            }
            if let Some(bad) = report.tables.iter().find(|t| !t.matches()) {
                return Err(ShardError::VerificationMismatch {
                    table: bad.table.clone(),
                    source_count: bad.source_count,
                    target_count: bad.target_count,
                });
            }
            job.set_verified(report.verified_records)?;
        }

        // Phase 4: repoint routing, then tear down dual-write.
        job.enter(MigrationState::Cutover, "Switching routing to target")?;
        let (change, binding) = self.dual_write.cutover(job.id(), || {
            self.router
                .repoint(&request.range, request.source, request.target)
        })?;
        job.set_routing_epoch(change.epoch)?;
        let mut unreconciled = None;
        if let Some(binding) = binding {
            self.absorb_mirrors(job, &binding)?;
            if !binding.wait_idle(self.config.operation_timeout).await {
                warn!(migration_id = %job.id(), "dual-write mirrors still in flight after cutover");
            }
            // Writes resolved just before cutover may have failed to mirror.
            // Routing has moved, so a failure here is reported, not undone.
            if let Err(err) = self.reconcile_mirrors(job, &endpoints, &binding).await {
                error!(
                    migration_id = %job.id(),
                    error = %err,
                    "failed to reconcile mirrors after cutover"
                );
                unreconciled = Some(err.to_string());
            }
        }

        // Phase 5.
        let status = job.status()?;
        let mut message = format!(
            "Migration completed: {} rows moved from shard {} to shard {}",
            status.migrated_records, request.source, request.target
        );
        if unreconciled.is_some() {
            message.push_str("; some dual-writes could not be reconciled");
        }
        job.finish(MigrationState::Completed, message, unreconciled)?;
        Ok(())
    }

    async fn connect(&self, job: &MigrationJob) -> Result<Endpoints> {
        let request = job.request();
        let registry = self.router.registry();
        let timeout = self.config.operation_timeout;
        let source_descriptor = registry.get(request.source)?;
        let target_descriptor = registry.get(request.target)?;
        Ok(Endpoints {
            source: ShardConnection::open(self.connector.as_ref(), &source_descriptor, timeout)
                .await?,
            target: ShardConnection::open(self.connector.as_ref(), &target_descriptor, timeout)
                .await?,
        })
    }

    async fn copy_table(
        &self,
        job: &MigrationJob,
        endpoints: &Endpoints,
        table: &str,
    ) -> Result<()> {
        let request = job.request();
        let batch_size = job.batch_size();
        job.set_table(table)?;
        info!(migration_id = %job.id(), table, "copying table");

        let mut cursor = None;
        loop {
            job.check_cancelled()?;
            let batch = endpoints
                .source
                .read_batch(table, &request.range, cursor, batch_size)
                .await?;
            let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
                break;
            };
            let (first_id, last_id) = (first.id, last.id);
            let rows = batch.len() as u64;

            match endpoints.target.insert_rows(table, &batch).await {
                Ok(_) => job.record_batch(table, first_id, last_id, rows, false)?,
                Err(err) => {
                    // The batch may have partially landed; keep its ids for purge.
                    job.record_batch(table, first_id, last_id, rows, true)?;
                    if !request.continue_on_batch_error {
                        return Err(err);
                    }
                    warn!(
                        migration_id = %job.id(),
                        table,
                        first_id,
                        last_id,
                        error = %err,
                        "batch insert failed, continuing"
                    );
                }
            }

            cursor = Some(last_id);
            if batch.len() < batch_size {
                break;
            }
        }
        Ok(())
    }

    async fn count_tables(
        &self,
        job: &MigrationJob,
        endpoints: &Endpoints,
    ) -> Result<VerificationReport> {
        let range = &job.request().range;
        let mut tables = Vec::with_capacity(self.plan.tables().len());
        for table in self.plan.tables() {
            tables.push(TableVerification {
                table: table.clone(),
                source_count: endpoints.source.count_rows(table, range).await?,
                target_count: endpoints.target.count_rows(table, range).await?,
            });
        }
        let mismatches = tables.iter().filter(|t| !t.matches()).count();
        let verified_records = tables
            .iter()
            .filter(|t| t.matches())
            .map(|t| t.source_count)
            .sum();
        for table in tables.iter().filter(|t| !t.matches()) {
            warn!(
                migration_id = %job.id(),
                table = %table.table,
                source_count = table.source_count,
                target_count = table.target_count,
                "row count mismatch"
            );
        }
        Ok(VerificationReport {
            migration_id: job.id().to_string(),
            tables,
            verified_records,
            mismatches,
        })
    }

    async fn settle_mirrors(&self, job: &MigrationJob) {
        if let Ok(Some(binding)) = self.dual_write.binding(job.id()) {
            if !binding.wait_idle(self.config.operation_timeout).await {
                warn!(
                    migration_id = %job.id(),
                    "dual-write mirrors did not drain before verification"
                );
            }
        }
    }

    /// Waits for in-flight mirrors, then copies again what failed.
    async fn repair_mirrors(&self, job: &MigrationJob, endpoints: &Endpoints) -> Result<()> {
        self.settle_mirrors(job).await;
        if let Some(binding) = self.dual_write.binding(job.id())? {
            self.reconcile_mirrors(job, endpoints, &binding).await?;
        }
        Ok(())
    }

    /// Copies rows whose mirror failed again from the source. The
    /// conflict-aware insert keeps a newer version the target already holds.
    /// A failed delete is repeated only while the source still lacks the row
    /// and the target copy is no newer than the delete.
    async fn reconcile_mirrors(
        &self,
        job: &MigrationJob,
        endpoints: &Endpoints,
        binding: &DualWriteBinding,
    ) -> Result<u64> {
        let failures = binding.take_failures();
        if failures.is_empty() {
            return Ok(0);
        }
        let range = &job.request().range;
        let mut repaired = 0;
        for failure in &failures {
            match failure {
                MirrorFailure::Upsert { table, id } => {
                    let Some(row) = endpoints.source.get_row(table, *id).await? else {
                        continue;
                    };
                    if range.contains(&row.tenant) {
                        endpoints
                            .target
                            .insert_rows(table, std::slice::from_ref(&row))
                            .await?;
                        job.record_written(table, row.id, row.id)?;
                        repaired += 1;
                    }
                }
                MirrorFailure::Delete {
                    table,
                    id,
                    deleted_at,
                } => {
                    let stale = endpoints
                        .target
                        .get_row(table, *id)
                        .await?
                        .is_some_and(|row| {
                            range.contains(&row.tenant) && row.updated_at <= *deleted_at
                        });
                    if stale && endpoints.source.get_row(table, *id).await?.is_none() {
                        endpoints.target.delete_row(table, *id).await?;
                        repaired += 1;
                    }
                }
            }
        }
        info!(
            migration_id = %job.id(),
            failures = failures.len(),
            repaired,
            "failed dual-writes reconciled"
        );
        Ok(repaired)
    }

    /// Folds ids the binding mirrored into the job's purge ranges.
    fn absorb_mirrors(&self, job: &MigrationJob, binding: &DualWriteBinding) -> Result<()> {
        for (table, (lo, hi)) in binding.touched_ranges() {
            job.record_written(&table, lo, hi)?;
        }
        Ok(())
    }

    async fn purge_target(&self, job: &MigrationJob) -> Result<()> {
        if job.target_purged()? {
            return Ok(());
        }
        let request = job.request();
        if let Some(active) = self.active_job_onto(job, request.target, &request.range)? {
            return Err(ShardError::InvalidState(format!(
                "migration {} is moving overlapping tenants onto shard {}; purge after it finishes",
                active, request.target
            )));
        }
        // The binding must be gone first or a late mirror could land after
        // the purge.
        if let Some(binding) = self.dual_write.detach(job.id())? {
            self.absorb_mirrors(job, &binding)?;
            binding.wait_idle(self.config.operation_timeout).await;
        }

        let target_descriptor = self.router.registry().get(request.target)?;
        let target = ShardConnection::open(
            self.connector.as_ref(),
            &target_descriptor,
            self.config.operation_timeout,
        )
        .await?;

        let mut deleted = 0;
        let mut kept = BTreeSet::new();
        for table in self.plan.reversed() {
            let Some((first_id, last_id)) = job.written_range(table)? else {
                continue;
            };
            let (scope, served) = self
                .purge_scope(job, &target, table, first_id, last_id)
                .await?;
            kept.extend(served);
            if let Some(scope) = scope {
                deleted += target
                    .delete_range(table, &scope, first_id, last_id)
                    .await?;
            }
        }

        if !kept.is_empty() {
            warn!(
                migration_id = %job.id(),
                target = request.target,
                tenants = kept.len(),
                "target now serves some of this migration's tenants; their rows were kept"
            );
        }
        info!(migration_id = %job.id(), deleted, target = request.target, "target rows purged");
        let mut message = format!(
            "Rolled back: {} rows removed from shard {}",
            deleted, request.target
        );
        if !kept.is_empty() {
            message.push_str(&format!(
                "; rows of {} tenant(s) now served by shard {} were kept",
                kept.len(),
                request.target
            ));
        }
        job.mark_purged(message)
    }

    /// Tenants whose rows in `first_id..=last_id` may be deleted from the
    /// target, and those the target serves by now. `None` means nothing may
    /// be deleted.
    async fn purge_scope(
        &self,
        job: &MigrationJob,
        target: &ShardConnection,
        table: &str,
        first_id: i64,
        last_id: i64,
    ) -> Result<(Option<TenantRange>, BTreeSet<TenantKey>)> {
        let range = &job.request().range;
        let target_id = job.request().target;

        let mut tenants = BTreeSet::new();
        let mut cursor = first_id.checked_sub(1);
        'scan: loop {
            let batch = target
                .read_batch(table, range, cursor, job.batch_size())
                .await?;
            let done = batch.len() < job.batch_size();
            for row in batch {
                if row.id > last_id {
                    break 'scan;
                }
                cursor = Some(row.id);
                tenants.insert(row.tenant);
            }
            if done {
                break;
            }
        }

        let (served, purgeable): (BTreeSet<TenantKey>, BTreeSet<TenantKey>) =
            tenants.into_iter().partition(|tenant| {
                self.router
                    .shard_for(tenant)
                    .is_ok_and(|shard| shard == target_id)
            });
        let scope = if served.is_empty() {
            Some(range.clone())
        } else if purgeable.is_empty() {
            None
        } else {
            Some(TenantRange::Keys(purgeable))
        };
        Ok((scope, served))
    }

    /// Id of another running job that moves tenants of `range` onto `target`.
    fn active_job_onto(
        &self,
        job: &MigrationJob,
        target: ShardId,
        range: &TenantRange,
    ) -> Result<Option<String>> {
        let jobs = self.jobs.read()?;
        Ok(jobs
            .values()
            .filter(|other| other.id() != job.id() && !other.state().is_terminal())
            .find(|other| other.request().target == target && other.request().range.overlaps(range))
            .map(|other| other.id().to_string()))
    }
}

/// An active job conflicts when it touches either shard of `request` with
/// an overlapping tenant range.
fn conflicts(job: &MigrationJob, request: &MigrationRequest) -> bool {
    if job.state().is_terminal() {
        return false;
    }
    let active = job.request();
    let shards = [active.source, active.target];
    (shards.contains(&request.source) || shards.contains(&request.target))
        && active.range.overlaps(&request.range)
}
