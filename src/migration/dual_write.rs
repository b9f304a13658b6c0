//! Keeps a migration target current while the copy runs.
//!
//! While a binding is attached, every write the coordinator routes to the
//! binding's leader (the migration source) for a tenant in its range is
//! applied to the leader first and then mirrored to the follower (the
//! target) in the background. The caller only waits for the leader; a failed
//! mirror is logged, counted and kept as a [`MirrorFailure`] for the
//! migration to reconcile, never surfaced to the writer.

use crate::connection::ShardConnection;
use crate::core::{Result, Row, ShardError, ShardId, TenantKey, TenantRange};
use crate::health::HealthMonitor;
use crate::sharding::{RoutingChange, ShardRouter};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DualWriteStats {
    pub migration_id: String,
    pub leader: ShardId,
    pub follower: ShardId,
    /// Writes that matched the binding.
    pub writes: u64,
    pub mirrored: u64,
    pub failed: u64,
    pub in_flight: u64,
    /// Failed mirrors not yet reconciled.
    pub unreconciled: u64,
}

/// A mirror the follower did not apply. The follower may hold an older
/// version of the row (or a row the leader deleted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorFailure {
    Upsert {
        table: String,
        id: i64,
    },
    Delete {
        table: String,
        id: i64,
        deleted_at: DateTime<Utc>,
    },
}

/// Pairs a leader with a follower for one migration's tenants.
pub struct DualWriteBinding {
    migration_id: String,
    range: TenantRange,
    leader: ShardId,
    follower: ShardConnection,
    writes: AtomicU64,
    mirrored: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    idle: Notify,
    /// table -> (lowest, highest) id upserted on the follower
    touched: Mutex<BTreeMap<String, (i64, i64)>>,
    failures: Mutex<Vec<MirrorFailure>>,
}

impl DualWriteBinding {
    pub fn new(
        migration_id: impl Into<String>,
        range: TenantRange,
        leader: ShardId,
        follower: ShardConnection,
    ) -> Self {
        Self {
            migration_id: migration_id.into(),
            range,
            leader,
            follower,
            writes: AtomicU64::new(0),
            mirrored: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            idle: Notify::new(),
            touched: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    fn matches(&self, shard_id: ShardId, tenant: &TenantKey) -> bool {
        self.leader == shard_id && self.range.contains(tenant)
    }

    pub fn stats(&self) -> DualWriteStats {
        DualWriteStats {
            migration_id: self.migration_id.clone(),
            leader: self.leader,
            follower: self.follower.shard_id(),
            writes: self.writes.load(Ordering::SeqCst),
            mirrored: self.mirrored.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            unreconciled: self.failures.lock().map(|f| f.len() as u64).unwrap_or(0),
        }
    }

    /// Drains the mirrors that failed since the last call.
    pub fn take_failures(&self) -> Vec<MirrorFailure> {
        self.failures
            .lock()
            .map(|mut failures| std::mem::take(&mut *failures))
            .unwrap_or_default()
    }

    fn record_failure(&self, failure: MirrorFailure) {
        match self.failures.lock() {
            Ok(mut failures) => failures.push(failure),
            Err(_) => warn!(
                migration_id = %self.migration_id,
                ?failure,
                "lost mirror failure record"
            ),
        }
    }

    /// Id ranges the follower received through mirroring, per table.
    pub fn touched_ranges(&self) -> BTreeMap<String, (i64, i64)> {
        self.touched
            .lock()
            .map(|touched| touched.clone())
            .unwrap_or_default()
    }

    fn touch(&self, table: &str, id: i64) {
        if let Ok(mut touched) = self.touched.lock() {
            touched
                .entry(table.to_string())
                .and_modify(|(lo, hi)| {
                    *lo = (*lo).min(id);
                    *hi = (*hi).max(id);
                })
                .or_insert((id, id));
        }
    }

    /// Waits until no mirror is outstanding, up to `timeout`. Returns false
    /// on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    fn mirror(self: &Arc<Self>, op: MirrorOp) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if let MirrorOp::Upsert { table, row } = &op {
            self.touch(table, row.id);
        }

        let binding = Arc::clone(self);
        tokio::spawn(async move {
            // Mirrors go through the conflict-aware insert so they never
            // overwrite a newer version the copy already placed.
            let (failure, result) = match op {
                MirrorOp::Upsert { table, row } => {
                    let result = binding
                        .follower
                        .insert_rows(&table, std::slice::from_ref(&row))
                        .await
                        .map(|_| ());
                    (MirrorFailure::Upsert { table, id: row.id }, result)
                }
                MirrorOp::Delete { table, id, deleted_at } => {
                    let result = binding.follower.delete_row(&table, id).await.map(|_| ());
                    (MirrorFailure::Delete { table, id, deleted_at }, result)
                }
            };
            match result {
                Ok(()) => {
                    binding.mirrored.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    binding.failed.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        migration_id = %binding.migration_id,
                        follower = binding.follower.shard_id(),
                        failure = ?failure,
                        error = %err,
                        "dual-write to follower failed"
                    );
                    binding.record_failure(failure);
                }
            }
            binding.in_flight.fetch_sub(1, Ordering::SeqCst);
            binding.idle.notify_waiters();
        });
    }
}

enum MirrorOp {
    Upsert {
        table: String,
        row: Row,
    },
    Delete {
        table: String,
        id: i64,
        deleted_at: DateTime<Utc>,
    },
}

/// Routes tenant writes and mirrors them for migrations in flight.
pub struct DualWriteCoordinator {
    router: Arc<ShardRouter>,
    monitor: Option<Arc<HealthMonitor>>,
    bindings: RwLock<HashMap<String, Arc<DualWriteBinding>>>,
}

impl DualWriteCoordinator {
    pub fn new(router: Arc<ShardRouter>, monitor: Option<Arc<HealthMonitor>>) -> Self {
        Self {
            router,
            monitor,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    pub fn attach(&self, binding: DualWriteBinding) -> Result<Arc<DualWriteBinding>> {
        let mut bindings = self.bindings.write()?;
        if bindings.contains_key(&binding.migration_id) {
            return Err(ShardError::InvalidState(format!(
                "dual-write already attached for migration {}",
                binding.migration_id
            )));
        }
        let binding = Arc::new(binding);
        info!(
            migration_id = %binding.migration_id,
            leader = binding.leader,
            follower = binding.follower.shard_id(),
            tenants = %binding.range,
            "dual-write attached"
        );
        bindings.insert(binding.migration_id.clone(), binding.clone());
        Ok(binding)
    }

    pub fn detach(&self, migration_id: &str) -> Result<Option<Arc<DualWriteBinding>>> {
        let removed = self.bindings.write()?.remove(migration_id);
        if let Some(binding) = &removed {
            info!(migration_id, stats = ?binding.stats(), "dual-write detached");
        }
        Ok(removed)
    }

    /// Applies `repoint` and tears the binding down under one lock, so no
    /// write can resolve to the old leader after the binding is gone.
    pub fn cutover<F>(
        &self,
        migration_id: &str,
        repoint: F,
    ) -> Result<(RoutingChange, Option<Arc<DualWriteBinding>>)>
    where
        F: FnOnce() -> Result<RoutingChange>,
    {
        let mut bindings = self.bindings.write()?;
        let change = repoint()?;
        let removed = bindings.remove(migration_id);
        drop(bindings);
        if let Some(binding) = &removed {
            info!(migration_id, stats = ?binding.stats(), "dual-write detached after cutover");
        }
        Ok((change, removed))
    }

    pub fn binding(&self, migration_id: &str) -> Result<Option<Arc<DualWriteBinding>>> {
        Ok(self.bindings.read()?.get(migration_id).cloned())
    }

    pub fn stats(&self) -> Result<Vec<DualWriteStats>> {
        let mut stats: Vec<DualWriteStats> =
            self.bindings.read()?.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.migration_id.cmp(&b.migration_id));
        Ok(stats)
    }

    /// Shard for `tenant` plus the bindings that must see its writes,
    /// resolved together so a concurrent cutover is observed atomically.
    fn resolve(&self, tenant: &TenantKey) -> Result<(ShardId, Vec<Arc<DualWriteBinding>>)> {
        let bindings = self.bindings.read()?;
        let shard_id = self.router.shard_for(tenant)?;
        let followers = bindings
            .values()
            .filter(|b| b.matches(shard_id, tenant))
            .cloned()
            .collect();
        Ok((shard_id, followers))
    }

    async fn on_leader<T, F>(&self, shard_id: ShardId, query: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match &self.monitor {
            Some(monitor) => monitor.observe(shard_id, query).await,
            None => query.await,
        }
    }

    /// Writes `row` to the tenant's shard, mirroring it to any migration
    /// target. Returns the shard that took the write. A row the shard holds
    /// at the same or a newer version fails with [`ShardError::StaleWrite`]
    /// and is not mirrored.
    pub async fn write(&self, tenant: &TenantKey, table: &str, row: Row) -> Result<ShardId> {
        if &row.tenant != tenant {
            return Err(ShardError::InvalidTenantKey(format!(
                "row {} belongs to tenant {}, not {}",
                row.id, row.tenant, tenant
            )));
        }
        let (shard_id, followers) = self.resolve(tenant)?;
        let conn = self.router.connection_for_shard(shard_id).await?;
        self.on_leader(shard_id, conn.upsert_row(table, &row)).await?;

        for binding in &followers {
            binding.mirror(MirrorOp::Upsert {
                table: table.to_string(),
                row: row.clone(),
            });
        }
        debug!(
            tenant = %tenant,
            shard_id,
            table,
            id = row.id,
            mirrors = followers.len(),
            "write applied"
        );
        Ok(shard_id)
    }

    /// Deletes a row from the tenant's shard, mirroring the delete.
    pub async fn delete(&self, tenant: &TenantKey, table: &str, id: i64) -> Result<bool> {
        let (shard_id, followers) = self.resolve(tenant)?;
        let conn = self.router.connection_for_shard(shard_id).await?;
        if let Some(existing) = self.on_leader(shard_id, conn.get_row(table, id)).await? {
            if &existing.tenant != tenant {
                return Err(ShardError::InvalidTenantKey(format!(
                    "row {} does not belong to tenant {}",
                    id, tenant
                )));
            }
        }
        let deleted = self.on_leader(shard_id, conn.delete_row(table, id)).await?;
        let deleted_at = Utc::now();

        for binding in &followers {
            binding.mirror(MirrorOp::Delete {
                table: table.to_string(),
                id,
                deleted_at,
            });
        }
        Ok(deleted)
    }

    /// Reads a row from the tenant's shard. Rows owned by another tenant are
    /// not visible.
    pub async fn read(&self, tenant: &TenantKey, table: &str, id: i64) -> Result<Option<Row>> {
        let shard_id = self.router.shard_for(tenant)?;
        let conn = self.router.connection_for_shard(shard_id).await?;
        let row = self.on_leader(shard_id, conn.get_row(table, id)).await?;
        Ok(row.filter(|row| &row.tenant == tenant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::{PoolConfig, ShardDescriptor};
    use crate::sharding::ShardRegistry;
    use crate::storage::{MemoryConnector, ShardBackend, ShardConnector};

    async fn setup() -> (Arc<MemoryConnector>, Arc<ShardRouter>, DualWriteCoordinator) {
        let connector = Arc::new(MemoryConnector::new());
        connector.provision(0..2, &["orders"]).await.unwrap();
        let registry = Arc::new(
            ShardRegistry::new(vec![ShardDescriptor::new(0, "a"), ShardDescriptor::new(1, "b")])
                .unwrap(),
        );
        let router =
            Arc::new(ShardRouter::new(registry, connector.clone(), PoolConfig::new()).unwrap());
        let coordinator = DualWriteCoordinator::new(router.clone(), None);
        (connector, router, coordinator)
    }

    async fn follower(connector: &Arc<MemoryConnector>, shard_id: ShardId) -> ShardConnection {
        let descriptor = ShardDescriptor::new(shard_id, "follower");
        let backend = connector.connect(&descriptor).await.unwrap();
        ShardConnection::new(0, shard_id, backend, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn mirrors_writes_for_bound_tenants_only() {
        let (connector, router, coordinator) = setup().await;
        let tenant = TenantKey::parse("tenant-a").unwrap();
        let leader = router.shard_for(&tenant).unwrap();
        let other = 1 - leader;

        let binding = coordinator
            .attach(DualWriteBinding::new(
                "m1",
                TenantRange::keys(["tenant-a"]).unwrap(),
                leader,
                follower(&connector, other).await,
            ))
            .unwrap();

        let shard = coordinator
            .write(&tenant, "orders", Row::new(7, tenant.clone()))
            .await
            .unwrap();
        assert_eq!(shard, leader);
        assert!(binding.wait_idle(Duration::from_secs(1)).await);

        let mirrored = connector.shard(other).unwrap().dump("orders").await.unwrap();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(binding.stats().mirrored, 1);
        assert_eq!(binding.touched_ranges().get("orders"), Some(&(7, 7)));

        coordinator.delete(&tenant, "orders", 7).await.unwrap();
        assert!(binding.wait_idle(Duration::from_secs(1)).await);
        assert!(connector.shard(other).unwrap().dump("orders").await.unwrap().is_empty());
        assert_eq!(binding.stats().writes, 2);
    }

    #[tokio::test]
    async fn follower_failure_does_not_fail_the_write() {
        let (connector, router, coordinator) = setup().await;
        let tenant = TenantKey::parse("tenant-a").unwrap();
        let leader = router.shard_for(&tenant).unwrap();
        let other = 1 - leader;

        let binding = coordinator
            .attach(DualWriteBinding::new(
                "m1",
                TenantRange::All,
                leader,
                follower(&connector, other).await,
            ))
            .unwrap();
        connector.shard(other).unwrap().set_reachable(false);

        coordinator
            .write(&tenant, "orders", Row::new(1, tenant.clone()))
            .await
            .unwrap();
        assert!(binding.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(binding.stats().failed, 1);
        assert_eq!(binding.stats().unreconciled, 1);
        assert_eq!(connector.shard(leader).unwrap().dump("orders").await.unwrap().len(), 1);

        assert_eq!(
            binding.take_failures(),
            vec![MirrorFailure::Upsert {
                table: "orders".to_string(),
                id: 1
            }]
        );
        assert!(binding.take_failures().is_empty());
        assert_eq!(binding.stats().unreconciled, 0);
    }

    #[tokio::test]
    async fn stale_write_is_refused_and_not_mirrored() {
        let (connector, router, coordinator) = setup().await;
        let tenant = TenantKey::parse("tenant-a").unwrap();
        let leader = router.shard_for(&tenant).unwrap();
        let other = 1 - leader;

        let binding = coordinator
            .attach(DualWriteBinding::new(
                "m1",
                TenantRange::All,
                leader,
                follower(&connector, other).await,
            ))
            .unwrap();

        let current = Row::new(1, tenant.clone()).with_field("total_cents", 200i64);
        coordinator.write(&tenant, "orders", current.clone()).await.unwrap();
        let stale = Row::new(1, tenant.clone())
            .with_field("total_cents", 100i64)
            .updated_at(current.updated_at - chrono::Duration::seconds(1));
        assert!(matches!(
            coordinator.write(&tenant, "orders", stale).await,
            Err(ShardError::StaleWrite { id: 1, .. })
        ));
        assert!(binding.wait_idle(Duration::from_secs(1)).await);

        assert_eq!(binding.stats().writes, 1);
        let stored = coordinator.read(&tenant, "orders", 1).await.unwrap();
        assert_eq!(stored, Some(current.clone()));
        let mirrored = connector.shard(other).unwrap().get_row("orders", 1).await.unwrap();
        assert_eq!(mirrored, Some(current));
    }

    #[tokio::test]
    async fn cutover_repoints_then_detaches() {
        let (connector, router, coordinator) = setup().await;
        let tenant = TenantKey::parse("tenant-a").unwrap();
        let leader = router.shard_for(&tenant).unwrap();
        let other = 1 - leader;
        let range = TenantRange::keys(["tenant-a"]).unwrap();

        let binding =
            DualWriteBinding::new("m1", range.clone(), leader, follower(&connector, other).await);
        coordinator.attach(binding).unwrap();
        let duplicate =
            DualWriteBinding::new("m1", range.clone(), leader, follower(&connector, other).await);
        assert!(coordinator.attach(duplicate).is_err());

        let (change, removed) = coordinator
            .cutover("m1", || router.repoint(&range, leader, other))
            .unwrap();
        assert_eq!(change.target, other);
        assert!(removed.is_some());
        assert!(coordinator.stats().unwrap().is_empty());

        let shard = coordinator
            .write(&tenant, "orders", Row::new(3, tenant.clone()))
            .await
            .unwrap();
        assert_eq!(shard, other);
    }

    #[tokio::test]
    async fn rows_of_other_tenants_are_rejected() {
        let (_, _, coordinator) = setup().await;
        let tenant = TenantKey::parse("tenant-a").unwrap();
        let stranger = TenantKey::parse("tenant-b").unwrap();
        assert!(coordinator
            .write(&tenant, "orders", Row::new(1, stranger))
            .await
            .is_err());
    }
}
