use super::store::RoutingSnapshot;
use crate::connection::config::ShardDescriptor;
use crate::core::{Result, ShardError, ShardId};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// The set of known shards.
///
/// Shards from configuration must be numbered `0..N`; their count fixes the
/// number of hash buckets. Shards added later are addressable by id (for
/// migrations and overrides) but never enlarge the bucket count, so adding
/// capacity does not silently move tenants whose data has not been copied.
#[derive(Debug)]
pub struct ShardRegistry {
    shards: RwLock<BTreeMap<ShardId, Arc<ShardDescriptor>>>,
    hash_buckets: u32,
}

impl ShardRegistry {
    pub fn new(descriptors: Vec<ShardDescriptor>) -> Result<Self> {
        let shards = Self::collect(descriptors)?;
        let count = shards.len() as u32;
        if let Some((&max_id, _)) = shards.last_key_value() {
            if max_id != count - 1 {
                return Err(ShardError::Config(format!(
                    "configured shard ids must be 0..{} without gaps",
                    count
                )));
            }
        }
        Self::with_buckets(shards, count)
    }

    /// Rebuilds the registry a previous run left behind: the bucket count
    /// comes from `snapshot`, and configured shards beyond it count as added
    /// shards. A configured descriptor wins over a persisted one with the
    /// same id, since only configuration carries credentials.
    pub fn restore(
        configured: Vec<ShardDescriptor>,
        snapshot: &RoutingSnapshot,
    ) -> Result<Self> {
        let mut shards = Self::collect(configured)?;
        for descriptor in &snapshot.added_shards {
            if !shards.contains_key(&descriptor.id) {
                descriptor.validate()?;
                shards.insert(descriptor.id, Arc::new(descriptor.clone()));
            }
        }
        Self::with_buckets(shards, snapshot.hash_buckets)
    }

    fn collect(
        descriptors: Vec<ShardDescriptor>,
    ) -> Result<BTreeMap<ShardId, Arc<ShardDescriptor>>> {
        if descriptors.is_empty() {
            return Err(ShardError::Config(
                "at least one shard must be configured".to_string(),
            ));
        }

        let mut shards = BTreeMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            let id = descriptor.id;
            if shards.insert(id, Arc::new(descriptor)).is_some() {
                return Err(ShardError::Config(format!("duplicate shard id {}", id)));
            }
        }
        Ok(shards)
    }

    fn with_buckets(
        shards: BTreeMap<ShardId, Arc<ShardDescriptor>>,
        hash_buckets: u32,
    ) -> Result<Self> {
        if hash_buckets == 0 {
            return Err(ShardError::Config(
                "hash bucket count must be > 0".to_string(),
            ));
        }
        if let Some(missing) = (0..hash_buckets).find(|id| !shards.contains_key(id)) {
            return Err(ShardError::Config(format!(
                "shard {} is missing; tenants hash over shards 0..{}",
                missing, hash_buckets
            )));
        }
        Ok(Self {
            shards: RwLock::new(shards),
            hash_buckets,
        })
    }

    /// Number of jump-hash buckets, fixed at construction.
    pub fn hash_buckets(&self) -> u32 {
        self.hash_buckets
    }

    pub fn get(&self, shard_id: ShardId) -> Result<Arc<ShardDescriptor>> {
        self.shards
            .read()?
            .get(&shard_id)
            .cloned()
            .ok_or(ShardError::UnknownShard(shard_id))
    }

    pub fn contains(&self, shard_id: ShardId) -> bool {
        self.shards
            .read()
            .map(|shards| shards.contains_key(&shard_id))
            .unwrap_or(false)
    }

    /// All descriptors ordered by id.
    pub fn all(&self) -> Result<Vec<Arc<ShardDescriptor>>> {
        Ok(self.shards.read()?.values().cloned().collect())
    }

    pub fn ids(&self) -> Result<Vec<ShardId>> {
        Ok(self.shards.read()?.keys().copied().collect())
    }

    pub fn len(&self) -> usize {
        self.shards.read().map(|shards| shards.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Administrative "add shard": registers a new, empty shard.
    pub fn add_shard(&self, descriptor: ShardDescriptor) -> Result<Arc<ShardDescriptor>> {
        descriptor.validate()?;
        let mut shards = self.shards.write()?;
        if shards.contains_key(&descriptor.id) {
            return Err(ShardError::Config(format!(
                "shard {} is already registered",
                descriptor.id
            )));
        }
        let descriptor = Arc::new(descriptor);
        shards.insert(descriptor.id, descriptor.clone());
        info!(shard_id = descriptor.id, address = %descriptor.address(), "shard registered");
        Ok(descriptor)
    }

    /// Shards registered beyond the hash buckets, ordered by id.
    pub fn added(&self) -> Result<Vec<Arc<ShardDescriptor>>> {
        Ok(self
            .shards
            .read()?
            .range(self.hash_buckets..)
            .map(|(_, descriptor)| descriptor.clone())
            .collect())
    }

    /// Undoes [`ShardRegistry::add_shard`]. Hash bucket shards are never
    /// removed.
    pub(crate) fn forget(&self, shard_id: ShardId) -> Result<()> {
        if shard_id < self.hash_buckets {
            return Err(ShardError::InvalidState(format!(
                "shard {} is a hash bucket and cannot be removed",
                shard_id
            )));
        }
        self.shards.write()?.remove(&shard_id);
        Ok(())
    }

    /// Swaps the descriptor of an existing shard, e.g. when its host is
    /// decommissioned. Returns the previous descriptor.
    pub fn replace(&self, descriptor: ShardDescriptor) -> Result<Arc<ShardDescriptor>> {
        descriptor.validate()?;
        let mut shards = self.shards.write()?;
        let Some(previous) = shards.get(&descriptor.id).cloned() else {
            return Err(ShardError::UnknownShard(descriptor.id));
        };
        info!(
            shard_id = descriptor.id,
            from = %previous.address(),
            to = %descriptor.address(),
            "shard descriptor replaced"
        );
        shards.insert(descriptor.id, Arc::new(descriptor));
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(ids: &[ShardId]) -> Vec<ShardDescriptor> {
        ids.iter()
            .map(|id| ShardDescriptor::new(*id, &format!("db-{id}")))
            .collect()
    }

    #[test]
    fn rejects_empty_duplicate_and_gapped_sets() {
        assert!(matches!(ShardRegistry::new(vec![]), Err(ShardError::Config(_))));
        assert!(ShardRegistry::new(shards(&[0, 0])).is_err());
        assert!(ShardRegistry::new(shards(&[0, 2])).is_err());
        assert!(ShardRegistry::new(shards(&[1, 2])).is_err());
    }

    #[test]
    fn added_shards_do_not_change_bucket_count() {
        let registry = ShardRegistry::new(shards(&[0, 1, 2, 3])).unwrap();
        registry.add_shard(ShardDescriptor::new(4, "db-4")).unwrap();

        assert_eq!(registry.hash_buckets(), 4);
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.ids().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(registry.add_shard(ShardDescriptor::new(4, "other")).is_err());
    }

    #[test]
    fn restore_keeps_the_persisted_bucket_count() {
        let snapshot = RoutingSnapshot {
            hash_buckets: 4,
            table: Default::default(),
            added_shards: vec![ShardDescriptor::new(4, "db-4-persisted")],
            saved_at: chrono::Utc::now(),
        };

        let registry = ShardRegistry::restore(shards(&[0, 1, 2, 3]), &snapshot).unwrap();
        assert_eq!(registry.hash_buckets(), 4);
        assert_eq!(registry.get(4).unwrap().host, "db-4-persisted");

        // Listing the added shard in configuration does not enlarge the hash.
        let registry = ShardRegistry::restore(shards(&[0, 1, 2, 3, 4]), &snapshot).unwrap();
        assert_eq!(registry.hash_buckets(), 4);
        assert_eq!(registry.get(4).unwrap().host, "db-4");
        let added: Vec<ShardId> = registry.added().unwrap().iter().map(|d| d.id).collect();
        assert_eq!(added, vec![4]);

        // Dropping a bucket shard from configuration is refused.
        assert!(matches!(
            ShardRegistry::restore(shards(&[0, 1, 2]), &snapshot),
            Err(ShardError::Config(_))
        ));
    }

    #[test]
    fn only_added_shards_can_be_forgotten() {
        let registry = ShardRegistry::new(shards(&[0, 1])).unwrap();
        registry.add_shard(ShardDescriptor::new(2, "db-2")).unwrap();
        registry.forget(2).unwrap();
        assert!(!registry.contains(2));
        assert!(registry.forget(1).is_err());
    }

    #[test]
    fn replace_requires_existing_shard() {
        let registry = ShardRegistry::new(shards(&[0])).unwrap();
        let previous = registry.replace(ShardDescriptor::new(0, "db-0-new")).unwrap();
        assert_eq!(previous.host, "db-0");
        assert_eq!(registry.get(0).unwrap().host, "db-0-new");

        assert!(matches!(
            registry.replace(ShardDescriptor::new(7, "x")),
            Err(ShardError::UnknownShard(7))
        ));
    }
}
