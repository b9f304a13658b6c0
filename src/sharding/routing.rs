use super::hash::bucket_for;
use crate::core::{Result, ShardError, ShardId, TenantKey, TenantRange};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Routing state layered over the hash: explicit per-tenant overrides and
/// whole-shard redirects written by migration cutovers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Bumped on every repoint.
    pub epoch: u64,
    pub overrides: HashMap<TenantKey, ShardId>,
    pub redirects: BTreeMap<ShardId, ShardId>,
}

/// Result of a repoint, recorded in the migration job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingChange {
    pub epoch: u64,
    pub source: ShardId,
    pub target: ShardId,
    pub tenants: String,
}

impl RoutingTable {
    /// Shard for `tenant` given the hash bucket count.
    ///
    /// Overrides win over the hash; the result then follows redirects.
    pub fn shard_for(&self, tenant: &TenantKey, buckets: u32) -> ShardId {
        let shard = match self.overrides.get(tenant) {
            Some(shard) => *shard,
            None => bucket_for(tenant.as_str(), buckets),
        };
        self.follow_redirects(shard)
    }

    fn follow_redirects(&self, mut shard: ShardId) -> ShardId {
        // Redirects are collapsed on write; the hop limit only guards
        // against a hand-edited cycle.
        for _ in 0..=self.redirects.len() {
            match self.redirects.get(&shard) {
                Some(next) => shard = *next,
                None => break,
            }
        }
        shard
    }

    pub fn is_drained(&self, shard: ShardId) -> bool {
        self.redirects.contains_key(&shard)
    }

    /// Points `range` (currently served by `source`) at `target`.
    pub fn repoint(
        &mut self,
        range: &TenantRange,
        source: ShardId,
        target: ShardId,
    ) -> Result<RoutingChange> {
        if source == target {
            return Err(ShardError::InvalidState(
                "source and target shard must differ".to_string(),
            ));
        }
        if self.is_drained(target) {
            return Err(ShardError::InvalidState(format!(
                "shard {} has been drained and cannot receive tenants",
                target
            )));
        }

        match range {
            TenantRange::Keys(keys) => {
                for key in keys {
                    self.overrides.insert(key.clone(), target);
                }
            }
            TenantRange::All => {
                self.redirects.insert(source, target);
                for next in self.redirects.values_mut() {
                    if *next == source {
                        *next = target;
                    }
                }
                for shard in self.overrides.values_mut() {
                    if *shard == source {
                        *shard = target;
                    }
                }
            }
        }

        self.epoch += 1;
        Ok(RoutingChange {
            epoch: self.epoch,
            source,
            target,
            tenants: range.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> TenantKey {
        TenantKey::parse(raw).unwrap()
    }

    fn key_on(shard: ShardId, buckets: u32) -> TenantKey {
        (0..)
            .map(|i| key(&format!("tenant-{i}")))
            .find(|k| bucket_for(k.as_str(), buckets) == shard)
            .unwrap()
    }

    #[test]
    fn override_wins_over_hash() {
        let mut table = RoutingTable::default();
        let tenant = key_on(1, 4);
        assert_eq!(table.shard_for(&tenant, 4), 1);

        let change = table
            .repoint(&TenantRange::Keys([tenant.clone()].into()), 1, 4)
            .unwrap();
        assert_eq!(change.epoch, 1);
        assert_eq!(table.shard_for(&tenant, 4), 4);
    }

    #[test]
    fn whole_shard_redirect_moves_only_that_shard() {
        let mut table = RoutingTable::default();
        let moved = key_on(0, 4);
        let stays = key_on(2, 4);

        table.repoint(&TenantRange::All, 0, 4).unwrap();
        assert_eq!(table.shard_for(&moved, 4), 4);
        assert_eq!(table.shard_for(&stays, 4), 2);
    }

    #[test]
    fn chained_redirects_are_collapsed() {
        let mut table = RoutingTable::default();
        let tenant = key_on(0, 4);
        let pinned = key_on(3, 4);
        table
            .repoint(&TenantRange::Keys([pinned.clone()].into()), 3, 4)
            .unwrap();

        table.repoint(&TenantRange::All, 0, 4).unwrap();
        table.repoint(&TenantRange::All, 4, 5).unwrap();

        assert_eq!(table.redirects.get(&0), Some(&5));
        assert_eq!(table.shard_for(&tenant, 4), 5);
        assert_eq!(table.shard_for(&pinned, 4), 5);
        assert_eq!(table.epoch, 3);
    }

    #[test]
    fn drained_shard_cannot_be_a_target() {
        let mut table = RoutingTable::default();
        table.repoint(&TenantRange::All, 0, 4).unwrap();
        assert!(table.repoint(&TenantRange::All, 1, 0).is_err());
        assert!(table.repoint(&TenantRange::All, 1, 1).is_err());
    }
}
