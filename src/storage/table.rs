use crate::core::{Row, TenantRange};
use std::collections::BTreeMap;
use std::ops::Bound;

/// In-memory table: rows ordered by primary key.
#[derive(Debug, Default)]
pub struct Table {
    name: String,
    rows: BTreeMap<i64, Row>,
    bytes: usize,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: BTreeMap::new(),
            bytes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.bytes
    }

    pub fn count(&self, range: &TenantRange) -> u64 {
        match range {
            TenantRange::All => self.rows.len() as u64,
            _ => self
                .rows
                .values()
                .filter(|row| range.contains(&row.tenant))
                .count() as u64,
        }
    }

    pub fn scan_after(&self, range: &TenantRange, after_id: Option<i64>, limit: usize) -> Vec<Row> {
        let lower = match after_id {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        self.rows
            .range((lower, Bound::Unbounded))
            .map(|(_, row)| row)
            .filter(|row| range.contains(&row.tenant))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: i64) -> Option<&Row> {
        self.rows.get(&id)
    }

    /// Last-write-wins insert. Returns true if the row was stored.
    pub fn upsert(&mut self, row: Row) -> bool {
        if let Some(existing) = self.rows.get(&row.id) {
            if existing.updated_at >= row.updated_at {
                return false;
            }
        }
        self.bytes += row.estimated_bytes();
        if let Some(previous) = self.rows.insert(row.id, row) {
            self.bytes = self.bytes.saturating_sub(previous.estimated_bytes());
        }
        true
    }

    pub fn remove(&mut self, id: i64) -> bool {
        match self.rows.remove(&id) {
            Some(row) => {
                self.bytes = self.bytes.saturating_sub(row.estimated_bytes());
                true
            }
            None => false,
        }
    }

    pub fn remove_range(&mut self, range: &TenantRange, first_id: i64, last_id: i64) -> u64 {
        if first_id > last_id {
            return 0;
        }
        let doomed: Vec<i64> = self
            .rows
            .range(first_id..=last_id)
            .filter(|(_, row)| range.contains(&row.tenant))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.remove(*id);
        }
        doomed.len() as u64
    }
}
