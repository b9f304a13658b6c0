use crate::core::{Result, ShardError, validate_identifier};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Order in which a migration copies tables: every table after the tables
/// it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TablePlan {
    order: Vec<String>,
}

impl TablePlan {
    /// Orders `tables` so parents precede children.
    ///
    /// Ties keep the listed order. Parents that are not in `tables` are
    /// ignored, since they are not migrated. A cycle is a configuration error.
    pub fn resolve(
        tables: &[String],
        dependencies: &BTreeMap<String, Vec<String>>,
    ) -> Result<Self> {
        if tables.is_empty() {
            return Err(ShardError::Config(
                "migration needs at least one table".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for table in tables {
            validate_identifier(table)?;
            if !seen.insert(table.as_str()) {
                return Err(ShardError::Config(format!(
                    "table '{}' listed twice",
                    table
                )));
            }
        }

        let parents_of = |table: &str| -> Vec<&str> {
            dependencies
                .get(table)
                .map(|parents| {
                    parents
                        .iter()
                        .map(String::as_str)
                        .filter(|p| *p != table && seen.contains(p))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut placed: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(tables.len());
        while order.len() < tables.len() {
            let next = tables.iter().find(|t| {
                !placed.contains(t.as_str())
                    && parents_of(t).iter().all(|p| placed.contains(p))
            });
            match next {
                Some(table) => {
                    placed.insert(table.as_str());
                    order.push(table.clone());
                }
                None => {
                    let stuck: Vec<&str> = tables
                        .iter()
                        .map(String::as_str)
                        .filter(|t| !placed.contains(t))
                        .collect();
                    return Err(ShardError::Config(format!(
                        "table dependencies form a cycle among: {}",
                        stuck.join(", ")
                    )));
                }
            }
        }

        Ok(Self { order })
    }

    /// Parents first.
    pub fn tables(&self) -> &[String] {
        &self.order
    }

    /// Children first, the safe order for deletes.
    pub fn reversed(&self) -> impl Iterator<Item = &String> {
        self.order.iter().rev()
    }
}
