use super::{Result, ShardError, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Numeric shard identifier. Shards created from configuration are numbered
/// `0..N` so that they line up with jump-hash buckets.
pub type ShardId = u32;

const MAX_TENANT_KEY_LEN: usize = 128;

/// Opaque tenant identifier (a restaurant id, for example).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantKey(String);

impl TenantKey {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            return Err(ShardError::InvalidTenantKey(
                "tenant key must not be empty".to_string(),
            ));
        }
        if raw.len() > MAX_TENANT_KEY_LEN {
            return Err(ShardError::InvalidTenantKey(format!(
                "tenant key exceeds {} bytes",
                MAX_TENANT_KEY_LEN
            )));
        }
        if raw.chars().any(char::is_control) {
            return Err(ShardError::InvalidTenantKey(
                "tenant key must not contain control characters".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantKey {
    type Error = ShardError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<TenantKey> for String {
    fn from(value: TenantKey) -> Self {
        value.0
    }
}

/// The set of tenants a migration moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "keys", rename_all = "snake_case")]
pub enum TenantRange {
    /// Every tenant whose rows live on the source shard.
    All,
    /// An explicit set of tenants.
    Keys(BTreeSet<TenantKey>),
}

impl TenantRange {
    pub fn keys<I, K>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys = keys
            .into_iter()
            .map(TenantKey::parse)
            .collect::<Result<BTreeSet<_>>>()?;
        if keys.is_empty() {
            return Err(ShardError::InvalidTenantKey(
                "tenant range must name at least one tenant".to_string(),
            ));
        }
        Ok(Self::Keys(keys))
    }

    pub fn contains(&self, tenant: &TenantKey) -> bool {
        match self {
            Self::All => true,
            Self::Keys(keys) => keys.contains(tenant),
        }
    }

    pub fn overlaps(&self, other: &TenantRange) -> bool {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => true,
            (Self::Keys(a), Self::Keys(b)) => a.intersection(b).next().is_some(),
        }
    }
}

impl fmt::Display for TenantRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all tenants"),
            Self::Keys(keys) => write!(f, "{} tenant(s)", keys.len()),
        }
    }
}

/// One tenant-scoped row. Every sharded table carries a numeric primary key,
/// the owning tenant and a modification timestamp; the rest is free-form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: i64,
    pub tenant: TenantKey,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(id: i64, tenant: TenantKey) -> Self {
        Self {
            id,
            tenant,
            updated_at: Utc::now(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    pub fn estimated_bytes(&self) -> usize {
        let fields: usize = self
            .fields
            .iter()
            .map(|(name, value)| name.len() + value.estimated_bytes())
            .sum();
        8 + self.tenant.as_str().len() + 12 + fields
    }

    /// Flat JSON document with `id`, `tenant_id` and `updated_at` beside the
    /// data columns, the shape relational backends read and write.
    pub fn to_document(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut doc = serde_json::Map::new();
        for (name, value) in &self.fields {
            let json = serde_json::to_value(value)
                .map_err(|e| ShardError::Backend(format!("encode column '{}': {}", name, e)))?;
            doc.insert(name.clone(), json);
        }
        doc.insert("id".to_string(), self.id.into());
        doc.insert("tenant_id".to_string(), self.tenant.as_str().into());
        doc.insert(
            "updated_at".to_string(),
            self.updated_at.to_rfc3339().into(),
        );
        Ok(doc)
    }

    pub fn from_document(mut doc: serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let id = doc
            .remove("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ShardError::Backend("row is missing integer 'id'".to_string()))?;
        let tenant = doc
            .remove("tenant_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| ShardError::Backend(format!("row {} is missing 'tenant_id'", id)))?;
        let updated_at = match doc.remove("updated_at") {
            Some(serde_json::Value::String(raw)) => DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| ShardError::Backend(format!("row {} updated_at: {}", id, e)))?,
            _ => {
                return Err(ShardError::Backend(format!(
                    "row {} is missing 'updated_at'",
                    id
                )));
            }
        };

        let mut fields = BTreeMap::new();
        for (name, json) in doc {
            let value = serde_json::from_value(json)
                .map_err(|e| ShardError::Backend(format!("decode column '{}': {}", name, e)))?;
            fields.insert(name, value);
        }

        Ok(Self {
            id,
            tenant: TenantKey::parse(tenant)?,
            updated_at,
            fields,
        })
    }
}

/// Rejects anything but `[A-Za-z_][A-Za-z0-9_]*`, so table names can be
/// interpolated into SQL text.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') || name.len() > 63 {
        return Err(ShardError::Config(format!(
            "'{}' is not a valid table identifier",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_key_is_trimmed_and_validated() {
        assert_eq!(TenantKey::parse("  rest-42 ").unwrap().as_str(), "rest-42");
        assert!(TenantKey::parse("   ").is_err());
        assert!(TenantKey::parse("a\nb").is_err());
        assert!(TenantKey::parse("x".repeat(129)).is_err());
    }

    #[test]
    fn tenant_key_deserialization_validates() {
        let ok: TenantKey = serde_json::from_str("\"rest-1\"").unwrap();
        assert_eq!(ok.as_str(), "rest-1");
        assert!(serde_json::from_str::<TenantKey>("\"\"").is_err());
    }

    #[test]
    fn tenant_range_membership() {
        let range = TenantRange::keys(["a", "b"]).unwrap();
        assert!(range.contains(&TenantKey::parse("a").unwrap()));
        assert!(!range.contains(&TenantKey::parse("c").unwrap()));
        assert!(TenantRange::All.contains(&TenantKey::parse("c").unwrap()));
        assert!(TenantRange::keys(Vec::<&str>::new()).is_err());

        let other = TenantRange::keys(["b", "z"]).unwrap();
        assert!(range.overlaps(&other));
        assert!(!range.overlaps(&TenantRange::keys(["q"]).unwrap()));
    }

    #[test]
    fn row_document_round_trip_keeps_key_columns() {
        let row = Row::new(7, TenantKey::parse("rest-1").unwrap())
            .with_field("total", 1250i64)
            .with_field("note", "no onions");

        let doc = row.to_document().unwrap();
        assert_eq!(doc["id"], serde_json::json!(7));
        assert_eq!(doc["tenant_id"], serde_json::json!("rest-1"));

        let back = Row::from_document(doc).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn identifiers_are_restricted() {
        assert!(validate_identifier("order_items").is_ok());
        assert!(validate_identifier("_tmp2").is_ok());
        assert!(validate_identifier("1orders").is_err());
        assert!(validate_identifier("orders; drop table x").is_err());
        assert!(validate_identifier("").is_err());
    }
}
