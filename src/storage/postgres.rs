//! PostgreSQL shards.
//!
//! Sharded tables follow one convention: `id BIGINT PRIMARY KEY`,
//! `tenant_id TEXT` and `updated_at TIMESTAMPTZ`, plus any other columns.
//! Rows travel as JSON documents (`to_jsonb` out, `jsonb_populate_recordset`
//! in), so no per-table column mapping lives in this crate.

use super::engine::{ShardBackend, ShardConnector, ShardStats};
use crate::connection::config::ShardDescriptor;
use crate::core::{Result, Row, ShardError, ShardId, TenantRange, validate_identifier};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

/// Opens one `tokio_postgres` client per connection.
pub struct PgConnector {
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ShardConnector for PgConnector {
    async fn connect(&self, descriptor: &ShardDescriptor) -> Result<Arc<dyn ShardBackend>> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&descriptor.host)
            .port(descriptor.port)
            .user(&descriptor.username)
            .dbname(&descriptor.database)
            .connect_timeout(self.connect_timeout);
        if !descriptor.password.is_empty() {
            config.password(&descriptor.password);
        }

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| ShardError::unavailable(descriptor.id, e.to_string()))?;

        let shard_id = descriptor.id;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(shard_id, error = %e, "postgres connection closed with error");
            }
        });

        debug!(shard_id, address = %descriptor.address(), "connected to postgres shard");
        Ok(Arc::new(PgShard::new(shard_id, client)))
    }
}

pub struct PgShard {
    shard_id: ShardId,
    client: Client,
    /// Column lists per table, needed to build `ON CONFLICT DO UPDATE`.
    columns: Mutex<HashMap<String, Arc<Vec<String>>>>,
}

impl PgShard {
    pub fn new(shard_id: ShardId, client: Client) -> Self {
        Self {
            shard_id,
            client,
            columns: Mutex::new(HashMap::new()),
        }
    }

    fn map_err(&self, table: Option<&str>, err: tokio_postgres::Error) -> ShardError {
        if err.is_closed() {
            return ShardError::unavailable(self.shard_id, err.to_string());
        }
        if let (Some(table), Some(&SqlState::UNDEFINED_TABLE)) = (table, err.code()) {
            return ShardError::TableNotFound(table.to_string());
        }
        ShardError::Backend(format!("shard {}: {}", self.shard_id, err))
    }

    async fn table_columns(&self, table: &str) -> Result<Arc<Vec<String>>> {
        let cached = self.columns.lock()?.get(table).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let rows = self
            .client
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .map_err(|e| self.map_err(Some(table), e))?;
        if rows.is_empty() {
            return Err(ShardError::TableNotFound(table.to_string()));
        }

        let columns: Arc<Vec<String>> =
            Arc::new(rows.iter().map(|row| row.get::<_, String>(0)).collect());
        self.columns
            .lock()?
            .insert(table.to_string(), columns.clone());
        Ok(columns)
    }

    async fn query_documents(
        &self,
        table: &str,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        let rows = self
            .client
            .query(sql, params)
            .await
            .map_err(|e| self.map_err(Some(table), e))?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get(0);
                let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
                    .map_err(|e| ShardError::Backend(format!("decode row from {}: {}", table, e)))?;
                Row::from_document(doc)
            })
            .collect()
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn tenant_keys(range: &TenantRange) -> Option<Vec<String>> {
    match range {
        TenantRange::All => None,
        TenantRange::Keys(keys) => Some(keys.iter().map(|k| k.as_str().to_string()).collect()),
    }
}

#[async_trait]
impl ShardBackend for PgShard {
    async fn ping(&self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| self.map_err(None, e))?;
        Ok(())
    }

    async fn stats(&self, tables: &[String]) -> Result<ShardStats> {
        let size: i64 = self
            .client
            .query_one("SELECT pg_database_size(current_database())", &[])
            .await
            .map_err(|e| self.map_err(None, e))?
            .get(0);

        let mut record_count = 0u64;
        for table in tables {
            validate_identifier(table)?;
            let count: i64 = self
                .client
                .query_one(&format!("SELECT count(*) FROM {}", table), &[])
                .await
                .map_err(|e| self.map_err(Some(table), e))?
                .get(0);
            record_count += count.max(0) as u64;
        }

        Ok(ShardStats {
            database_size_bytes: size.max(0) as u64,
            record_count,
        })
    }

    async fn count_rows(&self, table: &str, range: &TenantRange) -> Result<u64> {
        validate_identifier(table)?;
        let row = match tenant_keys(range) {
            None => {
                self.client
                    .query_one(&format!("SELECT count(*) FROM {}", table), &[])
                    .await
            }
            Some(keys) => {
                self.client
                    .query_one(
                        &format!("SELECT count(*) FROM {} WHERE tenant_id = ANY($1)", table),
                        &[&keys],
                    )
                    .await
            }
        }
        .map_err(|e| self.map_err(Some(table), e))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn read_batch(
        &self,
        table: &str,
        range: &TenantRange,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        validate_identifier(table)?;
        let after = after_id.unwrap_or(i64::MIN);
        let limit = limit.min(i64::MAX as usize) as i64;
        match tenant_keys(range) {
            None => {
                let sql = format!(
                    "SELECT to_jsonb(t)::text FROM {} t WHERE id > $1 ORDER BY id LIMIT $2",
                    table
                );
                self.query_documents(table, &sql, &[&after, &limit]).await
            }
            Some(keys) => {
                let sql = format!(
                    "SELECT to_jsonb(t)::text FROM {} t \
                     WHERE id > $1 AND tenant_id = ANY($3) ORDER BY id LIMIT $2",
                    table
                );
                self.query_documents(table, &sql, &[&after, &limit, &keys])
                    .await
            }
        }
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        validate_identifier(table)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let columns = self.table_columns(table).await?;
        let assignments = columns
            .iter()
            .filter(|c| c.as_str() != "id")
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let docs = rows
            .iter()
            .map(|row| row.to_document().map(serde_json::Value::Object))
            .collect::<Result<Vec<_>>>()?;
        let payload = serde_json::Value::Array(docs).to_string();

        let sql = format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1::text::jsonb) \
             ON CONFLICT (id) DO UPDATE SET {assignments} \
             WHERE {table}.updated_at < EXCLUDED.updated_at"
        );
        let written = self
            .client
            .execute(&sql, &[&payload])
            .await
            .map_err(|e| self.map_err(Some(table), e))?;
        Ok(written)
    }

    async fn delete_range(
        &self,
        table: &str,
        range: &TenantRange,
        first_id: i64,
        last_id: i64,
    ) -> Result<u64> {
        validate_identifier(table)?;
        match tenant_keys(range) {
            None => {
                self.client
                    .execute(
                        &format!("DELETE FROM {} WHERE id BETWEEN $1 AND $2", table),
                        &[&first_id, &last_id],
                    )
                    .await
            }
            Some(keys) => {
                self.client
                    .execute(
                        &format!(
                            "DELETE FROM {} WHERE id BETWEEN $1 AND $2 AND tenant_id = ANY($3)",
                            table
                        ),
                        &[&first_id, &last_id, &keys],
                    )
                    .await
            }
        }
        .map_err(|e| self.map_err(Some(table), e))
    }

    async fn get_row(&self, table: &str, id: i64) -> Result<Option<Row>> {
        validate_identifier(table)?;
        let sql = format!("SELECT to_jsonb(t)::text FROM {} t WHERE id = $1", table);
        let mut rows = self.query_documents(table, &sql, &[&id]).await?;
        Ok(rows.pop())
    }

    async fn delete_row(&self, table: &str, id: i64) -> Result<bool> {
        validate_identifier(table)?;
        let deleted = self
            .client
            .execute(&format!("DELETE FROM {} WHERE id = $1", table), &[&id])
            .await
            .map_err(|e| self.map_err(Some(table), e))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("total"), "\"total\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn all_range_has_no_key_filter() {
        assert!(tenant_keys(&TenantRange::All).is_none());
        let keys = tenant_keys(&TenantRange::keys(["b", "a"]).unwrap()).unwrap();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
