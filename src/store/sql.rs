// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL store backend.
//!
//! One [`SqlStore`] wraps one relational store (primary or secondary). The
//! coordination core needs exactly two capabilities from it:
//!
//! 1. **Transactional execution** - run a caller-supplied unit of work
//!    atomically ([`SqlStore::in_transaction`]).
//! 2. **Point-identity record CRUD** - parameterized statements keyed by
//!    `(entity_type, entity_id)`, used by the recovery worker and the
//!    consistency verifier ([`insert_record`], [`delete_record`],
//!    [`fetch_record_in_tx`] and the pool-level methods).
//!
//! Records live in a single `entity_records` table namespaced by entity type:
//!
//! ```sql
//! CREATE TABLE entity_records (
//!   entity_type VARCHAR(64) NOT NULL,
//!   entity_id BIGINT NOT NULL,
//!   fields LONGTEXT,        -- field map as JSON text (sqlx Any driver limitation)
//!   updated_at BIGINT NOT NULL,
//!   PRIMARY KEY (entity_type, entity_id)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! We use TEXT instead of a native JSON type because sqlx's `Any` driver:
//! 1. Doesn't support MySQL's JSON type mapping
//! 2. Treats LONGTEXT/TEXT as BLOB (requires reading as `Vec<u8>` then converting)
//!
//! JSON functions still work on TEXT columns, so operators can query
//! `JSON_EXTRACT(fields, '$.content')` directly in MySQL.

use sqlx::any::AnyPoolOptions;
use sqlx::{AnyConnection, AnyPool, Row};
use std::sync::Once;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::traits::{StoreError, TxFuture};
use crate::config::DualSyncConfig;
use crate::record::EntityRecord;
use crate::resilience::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if the URL is wrong) and
    /// bootstrap the record schema.
    pub async fn connect(url: &str, config: &DualSyncConfig) -> Result<Self, StoreError> {
        install_drivers();

        let is_sqlite = url.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
                .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
                .connect(url)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool for direct statement execution by
    /// embedding layers.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// Enable WAL journal mode for SQLite (concurrent reads during writes).
    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        // TEXT/LONGTEXT instead of native JSON: the sqlx Any driver has no
        // MySQL JSON mapping. The column still holds valid JSON.
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS entity_records (
                entity_type TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                fields TEXT,
                updated_at INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (entity_type, entity_id)
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS entity_records (
                entity_type VARCHAR(64) NOT NULL,
                entity_id BIGINT NOT NULL,
                fields LONGTEXT,
                updated_at BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (entity_type, entity_id),
                INDEX idx_updated_at (updated_at)
            )
            "#
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;

        Ok(())
    }

    /// Run a caller-supplied unit of work inside one transaction scoped to
    /// this store: BEGIN, run the closure on the transaction connection,
    /// COMMIT on `Ok`, ROLLBACK on `Err`.
    ///
    /// This is the only transaction boundary the coordination core ever
    /// creates - there is no cross-store transaction anywhere.
    pub async fn in_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut AnyConnection) -> TxFuture<'c, T> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match f(&mut *tx).await {
            Ok(val) => {
                tx.commit()
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(val)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Like [`SqlStore::in_transaction`], but threads a borrowed `ctx` value
    /// into the unit of work. The reference is reborrowed to the transaction
    /// scope, so callers can feed data owned outside the transaction (e.g. the
    /// primary write's result) without it needing to be `'static`.
    pub async fn in_transaction_with<T, X, F>(&self, ctx: &X, f: F) -> Result<T, StoreError>
    where
        T: Send,
        X: ?Sized,
        F: for<'c> FnOnce(&'c mut AnyConnection, &'c X) -> TxFuture<'c, T> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match f(&mut *tx, ctx).await {
            Ok(val) => {
                tx.commit()
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(val)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Probe connectivity with `SELECT 1`, returning the round-trip latency.
    pub async fn probe(&self) -> Result<Duration, StoreError> {
        let start = Instant::now();
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(start.elapsed())
    }

    // --- Pool-level record CRUD (delegates to the executor-generic forms) ---

    pub async fn fetch_record(
        &self,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<Option<EntityRecord>, StoreError> {
        fetch_record(&self.pool, entity_type, entity_id).await
    }

    pub async fn insert_record(&self, record: &EntityRecord) -> Result<(), StoreError> {
        insert_record_on(&self.pool, record).await
    }

    /// Delete by identity, returning the number of rows removed (0 is fine,
    /// deletes are idempotent).
    pub async fn delete_record(
        &self,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<u64, StoreError> {
        delete_record_on(&self.pool, entity_type, entity_id).await
    }

    /// All record ids of one entity type, for one-sided diagnostics.
    pub async fn list_ids(&self, entity_type: &str) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query("SELECT entity_id FROM entity_records WHERE entity_type = ? ORDER BY entity_id")
            .bind(entity_type)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<i64, _>("entity_id").ok())
            .collect())
    }

    pub async fn count(&self, entity_type: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM entity_records WHERE entity_type = ?")
            .bind(entity_type)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let n: i64 = row
            .try_get("n")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(n as u64)
    }
}

// --- Executor-generic record operations ---
//
// Each operation runs against anything sqlx can execute on: a pool reference
// for standalone statements, or the `&mut AnyConnection` handed to a
// caller-supplied unit of work inside `in_transaction`.

/// Insert a record inside a caller transaction.
pub async fn insert_record(
    conn: &mut AnyConnection,
    record: &EntityRecord,
) -> Result<(), StoreError> {
    insert_record_on(&mut *conn, record).await
}

/// Delete a record by identity inside a caller transaction. Returns rows removed.
pub async fn delete_record(
    conn: &mut AnyConnection,
    entity_type: &str,
    entity_id: i64,
) -> Result<u64, StoreError> {
    delete_record_on(&mut *conn, entity_type, entity_id).await
}

/// Fetch a record by identity inside a caller transaction.
pub async fn fetch_record_in_tx(
    conn: &mut AnyConnection,
    entity_type: &str,
    entity_id: i64,
) -> Result<Option<EntityRecord>, StoreError> {
    fetch_record(&mut *conn, entity_type, entity_id).await
}

async fn insert_record_on<'e, E>(executor: E, record: &EntityRecord) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let fields_json = serde_json::to_string(&record.fields)
        .map_err(|e| StoreError::Backend(format!("field map serialization failed: {}", e)))?;

    sqlx::query(
        "INSERT INTO entity_records (entity_type, entity_id, fields, updated_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&record.entity_type)
    .bind(record.entity_id)
    .bind(fields_json)
    .bind(epoch_millis())
    .execute(executor)
    .await
    .map_err(|e| StoreError::Backend(e.to_string()))?;

    Ok(())
}

async fn delete_record_on<'e, E>(
    executor: E,
    entity_type: &str,
    entity_id: i64,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let result = sqlx::query("DELETE FROM entity_records WHERE entity_type = ? AND entity_id = ?")
        .bind(entity_type)
        .bind(entity_id)
        .execute(executor)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

    Ok(result.rows_affected())
}

async fn fetch_record<'e, E>(
    executor: E,
    entity_type: &str,
    entity_id: i64,
) -> Result<Option<EntityRecord>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let row = sqlx::query(
        "SELECT fields FROM entity_records WHERE entity_type = ? AND entity_id = ?",
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_optional(executor)
    .await
    .map_err(|e| StoreError::Backend(e.to_string()))?;

    let Some(row) = row else {
        return Ok(None);
    };

    // Try reading as String first (SQLite TEXT), then as bytes (MySQL LONGTEXT)
    let fields_json: Option<String> = row.try_get::<String, _>("fields").ok().or_else(|| {
        row.try_get::<Vec<u8>, _>("fields")
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    });

    let fields = match fields_json {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| StoreError::Backend(format!("field map deserialization failed: {}", e)))?,
        None => serde_json::Map::new(),
    };

    Ok(Some(EntityRecord {
        entity_type: entity_type.to_string(),
        entity_id,
        fields,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(dir: &tempfile::TempDir, name: &str) -> (DualSyncConfig, String) {
        let path = dir.path().join(format!("{}.db", name));
        let url = format!("sqlite://{}?mode=rwc", path.display());
        (DualSyncConfig::new(url.clone(), url.clone()), url)
    }

    async fn test_store(dir: &tempfile::TempDir, name: &str) -> SqlStore {
        let (config, url) = test_config(dir, name);
        SqlStore::connect(&url, &config).await.unwrap()
    }

    fn memo(id: i64) -> EntityRecord {
        EntityRecord::new("Memo", id)
            .with_field("content", json!("note"))
            .with_field("page_number", json!(12))
    }

    #[tokio::test]
    async fn test_insert_and_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, "round_trip").await;

        store.insert_record(&memo(1)).await.unwrap();

        let fetched = store.fetch_record("Memo", 1).await.unwrap().unwrap();
        assert_eq!(fetched.entity_id, 1);
        assert_eq!(fetched.field("content"), Some(&json!("note")));
        assert_eq!(fetched.field("page_number"), Some(&json!(12)));
    }

    #[tokio::test]
    async fn test_fetch_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, "missing").await;

        let fetched = store.fetch_record("Memo", 99).await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn test_identity_is_namespaced_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, "namespaced").await;

        store.insert_record(&memo(1)).await.unwrap();
        store
            .insert_record(&EntityRecord::new("UserDevice", 1).with_field("platform", json!("IOS")))
            .await
            .unwrap();

        let device = store.fetch_record("UserDevice", 1).await.unwrap().unwrap();
        assert_eq!(device.field("platform"), Some(&json!("IOS")));
        assert_eq!(device.field("content"), None);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, "delete").await;

        store.insert_record(&memo(5)).await.unwrap();

        assert_eq!(store.delete_record("Memo", 5).await.unwrap(), 1);
        assert_eq!(store.delete_record("Memo", 5).await.unwrap(), 0);
        assert!(store.fetch_record("Memo", 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_commits_on_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, "tx_commit").await;

        let record = memo(7);
        store
            .in_transaction(move |conn| {
                Box::pin(async move {
                    insert_record(conn, &record).await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert!(store.fetch_record("Memo", 7).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_err() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, "tx_rollback").await;

        let record = memo(8);
        let result: Result<(), StoreError> = store
            .in_transaction(move |conn| {
                Box::pin(async move {
                    insert_record(conn, &record).await?;
                    Err(StoreError::Backend("injected failure".into()))
                })
            })
            .await;

        assert!(result.is_err());
        assert!(store.fetch_record("Memo", 8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_ids_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, "list").await;

        for id in [3, 1, 2] {
            store.insert_record(&memo(id)).await.unwrap();
        }

        assert_eq!(store.list_ids("Memo").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.count("Memo").await.unwrap(), 3);
        assert_eq!(store.count("UserDevice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_probe() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, "probe").await;

        assert!(store.probe().await.is_ok());
    }
}
