// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dual-write orchestration with compensating rollback.
//!
//! The orchestrator performs a strict two-phase write across the primary and
//! secondary stores. There is no distributed transaction; each phase runs in
//! its own store-scoped transaction, and partial failure is handled by
//! compensation and, when that fails too, by deferral to the recovery queue.
//!
//! ```text
//! primary write ──ok──▶ secondary write ──ok──▶ caller gets primary result
//!       │                      │
//!      err                    err
//!       │                      ▼
//!       ▼               compensate on primary ──ok──▶ SecondaryWriteFailed
//! PrimaryUnavailable           │
//!                             err
//!                              ▼
//!                  publish SyncFailureEvent ──▶ SecondaryWriteFailed
//! ```
//!
//! The caller never receives a false success: any secondary failure after a
//! primary commit surfaces as [`WriteError::SecondaryWriteFailed`], whether or
//! not compensation succeeded. Nothing is retried synchronously; retry belongs
//! to the recovery worker's bounded loop, which keeps caller-facing latency
//! predictable.

use sqlx::AnyConnection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::metrics;
use crate::recovery::event::{RecoveryAction, SyncFailureEvent};
use crate::recovery::queue::RecoveryQueue;
use crate::store::sql::SqlStore;
use crate::store::traits::{StoreError, TxFuture};

#[derive(Error, Debug)]
pub enum WriteError {
    /// The primary store transaction failed. The operation aborted before
    /// any secondary interaction; writes never fail over.
    #[error("primary store write failed: {0}")]
    PrimaryUnavailable(#[source] StoreError),

    /// The secondary write failed after the primary commit. Surfaced even
    /// when compensation succeeded, because the operation did not achieve
    /// dual durability.
    #[error("secondary store write failed after primary commit: {0}")]
    SecondaryWriteFailed(#[source] StoreError),
}

/// Orchestrates ordered writes across both stores.
///
/// For a single logical write, the primary write strictly precedes the
/// secondary write, which strictly precedes (on failure) compensation, which
/// strictly precedes recovery-queue publication. Invocations for different
/// entities proceed independently with no shared locks; the recovery queue is
/// the only shared structure.
pub struct WriteOrchestrator {
    primary: Arc<SqlStore>,
    secondary: Arc<SqlStore>,
    queue: Arc<dyn RecoveryQueue>,
    compensation_delay: Duration,
}

impl WriteOrchestrator {
    pub fn new(
        primary: Arc<SqlStore>,
        secondary: Arc<SqlStore>,
        queue: Arc<dyn RecoveryQueue>,
        compensation_delay: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            queue,
            compensation_delay,
        }
    }

    /// Execute one dual write.
    ///
    /// - `primary_write` runs in a primary-scoped transaction and produces the
    ///   authoritative result.
    /// - `secondary_write` runs in a secondary-scoped transaction and receives
    ///   the primary's freshly-written value, so both stores hold convergent
    ///   values rather than independently re-derived ones.
    /// - `compensate` must undo the primary write's effect; it runs in a
    ///   primary-scoped transaction only after a secondary failure.
    /// - `entity_id_of` extracts the identity used for recovery events when
    ///   compensation itself fails. Callers construct `secondary_write` and
    ///   `compensate` as counterparts of `primary_write`'s effect.
    #[tracing::instrument(skip_all, fields(entity_type = %entity_type))]
    pub async fn execute<T, P, S, C>(
        &self,
        entity_type: &str,
        entity_id_of: impl Fn(&T) -> i64,
        primary_write: P,
        secondary_write: S,
        compensate: C,
    ) -> Result<T, WriteError>
    where
        T: Send + Sync,
        P: for<'c> FnOnce(&'c mut AnyConnection) -> TxFuture<'c, T> + Send,
        S: for<'c> FnOnce(&'c mut AnyConnection, &'c T) -> TxFuture<'c, ()> + Send,
        C: for<'c> FnOnce(&'c mut AnyConnection, &'c T) -> TxFuture<'c, ()> + Send,
    {
        let start = Instant::now();

        // Phase 1: primary write. Failure aborts the whole operation; the
        // primary is authoritative and there is no secondary-only fallback.
        let primary_result = match self.primary.in_transaction(primary_write).await {
            Ok(result) => {
                debug!("primary store write committed");
                result
            }
            Err(e) => {
                error!(error = %e, "primary store write failed");
                metrics::record_write("primary_failed");
                return Err(WriteError::PrimaryUnavailable(e));
            }
        };

        // Phase 2: secondary write, fed the primary's result.
        let secondary_err = match self
            .secondary
            .in_transaction_with(&primary_result, secondary_write)
            .await
        {
            Ok(()) => {
                debug!("secondary store write committed");
                metrics::record_write("success");
                metrics::record_write_latency(start.elapsed());
                return Ok(primary_result);
            }
            Err(e) => e,
        };

        error!(error = %secondary_err, "secondary store write failed, compensating on primary");

        // Let in-flight primary visibility lag settle before undoing the
        // write. Off by default; see `DualSyncConfig::compensation_delay_ms`.
        if !self.compensation_delay.is_zero() {
            info!(delay = ?self.compensation_delay, "waiting before compensation");
            tokio::time::sleep(self.compensation_delay).await;
        }

        match self
            .primary
            .in_transaction_with(&primary_result, compensate)
            .await
        {
            Ok(()) => {
                info!("compensation committed, primary rolled back");
                metrics::record_write("secondary_failed_compensated");
            }
            Err(comp_err) => {
                // The primary now holds state the secondary lacks and that
                // could not be undone. Hand the divergence to the recovery
                // worker.
                let event = SyncFailureEvent::new(
                    RecoveryAction::SecondarySyncRetry,
                    entity_id_of(&primary_result),
                    entity_type,
                    "secondary",
                    comp_err.to_string(),
                );

                error!(
                    error = %comp_err,
                    event = %event,
                    "CRITICAL: compensation failed, stores have diverged; \
                     published for asynchronous recovery"
                );

                self.queue.publish(event).await;
                metrics::record_write("secondary_failed_unrecovered");
            }
        }

        metrics::record_write_latency(start.elapsed());
        Err(WriteError::SecondaryWriteFailed(secondary_err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DualSyncConfig;
    use crate::recovery::queue::InMemoryRecoveryQueue;
    use crate::record::EntityRecord;
    use crate::store::sql;
    use serde_json::json;

    async fn store(dir: &tempfile::TempDir, name: &str) -> Arc<SqlStore> {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join(name).display());
        let config = DualSyncConfig::new(url.clone(), url.clone());
        Arc::new(SqlStore::connect(&url, &config).await.unwrap())
    }

    fn orchestrator(
        primary: Arc<SqlStore>,
        secondary: Arc<SqlStore>,
        queue: Arc<InMemoryRecoveryQueue>,
    ) -> WriteOrchestrator {
        WriteOrchestrator::new(primary, secondary, queue, Duration::ZERO)
    }

    fn memo(id: i64) -> EntityRecord {
        EntityRecord::new("Memo", id).with_field("content", json!("note"))
    }

    #[tokio::test]
    async fn test_happy_path_writes_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let primary = store(&dir, "primary.db").await;
        let secondary = store(&dir, "secondary.db").await;
        let queue = Arc::new(InMemoryRecoveryQueue::new());
        let writer = orchestrator(primary.clone(), secondary.clone(), queue.clone());

        let record = memo(1);
        let saved = writer
            .execute(
                "Memo",
                |r: &EntityRecord| r.entity_id,
                {
                    let record = record.clone();
                    move |conn| {
                        Box::pin(async move {
                            sql::insert_record(conn, &record).await?;
                            Ok(record)
                        })
                    }
                },
                |conn, saved| Box::pin(sql::insert_record(conn, saved)),
                |conn, saved| {
                    Box::pin(async move {
                        sql::delete_record(conn, &saved.entity_type, saved.entity_id).await?;
                        Ok(())
                    })
                },
            )
            .await
            .unwrap();

        assert_eq!(saved.entity_id, 1);
        assert!(primary.fetch_record("Memo", 1).await.unwrap().is_some());
        assert!(secondary.fetch_record("Memo", 1).await.unwrap().is_some());
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_primary_failure_aborts_without_touching_secondary() {
        let dir = tempfile::tempdir().unwrap();
        let primary = store(&dir, "primary.db").await;
        let secondary = store(&dir, "secondary.db").await;
        let queue = Arc::new(InMemoryRecoveryQueue::new());
        let writer = orchestrator(primary, secondary.clone(), queue.clone());

        let result = writer
            .execute(
                "Memo",
                |r: &EntityRecord| r.entity_id,
                |_conn| {
                    Box::pin(async move {
                        Err::<EntityRecord, _>(StoreError::Backend("primary down".into()))
                    })
                },
                |conn, saved| Box::pin(sql::insert_record(conn, saved)),
                |_conn, _saved| Box::pin(async move { Ok(()) }),
            )
            .await;

        assert!(matches!(result, Err(WriteError::PrimaryUnavailable(_))));
        assert_eq!(secondary.count("Memo").await.unwrap(), 0);
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_secondary_failure_compensates_primary() {
        let dir = tempfile::tempdir().unwrap();
        let primary = store(&dir, "primary.db").await;
        let secondary = store(&dir, "secondary.db").await;
        let queue = Arc::new(InMemoryRecoveryQueue::new());
        let writer = orchestrator(primary.clone(), secondary.clone(), queue.clone());

        let record = memo(2);
        let result = writer
            .execute(
                "Memo",
                |r: &EntityRecord| r.entity_id,
                {
                    let record = record.clone();
                    move |conn| {
                        Box::pin(async move {
                            sql::insert_record(conn, &record).await?;
                            Ok(record)
                        })
                    }
                },
                |_conn, _saved| {
                    Box::pin(async move { Err(StoreError::Backend("secondary down".into())) })
                },
                |conn, saved| {
                    Box::pin(async move {
                        sql::delete_record(conn, &saved.entity_type, saved.entity_id).await?;
                        Ok(())
                    })
                },
            )
            .await;

        assert!(matches!(result, Err(WriteError::SecondaryWriteFailed(_))));
        // Compensation undid the primary write; no recovery event needed.
        assert!(primary.fetch_record("Memo", 2).await.unwrap().is_none());
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_compensation_failure_publishes_recovery_event() {
        let dir = tempfile::tempdir().unwrap();
        let primary = store(&dir, "primary.db").await;
        let secondary = store(&dir, "secondary.db").await;
        let queue = Arc::new(InMemoryRecoveryQueue::new());
        let writer = orchestrator(primary.clone(), secondary, queue.clone());

        let record = memo(42);
        let result = writer
            .execute(
                "Memo",
                |r: &EntityRecord| r.entity_id,
                {
                    let record = record.clone();
                    move |conn| {
                        Box::pin(async move {
                            sql::insert_record(conn, &record).await?;
                            Ok(record)
                        })
                    }
                },
                |_conn, _saved| {
                    Box::pin(async move { Err(StoreError::Backend("secondary down".into())) })
                },
                |_conn, _saved| {
                    Box::pin(async move { Err(StoreError::Backend("compensation blocked".into())) })
                },
            )
            .await;

        // Caller still sees the secondary failure, never a false success.
        assert!(matches!(result, Err(WriteError::SecondaryWriteFailed(_))));
        // Primary kept the write that could not be undone.
        assert!(primary.fetch_record("Memo", 42).await.unwrap().is_some());

        let events = queue.consume().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, RecoveryAction::SecondarySyncRetry);
        assert_eq!(events[0].entity_id, 42);
        assert_eq!(events[0].entity_type, "Memo");
        assert_eq!(events[0].retry_count, 0);
        assert!(events[0].error_message.contains("compensation blocked"));
    }
}
