// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation worker.
//!
//! The single source of eventual consistency. The worker drains the recovery
//! queue on a fixed schedule and re-derives secondary-store state from the
//! primary, which is always authoritative. Failed attempts requeue with a
//! bumped retry counter; once the budget is exhausted the event moves to the
//! terminal-failure set and operators are alerted exactly once.
//!
//! The worker runs on its own background task, decoupled from
//! request-handling concurrency, and shuts down via a cancellation token.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::AlertChannel;
use crate::config::DualSyncConfig;
use crate::metrics;
use crate::store::sql::{self, SqlStore};
use crate::store::traits::StoreError;

use super::event::{RecoveryAction, SyncFailureEvent};
use super::queue::RecoveryQueue;

pub struct RecoveryWorker {
    queue: Arc<dyn RecoveryQueue>,
    primary: Arc<SqlStore>,
    secondary: Arc<SqlStore>,
    alerts: Arc<dyn AlertChannel>,
    interval: Duration,
    max_retry_count: u32,
}

impl RecoveryWorker {
    pub fn new(
        queue: Arc<dyn RecoveryQueue>,
        primary: Arc<SqlStore>,
        secondary: Arc<SqlStore>,
        alerts: Arc<dyn AlertChannel>,
        config: &DualSyncConfig,
    ) -> Self {
        Self {
            queue,
            primary,
            secondary,
            alerts,
            interval: Duration::from_secs(config.worker_interval_secs),
            max_retry_count: config.max_retry_count,
        }
    }

    /// Poll the queue on a fixed interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "recovery worker started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("recovery worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One poll cycle: drain the queue and process every event in the
    /// snapshot. Public so tests and operator tooling can drive a cycle
    /// without waiting for the interval.
    pub async fn tick(&self) {
        let events = self.queue.consume().await;
        if events.is_empty() {
            return;
        }

        info!(count = events.len(), "processing recovery queue");
        for event in events {
            self.process_event(event).await;
        }
    }

    async fn process_event(&self, mut event: SyncFailureEvent) {
        let start = Instant::now();

        let outcome = match event.action {
            RecoveryAction::SecondarySyncRetry => self.resync_secondary(&event).await,
            RecoveryAction::LegacyDelete | RecoveryAction::LegacySecondaryCleanup => {
                self.delete_from_secondary(&event).await
            }
        };

        metrics::record_recovery_latency(start.elapsed());

        match outcome {
            Ok(()) => {
                info!(event = %event, "reconciliation succeeded");
                metrics::record_recovery(&event.action.to_string(), "success");
                self.queue.acknowledge(&event).await;
            }
            Err(e) => {
                event.error_message = e.to_string();
                self.handle_failure(event, e).await;
            }
        }
    }

    /// Re-derive the secondary record from the primary's current state:
    /// remove any stale or partial secondary row, then insert the primary's
    /// field values. Both steps run in one secondary-scoped transaction.
    ///
    /// If the primary no longer has the entity, its state was deleted or
    /// rolled back elsewhere; the cleanup alone converges the secondary and
    /// the event counts as success.
    async fn resync_secondary(&self, event: &SyncFailureEvent) -> Result<(), StoreError> {
        let entity_type = event.entity_type.clone();
        let entity_id = event.entity_id;

        let record = self.primary.fetch_record(&entity_type, entity_id).await?;
        let found = record.is_some();

        self.secondary
            .in_transaction(move |conn| {
                Box::pin(async move {
                    let stale = sql::delete_record(&mut *conn, &entity_type, entity_id).await?;
                    if stale > 0 {
                        debug!(entity_type = %entity_type, entity_id, "removed stale secondary row");
                    }
                    if let Some(ref record) = record {
                        sql::insert_record(&mut *conn, record).await?;
                    }
                    Ok(())
                })
            })
            .await?;

        if found {
            info!(
                entity_type = %event.entity_type,
                entity_id,
                "secondary re-synced from primary's current state"
            );
        } else {
            info!(
                entity_type = %event.entity_type,
                entity_id,
                "entity gone from primary, nothing to re-derive"
            );
        }

        Ok(())
    }

    /// Legacy actions: direct delete-by-identity against the secondary store.
    async fn delete_from_secondary(&self, event: &SyncFailureEvent) -> Result<(), StoreError> {
        let deleted = self
            .secondary
            .delete_record(&event.entity_type, event.entity_id)
            .await?;

        if deleted > 0 {
            info!(
                entity_type = %event.entity_type,
                entity_id = event.entity_id,
                "ghost row removed from secondary"
            );
        } else {
            info!(
                entity_type = %event.entity_type,
                entity_id = event.entity_id,
                "ghost row already absent from secondary"
            );
        }

        Ok(())
    }

    async fn handle_failure(&self, mut event: SyncFailureEvent, error: StoreError) {
        let retry_count = event.increment_retry_count();
        warn!(
            event = %event,
            error = %error,
            retry_count,
            "reconciliation attempt failed"
        );

        if retry_count >= self.max_retry_count {
            error!(
                event = %event,
                "CRITICAL: reconciliation retry budget exhausted, manual intervention required"
            );
            metrics::record_recovery(&event.action.to_string(), "exhausted");

            let title = "Reconciliation retry budget exhausted";
            let message = format!(
                "Reconciliation failed {} times and the stores remain divergent. \
                 The system cannot resolve this on its own; immediate manual \
                 intervention is required.\n\
                 - Entity Type: {}\n\
                 - Entity ID: {}\n\
                 - Action: {}\n\
                 - Target Store: {}\n\
                 - Failure Time: {}\n\
                 - Error Message: {}",
                self.max_retry_count,
                event.entity_type,
                event.entity_id,
                event.action,
                event.target_store,
                event.failure_time,
                event.error_message,
            );
            self.alerts.send_critical_alert(title, &message).await;

            self.queue.mark_as_failed(event).await;
        } else {
            metrics::record_recovery(&event.action.to_string(), "retry");
            self.queue.requeue(event).await;
        }
    }
}
