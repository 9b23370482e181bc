// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine facade: wiring, lifecycle, and health.
//!
//! [`DualSyncEngine`] owns the two store pools, the recovery queue, the
//! alert channel, and the background reconciliation worker, and hands out
//! the coordination components built on top of them.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready → Running → ShuttingDown
//! ```
//!
//! Both stores are mandatory: this is a dual-master pair, and a missing
//! secondary would make every write path unusable. `start()` therefore
//! fails fast if either pool cannot be brought up.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alert::{AlertChannel, LogAlertChannel};
use crate::config::DualSyncConfig;
use crate::metrics;
use crate::read::ReadCoordinator;
use crate::recovery::queue::{InMemoryRecoveryQueue, RecoveryQueue};
use crate::recovery::worker::RecoveryWorker;
use crate::store::sql::SqlStore;
use crate::store::traits::StoreError;
use crate::verify::ConsistencyVerifier;
use crate::write::WriteOrchestrator;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to both stores
    Connecting,
    /// Stores connected, components built
    Ready,
    /// Recovery worker running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Point-in-time health snapshot, suitable for `/ready` and `/health`
/// endpoints in the embedding service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: EngineState,
    pub ready: bool,
    /// `None` when the store is not connected yet
    pub primary_connected: Option<bool>,
    pub primary_latency_ms: Option<u64>,
    pub secondary_connected: Option<bool>,
    pub secondary_latency_ms: Option<u64>,
    /// Recovery events currently in-flight
    pub queue_depth: usize,
    /// Events that exhausted their retry budget and await manual intervention
    pub failed_events: usize,
    pub healthy: bool,
}

/// Facade over the dual-store coordination subsystem.
pub struct DualSyncEngine {
    config: DualSyncConfig,
    state: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    queue: Arc<dyn RecoveryQueue>,
    alerts: Arc<dyn AlertChannel>,
    primary: Option<Arc<SqlStore>>,
    secondary: Option<Arc<SqlStore>>,
    writer: Option<Arc<WriteOrchestrator>>,
    reader: Option<Arc<ReadCoordinator>>,
    verifier: Option<Arc<ConsistencyVerifier>>,
    worker_cancel: Option<CancellationToken>,
    worker_handle: Option<JoinHandle<()>>,
}

impl DualSyncEngine {
    /// Create an engine with the in-memory recovery queue and the log-based
    /// alert channel. Call [`start()`](Self::start) to connect.
    pub fn new(config: DualSyncConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        Self {
            config,
            state: state_tx,
            state_rx,
            queue: Arc::new(InMemoryRecoveryQueue::new()),
            alerts: Arc::new(LogAlertChannel),
            primary: None,
            secondary: None,
            writer: None,
            reader: None,
            verifier: None,
            worker_cancel: None,
            worker_handle: None,
        }
    }

    /// Substitute a durable recovery queue backend.
    #[must_use]
    pub fn with_recovery_queue(mut self, queue: Arc<dyn RecoveryQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Substitute an alert channel (SMS, email, chat, monitoring).
    #[must_use]
    pub fn with_alert_channel(mut self, alerts: Arc<dyn AlertChannel>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if the engine is ready to coordinate reads and writes.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    /// Connect both store pools, build the coordination components, and
    /// spawn the recovery worker.
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), StoreError> {
        info!("starting dual-store coordination engine");
        let _ = self.state.send(EngineState::Connecting);

        info!(url = %self.config.primary_url, "connecting to primary store");
        let primary = match SqlStore::connect(&self.config.primary_url, &self.config).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "failed to connect to primary store");
                metrics::set_store_healthy("primary", false);
                return Err(e);
            }
        };
        metrics::set_store_healthy("primary", true);

        info!(url = %self.config.secondary_url, "connecting to secondary store");
        let secondary = match SqlStore::connect(&self.config.secondary_url, &self.config).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                // Dual-master: without the secondary every write would have
                // to be compensated away, so refuse to start instead.
                error!(error = %e, "failed to connect to secondary store");
                metrics::set_store_healthy("secondary", false);
                return Err(e);
            }
        };
        metrics::set_store_healthy("secondary", true);

        self.writer = Some(Arc::new(WriteOrchestrator::new(
            primary.clone(),
            secondary.clone(),
            self.queue.clone(),
            Duration::from_millis(self.config.compensation_delay_ms),
        )));
        self.reader = Some(Arc::new(ReadCoordinator::new(
            primary.clone(),
            secondary.clone(),
        )));
        self.verifier = Some(Arc::new(ConsistencyVerifier::new(
            primary.clone(),
            secondary.clone(),
        )));

        let worker = Arc::new(RecoveryWorker::new(
            self.queue.clone(),
            primary.clone(),
            secondary.clone(),
            self.alerts.clone(),
            &self.config,
        ));

        self.primary = Some(primary);
        self.secondary = Some(secondary);
        let _ = self.state.send(EngineState::Ready);

        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        self.worker_handle = Some(tokio::spawn(async move {
            worker.run(worker_cancel).await;
        }));
        self.worker_cancel = Some(cancel);

        let _ = self.state.send(EngineState::Running);
        info!("dual-store coordination engine running");
        Ok(())
    }

    /// The dual-write orchestrator.
    ///
    /// # Panics
    ///
    /// Panics if the engine has not been started.
    #[must_use]
    pub fn writer(&self) -> &WriteOrchestrator {
        self.writer.as_deref().expect("engine not started")
    }

    /// The read-path failover coordinator.
    ///
    /// # Panics
    ///
    /// Panics if the engine has not been started.
    #[must_use]
    pub fn reader(&self) -> &ReadCoordinator {
        self.reader.as_deref().expect("engine not started")
    }

    /// The cross-store consistency verifier.
    ///
    /// # Panics
    ///
    /// Panics if the engine has not been started.
    #[must_use]
    pub fn verifier(&self) -> &ConsistencyVerifier {
        self.verifier.as_deref().expect("engine not started")
    }

    /// The recovery queue (for diagnostics and failed-event inspection).
    #[must_use]
    pub fn recovery_queue(&self) -> &Arc<dyn RecoveryQueue> {
        &self.queue
    }

    /// Probe both stores and collect queue state into a health snapshot.
    pub async fn health_check(&self) -> HealthReport {
        let state = self.state();
        let ready = self.is_ready();

        let (primary_probe, secondary_probe) = tokio::join!(
            Self::probe(self.primary.as_ref()),
            Self::probe(self.secondary.as_ref()),
        );
        let (primary_connected, primary_latency_ms) = primary_probe;
        let (secondary_connected, secondary_latency_ms) = secondary_probe;

        if let Some(connected) = primary_connected {
            metrics::set_store_healthy("primary", connected);
        }
        if let Some(connected) = secondary_connected {
            metrics::set_store_healthy("secondary", connected);
        }

        let queue_depth = self.queue.depth().await;
        let failed_events = self.queue.failed_events().await.len();

        let healthy = matches!(state, EngineState::Running)
            && primary_connected == Some(true)
            && secondary_connected == Some(true);

        HealthReport {
            state,
            ready,
            primary_connected,
            primary_latency_ms,
            secondary_connected,
            secondary_latency_ms,
            queue_depth,
            failed_events,
            healthy,
        }
    }

    async fn probe(store: Option<&Arc<SqlStore>>) -> (Option<bool>, Option<u64>) {
        let Some(store) = store else {
            return (None, None);
        };
        match store.probe().await {
            Ok(latency) => (Some(true), Some(latency.as_millis() as u64)),
            Err(_) => (Some(false), None),
        }
    }

    /// Stop the recovery worker and mark the engine down. In-flight queue
    /// events are lost with the process; the orchestrator already reported
    /// those failures to its callers.
    pub async fn shutdown(&mut self) {
        info!("shutting down dual-store coordination engine");
        let _ = self.state.send(EngineState::ShuttingDown);

        if let Some(cancel) = self.worker_cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.worker_handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "recovery worker task join failed");
            }
        }

        info!("dual-store coordination engine shutdown complete");
    }
}
