//! Asynchronous recovery of failed compensations.
//!
//! When the write orchestrator cannot undo a primary write whose secondary
//! counterpart failed, it publishes a [`event::SyncFailureEvent`] to the
//! [`queue::RecoveryQueue`]. The [`worker::RecoveryWorker`] drains the queue
//! on a fixed schedule and re-derives the secondary store's state from the
//! primary, with bounded retries and operator escalation on exhaustion.

pub mod event;
pub mod queue;
pub mod worker;

pub use event::{RecoveryAction, SyncFailureEvent};
pub use queue::{InMemoryRecoveryQueue, RecoveryQueue};
pub use worker::RecoveryWorker;
