//! Synchronization-failure events.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// What the recovery worker should do for an event.
///
/// A closed set: the worker matches exhaustively, so adding a variant is a
/// compile-time checklist of every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Re-derive the secondary store's record from the primary's current
    /// state (delete stale secondary row, insert primary's field values).
    SecondarySyncRetry,
    /// Direct delete-by-identity against the secondary store. Emitted by
    /// earlier producers; subsumed by [`Self::SecondarySyncRetry`].
    LegacyDelete,
    /// Ghost-row cleanup in the secondary store. Emitted by earlier
    /// producers; subsumed by [`Self::SecondarySyncRetry`].
    LegacySecondaryCleanup,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SecondarySyncRetry => write!(f, "SECONDARY_SYNC_RETRY"),
            Self::LegacyDelete => write!(f, "LEGACY_DELETE"),
            Self::LegacySecondaryCleanup => write!(f, "LEGACY_SECONDARY_CLEANUP"),
        }
    }
}

/// A write-synchronization failure captured for asynchronous recovery.
///
/// Created by the write orchestrator when a compensation attempt fails.
/// `retry_count` is mutated only by the recovery worker and is monotonically
/// non-decreasing. An event is either in-flight (queued), terminal-success
/// (acknowledged, removed) or terminal-failure (failed set, alerted) - never
/// silently discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFailureEvent {
    /// Stable identity for durable-queue backends
    pub event_id: Uuid,
    pub action: RecoveryAction,
    pub entity_id: i64,
    pub entity_type: String,
    /// The store whose state is behind (informational)
    pub target_store: String,
    /// Failure time, epoch millis
    pub failure_time: i64,
    /// Last error observed for this event
    pub error_message: String,
    /// Failed reconciliation attempts so far
    pub retry_count: u32,
}

impl SyncFailureEvent {
    pub fn new(
        action: RecoveryAction,
        entity_id: i64,
        entity_type: impl Into<String>,
        target_store: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            action,
            entity_id,
            entity_type: entity_type.into(),
            target_store: target_store.into(),
            failure_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64,
            error_message: error_message.into(),
            retry_count: 0,
        }
    }

    /// Bump the retry counter, returning the new value.
    pub fn increment_retry_count(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }
}

impl std::fmt::Display for SyncFailureEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SyncFailureEvent{{action={}, entity={}#{}, target={}, retries={}}}",
            self.action, self.entity_type, self.entity_id, self.target_store, self.retry_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_starts_at_zero_retries() {
        let event = SyncFailureEvent::new(
            RecoveryAction::SecondarySyncRetry,
            42,
            "Memo",
            "secondary",
            "connection refused",
        );

        assert_eq!(event.retry_count, 0);
        assert_eq!(event.entity_id, 42);
        assert_eq!(event.entity_type, "Memo");
        assert!(event.failure_time > 0);
    }

    #[test]
    fn test_retry_count_is_monotonic() {
        let mut event = SyncFailureEvent::new(
            RecoveryAction::SecondarySyncRetry,
            1,
            "Memo",
            "secondary",
            "err",
        );

        assert_eq!(event.increment_retry_count(), 1);
        assert_eq!(event.increment_retry_count(), 2);
        assert_eq!(event.retry_count, 2);
    }

    #[test]
    fn test_action_display() {
        assert_eq!(
            RecoveryAction::SecondarySyncRetry.to_string(),
            "SECONDARY_SYNC_RETRY"
        );
        assert_eq!(RecoveryAction::LegacyDelete.to_string(), "LEGACY_DELETE");
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = SyncFailureEvent::new(RecoveryAction::LegacyDelete, 1, "Memo", "secondary", "e");
        let b = SyncFailureEvent::new(RecoveryAction::LegacyDelete, 1, "Memo", "secondary", "e");
        assert_ne!(a.event_id, b.event_id);
    }
}
