//! Durable-intent recovery queue.
//!
//! An unbounded FIFO of [`SyncFailureEvent`]s with a separate terminal-failure
//! set. The write orchestrator is the producer; the recovery worker is the
//! consumer. The trait is async so a durable backing (on-disk log, external
//! broker) can be substituted without touching either side.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{error, info};

use super::event::SyncFailureEvent;

#[async_trait]
pub trait RecoveryQueue: Send + Sync {
    /// Append an event to the tail.
    async fn publish(&self, event: SyncFailureEvent);

    /// Atomically drain all currently queued events - a stable snapshot per
    /// poll cycle, not a pop-one loop.
    async fn consume(&self) -> Vec<SyncFailureEvent>;

    /// Append an event back to the tail after a failed reconciliation
    /// attempt (retry count already bumped by the worker).
    async fn requeue(&self, event: SyncFailureEvent);

    /// Mark an event successfully processed. A no-op for the in-memory
    /// backend; durable backends delete their copy here.
    async fn acknowledge(&self, event: &SyncFailureEvent);

    /// Move an event to the terminal-failure set.
    async fn mark_as_failed(&self, event: SyncFailureEvent);

    /// Snapshot of the terminal-failure set.
    async fn failed_events(&self) -> Vec<SyncFailureEvent>;

    /// Number of events currently in-flight.
    async fn depth(&self) -> usize;
}

/// In-memory, non-persistent queue. A process restart loses in-flight
/// events; the orchestrator has already reported failure to its caller
/// before relying on the queue, so this narrows recovery, it does not
/// invent false successes.
#[derive(Default)]
pub struct InMemoryRecoveryQueue {
    queue: Mutex<VecDeque<SyncFailureEvent>>,
    failed: Mutex<Vec<SyncFailureEvent>>,
}

impl InMemoryRecoveryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryQueue for InMemoryRecoveryQueue {
    async fn publish(&self, event: SyncFailureEvent) {
        info!(event = %event, "recovery event published");
        crate::metrics::record_queue_publish(&event.action.to_string());
        let mut queue = self.queue.lock();
        queue.push_back(event);
        crate::metrics::set_queue_depth(queue.len());
    }

    async fn consume(&self) -> Vec<SyncFailureEvent> {
        let mut queue = self.queue.lock();
        let drained: Vec<SyncFailureEvent> = queue.drain(..).collect();
        crate::metrics::set_queue_depth(queue.len());
        drained
    }

    async fn requeue(&self, event: SyncFailureEvent) {
        info!(event = %event, "recovery event requeued");
        let mut queue = self.queue.lock();
        queue.push_back(event);
        crate::metrics::set_queue_depth(queue.len());
    }

    async fn acknowledge(&self, event: &SyncFailureEvent) {
        info!(event = %event, "recovery event acknowledged");
    }

    async fn mark_as_failed(&self, event: SyncFailureEvent) {
        error!(event = %event, "recovery event marked as terminally failed");
        let mut failed = self.failed.lock();
        failed.push(event);
        crate::metrics::set_failed_events(failed.len());
    }

    async fn failed_events(&self) -> Vec<SyncFailureEvent> {
        self.failed.lock().clone()
    }

    async fn depth(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::event::RecoveryAction;

    fn event(id: i64) -> SyncFailureEvent {
        SyncFailureEvent::new(
            RecoveryAction::SecondarySyncRetry,
            id,
            "Memo",
            "secondary",
            "injected",
        )
    }

    #[tokio::test]
    async fn test_publish_then_consume_drains_in_order() {
        let queue = InMemoryRecoveryQueue::new();

        queue.publish(event(1)).await;
        queue.publish(event(2)).await;
        queue.publish(event(3)).await;
        assert_eq!(queue.depth().await, 3);

        let events = queue.consume().await;
        assert_eq!(
            events.iter().map(|e| e.entity_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_consume_empty_returns_empty() {
        let queue = InMemoryRecoveryQueue::new();
        assert!(queue.consume().await.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_appends_to_tail() {
        let queue = InMemoryRecoveryQueue::new();

        queue.publish(event(1)).await;
        let mut drained = queue.consume().await;
        let mut retried = drained.remove(0);
        retried.increment_retry_count();

        queue.publish(event(2)).await;
        queue.requeue(retried).await;

        let events = queue.consume().await;
        assert_eq!(events[0].entity_id, 2);
        assert_eq!(events[1].entity_id, 1);
        assert_eq!(events[1].retry_count, 1);
    }

    #[tokio::test]
    async fn test_mark_as_failed_moves_to_terminal_set() {
        let queue = InMemoryRecoveryQueue::new();

        queue.publish(event(7)).await;
        let mut events = queue.consume().await;
        queue.mark_as_failed(events.remove(0)).await;

        assert_eq!(queue.depth().await, 0);
        let failed = queue.failed_events().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].entity_id, 7);
    }

    #[tokio::test]
    async fn test_concurrent_publish_and_consume_loses_nothing() {
        use std::sync::Arc;

        let queue = Arc::new(InMemoryRecoveryQueue::new());
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    queue.publish(event(i)).await;
                }
            })
        };

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while seen.len() < 100 {
                    seen.extend(queue.consume().await);
                    tokio::task::yield_now().await;
                }
                seen
            })
        };

        producer.await.unwrap();
        let seen = consumer.await.unwrap();

        assert_eq!(seen.len(), 100);
        let mut ids: Vec<_> = seen.iter().map(|e| e.entity_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 100);
    }
}
