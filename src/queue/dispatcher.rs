//! Offline-queue dispatcher (C5): drains an agent's mailbox in FIFO order
//! as soon as it (re)connects, halting on the first send failure rather than
//! risking reordering or duplication against a flapping connection.

use super::OfflineQueueStore;
use std::sync::Arc;

/// Narrow seam the dispatcher needs from the connection registry. Kept
/// separate from `AgentManager` itself so the queue module never references
/// the gateway module — events flow one way, queue -> sender, never back.
#[async_trait::async_trait]
pub trait AgentSender: Send + Sync {
    async fn send(&self, agent_id: &str, bytes: Vec<u8>) -> bool;
}

pub struct QueueDispatcher<S: OfflineQueueStore> {
    store: Arc<S>,
}

impl<S: OfflineQueueStore> QueueDispatcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Drain `agent_id`'s pending mailbox onto `sender`, stopping at the
    /// first failed send. Returns the number of entries delivered.
    pub async fn drain(&self, agent_id: &str, sender: &dyn AgentSender) -> crate::Result<usize> {
        let pending = self.store.find_pending(agent_id).await?;
        let mut delivered = 0;
        for entry in pending {
            if !sender.send(agent_id, entry.payload.clone()).await {
                tracing::warn!(
                    agent_id,
                    entry_id = entry.id,
                    "offline drain halted on send failure"
                );
                break;
            }
            self.store.mark_delivered(entry.id).await?;
            delivered += 1;
        }
        if delivered > 0 {
            tracing::info!(agent_id, delivered, "drained offline queue");
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryOfflineQueueStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySender {
        fail_after: usize,
        sent: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AgentSender for FlakySender {
        async fn send(&self, _agent_id: &str, _bytes: Vec<u8>) -> bool {
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            n < self.fail_after
        }
    }

    #[tokio::test]
    async fn drains_fifo_until_first_failure() {
        let store = Arc::new(InMemoryOfflineQueueStore::new(60_000));
        for i in 0..5u8 {
            store
                .enqueue("a1", "task:submit", vec![i])
                .await
                .unwrap();
        }
        let dispatcher = QueueDispatcher::new(store.clone());
        let sender = FlakySender {
            fail_after: 3,
            sent: AtomicUsize::new(0),
        };
        let delivered = dispatcher.drain("a1", &sender).await.unwrap();
        assert_eq!(delivered, 3);

        let remaining = store.find_pending("a1").await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn drain_with_nothing_pending_is_noop() {
        let store = Arc::new(InMemoryOfflineQueueStore::new(60_000));
        let dispatcher = QueueDispatcher::new(store);
        let sender = FlakySender {
            fail_after: 10,
            sent: AtomicUsize::new(0),
        };
        assert_eq!(dispatcher.drain("a1", &sender).await.unwrap(), 0);
    }
}
