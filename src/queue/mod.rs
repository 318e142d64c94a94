//! Durable per-agent offline mailbox (C2).

pub mod dispatcher;

use crate::{MeshError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single queued envelope awaiting delivery to an agent that was offline
/// at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u64,
    pub agent_id: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub created_at: i64,
    pub expires_at: i64,
    pub delivered: bool,
    pub delivered_at: Option<i64>,
}

impl QueueEntry {
    fn is_pending(&self, now: i64) -> bool {
        !self.delivered && now < self.expires_at
    }
}

/// Storage contract for the offline queue, so a durable backend can be
/// swapped in without touching the dispatcher (§3.1).
#[async_trait]
pub trait OfflineQueueStore: Send + Sync {
    async fn enqueue(&self, agent_id: &str, message_type: &str, payload: Vec<u8>) -> Result<u64>;
    async fn find_pending(&self, agent_id: &str) -> Result<Vec<QueueEntry>>;
    async fn mark_delivered(&self, id: u64) -> Result<()>;
    async fn clean_expired(&self) -> Result<usize>;
}

/// In-memory implementation backing this crate's shipped deployment.
pub struct InMemoryOfflineQueueStore {
    entries: tokio::sync::Mutex<Vec<QueueEntry>>,
    next_id: std::sync::atomic::AtomicU64,
    ttl_ms: i64,
}

impl InMemoryOfflineQueueStore {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            entries: tokio::sync::Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
            ttl_ms,
        }
    }
}

#[async_trait]
impl OfflineQueueStore for InMemoryOfflineQueueStore {
    async fn enqueue(&self, agent_id: &str, message_type: &str, payload: Vec<u8>) -> Result<u64> {
        let now = crate::now_ms();
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let entry = QueueEntry {
            id,
            agent_id: agent_id.to_string(),
            message_type: message_type.to_string(),
            payload,
            created_at: now,
            expires_at: now + self.ttl_ms,
            delivered: false,
            delivered_at: None,
        };
        self.entries.lock().await.push(entry);
        tracing::debug!(agent_id, id, "enqueued offline message");
        Ok(id)
    }

    async fn find_pending(&self, agent_id: &str) -> Result<Vec<QueueEntry>> {
        let now = crate::now_ms();
        let entries = self.entries.lock().await;
        // `id` assignment order is insertion order, so this is already FIFO.
        Ok(entries
            .iter()
            .filter(|e| e.agent_id == agent_id && e.is_pending(now))
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, id: u64) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| MeshError::NotFound(format!("queue entry {id}")))?;
        entry.delivered = true;
        entry.delivered_at = Some(crate::now_ms());
        Ok(())
    }

    async fn clean_expired(&self) -> Result<usize> {
        let now = crate::now_ms();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.delivered || now < e.expires_at);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "cleaned expired offline-queue entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_ordering_and_delivery() {
        let store = InMemoryOfflineQueueStore::new(60_000);
        let id1 = store.enqueue("a1", "task:submit", vec![1]).await.unwrap();
        let id2 = store.enqueue("a1", "task:submit", vec![2]).await.unwrap();

        let pending = store.find_pending("a1").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, id1);
        assert_eq!(pending[1].id, id2);

        store.mark_delivered(id1).await.unwrap();
        let pending = store.find_pending("a1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id2);
    }

    #[tokio::test]
    async fn expired_entries_never_returned() {
        let store = InMemoryOfflineQueueStore::new(-1);
        store.enqueue("a1", "task:submit", vec![1]).await.unwrap();
        let pending = store.find_pending("a1").await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn clean_expired_removes_undelivered_only() {
        let store = InMemoryOfflineQueueStore::new(-1);
        let id = store.enqueue("a1", "task:submit", vec![1]).await.unwrap();
        store.mark_delivered(id).await.unwrap();
        // Delivered entries survive even if technically past TTL; only
        // undelivered-and-expired rows are swept.
        let removed = store.clean_expired().await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn mark_delivered_unknown_id_fails() {
        let store = InMemoryOfflineQueueStore::new(60_000);
        assert!(store.mark_delivered(999).await.is_err());
    }
}
