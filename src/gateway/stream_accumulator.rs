//! StreamAccumulator (C6): batches agent-produced text deltas into
//! rate-limited, edit-in-place chat updates.
//!
//! Grounded on the retry/timeout/cleanup shape of a per-message pending-update
//! tracker: register on first delta, retry a bounded number of times on flush
//! failure, never drop the buffer, abandon (not retry forever) once a pending
//! edit has been stuck past its timeout.

use crate::chat::{to_chat_markdown, truncate_tail, ChatClient};
use crate::models::ChatOrigin;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bookkeeping for why a specific chat edit is still pending, distinct from
/// the text buffer itself (§10.2): shared by stream flushes, progress
/// notices, and the final complete/error post.
#[derive(Debug, Clone, Default)]
pub struct PendingEditState {
    pub attempts: u32,
    pub last_attempt_ms: i64,
    pub first_attempt_ms: i64,
}

impl PendingEditState {
    fn record_attempt(&mut self) {
        let now = crate::now_ms();
        if self.attempts == 0 {
            self.first_attempt_ms = now;
        }
        self.attempts += 1;
        self.last_attempt_ms = now;
    }

    fn timed_out(&self, timeout_ms: i64) -> bool {
        self.attempts > 0 && crate::now_ms() - self.first_attempt_ms > timeout_ms
    }
}

struct StreamState {
    buffer: String,
    chat_origin: ChatOrigin,
    chat_message_id: Option<String>,
    pending: PendingEditState,
}

pub struct StreamAccumulatorConfig {
    pub flush_interval_ms: u64,
    pub max_snapshot_chars: usize,
    pub max_retries: u32,
    pub retry_timeout_ms: i64,
}

impl Default for StreamAccumulatorConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            flush_interval_ms: STREAM_UPDATE_INTERVAL_MS,
            max_snapshot_chars: STREAM_MAX_SNAPSHOT_CHARS,
            max_retries: CHAT_EDIT_MAX_RETRIES,
            retry_timeout_ms: CHAT_EDIT_TIMEOUT_MS as i64,
        }
    }
}

pub struct StreamAccumulator {
    streams: RwLock<HashMap<String, StreamState>>,
    chat: Arc<dyn ChatClient>,
    config: StreamAccumulatorConfig,
}

impl StreamAccumulator {
    pub fn new(chat: Arc<dyn ChatClient>, config: StreamAccumulatorConfig) -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            chat,
            config,
        })
    }

    /// Append a delta to the task's buffer, creating the stream state on
    /// first use.
    pub async fn add_delta(&self, task_id: &str, delta: &str, origin: ChatOrigin) {
        let mut streams = self.streams.write().await;
        let state = streams.entry(task_id.to_string()).or_insert_with(|| StreamState {
            buffer: String::new(),
            chat_origin: origin,
            chat_message_id: None,
            pending: PendingEditState::default(),
        });
        state.buffer.push_str(delta);
    }

    /// Flush every stream with a non-empty buffer. Failures are logged and
    /// left for the next tick; the buffer is never cleared on failure.
    pub async fn flush_all(&self) {
        let task_ids: Vec<String> = {
            let streams = self.streams.read().await;
            streams
                .iter()
                .filter(|(_, s)| !s.buffer.is_empty())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for task_id in task_ids {
            self.flush_one(&task_id).await;
        }
    }

    async fn flush_one(&self, task_id: &str) {
        let (snapshot, origin, message_id, timed_out) = {
            let streams = self.streams.read().await;
            let Some(state) = streams.get(task_id) else {
                return;
            };
            let rendered = to_chat_markdown(&state.buffer);
            let snapshot = truncate_tail(&rendered, self.config.max_snapshot_chars);
            (
                snapshot,
                state.chat_origin.clone(),
                state.chat_message_id.clone(),
                state.pending.timed_out(self.config.retry_timeout_ms),
            )
        };

        if timed_out {
            warn!(task_id, "abandoning stream edit past retry timeout");
            return;
        }

        let result = match &message_id {
            Some(id) => self.chat.edit(&origin, id, &snapshot).await.map(|_| id.clone()),
            None => self.chat.post(&origin, &snapshot).await,
        };

        let mut streams = self.streams.write().await;
        let Some(state) = streams.get_mut(task_id) else {
            return;
        };
        match result {
            Ok(new_id) => {
                state.chat_message_id = Some(new_id);
                state.pending = PendingEditState::default();
                debug!(task_id, "flushed stream buffer");
            }
            Err(e) => {
                state.pending.record_attempt();
                warn!(task_id, error = %e, attempts = state.pending.attempts, "stream flush failed, buffer retained");
            }
        }
    }

    /// Force a final flush and remove the stream state, called on task
    /// terminal transition.
    pub async fn remove(&self, task_id: &str) {
        self.flush_one(task_id).await;
        self.streams.write().await.remove(task_id);
    }

    /// Replace the streaming message with the task's final result block (or
    /// post a fresh one if no streaming message exists yet), then drop the
    /// stream state. Called once on `task:complete`/`task:error`, after the
    /// streaming buffer stops being useful.
    pub async fn finalize(&self, task_id: &str, origin: &ChatOrigin, final_text: &str) {
        let message_id = {
            let streams = self.streams.read().await;
            streams.get(task_id).and_then(|s| s.chat_message_id.clone())
        };
        let rendered = to_chat_markdown(final_text);
        let result = match &message_id {
            Some(id) => self.chat.edit(origin, id, &rendered).await,
            None => self.chat.post(origin, &rendered).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!(task_id, error = %e, "failed to post final task result to chat");
        }
        self.streams.write().await.remove(task_id);
    }

    /// Spawn the periodic flusher loop, following the background-task
    /// pattern used for this codebase's other periodic maintenance loops.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.flush_all().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct RecordingChat {
        posts: AtomicUsize,
        edits: AtomicUsize,
        fail_next: Mutex<bool>,
    }

    #[async_trait::async_trait]
    impl ChatClient for RecordingChat {
        async fn post(&self, _origin: &ChatOrigin, _text: &str) -> crate::Result<String> {
            if *self.fail_next.lock().await {
                *self.fail_next.lock().await = false;
                return Err(crate::MeshError::NetworkTransient("boom".into()));
            }
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok("msg-1".to_string())
        }

        async fn edit(&self, _origin: &ChatOrigin, _id: &str, _text: &str) -> crate::Result<()> {
            if *self.fail_next.lock().await {
                *self.fail_next.lock().await = false;
                return Err(crate::MeshError::NetworkTransient("boom".into()));
            }
            self.edits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn origin() -> ChatOrigin {
        ChatOrigin {
            channel_id: "c1".into(),
            thread_ts: None,
            user_id: "u1".into(),
            message_ts: None,
        }
    }

    #[tokio::test]
    async fn first_flush_posts_then_edits() {
        let chat = Arc::new(RecordingChat {
            posts: AtomicUsize::new(0),
            edits: AtomicUsize::new(0),
            fail_next: Mutex::new(false),
        });
        let acc = StreamAccumulator::new(chat.clone(), StreamAccumulatorConfig::default());
        acc.add_delta("t1", "hello ", origin()).await;
        acc.flush_all().await;
        acc.add_delta("t1", "world", origin()).await;
        acc.flush_all().await;
        assert_eq!(chat.posts.load(Ordering::SeqCst), 1);
        assert_eq!(chat.edits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_flush_retains_buffer_for_retry() {
        let chat = Arc::new(RecordingChat {
            posts: AtomicUsize::new(0),
            edits: AtomicUsize::new(0),
            fail_next: Mutex::new(true),
        });
        let acc = StreamAccumulator::new(chat.clone(), StreamAccumulatorConfig::default());
        acc.add_delta("t1", "hello", origin()).await;
        acc.flush_all().await; // fails, buffer retained
        assert_eq!(chat.posts.load(Ordering::SeqCst), 0);
        acc.flush_all().await; // succeeds now
        assert_eq!(chat.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finalize_edits_existing_stream_message_in_place() {
        let chat = Arc::new(RecordingChat {
            posts: AtomicUsize::new(0),
            edits: AtomicUsize::new(0),
            fail_next: Mutex::new(false),
        });
        let acc = StreamAccumulator::new(chat.clone(), StreamAccumulatorConfig::default());
        acc.add_delta("t1", "partial...", origin()).await;
        acc.flush_all().await;
        assert_eq!(chat.posts.load(Ordering::SeqCst), 1);

        acc.finalize("t1", &origin(), "Task complete:\n\nfinal output").await;
        assert_eq!(chat.edits.load(Ordering::SeqCst), 1);
        assert!(acc.streams.read().await.get("t1").is_none());
    }

    #[tokio::test]
    async fn finalize_posts_fresh_message_when_no_stream_existed() {
        let chat = Arc::new(RecordingChat {
            posts: AtomicUsize::new(0),
            edits: AtomicUsize::new(0),
            fail_next: Mutex::new(false),
        });
        let acc = StreamAccumulator::new(chat.clone(), StreamAccumulatorConfig::default());
        acc.finalize("t2", &origin(), "Task failed: boom").await;
        assert_eq!(chat.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tail_biased_truncation_respects_limit() {
        let chat = Arc::new(RecordingChat {
            posts: AtomicUsize::new(0),
            edits: AtomicUsize::new(0),
            fail_next: Mutex::new(false),
        });
        let mut config = StreamAccumulatorConfig::default();
        config.max_snapshot_chars = 10;
        let acc = StreamAccumulator::new(chat, config);
        acc.add_delta("t1", &"x".repeat(100), origin()).await;
        acc.flush_all().await;
        let streams = acc.streams.read().await;
        // buffer itself is untouched; truncation only applies to the rendered snapshot.
        assert_eq!(streams.get("t1").unwrap().buffer.len(), 100);
    }
}
