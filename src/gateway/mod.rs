//! Gateway: the cloud side of the fabric. Owns the AgentManager, the Task
//! store, the offline queue, and the StreamAccumulator, and wires incoming
//! WebSocket connections through the auth handshake into the dispatcher.

pub mod agent_manager;
pub mod dispatcher;
pub mod stream_accumulator;
pub mod ws_server;

use crate::chat::ChatClient;
use crate::config::GatewayConfig;
use crate::envelope::{self, Envelope, EnvelopeType};
use crate::queue::dispatcher::QueueDispatcher;
use crate::queue::{InMemoryOfflineQueueStore, OfflineQueueStore};
use crate::task_store::{InMemoryTaskStore, TaskStore};
use agent_manager::{AgentEvent, AgentManager, SharedAgentManager};
use dispatcher::GatewayDispatcher;
use std::sync::Arc;
use stream_accumulator::StreamAccumulator;
use tracing::{error, info};

/// All the long-lived shared state a gateway process wires together.
pub struct Gateway {
    pub config: GatewayConfig,
    pub agents: SharedAgentManager,
    pub tasks: Arc<dyn TaskStore>,
    pub queue: Arc<InMemoryOfflineQueueStore>,
    pub dispatcher: Arc<GatewayDispatcher>,
    pub streams: Arc<StreamAccumulator>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, chat: Arc<dyn ChatClient>) -> Self {
        let agents = Arc::new(AgentManager::new());
        let tasks: Arc<dyn TaskStore> =
            Arc::new(InMemoryTaskStore::new(crate::constants::MAX_STORED_TASKS));
        let queue = Arc::new(InMemoryOfflineQueueStore::new(
            config.tunables.offline_queue_ttl_ms,
        ));
        let streams = StreamAccumulator::new(
            chat.clone(),
            stream_accumulator::StreamAccumulatorConfig {
                flush_interval_ms: config.tunables.stream_update_interval_ms,
                ..Default::default()
            },
        );
        let dispatcher = Arc::new(GatewayDispatcher::new(
            tasks.clone(),
            agents.clone(),
            streams.clone(),
            chat,
        ));
        Self {
            config,
            agents,
            tasks,
            queue,
            dispatcher,
            streams,
        }
    }

    /// Background loops: queue drain on reconnect, dead-connection sweep,
    /// periodic queue TTL cleanup, and the stream flush ticker.
    pub fn spawn_background_loops(self: &Arc<Self>) {
        self.streams.spawn_flush_loop();
        self.spawn_queue_drain_listener();
        self.spawn_dead_sweep();
        self.spawn_queue_cleanup();
    }

    fn spawn_queue_drain_listener(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = self.agents.subscribe();
        tokio::spawn(async move {
            let queue_dispatcher = QueueDispatcher::new(this.queue.clone());
            loop {
                match events.recv().await {
                    Ok(AgentEvent::Connected(agent_id)) => {
                        if let Err(e) = queue_dispatcher
                            .drain(&agent_id, this.agents.as_ref())
                            .await
                        {
                            error!(agent_id, error = %e, "offline queue drain failed");
                        }
                    }
                    Ok(AgentEvent::Disconnected(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "agent event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_dead_sweep(self: &Arc<Self>) {
        let this = self.clone();
        let interval_ms = this.config.tunables.agent_keepalive_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                this.agents.sweep_dead(interval_ms as i64).await;
            }
        });
    }

    fn spawn_queue_cleanup(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
                crate::constants::QUEUE_SWEEP_INTERVAL_MS,
            ));
            loop {
                ticker.tick().await;
                if let Ok(removed) = this.queue.clean_expired().await {
                    if removed > 0 {
                        info!(removed, "swept expired offline-queue entries");
                    }
                }
            }
        });
    }

    /// Submission entry (C10): persist the task, try a live send, fall back
    /// to the offline queue.
    pub async fn submit(&self, task: crate::models::Task) -> crate::Result<bool> {
        let agent_id = task.agent_id.clone();
        let task_id = task.id.clone();
        let submit_payload = envelope::TaskSubmit {
            task_id: task.id.clone(),
            project_id: task.project_id.clone(),
            bot_name: task.bot_name.clone(),
            command: task.command.clone(),
            prompt: task.prompt.clone(),
            system_prompt: task.system_prompt.clone(),
            local_path: task.local_path.clone(),
            model: task.model.clone(),
            max_budget: task.max_budget,
            allowed_tools: task.allowed_tools.clone(),
            chat_origin: task.chat_origin.clone(),
        };
        self.tasks.insert(task).await?;

        let bytes = envelope::encode_bytes(EnvelopeType::TaskSubmit, &submit_payload)?;
        if self.agents.send(&agent_id, bytes.clone()).await {
            info!(task_id, agent_id, "dispatched task to live agent");
            return Ok(true);
        }

        self.queue
            .enqueue(&agent_id, EnvelopeType::TaskSubmit.as_str(), bytes)
            .await?;
        info!(task_id, agent_id, "agent offline, task queued");
        Ok(false)
    }

    pub async fn cancel(&self, task_id: &str, reason: &str) -> crate::Result<()> {
        let task = self.tasks.get(task_id).await?;
        let cancel = envelope::TaskCancel {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        };
        let bytes = envelope::encode_bytes(EnvelopeType::TaskCancel, &cancel)?;
        if !self.agents.send(&task.agent_id, bytes).await {
            return Err(crate::MeshError::AgentOffline(task.agent_id));
        }
        Ok(())
    }

    /// Entry point for raw inbound bytes from an already-authenticated agent
    /// connection. Shared by the WS server loop and tests. `agent_id` is the
    /// connection's authenticated identity, not carried on every envelope
    /// (e.g. `heartbeat:ping` has no agent id field of its own).
    pub async fn handle_inbound(&self, agent_id: &str, raw: &[u8]) -> crate::Result<()> {
        let envelope: Envelope = envelope::decode(raw)?;
        self.dispatcher.dispatch(agent_id, &envelope).await
    }
}
