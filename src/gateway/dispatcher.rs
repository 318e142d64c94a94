//! Gateway dispatcher (C7): demultiplexes inbound envelopes by tag and
//! applies them to the Task store, AgentManager, and StreamAccumulator.
//! Every handler is idempotent — re-delivery of the same envelope (at-least-
//! once, per the fabric's Non-goals) must never corrupt state.

use crate::chat::ChatClient;
use crate::envelope::{self, Envelope, EnvelopeType};
use crate::gateway::agent_manager::SharedAgentManager;
use crate::gateway::stream_accumulator::StreamAccumulator;
use crate::models::{AgentStatusReport, TaskStatus};
use crate::task_store::{TaskOutcome, TaskStore};
use crate::MeshError;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub struct GatewayDispatcher {
    pub tasks: Arc<dyn TaskStore>,
    pub agents: SharedAgentManager,
    pub streams: Arc<StreamAccumulator>,
    chat: Arc<dyn ChatClient>,
    /// Per-task id of the most recent progress notice posted to chat, so
    /// subsequent notices edit in place rather than spamming new messages.
    progress_messages: RwLock<std::collections::HashMap<String, String>>,
}

impl GatewayDispatcher {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        agents: SharedAgentManager,
        streams: Arc<StreamAccumulator>,
        chat: Arc<dyn ChatClient>,
    ) -> Self {
        Self {
            tasks,
            agents,
            streams,
            chat,
            progress_messages: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Route one inbound envelope from an agent. Unknown tags are logged and
    /// ignored rather than treated as fatal, since forward-compatibility is
    /// a design goal of the codec itself (§4.1). `agent_id` is the sending
    /// connection's authenticated identity.
    pub async fn dispatch(&self, agent_id: &str, envelope: &Envelope) -> crate::Result<()> {
        let Some(ty) = EnvelopeType::parse(&envelope.kind) else {
            warn!(kind = %envelope.kind, "ignoring envelope with unknown type");
            return Ok(());
        };

        match ty {
            EnvelopeType::TaskAck => self.handle_ack(envelope).await,
            EnvelopeType::TaskProgress => self.handle_progress(envelope).await,
            EnvelopeType::TaskStream => self.handle_stream(envelope).await,
            EnvelopeType::TaskComplete => self.handle_complete(envelope).await,
            EnvelopeType::TaskError => self.handle_error(envelope).await,
            EnvelopeType::TaskCancelled => self.handle_cancelled(envelope).await,
            EnvelopeType::AgentStatus => self.handle_agent_status(envelope).await,
            EnvelopeType::HeartbeatPing => self.handle_heartbeat_ping(agent_id).await,
            EnvelopeType::HeartbeatPong => self.handle_heartbeat_pong(envelope).await,
            other => {
                debug!(tag = other.as_str(), "envelope handled elsewhere");
                Ok(())
            }
        }
    }

    /// Answer an agent's `heartbeat:ping` with `heartbeat:pong` (§4.8). An
    /// agent that never hears back force-closes the connection once its own
    /// liveness window elapses, so this reply is what keeps an idle-but-
    /// healthy connection open.
    async fn handle_heartbeat_ping(&self, agent_id: &str) -> crate::Result<()> {
        let pong = envelope::HeartbeatPong {
            agent_id: agent_id.to_string(),
            server_time: crate::now_ms(),
            active_tasks: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
        };
        let bytes = envelope::encode_bytes(EnvelopeType::HeartbeatPong, &pong)?;
        if !self.agents.send(agent_id, bytes).await {
            warn!(agent_id, "dropping heartbeat pong, agent not connected");
        }
        Ok(())
    }

    async fn handle_ack(&self, envelope: &Envelope) -> crate::Result<()> {
        let ack: envelope::TaskAck = envelope::decode_payload(envelope)?;
        if !ack.accepted {
            self.tasks.try_transition(&ack.task_id, TaskStatus::Failed).await?;
            self.tasks
                .set_outcome(
                    &ack.task_id,
                    TaskOutcome {
                        error_message: ack.reason.clone(),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }
        let target = if ack.queued {
            TaskStatus::Queued
        } else {
            TaskStatus::Running
        };
        self.tasks.try_transition(&ack.task_id, target).await?;
        Ok(())
    }

    async fn handle_progress(&self, envelope: &Envelope) -> crate::Result<()> {
        let progress: envelope::TaskProgress = envelope::decode_payload(envelope)?;
        debug!(task_id = %progress.task_id, message = %progress.message, "task progress");

        if let Some(session_id) = progress.session_id.clone() {
            self.tasks.set_session_id(&progress.task_id, session_id).await?;
        }

        let task = self.tasks.get(&progress.task_id).await?;
        let text = format!("[{:?}] {}", progress.kind, progress.message);
        let existing = self
            .progress_messages
            .read()
            .await
            .get(&progress.task_id)
            .cloned();
        let posted = match &existing {
            Some(id) => self
                .chat
                .edit(&task.chat_origin, id, &text)
                .await
                .map(|_| id.clone()),
            None => self.chat.post(&task.chat_origin, &text).await,
        };
        match posted {
            Ok(id) => {
                self.progress_messages
                    .write()
                    .await
                    .insert(progress.task_id.clone(), id);
            }
            Err(e) => {
                warn!(task_id = %progress.task_id, error = %e, "failed to post progress notice");
            }
        }
        Ok(())
    }

    async fn handle_stream(&self, envelope: &Envelope) -> crate::Result<()> {
        let stream: envelope::TaskStream = envelope::decode_payload(envelope)?;
        let task = self.tasks.get(&stream.task_id).await?;
        self.streams
            .add_delta(&stream.task_id, &stream.delta, task.chat_origin)
            .await;
        Ok(())
    }

    async fn handle_complete(&self, envelope: &Envelope) -> crate::Result<()> {
        let complete: envelope::TaskComplete = envelope::decode_payload(envelope)?;
        let task = self.tasks.get(&complete.task_id).await?;
        if task.status.is_terminal() {
            // Already terminal: re-delivery of a completion we've already applied.
            return Ok(());
        }

        let over_budget = complete.estimated_cost > task.max_budget;
        let target = if over_budget {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        let transitioned = self.tasks.try_transition(&complete.task_id, target).await?;
        if !transitioned {
            return Ok(());
        }

        self.tasks
            .record_activity(&complete.task_id, &complete.files_changed, &complete.commands_run)
            .await?;

        let error_message = if over_budget {
            Some(
                MeshError::BudgetExceeded {
                    estimated: complete.estimated_cost,
                    max: task.max_budget,
                }
                .to_string(),
            )
        } else {
            None
        };
        if over_budget {
            warn!(
                task_id = %complete.task_id,
                estimated = complete.estimated_cost,
                max = task.max_budget,
                "task exceeded budget, marking failed"
            );
        }
        self.tasks
            .set_outcome(
                &complete.task_id,
                TaskOutcome {
                    result: Some(complete.result.clone()),
                    error_message,
                    input_tokens: complete.input_tokens,
                    output_tokens: complete.output_tokens,
                    estimated_cost: complete.estimated_cost,
                },
            )
            .await?;

        let final_text = if over_budget {
            format!(
                "Task failed: budget exceeded (estimated {:.2}, max {:.2})",
                complete.estimated_cost, task.max_budget
            )
        } else if complete.result.is_error {
            format!("Task failed:\n\n{}", complete.result.output)
        } else {
            format!("Task complete:\n\n{}", complete.result.output)
        };
        self.streams
            .finalize(&complete.task_id, &task.chat_origin, &final_text)
            .await;
        self.progress_messages.write().await.remove(&complete.task_id);
        Ok(())
    }

    async fn handle_error(&self, envelope: &Envelope) -> crate::Result<()> {
        let error: envelope::TaskError = envelope::decode_payload(envelope)?;
        let task = self.tasks.get(&error.task_id).await?;
        if task.status.is_terminal() {
            return Ok(());
        }
        let transitioned = self
            .tasks
            .try_transition(&error.task_id, TaskStatus::Failed)
            .await?;
        if !transitioned {
            return Ok(());
        }
        self.tasks
            .set_outcome(
                &error.task_id,
                TaskOutcome {
                    error_message: Some(error.error.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let retry_hint = if error.recoverable { " (retryable)" } else { "" };
        let final_text = format!("Task failed: {}{retry_hint}", error.error);
        self.streams
            .finalize(&error.task_id, &task.chat_origin, &final_text)
            .await;
        self.progress_messages.write().await.remove(&error.task_id);
        Ok(())
    }

    async fn handle_cancelled(&self, envelope: &Envelope) -> crate::Result<()> {
        let cancelled: envelope::TaskCancelled = envelope::decode_payload(envelope)?;
        let transitioned = self
            .tasks
            .try_transition(&cancelled.task_id, TaskStatus::Cancelled)
            .await?;
        if transitioned {
            self.tasks
                .set_outcome(
                    &cancelled.task_id,
                    TaskOutcome {
                        error_message: Some(cancelled.reason),
                        ..Default::default()
                    },
                )
                .await?;
            self.streams.remove(&cancelled.task_id).await;
            self.progress_messages.write().await.remove(&cancelled.task_id);
        }
        Ok(())
    }

    async fn handle_agent_status(&self, envelope: &Envelope) -> crate::Result<()> {
        let status: envelope::AgentStatusPayload = envelope::decode_payload(envelope)?;
        let active: HashSet<String> = (0..status.active_tasks)
            .map(|i| format!("unlabeled-{i}"))
            .collect();
        self.agents
            .update_status(&status.agent_id, status.status, active)
            .await;
        if matches!(status.status, AgentStatusReport::Offline) {
            warn!(agent_id = %status.agent_id, "agent self-reported offline");
        }
        Ok(())
    }

    async fn handle_heartbeat_pong(&self, _envelope: &Envelope) -> crate::Result<()> {
        // heartbeat:pong is cloud-to-agent on the wire (the gateway's own
        // reply to heartbeat:ping, see handle_heartbeat_ping); an agent
        // should never send one, but a forward-incompatible agent build
        // might, so this stays a defensive no-op rather than an error.
        // Gateway-side liveness bookkeeping lives in the WS read loop's
        // `AgentManager::update_heartbeat` call on any inbound frame.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatClient;
    use crate::envelope::{encode, ProgressKind};
    use crate::gateway::agent_manager::AgentManager;
    use crate::models::{ChatOrigin, Task, TaskResultSummary as WireResult};
    use crate::task_store::InMemoryTaskStore;

    struct NoopChat;
    #[async_trait::async_trait]
    impl ChatClient for NoopChat {
        async fn post(&self, _o: &ChatOrigin, _t: &str) -> crate::Result<String> {
            Ok("m1".into())
        }
        async fn edit(&self, _o: &ChatOrigin, _id: &str, _t: &str) -> crate::Result<()> {
            Ok(())
        }
    }

    fn build() -> (Arc<InMemoryTaskStore>, GatewayDispatcher) {
        let tasks = Arc::new(InMemoryTaskStore::new(100));
        let agents = Arc::new(AgentManager::new());
        let streams = StreamAccumulator::new(
            Arc::new(NoopChat),
            crate::gateway::stream_accumulator::StreamAccumulatorConfig::default(),
        );
        let dispatcher = GatewayDispatcher::new(tasks.clone(), agents, streams, Arc::new(NoopChat));
        (tasks, dispatcher)
    }

    fn origin() -> ChatOrigin {
        ChatOrigin {
            channel_id: "c1".into(),
            thread_ts: None,
            user_id: "u1".into(),
            message_ts: None,
        }
    }

    fn sample_task() -> Task {
        Task::new(
            "p".into(),
            "a1".into(),
            "bot".into(),
            "x".into(),
            "y".into(),
            5.0,
            origin(),
            "/work/p".into(),
            None,
            None,
            vec![],
        )
    }

    #[tokio::test]
    async fn ack_accepted_transitions_to_running() {
        let (tasks, dispatcher) = build();
        let task = sample_task();
        let id = task.id.clone();
        tasks.insert(task).await.unwrap();

        let env = encode(
            EnvelopeType::TaskAck,
            &envelope::TaskAck {
                task_id: id.clone(),
                accepted: true,
                reason: None,
                queued: false,
                queue_position: None,
            },
        )
        .unwrap();
        dispatcher.dispatch("a1", &env).await.unwrap();
        assert_eq!(tasks.get(&id).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn duplicate_complete_is_idempotent() {
        let (tasks, dispatcher) = build();
        let task = sample_task();
        let id = task.id.clone();
        tasks.insert(task).await.unwrap();
        tasks.try_transition(&id, TaskStatus::Running).await.unwrap();

        let complete = envelope::TaskComplete {
            task_id: id.clone(),
            result: WireResult {
                output: "done".into(),
                is_error: false,
            },
            input_tokens: 10,
            output_tokens: 20,
            estimated_cost: 0.1,
            files_changed: vec!["a.rs".into()],
            commands_run: vec![],
            duration_ms: 5,
        };
        let env = encode(EnvelopeType::TaskComplete, &complete).unwrap();
        dispatcher.dispatch("a1", &env).await.unwrap();
        dispatcher.dispatch("a1", &env).await.unwrap(); // redelivery, must not error or corrupt
        let stored = tasks.get(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.input_tokens, 10);
    }

    #[tokio::test]
    async fn complete_over_budget_marks_failed() {
        let (tasks, dispatcher) = build();
        let task = sample_task(); // max_budget 5.0
        let id = task.id.clone();
        tasks.insert(task).await.unwrap();
        tasks.try_transition(&id, TaskStatus::Running).await.unwrap();

        let complete = envelope::TaskComplete {
            task_id: id.clone(),
            result: WireResult {
                output: "done".into(),
                is_error: false,
            },
            input_tokens: 10,
            output_tokens: 20,
            estimated_cost: 50.0,
            files_changed: vec![],
            commands_run: vec![],
            duration_ms: 5,
        };
        let env = encode(EnvelopeType::TaskComplete, &complete).unwrap();
        dispatcher.dispatch("a1", &env).await.unwrap();
        let stored = tasks.get(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error_message.unwrap().contains("budget"));
    }

    #[tokio::test]
    async fn unknown_envelope_type_is_ignored() {
        let (_tasks, dispatcher) = build();
        let env = Envelope {
            id: "x".into(),
            kind: "deploy:result".into(),
            payload: serde_json::json!({}),
            timestamp: 0,
        };
        dispatcher.dispatch("a1", &env).await.unwrap();
    }

    #[tokio::test]
    async fn progress_handler_does_not_touch_task_state() {
        let (tasks, dispatcher) = build();
        let task = sample_task();
        let id = task.id.clone();
        tasks.insert(task).await.unwrap();
        let env = encode(
            EnvelopeType::TaskProgress,
            &envelope::TaskProgress {
                task_id: id.clone(),
                kind: ProgressKind::Info,
                message: "step 1".into(),
                timestamp: 0,
                session_id: None,
            },
        )
        .unwrap();
        dispatcher.dispatch("a1", &env).await.unwrap();
        assert_eq!(tasks.get(&id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn progress_with_session_id_records_it_on_task() {
        let (tasks, dispatcher) = build();
        let task = sample_task();
        let id = task.id.clone();
        tasks.insert(task).await.unwrap();
        let env = encode(
            EnvelopeType::TaskProgress,
            &envelope::TaskProgress {
                task_id: id.clone(),
                kind: ProgressKind::Info,
                message: "session established".into(),
                timestamp: 0,
                session_id: Some("sess-1".into()),
            },
        )
        .unwrap();
        dispatcher.dispatch("a1", &env).await.unwrap();
        assert_eq!(tasks.get(&id).await.unwrap().session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn heartbeat_ping_replies_with_pong_to_the_sending_agent() {
        let (_tasks, dispatcher) = build();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        dispatcher.agents.register("a1", tx).await;

        let env = encode(
            EnvelopeType::HeartbeatPing,
            &envelope::HeartbeatPing { server_time: 0 },
        )
        .unwrap();
        dispatcher.dispatch("a1", &env).await.unwrap();

        let bytes = rx.recv().await.unwrap();
        let reply = envelope::decode(&bytes).unwrap();
        assert_eq!(reply.kind, "heartbeat:pong");
    }
}
