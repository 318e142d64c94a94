//! Agent task executor (C9): per-agent admission control, concurrency
//! bounding, and the per-task run loop including auto-continuation.
//!
//! Grounded on the orchestrator's execute_task/process_tasks admission shape
//! and the CLI client's session-resume/continuation handling, re-targeted at
//! the black-box streaming [`LlmInvoker`] rather than a subprocess.

use super::llm::{InvocationRequest, InvocationResult, LlmInvoker, StopReason, StreamMessage};
use crate::envelope::{self, EnvelopeType, ProgressKind};
use crate::{MeshError, Result};
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct ExecutorConfig {
    pub max_concurrent_tasks: usize,
    pub max_continuations: u32,
    pub max_turns_per_invocation: u32,
    pub project_roots: Vec<PathBuf>,
    pub task_timeout_ms: u64,
}

struct RunningTask {
    handle: JoinHandle<()>,
}

pub struct TaskExecutor {
    config: ExecutorConfig,
    llm: Arc<dyn LlmInvoker>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    running: RwLock<HashMap<String, RunningTask>>,
    /// Submits accepted under `task:ack{queued:true}` but not yet spawned,
    /// drained as running slots free up.
    pending: RwLock<VecDeque<envelope::TaskSubmit>>,
}

impl TaskExecutor {
    pub fn new(
        config: ExecutorConfig,
        llm: Arc<dyn LlmInvoker>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            llm,
            outbound,
            running: RwLock::new(HashMap::new()),
            pending: RwLock::new(VecDeque::new()),
        })
    }

    pub async fn active_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// Admit a `task:submit`, immediately sending `task:ack` and, if
    /// accepted without queueing, spawning the run loop.
    pub async fn submit(self: &Arc<Self>, submit: envelope::TaskSubmit) -> Result<()> {
        let task_id = submit.task_id.clone();

        if let Err(reason) = validate_path(&self.config.project_roots, &submit.local_path) {
            self.send_ack(&task_id, false, Some(reason), false, None)?;
            return Ok(());
        }

        let active = self.active_count().await;
        if active >= self.config.max_concurrent_tasks {
            // Accept-with-queue rather than reject outright (§4.9a).
            let queue_position = {
                let mut pending = self.pending.write().await;
                pending.push_back(submit.clone());
                pending.len()
            };
            self.send_ack(&task_id, true, None, true, Some(queue_position))?;
            info!(task_id, active, queue_position, "task queued locally, at admission limit");
            return Ok(());
        }

        self.send_ack(&task_id, true, None, false, None)?;
        self.spawn(submit).await;
        Ok(())
    }

    pub async fn cancel(&self, task_id: &str, reason: &str) -> Result<()> {
        {
            let mut pending = self.pending.write().await;
            if let Some(pos) = pending.iter().position(|s| s.task_id == task_id) {
                pending.remove(pos);
                let cancelled = envelope::TaskCancelled {
                    task_id: task_id.to_string(),
                    reason: reason.to_string(),
                };
                self.send(EnvelopeType::TaskCancelled, &cancelled)?;
                return Ok(());
            }
        }
        let mut running = self.running.write().await;
        if let Some(task) = running.remove(task_id) {
            task.handle.abort();
            let cancelled = envelope::TaskCancelled {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
            };
            self.send(EnvelopeType::TaskCancelled, &cancelled)?;
        }
        Ok(())
    }

    fn spawn<'a>(
        self: &'a Arc<Self>,
        submit: envelope::TaskSubmit,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let this = self.clone();
            let task_id = submit.task_id.clone();
            let cleanup_id = task_id.clone();
            let timeout = Duration::from_millis(self.config.task_timeout_ms);
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(timeout, this.run(submit)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(task_id = %cleanup_id, error = %e, "task execution failed");
                    }
                    Err(_) => {
                        warn!(task_id = %cleanup_id, "task timed out");
                        if let Err(e) = this.send_error(&cleanup_id, "task timed out", false) {
                            warn!(task_id = %cleanup_id, error = %e, "failed to report task timeout");
                        }
                    }
                }
                this.running.write().await.remove(&cleanup_id);
                this.try_dispatch_next().await;
            });
            // Insert before returning so a cancel() issued right after submit()
            // always finds either the handle or an already-finished task.
            self.running
                .write()
                .await
                .insert(task_id, RunningTask { handle });
        })
    }

    /// Pull the next locally queued submit, if any, now that a run slot has
    /// freed up. Re-validates the path since project roots don't change at
    /// runtime but this keeps the check in one place.
    async fn try_dispatch_next(self: &Arc<Self>) {
        if self.active_count().await >= self.config.max_concurrent_tasks {
            return;
        }
        let next = self.pending.write().await.pop_front();
        if let Some(submit) = next {
            if let Err(reason) = validate_path(&self.config.project_roots, &submit.local_path) {
                let _ = self.send_error(&submit.task_id, &reason, false);
                return;
            }
            self.spawn(submit).await;
        }
    }

    async fn run(self: &Arc<Self>, submit: envelope::TaskSubmit) -> Result<()> {
        let task_id = submit.task_id.clone();
        let cwd = PathBuf::from(&submit.local_path);
        let mut files_changed = HashSet::new();
        let mut commands_run = HashSet::new();
        let mut session_id: Option<String> = None;
        let mut continuation: u32 = 0;

        let mut request = InvocationRequest {
            prompt: submit.prompt.clone(),
            system_prompt: submit.system_prompt.clone(),
            model: submit.model.clone(),
            max_turns: self.config.max_turns_per_invocation,
            cwd: cwd.clone(),
            allowed_tools: submit.allowed_tools.clone(),
            resume_session_id: None,
        };

        loop {
            let result = self
                .drive_invocation(&task_id, &mut request, &mut files_changed, &mut commands_run, &mut session_id)
                .await?;

            match result.stop_reason {
                StopReason::Completed => {
                    self.send_complete(&task_id, &result, &files_changed, &commands_run)?;
                    return Ok(());
                }
                StopReason::TurnLimitReached => {
                    if continuation >= self.config.max_continuations {
                        self.send_error(&task_id, "Continuation limit reached", false)?;
                        return Ok(());
                    }
                    continuation += 1;
                    self.send_progress(
                        &task_id,
                        ProgressKind::Info,
                        &format!(
                            "Auto-continuing task ({continuation}/{})...",
                            self.config.max_continuations
                        ),
                        None,
                    )?;
                    request.resume_session_id = session_id.clone();
                    request.prompt = "Continue the previous task.".to_string();
                }
            }
        }
    }

    async fn drive_invocation(
        &self,
        task_id: &str,
        request: &mut InvocationRequest,
        files_changed: &mut HashSet<String>,
        commands_run: &mut HashSet<String>,
        session_id: &mut Option<String>,
    ) -> Result<InvocationResult> {
        let mut stream = self.llm.invoke(request.clone());
        while let Some(message) = stream.next().await {
            match message {
                StreamMessage::AssistantText { text } => {
                    self.send_stream(task_id, &text)?;
                }
                StreamMessage::ToolUse { name, target } => {
                    if let Some(target) = &target {
                        if name == "write" || name == "edit" {
                            files_changed.insert(target.clone());
                        } else {
                            commands_run.insert(format!("{name} {target}"));
                        }
                    } else {
                        commands_run.insert(name.clone());
                    }
                    self.send_progress(task_id, ProgressKind::ToolUse, &name, None)?;
                }
                StreamMessage::SystemInit { session_id: id } => {
                    *session_id = Some(id.clone());
                    self.send_progress(task_id, ProgressKind::Info, "session started", Some(id))?;
                }
                StreamMessage::Result(result) => return Ok(result),
            }
        }
        Err(MeshError::internal("llm stream ended without a result message"))
    }

    fn send_ack(
        &self,
        task_id: &str,
        accepted: bool,
        reason: Option<String>,
        queued: bool,
        queue_position: Option<usize>,
    ) -> Result<()> {
        self.send(
            EnvelopeType::TaskAck,
            &envelope::TaskAck {
                task_id: task_id.to_string(),
                accepted,
                reason,
                queued,
                queue_position,
            },
        )
    }

    fn send_progress(
        &self,
        task_id: &str,
        kind: ProgressKind,
        message: &str,
        session_id: Option<String>,
    ) -> Result<()> {
        self.send(
            EnvelopeType::TaskProgress,
            &envelope::TaskProgress {
                task_id: task_id.to_string(),
                kind,
                message: message.to_string(),
                timestamp: crate::now_ms(),
                session_id,
            },
        )
    }

    fn send_stream(&self, task_id: &str, delta: &str) -> Result<()> {
        self.send(
            EnvelopeType::TaskStream,
            &envelope::TaskStream {
                task_id: task_id.to_string(),
                delta: delta.to_string(),
                timestamp: crate::now_ms(),
            },
        )
    }

    fn send_complete(
        &self,
        task_id: &str,
        result: &InvocationResult,
        files_changed: &HashSet<String>,
        commands_run: &HashSet<String>,
    ) -> Result<()> {
        self.send(
            EnvelopeType::TaskComplete,
            &envelope::TaskComplete {
                task_id: task_id.to_string(),
                result: crate::models::TaskResultSummary {
                    output: result.text.clone(),
                    is_error: result.is_error,
                },
                input_tokens: result.input_tokens,
                output_tokens: result.output_tokens,
                estimated_cost: result.cost_usd,
                files_changed: files_changed.iter().cloned().collect(),
                commands_run: commands_run.iter().cloned().collect(),
                duration_ms: 0,
            },
        )
    }

    fn send_error(&self, task_id: &str, error: &str, recoverable: bool) -> Result<()> {
        self.send(
            EnvelopeType::TaskError,
            &envelope::TaskError {
                task_id: task_id.to_string(),
                error: error.to_string(),
                recoverable,
            },
        )
    }

    fn send<T: serde::Serialize>(&self, kind: EnvelopeType, payload: &T) -> Result<()> {
        let bytes = envelope::encode_bytes(kind, payload)?;
        self.outbound
            .send(bytes)
            .map_err(|_| MeshError::internal("outbound channel closed"))
    }
}

/// Normalize `local_path` and require it to resolve inside one of the
/// registered project roots, rejecting before any filesystem effect (§4.9).
fn validate_path(roots: &[PathBuf], local_path: &str) -> std::result::Result<PathBuf, String> {
    let candidate = Path::new(local_path);
    let normalized = normalize(candidate);
    for root in roots {
        let root_normalized = normalize(root);
        if normalized.starts_with(&root_normalized) {
            return Ok(normalized);
        }
    }
    Err(format!("path {local_path} is outside registered project roots"))
}

/// Lexical normalization (no filesystem access) so a task never needs to
/// exist on disk yet for this check to run.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream};

    #[test]
    fn rejects_path_traversal_outside_roots() {
        let roots = vec![PathBuf::from("/work/project")];
        let err = validate_path(&roots, "/work/project/../../etc/passwd").unwrap_err();
        assert!(err.contains("outside registered project roots"));
    }

    #[test]
    fn accepts_path_inside_root() {
        let roots = vec![PathBuf::from("/work/project")];
        assert!(validate_path(&roots, "/work/project/src/main.rs").is_ok());
    }

    struct ImmediateCompleteInvoker;

    #[async_trait]
    impl LlmInvoker for ImmediateCompleteInvoker {
        fn invoke(&self, _request: InvocationRequest) -> BoxStream<'static, StreamMessage> {
            Box::pin(stream::iter(vec![StreamMessage::Result(InvocationResult {
                text: "done".into(),
                is_error: false,
                stop_reason: StopReason::Completed,
                input_tokens: 1,
                output_tokens: 1,
                cost_usd: 0.01,
            })]))
        }
    }

    struct HangingInvoker;

    #[async_trait]
    impl LlmInvoker for HangingInvoker {
        fn invoke(&self, _request: InvocationRequest) -> BoxStream<'static, StreamMessage> {
            Box::pin(stream::unfold((), |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                None
            }))
        }
    }

    fn config(roots: Vec<PathBuf>) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent_tasks: 1,
            max_continuations: 1,
            max_turns_per_invocation: 10,
            project_roots: roots,
            task_timeout_ms: 50,
        }
    }

    fn submit(task_id: &str) -> envelope::TaskSubmit {
        envelope::TaskSubmit {
            task_id: task_id.to_string(),
            project_id: "p1".into(),
            bot_name: "bot".into(),
            command: "implement".into(),
            prompt: "do it".into(),
            system_prompt: None,
            local_path: "/work/project".into(),
            model: None,
            max_budget: 5.0,
            allowed_tools: vec![],
            chat_origin: crate::models::ChatOrigin {
                channel_id: "c1".into(),
                thread_ts: None,
                user_id: "u1".into(),
                message_ts: None,
            },
        }
    }

    #[tokio::test]
    async fn queued_submit_is_dispatched_once_a_slot_frees() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = TaskExecutor::new(
            config(vec![PathBuf::from("/work/project")]),
            Arc::new(ImmediateCompleteInvoker),
            tx,
        );

        executor.submit(submit("t1")).await.unwrap();
        executor.submit(submit("t2")).await.unwrap();

        // t1: ack(accepted, not queued), t2: ack(accepted, queued)
        let ack1 = rx.recv().await.unwrap();
        assert!(envelope::decode(&ack1).unwrap().kind == "task:ack");
        let ack2 = rx.recv().await.unwrap();
        let env2 = envelope::decode(&ack2).unwrap();
        let payload: envelope::TaskAck = envelope::decode_payload(&env2).unwrap();
        assert!(payload.queued);
        assert_eq!(payload.queue_position, Some(1));

        // t1 completes quickly, freeing a slot for t2 to be spawned and also complete.
        let mut saw_complete_for = Vec::new();
        for _ in 0..2 {
            let bytes = rx.recv().await.unwrap();
            let env = envelope::decode(&bytes).unwrap();
            if env.kind == "task:complete" {
                let complete: envelope::TaskComplete = envelope::decode_payload(&env).unwrap();
                saw_complete_for.push(complete.task_id);
            }
        }
        assert_eq!(saw_complete_for.len(), 2);
    }

    #[tokio::test]
    async fn task_exceeding_timeout_emits_unrecoverable_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = TaskExecutor::new(
            config(vec![PathBuf::from("/work/project")]),
            Arc::new(HangingInvoker),
            tx,
        );

        executor.submit(submit("t1")).await.unwrap();

        let ack = rx.recv().await.unwrap();
        assert_eq!(envelope::decode(&ack).unwrap().kind, "task:ack");
        let err_bytes = rx.recv().await.unwrap();
        let env = envelope::decode(&err_bytes).unwrap();
        assert_eq!(env.kind, "task:error");
        let error: envelope::TaskError = envelope::decode_payload(&env).unwrap();
        assert!(!error.recoverable);
    }
}
