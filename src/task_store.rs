//! Task store (C3): durable task records and the atomic state-machine
//! transitions that make dispatcher handlers idempotent (§4.7).

use crate::models::{Task, TaskStatus};
use crate::{MeshError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task) -> Result<()>;
    async fn get(&self, task_id: &str) -> Result<Task>;
    async fn list(&self, status: Option<TaskStatus>, project_id: Option<&str>) -> Result<Vec<Task>>;

    /// Attempt `task.status -> to`, failing rather than overwriting state
    /// when the task isn't in a state that legally admits `to`. A duplicate
    /// transition attempt (e.g. re-completing a completed task) returns
    /// `Ok(false)` so callers can log-and-ignore instead of treating it as
    /// an error.
    async fn try_transition(&self, task_id: &str, to: TaskStatus) -> Result<bool>;

    /// Record the agent-assigned continuation session id.
    async fn set_session_id(&self, task_id: &str, session_id: String) -> Result<()>;

    /// Record terminal metrics and result/error text alongside a transition.
    async fn set_outcome(&self, task_id: &str, outcome: TaskOutcome) -> Result<()>;

    /// Merge newly observed file/command touches into the task's running sets.
    async fn record_activity(&self, task_id: &str, files: &[String], commands: &[String]) -> Result<()>;
}

/// Fields set together when a task reaches a terminal state.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub result: Option<crate::models::TaskResultSummary>,
    pub error_message: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
}

pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    max_stored: usize,
}

impl InMemoryTaskStore {
    pub fn new(max_stored: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            max_stored,
        }
    }

    /// Drop the oldest terminal tasks once storage exceeds its retention
    /// bound, mirroring the teacher's periodic-cleanup approach but applied
    /// inline on insert rather than via a timer, since this store has no
    /// background loop of its own.
    async fn evict_if_over_capacity(&self, tasks: &mut HashMap<String, Task>) {
        if tasks.len() <= self.max_stored {
            return;
        }
        let mut terminal: Vec<(String, chrono::DateTime<chrono::Utc>)> = tasks
            .iter()
            .filter(|(_, t)| t.status.is_terminal())
            .map(|(id, t)| (id.clone(), t.updated_at))
            .collect();
        terminal.sort_by_key(|(_, ts)| *ts);
        let overflow = tasks.len() - self.max_stored;
        for (id, _) in terminal.into_iter().take(overflow) {
            tasks.remove(&id);
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.clone(), task);
        self.evict_if_over_capacity(&mut tasks).await;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| MeshError::NotFound(format!("task {task_id}")))
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        project_id: Option<&str>,
    ) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .filter(|t| project_id.map(|p| t.project_id == p).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn try_transition(&self, task_id: &str, to: TaskStatus) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::NotFound(format!("task {task_id}")))?;
        match task.transition(to) {
            Ok(()) => Ok(true),
            Err(_) if task.status == to => Ok(false),
            Err(_) if task.status.is_terminal() => {
                tracing::warn!(task_id, ?to, current = ?task.status, "ignoring transition into terminal task");
                Ok(false)
            }
            Err(e) => Err(MeshError::Validation(e.to_string())),
        }
    }

    async fn set_session_id(&self, task_id: &str, session_id: String) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::NotFound(format!("task {task_id}")))?;
        task.session_id = Some(session_id);
        task.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn set_outcome(&self, task_id: &str, outcome: TaskOutcome) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::NotFound(format!("task {task_id}")))?;
        task.result = outcome.result;
        task.error_message = outcome.error_message;
        task.input_tokens = outcome.input_tokens;
        task.output_tokens = outcome.output_tokens;
        task.estimated_cost = outcome.estimated_cost;
        task.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn record_activity(
        &self,
        task_id: &str,
        files: &[String],
        commands: &[String],
    ) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::NotFound(format!("task {task_id}")))?;
        task.files_changed.extend(files.iter().cloned());
        task.commands_run.extend(commands.iter().cloned());
        task.updated_at = chrono::Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatOrigin;

    fn sample_task() -> Task {
        Task::new(
            "p1".into(),
            "a1".into(),
            "bot".into(),
            "implement".into(),
            "do it".into(),
            10.0,
            ChatOrigin {
                channel_id: "c1".into(),
                thread_ts: None,
                user_id: "u1".into(),
                message_ts: None,
            },
            "/work/p1".into(),
            None,
            None,
            vec![],
        )
    }

    #[tokio::test]
    async fn duplicate_complete_is_noop_not_error() {
        let store = InMemoryTaskStore::new(100);
        let task = sample_task();
        let id = task.id.clone();
        store.insert(task).await.unwrap();
        store.try_transition(&id, TaskStatus::Running).await.unwrap();
        assert!(store
            .try_transition(&id, TaskStatus::Completed)
            .await
            .unwrap());
        // Second completion attempt: already terminal, no-op, no error.
        assert!(!store
            .try_transition(&id, TaskStatus::Completed)
            .await
            .unwrap());
        let task = store.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn illegal_transition_from_pending_to_completed_errors() {
        let store = InMemoryTaskStore::new(100);
        let task = sample_task();
        let id = task.id.clone();
        store.insert(task).await.unwrap();
        assert!(store
            .try_transition(&id, TaskStatus::Completed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn set_session_id_persists_on_the_task() {
        let store = InMemoryTaskStore::new(100);
        let task = sample_task();
        let id = task.id.clone();
        store.insert(task).await.unwrap();
        store.set_session_id(&id, "sess-42".into()).await.unwrap();
        let task = store.get(&id).await.unwrap();
        assert_eq!(task.session_id.as_deref(), Some("sess-42"));
    }

    #[tokio::test]
    async fn unknown_task_transition_not_found() {
        let store = InMemoryTaskStore::new(100);
        assert!(store
            .try_transition("missing", TaskStatus::Running)
            .await
            .is_err());
    }
}
