//! Core data model: tasks, chat origin, and agent status as seen by the gateway.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Where a task came from, so the gateway knows which chat message to edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatOrigin {
    pub channel_id: String,
    #[serde(default)]
    pub thread_ts: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub message_ts: Option<String>,
}

/// Lifecycle states for a task. Terminal states (`Completed`, `Failed`,
/// `Cancelled`) never transition further — see [`Task::transition`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Final outcome attached to `task:complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultSummary {
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

/// A unit of dispatched work, from submission through terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub agent_id: String,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<TaskResultSummary>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub max_budget: f64,
    pub files_changed: HashSet<String>,
    pub commands_run: HashSet<String>,
    pub chat_origin: ChatOrigin,
    /// Filesystem root on the target agent the task is scoped to; carried
    /// verbatim into `task:submit.localPath`.
    pub local_path: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Error raised when a transition doesn't match the state machine in §4.3.
#[derive(Debug, thiserror::Error)]
#[error("cannot transition task {task_id} from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: String,
        agent_id: String,
        bot_name: String,
        command: String,
        prompt: String,
        max_budget: f64,
        chat_origin: ChatOrigin,
        local_path: String,
        system_prompt: Option<String>,
        model: Option<String>,
        allowed_tools: Vec<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id,
            agent_id,
            bot_name,
            command,
            prompt,
            status: TaskStatus::Pending,
            result: None,
            error_message: None,
            session_id: None,
            input_tokens: 0,
            output_tokens: 0,
            estimated_cost: 0.0,
            max_budget,
            files_changed: HashSet::new(),
            commands_run: HashSet::new(),
            chat_origin,
            local_path,
            system_prompt,
            model,
            allowed_tools,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a state transition, rejecting anything illegal per the state
    /// machine in §4.3. Terminal states never accept a further transition.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), InvalidTransition> {
        let legal = matches!(
            (self.status, to),
            (TaskStatus::Pending, TaskStatus::Queued)
                | (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        );
        if !legal {
            return Err(InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Budget check applied at the task boundary, per §4.3.
    pub fn exceeds_budget(&self) -> bool {
        self.estimated_cost > self.max_budget
    }
}

/// Status an agent self-reports in `agent:status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatusReport {
    Online,
    Busy,
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_origin() -> ChatOrigin {
        ChatOrigin {
            channel_id: "c1".into(),
            thread_ts: None,
            user_id: "u1".into(),
            message_ts: None,
        }
    }

    #[test]
    fn pending_to_running_is_legal() {
        let mut t = Task::new(
            "p".into(),
            "a1".into(),
            "bot".into(),
            "implement".into(),
            "do it".into(),
            10.0,
            sample_origin(),
            "/work/p".into(),
            None,
            None,
            vec![],
        );
        assert!(t.transition(TaskStatus::Running).is_ok());
        assert_eq!(t.status, TaskStatus::Running);
    }

    #[test]
    fn terminal_state_rejects_further_transitions() {
        let mut t = Task::new(
            "p".into(),
            "a1".into(),
            "bot".into(),
            "implement".into(),
            "do it".into(),
            10.0,
            sample_origin(),
            "/work/p".into(),
            None,
            None,
            vec![],
        );
        t.transition(TaskStatus::Running).unwrap();
        t.transition(TaskStatus::Completed).unwrap();
        assert!(t.transition(TaskStatus::Running).is_err());
        assert!(t.transition(TaskStatus::Failed).is_err());
    }

    #[test]
    fn budget_check() {
        let mut t = Task::new(
            "p".into(),
            "a1".into(),
            "bot".into(),
            "implement".into(),
            "do it".into(),
            1.0,
            sample_origin(),
            "/work/p".into(),
            None,
            None,
            vec![],
        );
        t.estimated_cost = 2.5;
        assert!(t.exceeds_budget());
    }
}
