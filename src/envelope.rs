//! Wire envelope codec (C1).
//!
//! Every message crossing the gateway/agent boundary is a tagged, timestamped,
//! uniquely-identified envelope. The codec fails closed on unknown `id`/`type`/
//! `timestamp` shapes but tolerates unknown optional fields inside `payload` so
//! a newer agent and an older gateway (or vice versa) can still talk.

use crate::models::{AgentStatusReport, ChatOrigin, TaskResultSummary};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The envelope as it appears on the wire: `{ id, type, payload, timestamp }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

/// Strongly-typed payload variants, one per envelope tag in the wire table.
/// `serde(tag = "type")` is not used here because the outer `Envelope.kind`
/// already carries the tag; this enum is decoded from `Envelope.payload`
/// once the tag has selected a variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    AuthRequest(AuthRequest),
    AuthResponse(AuthResponse),
    HeartbeatPing(HeartbeatPing),
    HeartbeatPong(HeartbeatPong),
    TaskSubmit(TaskSubmit),
    TaskAck(TaskAck),
    TaskProgress(TaskProgress),
    TaskStream(TaskStream),
    TaskComplete(TaskComplete),
    TaskError(TaskError),
    TaskCancel(TaskCancel),
    TaskCancelled(TaskCancelled),
    AgentStatus(AgentStatusPayload),
    SystemRestart(SystemRestart),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub agent_id: String,
    pub api_key: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPong {
    pub agent_id: String,
    pub server_time: i64,
    pub active_tasks: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmit {
    pub task_id: String,
    pub project_id: String,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub local_path: String,
    #[serde(default)]
    pub model: Option<String>,
    pub max_budget: f64,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub chat_origin: ChatOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAck {
    pub task_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub queue_position: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    ToolUse,
    Thinking,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub message: String,
    pub timestamp: i64,
    /// Set once, the first time a continuation session id is captured, so
    /// the gateway can record it without a dedicated wire message.
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStream {
    pub task_id: String,
    pub delta: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComplete {
    pub task_id: String,
    pub result: TaskResultSummary,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub files_changed: Vec<String>,
    pub commands_run: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub task_id: String,
    pub error: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancel {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelled {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusPayload {
    pub agent_id: String,
    pub status: AgentStatusReport,
    pub active_tasks: usize,
    pub version: String,
    #[serde(default)]
    pub resource_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemRestart {
    pub reason: String,
    pub rebuild: bool,
}

/// Envelope tags, matching the wire table. `as_str`/`FromStr` are the single
/// source of truth so the dispatcher and the encoder never disagree on spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    AuthRequest,
    AuthResponse,
    HeartbeatPing,
    HeartbeatPong,
    TaskSubmit,
    TaskAck,
    TaskProgress,
    TaskStream,
    TaskComplete,
    TaskError,
    TaskCancel,
    TaskCancelled,
    AgentStatus,
    SystemRestart,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::AuthRequest => "auth:request",
            EnvelopeType::AuthResponse => "auth:response",
            EnvelopeType::HeartbeatPing => "heartbeat:ping",
            EnvelopeType::HeartbeatPong => "heartbeat:pong",
            EnvelopeType::TaskSubmit => "task:submit",
            EnvelopeType::TaskAck => "task:ack",
            EnvelopeType::TaskProgress => "task:progress",
            EnvelopeType::TaskStream => "task:stream",
            EnvelopeType::TaskComplete => "task:complete",
            EnvelopeType::TaskError => "task:error",
            EnvelopeType::TaskCancel => "task:cancel",
            EnvelopeType::TaskCancelled => "task:cancelled",
            EnvelopeType::AgentStatus => "agent:status",
            EnvelopeType::SystemRestart => "system:restart",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "auth:request" => EnvelopeType::AuthRequest,
            "auth:response" => EnvelopeType::AuthResponse,
            "heartbeat:ping" => EnvelopeType::HeartbeatPing,
            "heartbeat:pong" => EnvelopeType::HeartbeatPong,
            "task:submit" => EnvelopeType::TaskSubmit,
            "task:ack" => EnvelopeType::TaskAck,
            "task:progress" => EnvelopeType::TaskProgress,
            "task:stream" => EnvelopeType::TaskStream,
            "task:complete" => EnvelopeType::TaskComplete,
            "task:error" => EnvelopeType::TaskError,
            "task:cancel" => EnvelopeType::TaskCancel,
            "task:cancelled" => EnvelopeType::TaskCancelled,
            "agent:status" => EnvelopeType::AgentStatus,
            "system:restart" => EnvelopeType::SystemRestart,
            _ => return None,
        })
    }
}

/// Encode a tagged payload into a fresh envelope, stamping a new id and timestamp.
pub fn encode<T: Serialize>(kind: EnvelopeType, payload: &T) -> crate::Result<Envelope> {
    let payload = serde_json::to_value(payload)?;
    Ok(Envelope {
        id: Uuid::new_v4().to_string(),
        kind: kind.as_str().to_string(),
        payload,
        timestamp: crate::now_ms(),
    })
}

pub fn encode_bytes<T: Serialize>(kind: EnvelopeType, payload: &T) -> crate::Result<Vec<u8>> {
    let envelope = encode(kind, payload)?;
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decode raw bytes into an envelope. Fails closed: a missing/malformed `id`,
/// `type`, or `timestamp` is an error even if `payload` itself is well-formed.
pub fn decode(bytes: &[u8]) -> crate::Result<Envelope> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let obj = value
        .as_object()
        .ok_or_else(|| crate::MeshError::Validation("envelope must be a JSON object".into()))?;

    let id = obj
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| crate::MeshError::Validation("envelope missing string `id`".into()))?
        .to_string();
    let kind = obj
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| crate::MeshError::Validation("envelope missing string `type`".into()))?
        .to_string();
    let timestamp = obj
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| crate::MeshError::Validation("envelope missing integer `timestamp`".into()))?;
    let payload = obj
        .get("payload")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    Ok(Envelope {
        id,
        kind,
        payload,
        timestamp,
    })
}

/// Decode an envelope's payload into a strongly-typed struct once the caller
/// already knows which variant the tag selects. Unknown optional fields in
/// `payload` are tolerated by `serde`'s default field handling.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(envelope: &Envelope) -> crate::Result<T> {
    Ok(serde_json::from_value(envelope.payload.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_task_submit() {
        let submit = TaskSubmit {
            task_id: "t1".into(),
            project_id: "p1".into(),
            bot_name: "bot".into(),
            command: "implement".into(),
            prompt: "add tests".into(),
            system_prompt: None,
            local_path: "/work/p1".into(),
            model: None,
            max_budget: 5.0,
            allowed_tools: vec!["bash".into()],
            chat_origin: ChatOrigin {
                channel_id: "c1".into(),
                thread_ts: None,
                user_id: "u1".into(),
                message_ts: None,
            },
        };
        let bytes = encode_bytes(EnvelopeType::TaskSubmit, &submit).unwrap();
        let envelope = decode(&bytes).unwrap();
        assert_eq!(envelope.kind, "task:submit");
        let decoded: TaskSubmit = decode_payload(&envelope).unwrap();
        assert_eq!(decoded.task_id, submit.task_id);
        assert_eq!(decoded.prompt, submit.prompt);
    }

    #[test]
    fn rejects_missing_type() {
        let raw = serde_json::json!({ "id": "x", "timestamp": 1, "payload": {} });
        let err = decode(raw.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, crate::MeshError::Validation(_)));
    }

    #[test]
    fn tolerates_unknown_payload_fields() {
        let raw = serde_json::json!({
            "id": "x",
            "type": "heartbeat:ping",
            "timestamp": 1,
            "payload": { "server_time": 1, "future_field": "ignored" }
        });
        let envelope = decode(raw.to_string().as_bytes()).unwrap();
        let ping: HeartbeatPing = decode_payload(&envelope).unwrap();
        assert_eq!(ping.server_time, 1);
    }

    #[test]
    fn tag_round_trips_through_str() {
        for tag in [
            "auth:request",
            "task:submit",
            "task:complete",
            "agent:status",
        ] {
            let ty = EnvelopeType::parse(tag).unwrap();
            assert_eq!(ty.as_str(), tag);
        }
    }
}
