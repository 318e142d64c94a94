//! The LLM invocation library itself is out of scope for this fabric — it is
//! treated as a black-box streaming function, named here only by the
//! interface the executor drives it through.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_turns: u32,
    pub cwd: std::path::PathBuf,
    pub allowed_tools: Vec<String>,
    /// Set when continuing a prior invocation that hit its turn ceiling.
    pub resume_session_id: Option<String>,
}

/// One message from the streaming invocation, loosely typed upstream (the
/// "as any" coercion noted in the design notes) — this pins the discriminant
/// and the minimum fields the executor reads.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    AssistantText { text: String },
    ToolUse { name: String, target: Option<String> },
    SystemInit { session_id: String },
    Result(InvocationResult),
}

#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub text: String,
    pub is_error: bool,
    pub stop_reason: StopReason,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    TurnLimitReached,
}

/// The black-box streaming entry point. A real deployment backs this with
/// whatever LLM invocation library it uses; this crate only defines the seam.
#[async_trait]
pub trait LlmInvoker: Send + Sync {
    fn invoke(&self, request: InvocationRequest) -> BoxStream<'static, StreamMessage>;
}
