//! Concrete [`LlmInvoker`] backing the shipped agent binary, grounded on the
//! Claude Code CLI client's subprocess-management shape: binary discovery,
//! `--resume`/fresh-session handling, `--allowedTools`, and prompt delivery
//! over stdin. Adapted from a single `--output-format json` call-and-parse
//! into a `--output-format stream-json` line reader so the executor can
//! forward assistant text as it arrives instead of only at the end.

use super::llm::{InvocationRequest, InvocationResult, LlmInvoker, StopReason, StreamMessage};
use crate::MeshError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

pub struct ClaudeCliInvoker {
    binary: String,
    permission_mode: String,
}

impl ClaudeCliInvoker {
    pub async fn discover(permission_mode: impl Into<String>) -> crate::Result<Self> {
        let candidates = ["claude", "/usr/local/bin/claude", "/usr/bin/claude"];
        for path in candidates {
            if Command::new(path).arg("--help").output().await.is_ok() {
                return Ok(Self {
                    binary: path.to_string(),
                    permission_mode: permission_mode.into(),
                });
            }
        }
        Err(MeshError::internal(
            "claude CLI not found on PATH or common install locations",
        ))
    }
}

#[async_trait]
impl LlmInvoker for ClaudeCliInvoker {
    fn invoke(&self, request: InvocationRequest) -> BoxStream<'static, StreamMessage> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let binary = self.binary.clone();
        let permission_mode = self.permission_mode.clone();
        let max_turns = request.max_turns;

        tokio::spawn(async move {
            if let Err(e) = run_invocation(&binary, &permission_mode, &request, &tx, max_turns).await {
                warn!(error = %e, "claude CLI invocation failed");
                let _ = tx.send(StreamMessage::Result(InvocationResult {
                    text: format!("invocation failed: {e}"),
                    is_error: true,
                    stop_reason: StopReason::Completed,
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: 0.0,
                }));
            }
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

async fn run_invocation(
    binary: &str,
    permission_mode: &str,
    request: &InvocationRequest,
    tx: &tokio::sync::mpsc::UnboundedSender<StreamMessage>,
    max_turns: u32,
) -> crate::Result<()> {
    let mut command = Command::new(binary);
    command
        .args(["--print", "--output-format", "stream-json", "--permission-mode", permission_mode])
        .args(["--max-turns", &max_turns.to_string()])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .current_dir(&request.cwd);

    if let Some(resume) = &request.resume_session_id {
        command.args(["--resume", resume]);
    }
    if !request.allowed_tools.is_empty() {
        command.args(["--allowedTools", &request.allowed_tools.join(",")]);
    }
    if let Some(model) = &request.model {
        command.args(["--model", model]);
    }
    let cwd_str = request.cwd.to_string_lossy().to_string();
    command.args(["--add-dir", &cwd_str]);

    let mut child = command
        .spawn()
        .map_err(|e| MeshError::internal(format!("failed to spawn claude CLI: {e}")))?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin
            .write_all(request.prompt.as_bytes())
            .await
            .map_err(|e| MeshError::internal(format!("failed writing prompt to stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| MeshError::internal(format!("failed flushing stdin: {e}")))?;
    }
    drop(child.stdin.take());

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| MeshError::internal("claude CLI produced no stdout handle"))?;
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| MeshError::internal(format!("reading claude CLI output: {e}")))?
    {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(value) => {
                if let Some(message) = parse_line(&value, max_turns) {
                    let is_result = matches!(message, StreamMessage::Result(_));
                    let _ = tx.send(message);
                    if is_result {
                        return Ok(());
                    }
                }
            }
            Err(e) => debug!(line, error = %e, "skipping unparseable stream-json line"),
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| MeshError::internal(format!("waiting on claude CLI: {e}")))?;
    if !status.success() {
        return Err(MeshError::internal(format!(
            "claude CLI exited with status {status}"
        )));
    }
    Err(MeshError::internal(
        "claude CLI stream ended without a result message",
    ))
}

fn parse_line(value: &serde_json::Value, max_turns: u32) -> Option<StreamMessage> {
    match value.get("type").and_then(|t| t.as_str())? {
        "assistant" => {
            let text = value
                .pointer("/message/content/0/text")
                .and_then(|t| t.as_str())?
                .to_string();
            Some(StreamMessage::AssistantText { text })
        }
        "tool_use" => {
            let name = value.get("name").and_then(|n| n.as_str())?.to_string();
            let target = value
                .get("input")
                .and_then(|i| i.get("file_path").or_else(|| i.get("command")))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Some(StreamMessage::ToolUse { name, target })
        }
        "system" if value.get("subtype").and_then(|s| s.as_str()) == Some("init") => {
            let session_id = value.get("session_id").and_then(|s| s.as_str())?.to_string();
            Some(StreamMessage::SystemInit { session_id })
        }
        "result" => {
            let num_turns = value.get("num_turns").and_then(|n| n.as_u64()).unwrap_or(0) as u32;
            Some(StreamMessage::Result(InvocationResult {
                text: value.get("result").and_then(|r| r.as_str()).unwrap_or("").to_string(),
                is_error: value.get("is_error").and_then(|b| b.as_bool()).unwrap_or(false),
                stop_reason: if num_turns >= max_turns {
                    StopReason::TurnLimitReached
                } else {
                    StopReason::Completed
                },
                input_tokens: value
                    .pointer("/usage/input_tokens")
                    .and_then(|n| n.as_u64())
                    .unwrap_or(0),
                output_tokens: value
                    .pointer("/usage/output_tokens")
                    .and_then(|n| n.as_u64())
                    .unwrap_or(0),
                cost_usd: value.get("total_cost_usd").and_then(|n| n.as_f64()).unwrap_or(0.0),
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text_line() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#,
        )
        .unwrap();
        match parse_line(&value, 10).unwrap() {
            StreamMessage::AssistantText { text } => assert_eq!(text, "hello"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn result_line_flags_turn_limit() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"type":"result","num_turns":10,"result":"done"}"#).unwrap();
        match parse_line(&value, 10).unwrap() {
            StreamMessage::Result(r) => assert_eq!(r.stop_reason, StopReason::TurnLimitReached),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_type_is_skipped() {
        let value: serde_json::Value = serde_json::from_str(r#"{"type":"unknown"}"#).unwrap();
        assert!(parse_line(&value, 10).is_none());
    }
}
