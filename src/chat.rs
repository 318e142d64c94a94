//! Chat-platform boundary: the `ChatClient` trait is the external
//! collaborator named in scope as out-of-bounds (command parsing, block
//! formatting, reactions belong to the chat-platform integration itself).
//! What lives here is strictly: the narrow interface the gateway calls
//! through, and the markdown-to-chat text transform, which is a pure
//! function the fabric owns because its idempotency is a tested invariant
//! (§8 round-trip laws).

use crate::models::ChatOrigin;
use async_trait::async_trait;

/// Minimal surface the gateway needs from whatever chat platform is wired in.
/// `post` creates a new message and returns its id; `edit` replaces the
/// content of a previously posted message.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn post(&self, origin: &ChatOrigin, text: &str) -> crate::Result<String>;
    async fn edit(&self, origin: &ChatOrigin, message_id: &str, text: &str) -> crate::Result<()>;
}

/// Sanitizes raw agent-produced text for posting to chat. HTML-escapes the
/// content and collapses the sentinel this function itself emits, so that
/// applying it a second time to its own output is a no-op — required by the
/// markdown-to-chat idempotency law in §8.
pub fn to_chat_markdown(raw: &str) -> String {
    const MARKER: &str = "\u{2063}"; // invisible separator, never emitted by agents
    if raw.contains(MARKER) {
        // Already transformed once; escaping again would double-escape entities.
        return raw.to_string();
    }
    let escaped = html_escape::encode_text(raw);
    format!("{MARKER}{escaped}")
}

/// Tail-biased truncation used by the StreamAccumulator (§4.6): keep the most
/// recent `max_chars` characters, prefixed with an ellipsis marker when
/// truncation actually occurred.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= max_chars {
        return text.to_string();
    }
    let skip = char_count - max_chars;
    let tail: String = text.chars().skip(skip).collect();
    format!("…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_transform_is_idempotent() {
        let raw = "<script>alert(1)</script> some *text*";
        let once = to_chat_markdown(raw);
        let twice = to_chat_markdown(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn truncate_tail_keeps_freshest_content() {
        let text = "0123456789";
        let truncated = truncate_tail(text, 4);
        assert_eq!(truncated, "…6789");
    }

    #[test]
    fn truncate_tail_noop_under_limit() {
        let text = "short";
        assert_eq!(truncate_tail(text, 100), text);
    }
}
