//! Chat notice texts.
//!
//! Notices use Telegram Markdown (v1) since the transport sends
//! `parse_mode=Markdown` by default. Interpolated names and roles go through
//! [`escape_markdown`] and are kept outside `*bold*` spans, where legacy
//! Markdown does not allow escapes.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use herald_core::Request;
use herald_core::chat::{ChatError, ChatTransport};
use herald_core::tag;

#[derive(Debug, Error)]
pub enum NoticeError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("Chat call timed out after {0:?}")]
    Timeout(Duration),
}

/// Chat transport with a per-call timeout.
#[derive(Clone)]
pub struct Notifier {
    chat: Arc<dyn ChatTransport>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(chat: Arc<dyn ChatTransport>, timeout: Duration) -> Self {
        Self { chat, timeout }
    }

    pub async fn send(&self, chat_id: i64, text: &str) -> Result<(), NoticeError> {
        tokio::time::timeout(self.timeout, self.chat.send_message(chat_id, text))
            .await
            .map_err(|_| NoticeError::Timeout(self.timeout))?
            .map_err(NoticeError::from)
    }
}

/// Escape the legacy Markdown entity markers (`_`, `*`, `` ` ``, `[`) in
/// free text placed outside an entity.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn online(name: &str, role: &str) -> String {
    // Code spans are not parsed, so the raw name is safe inside one.
    format!(
        "🤖 @{} is now online!\n\n📋 *Role:* {}\n\nCall me with: `/cc @{name} <request>`",
        escape_markdown(name),
        escape_markdown(role)
    )
}

pub fn offline(name: &str) -> String {
    format!("👋 @{} is now offline.", escape_markdown(name))
}

pub fn not_running(name: &str) -> String {
    format!("❌ @{} is not running. Please start it first.", escape_markdown(name))
}

pub fn unreachable(name: &str) -> String {
    format!("❌ Failed to reach @{}. Try again.", escape_markdown(name))
}

/// Instruction injected into the execution channel for `req`.
///
/// The routing tag is stripped; provenance and the reply target are added
/// so the worker knows who asked and where to answer.
pub fn prompt(req: &Request, instance: &str) -> String {
    let clean = tag::strip_tag(&req.request, instance);
    format!(
        "[Chat from {}] {clean}\n\nReply to chat_id {} using the send_message tool when done.",
        req.requester_label(),
        req.chat_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herald_core::RequestStatus;

    #[test]
    fn prompt_strips_tag_and_names_requester() {
        let req = Request {
            id: 1,
            chat_id: -100,
            user_id: 7,
            username: Some("ada_l".into()),
            first_name: None,
            request: "@coder fix the bug".into(),
            status: RequestStatus::Processing,
            created_at: Utc::now(),
            claimed_at: None,
            responded_at: None,
        };
        assert_eq!(
            prompt(&req, "coder"),
            "[Chat from ada_l] fix the bug\n\nReply to chat_id -100 using the send_message tool when done."
        );
    }

    #[test]
    fn notices_mention_instance() {
        assert_eq!(not_running("coder"), "❌ @coder is not running. Please start it first.");
        assert_eq!(unreachable("coder"), "❌ Failed to reach @coder. Try again.");
        assert_eq!(offline("coder"), "👋 @coder is now offline.");
        assert!(online("coder", "Writes code").contains("*Role:* Writes code"));
    }

    /// Unescaped `_`, `*` and `[` outside code spans, which Telegram's legacy
    /// parser would read as entity openers.
    fn open_markers(text: &str) -> Vec<char> {
        let mut markers = Vec::new();
        let mut chars = text.chars();
        let mut in_code = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' if !in_code => {
                    chars.next();
                }
                '`' => in_code = !in_code,
                '_' | '*' | '[' if !in_code => markers.push(c),
                _ => {}
            }
        }
        markers
    }

    #[test]
    fn underscored_names_are_escaped() {
        assert_eq!(
            not_running("my_bot"),
            "❌ @my\\_bot is not running. Please start it first."
        );
        assert!(open_markers(&not_running("my_bot")).is_empty());
        assert!(open_markers(&unreachable("code_review-2")).is_empty());
        assert!(open_markers(&offline("my_bot")).is_empty());
    }

    #[test]
    fn online_notice_keeps_only_its_own_bold_markers() {
        let text = online("my_bot", "Reviews *risky* [PRs] in snake_case");
        assert_eq!(open_markers(&text), vec!['*', '*']);
        assert!(text.contains("`/cc @my_bot <request>`"));
        assert!(text.contains(r"Reviews \*risky\* \[PRs] in snake\_case"));
    }

    #[test]
    fn escape_leaves_plain_text() {
        assert_eq!(escape_markdown("coder-2"), "coder-2");
        assert_eq!(escape_markdown("a_b*c`d[e]"), r"a\_b\*c\`d\[e]");
    }
}
