//! tmux session channel.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ChannelError, ExecutionChannel, require_success, run_with_timeout};

/// Injects text into a tmux session with `send-keys`.
///
/// Arguments go straight to the tmux binary, so no shell quoting is
/// involved. The text is sent with `-l` (literal, no key-name lookup) and
/// submitted with `Enter` in the same tmux invocation, so a failed submit
/// cannot leave half an injection in the pane. Targets use `=name` so only
/// the exact session matches, never a longer name sharing the prefix.
#[derive(Debug, Clone)]
pub struct TmuxChannel {
    session: String,
    tmux_bin: String,
    timeout: Duration,
}

impl TmuxChannel {
    pub fn new(session: impl Into<String>, tmux_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            session: session.into(),
            tmux_bin: tmux_bin.into(),
            timeout,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.tmux_bin);
        cmd.stdin(std::process::Stdio::null());
        cmd
    }

    fn session_target(&self) -> String {
        format!("={}", self.session)
    }

    /// Active pane of the session's current window.
    fn pane_target(&self) -> String {
        format!("={}:", self.session)
    }

    pub(crate) fn has_session_args(&self) -> Vec<String> {
        vec!["has-session".into(), "-t".into(), self.session_target()]
    }

    pub(crate) fn send_keys_args(&self, text: &str) -> Vec<String> {
        let target = self.pane_target();
        vec![
            "send-keys".into(),
            "-t".into(),
            target.clone(),
            "-l".into(),
            "--".into(),
            literal_arg(text),
            ";".into(),
            "send-keys".into(),
            "-t".into(),
            target,
            "Enter".into(),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output, ChannelError> {
        let mut cmd = self.command();
        cmd.args(args);
        run_with_timeout(&self.tmux_bin, &mut cmd, self.timeout).await
    }
}

/// tmux treats an argument ending in `;` as a command separator even when
/// it arrives through argv, and strips one backslash from a trailing `\;`.
fn literal_arg(text: &str) -> String {
    match text.strip_suffix(';') {
        Some(head) => format!("{head}\\;"),
        None => text.to_string(),
    }
}

#[async_trait]
impl ExecutionChannel for TmuxChannel {
    fn id(&self) -> &str {
        &self.session
    }

    async fn exists(&self) -> Result<bool, ChannelError> {
        let output = self.run(self.has_session_args()).await?;
        debug!(session = %self.session, status = %output.status, "tmux has-session");
        Ok(output.status.success())
    }

    async fn inject(&self, text: &str) -> Result<(), ChannelError> {
        let output = self.run(self.send_keys_args(text)).await?;
        require_success(&self.tmux_bin, &output)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn channel() -> TmuxChannel {
        TmuxChannel::new("coder", "tmux", Duration::from_secs(5))
    }

    #[test]
    fn text_and_enter_go_in_one_invocation() {
        let args = channel().send_keys_args("-n \"quoted\" $HOME");
        assert_eq!(
            args,
            [
                "send-keys",
                "-t",
                "=coder:",
                "-l",
                "--",
                "-n \"quoted\" $HOME",
                ";",
                "send-keys",
                "-t",
                "=coder:",
                "Enter",
            ]
        );
    }

    #[test]
    fn session_lookup_is_exact() {
        assert_eq!(channel().has_session_args(), ["has-session", "-t", "=coder"]);
    }

    #[test]
    fn trailing_semicolon_is_escaped() {
        assert_eq!(literal_arg("run it;"), r"run it\;");
        assert_eq!(literal_arg(r"already\;"), r"already\\;");
        assert_eq!(literal_arg("a; b"), "a; b");
        assert_eq!(literal_arg(";"), r"\;");
    }

    #[test]
    fn escaped_text_is_not_a_separator() {
        let args = channel().send_keys_args("stop;");
        assert_eq!(args[5], r"stop\;");
        assert_eq!(args.iter().filter(|a| a.as_str() == ";").count(), 1);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let ch = TmuxChannel::new("coder", "/nonexistent/tmux-binary", Duration::from_secs(5));
        let err = ch.exists().await.unwrap_err();
        assert!(matches!(err, ChannelError::Spawn { .. }));
    }
}
