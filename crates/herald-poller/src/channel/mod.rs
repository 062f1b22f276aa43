//! Execution channels.
//!
//! An execution channel is the opaque destination a claimed request is
//! typed into: a tmux session running an agent CLI, or whatever a pair of
//! shell templates reaches.

pub mod shell;
pub mod tmux;

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

pub use shell::ShellChannel;
pub use tmux::TmuxChannel;

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// A destination that accepts injected text.
#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    /// Identifier shown in logs and registered with the instance.
    fn id(&self) -> &str;

    /// Whether the channel is currently reachable.
    async fn exists(&self) -> Result<bool, ChannelError>;

    /// Type `text` into the channel and submit it.
    async fn inject(&self, text: &str) -> Result<(), ChannelError>;
}

/// Run `cmd` to completion, killing it if it outlives `timeout`.
pub(crate) async fn run_with_timeout(
    program: &str,
    cmd: &mut Command,
    timeout: Duration,
) -> Result<Output, ChannelError> {
    cmd.kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(ChannelError::Spawn {
            program: program.to_string(),
            source,
        }),
        Err(_) => Err(ChannelError::Timeout {
            program: program.to_string(),
            timeout,
        }),
    }
}

/// Map a non-zero exit into [`ChannelError::CommandFailed`].
pub(crate) fn require_success(program: &str, output: &Output) -> Result<(), ChannelError> {
    if output.status.success() {
        return Ok(());
    }
    Err(ChannelError::CommandFailed {
        program: program.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Escape `s` for interpolation inside a double-quoted `sh` word.
///
/// Backslash, double quote, `$` and backtick are the only characters that
/// keep a special meaning between double quotes.
pub fn escape_double_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_shell_specials() {
        assert_eq!(escape_double_quoted("plain text"), "plain text");
        assert_eq!(escape_double_quoted(r#"say "hi""#), r#"say \"hi\""#);
        assert_eq!(escape_double_quoted("$HOME `id`"), r"\$HOME \`id\`");
        assert_eq!(escape_double_quoted(r"C:\tmp"), r"C:\\tmp");
    }

    #[test]
    fn leaves_newlines_and_single_quotes() {
        assert_eq!(escape_double_quoted("it's\nfine"), "it's\nfine");
    }
}
