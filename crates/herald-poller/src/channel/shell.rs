//! Shell-template channel.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    ChannelError, ExecutionChannel, escape_double_quoted, require_success, run_with_timeout,
};

/// Drives any destination through two `sh -c` templates.
///
/// `{channel}` and `{text}` are replaced with their values escaped for a
/// double-quoted context, so templates must quote the placeholders, e.g.
/// `screen -S "{channel}" -X stuff "{text}\n"`.
#[derive(Debug, Clone)]
pub struct ShellChannel {
    channel: String,
    exists_template: String,
    inject_template: String,
    timeout: Duration,
}

impl ShellChannel {
    pub fn new(
        channel: impl Into<String>,
        exists_template: impl Into<String>,
        inject_template: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            channel: channel.into(),
            exists_template: exists_template.into(),
            inject_template: inject_template.into(),
            timeout,
        }
    }

    pub(crate) fn render(&self, template: &str, text: Option<&str>) -> String {
        let rendered = template.replace("{channel}", &escape_double_quoted(&self.channel));
        match text {
            Some(text) => rendered.replace("{text}", &escape_double_quoted(text)),
            None => rendered,
        }
    }

    async fn sh(&self, script: &str) -> Result<std::process::Output, ChannelError> {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]).stdin(std::process::Stdio::null());
        run_with_timeout("sh", &mut cmd, self.timeout).await
    }
}

#[async_trait]
impl ExecutionChannel for ShellChannel {
    fn id(&self) -> &str {
        &self.channel
    }

    async fn exists(&self) -> Result<bool, ChannelError> {
        let script = self.render(&self.exists_template, None);
        Ok(self.sh(&script).await?.status.success())
    }

    async fn inject(&self, text: &str) -> Result<(), ChannelError> {
        let script = self.render(&self.inject_template, Some(text));
        let output = self.sh(&script).await?;
        require_success("sh", &output)
    }
}
