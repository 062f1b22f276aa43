//! Operator subcommands.
//!
//! User-facing output uses writeln! to the given writer (this is a CLI
//! binary, not debug output).

use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::info;

use herald_core::Config;
use herald_core::chat::{ChatTransport, TelegramConfig};
use herald_core::{InstanceRegistry, NewRequest, Request, RequestStatus, RequestStore, tag};

use crate::fmt;

/// Herald subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Enqueue a request for another instance, bypassing the chat.
    Call {
        /// Target instance name.
        instance: String,
        /// Request text (the `@instance` tag is added).
        text: String,
        /// Chat the target should reply to.
        #[arg(long, allow_hyphen_values = true)]
        chat_id: i64,
        /// Name of the calling instance.
        #[arg(long)]
        from: Option<String>,
    },
    /// Send a chat message (the reply path used by workers).
    Send {
        #[arg(allow_hyphen_values = true)]
        chat_id: i64,
        text: String,
        /// Send as plain text instead of Markdown, for text with stray
        /// `_` or `*` such as identifiers.
        #[arg(long)]
        plain: bool,
    },
    /// List registered instances with their liveness.
    Instances,
    /// List recent requests.
    Requests {
        /// Only show requests with this status (pending, processing, completed).
        #[arg(long, value_parser = parse_status)]
        status: Option<RequestStatus>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

fn parse_status(s: &str) -> Result<RequestStatus, String> {
    RequestStatus::parse(s).ok_or_else(|| format!("unknown status {s:?}"))
}

/// Enqueue `text` for `target` as a system-originated request.
pub async fn call(
    store: &dyn RequestStore,
    target: &str,
    text: &str,
    chat_id: i64,
    from: Option<&str>,
) -> anyhow::Result<Request> {
    tag::validate_instance_name(target)?;
    if let Some(from) = from {
        tag::validate_instance_name(from)?;
    }
    if text.trim().is_empty() {
        anyhow::bail!("request text is empty");
    }
    let new = NewRequest::from_instance(target, text, chat_id, from);
    let req = store
        .insert_request(&new)
        .await
        .context("Failed to enqueue request")?;
    info!(id = req.id, instance = target, "Enqueued request");
    Ok(req)
}

/// Telegram settings for `herald send`; `plain` drops the parse mode.
pub fn chat_config(config: &Config, plain: bool) -> anyhow::Result<TelegramConfig> {
    let mut tg = config.telegram_config()?;
    if plain {
        tg.parse_mode = None;
    }
    Ok(tg)
}

pub async fn send(chat: &dyn ChatTransport, chat_id: i64, text: &str) -> anyhow::Result<()> {
    if text.trim().is_empty() {
        anyhow::bail!("message text is empty");
    }
    chat.send_message(chat_id, text)
        .await
        .context("Failed to send message")
}

pub async fn instances(
    registry: &dyn InstanceRegistry,
    out: &mut impl Write,
    stale_after: Duration,
) -> anyhow::Result<()> {
    let list = registry.list_instances().await?;
    fmt::write_instances(out, &list, Utc::now(), stale_after)?;
    Ok(())
}

pub async fn requests(
    store: &dyn RequestStore,
    out: &mut impl Write,
    status: Option<RequestStatus>,
    limit: u32,
) -> anyhow::Result<()> {
    let list = store.list_requests(status, limit).await?;
    fmt::write_requests(out, &list)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use herald_core::db::Database;

    #[tokio::test]
    async fn call_enqueues_tagged_system_request() {
        let db = Database::open_in_memory().await.unwrap();
        let req = call(&db, "reviewer", "check PR 12", -100, Some("coder"))
            .await
            .unwrap();

        assert_eq!(req.request, "@reviewer check PR 12");
        assert_eq!(req.status, RequestStatus::Pending);
        assert!(req.is_system());
        assert_eq!(req.requester_label(), "@coder");
        assert_eq!(db.next_pending("reviewer").await.unwrap().unwrap().id, req.id);
    }

    #[tokio::test]
    async fn call_rejects_bad_input() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(call(&db, "two words", "hi", 1, None).await.is_err());
        assert!(call(&db, "coder", "   ", 1, None).await.is_err());
        assert!(call(&db, "coder", "hi", 1, Some("bad name")).await.is_err());
        assert!(db.list_requests(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requests_lists_filtered() {
        let db = Database::open_in_memory().await.unwrap();
        call(&db, "coder", "one", 1, None).await.unwrap();
        let second = call(&db, "coder", "two", 1, None).await.unwrap();
        db.mark_processing(second.id, Utc::now()).await.unwrap();

        let mut out = Vec::new();
        requests(&db, &mut out, Some(RequestStatus::Processing), 10)
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("@coder two"));
    }

    #[test]
    fn plain_send_drops_parse_mode() {
        let mut config = Config::default();
        config.telegram.token = Some("123:abc".into());
        assert_eq!(
            chat_config(&config, false).unwrap().parse_mode.as_deref(),
            Some("Markdown")
        );
        assert!(chat_config(&config, true).unwrap().parse_mode.is_none());
    }

    #[test]
    fn status_flag_parses() {
        assert_eq!(parse_status("pending"), Ok(RequestStatus::Pending));
        assert!(parse_status("done").is_err());
    }
}
