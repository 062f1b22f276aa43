//! Outbound chat messages.
//!
//! The poller only needs to post plain notices into a chat, so the
//! transport is a single-method trait. [`TelegramClient`] implements it on
//! the Bot API `sendMessage` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chat transport errors.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chat API error ({status}): {description}")]
    Api { status: u16, description: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Anything that can post a text message into a chat.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChatError>;
}

/// Telegram Bot API settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    /// API root, overridable for self-hosted Bot API servers and tests.
    pub api_url: String,
    /// `parse_mode` sent with every message; `None` sends plain text.
    pub parse_mode: Option<String>,
    pub timeout: Duration,
}

impl TelegramConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_url: "https://api.telegram.org".into(),
            parse_mode: Some("Markdown".into()),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
}

/// Bot API response envelope; `result` is ignored.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API client for `sendMessage`.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    send_url: String,
    parse_mode: Option<String>,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self, ChatError> {
        if config.token.is_empty() {
            return Err(ChatError::Config("bot token is empty".into()));
        }
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            send_url: Self::method_url(&config.api_url, &config.token, "sendMessage"),
            parse_mode: config.parse_mode.clone(),
        })
    }

    fn method_url(api_url: &str, token: &str, method: &str) -> String {
        format!("{}/bot{token}/{method}", api_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChatError> {
        let body = SendMessage {
            chat_id,
            text,
            parse_mode: self.parse_mode.as_deref(),
        };
        let resp = self.http.post(&self.send_url).json(&body).send().await?;
        let status = resp.status();

        // Telegram reports failures in the body as well as the status code.
        let parsed: Option<ApiResponse> = resp.json().await.ok();
        match parsed {
            Some(ApiResponse { ok: true, .. }) if status.is_success() => Ok(()),
            Some(ApiResponse { description, .. }) => Err(ChatError::Api {
                status: status.as_u16(),
                description: description.unwrap_or_else(|| "request rejected".into()),
            }),
            None => Err(ChatError::Api {
                status: status.as_u16(),
                description: status.canonical_reason().unwrap_or("Unknown").to_string(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn method_url_embeds_token() {
        assert_eq!(
            TelegramClient::method_url("https://api.telegram.org/", "123:abc", "sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn empty_token_is_rejected() {
        let err = TelegramClient::new(&TelegramConfig::new("")).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn send_message_body_shape() {
        let body = SendMessage {
            chat_id: -100,
            text: "hello",
            parse_mode: Some("Markdown"),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({ "chat_id": -100, "text": "hello", "parse_mode": "Markdown" })
        );

        let plain = SendMessage {
            chat_id: 1,
            text: "x",
            parse_mode: None,
        };
        assert!(serde_json::to_value(&plain).unwrap().get("parse_mode").is_none());
    }

    #[test]
    fn error_envelope_deserializes() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        )
        .unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.description.as_deref(), Some("Bad Request: chat not found"));
    }
}
