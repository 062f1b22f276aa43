//! Request and instance records shared by every store backend.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tag;

/// Lifecycle of a queued request. Transitions only move forward:
/// `pending -> processing -> completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
}

impl RequestStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A routed request as stored in the request table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub chat_id: i64,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    pub request: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Human-facing name of whoever asked: first name, then username.
    pub fn requester_label(&self) -> &str {
        self.first_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.username.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or("unknown")
    }

    /// Whether this request was enqueued by another instance rather than a person.
    pub const fn is_system(&self) -> bool {
        self.user_id == 0
    }

    /// Short single-line preview for logs.
    pub fn preview(&self, max_chars: usize) -> String {
        let flat = self.request.replace('\n', " ");
        if flat.chars().count() <= max_chars {
            return flat;
        }
        let mut out: String = flat.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

/// Fields supplied when enqueueing a request. The store assigns `id`,
/// `created_at` and the initial `pending` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRequest {
    pub chat_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub request: String,
}

impl NewRequest {
    /// Build a system-originated request addressed to another instance.
    ///
    /// The text is prefixed with the target's tag so its poller picks it up;
    /// `user_id` is 0 and the sender is recorded as the synthetic requester.
    pub fn from_instance(
        target: &str,
        text: &str,
        chat_id: i64,
        from_instance: Option<&str>,
    ) -> Self {
        Self {
            chat_id,
            user_id: 0,
            username: Some(from_instance.unwrap_or("system").to_string()),
            first_name: Some(
                from_instance.map_or_else(|| "another instance".to_string(), tag::tag_for),
            ),
            request: format!("{} {}", tag::tag_for(target), text.trim()),
        }
    }
}

/// Presence state recorded by an instance's own poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Online,
    Offline,
}

impl InstanceStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Liveness as seen by a consumer of the registry.
///
/// A crashed poller never writes `offline`, so an `online` row whose
/// heartbeat is too old is reported as [`Liveness::Stale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Stale,
    Offline,
}

impl Liveness {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Stale => "stale",
            Self::Offline => "offline",
        }
    }

    /// Stale instances are treated as offline.
    pub const fn is_alive(&self) -> bool {
        matches!(self, Self::Online)
    }
}

/// A registered worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub chat_id: Option<i64>,
    pub status: InstanceStatus,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Instance {
    /// Fresh `online` record for a poller that is starting up.
    pub fn starting(
        name: &str,
        role: &str,
        channel: &str,
        chat_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            channel: channel.to_string(),
            chat_id,
            status: InstanceStatus::Online,
            connected_at: now,
            last_seen: now,
        }
    }

    pub fn liveness(&self, now: DateTime<Utc>, stale_after: Duration) -> Liveness {
        match self.status {
            InstanceStatus::Offline => Liveness::Offline,
            InstanceStatus::Online => {
                let age = now.signed_duration_since(self.last_seen);
                let limit = chrono::Duration::from_std(stale_after)
                    .unwrap_or(chrono::Duration::MAX);
                if age > limit {
                    Liveness::Stale
                } else {
                    Liveness::Online
                }
            }
        }
    }
}

/// Partial update applied to an instance row by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstancePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl InstancePatch {
    pub const fn heartbeat(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(InstanceStatus::Online),
            last_seen: Some(now),
        }
    }

    pub const fn offline() -> Self {
        Self {
            status: Some(InstanceStatus::Offline),
            last_seen: None,
        }
    }
}
