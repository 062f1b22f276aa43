//! Configuration resolution for Herald.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/herald/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`HERALD_*`)
//! 5. CLI arguments (highest priority, applied by the binaries)
//!
//! File layers are merged key by key, so a file only needs to name the
//! settings it changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chat::TelegramConfig;
use crate::error::{Error, Result};
use crate::rest::PostgrestConfig;
use crate::tag;

/// Complete Herald configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub telegram: TelegramSettings,
    #[serde(default)]
    pub log: LogConfig,
}

/// Identity of this poller's instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub name: String,
    pub role: String,
    /// Execution channel identifier (a tmux session name, for example).
    pub channel: String,
    /// Chat that receives online/offline announcements. Unset disables them.
    pub home_chat_id: Option<i64>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: "ideas".to_string(),
            role: "General assistant".to_string(),
            channel: "claude".to_string(),
            home_chat_id: None,
        }
    }
}

/// Poll loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age after which an `online` instance counts as stale.
    /// Defaults to three heartbeat intervals.
    pub stale_after_secs: Option<u64>,
    /// Age after which a `processing` request is returned to `pending`.
    /// Unset disables reclaiming.
    pub lease_reclaim_secs: Option<u64>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            heartbeat_interval_secs: 30,
            stale_after_secs: None,
            lease_reclaim_secs: None,
        }
    }
}

/// Which execution channel implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Tmux,
    Shell,
}

impl ChannelKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tmux" => Some(Self::Tmux),
            "shell" => Some(Self::Shell),
            _ => None,
        }
    }
}

/// Execution channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub tmux_bin: String,
    /// `sh -c` template whose exit status reports channel existence.
    /// `{channel}` is substituted.
    pub exists_cmd: Option<String>,
    /// `sh -c` template that injects text. `{channel}` and `{text}` are
    /// substituted.
    pub inject_cmd: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::Tmux,
            tmux_bin: "tmux".to_string(),
            exists_cmd: None,
            inject_cmd: None,
            timeout_secs: 10,
        }
    }
}

/// Request store settings.
///
/// When `url` is set the `PostgREST` backend is used; otherwise a local
/// `SQLite` database at `db_path` (or the platform data directory).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: Option<String>,
    pub key: Option<String>,
    pub db_path: Option<PathBuf>,
    pub requests_table: String,
    pub instances_table: String,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            key: None,
            db_path: None,
            requests_table: "herald_requests".to_string(),
            instances_table: "herald_instances".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Resolved store backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Rest { url: String, key: String },
    Sqlite(PathBuf),
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub token: Option<String>,
    pub api_url: String,
    pub parse_mode: Option<String>,
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            token: None,
            api_url: "https://api.telegram.org".to_string(),
            parse_mode: Some("Markdown".to_string()),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poller.poll_interval_ms)
    }

    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.poller.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(
            self.poller
                .stale_after_secs
                .unwrap_or(self.poller.heartbeat_interval_secs.saturating_mul(3)),
        )
    }

    pub fn lease_reclaim_after(&self) -> Option<Duration> {
        self.poller.lease_reclaim_secs.map(Duration::from_secs)
    }

    pub const fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel.timeout_secs)
    }

    pub const fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store.timeout_secs)
    }

    /// Pick the store backend from the configured settings.
    pub fn store_backend(&self) -> Result<StoreBackend> {
        if let Some(url) = self.store.url.as_ref().filter(|u| !u.is_empty()) {
            let key = self
                .store
                .key
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::Config("store.key is required when store.url is set".into()))?;
            return Ok(StoreBackend::Rest {
                url: url.clone(),
                key,
            });
        }
        let path = self
            .store
            .db_path
            .clone()
            .or_else(default_database_path)
            .ok_or_else(|| Error::Config("Cannot determine database path".into()))?;
        Ok(StoreBackend::Sqlite(path))
    }

    pub fn postgrest_config(&self, url: &str, key: &str) -> PostgrestConfig {
        let mut cfg = PostgrestConfig::new(url, key);
        cfg.requests_table.clone_from(&self.store.requests_table);
        cfg.instances_table.clone_from(&self.store.instances_table);
        cfg.timeout = self.store_timeout();
        cfg
    }

    pub fn telegram_config(&self) -> Result<TelegramConfig> {
        let token = self
            .telegram
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Config("telegram.token is not set (HERALD_TELEGRAM_TOKEN)".into()))?;
        let mut cfg = TelegramConfig::new(token);
        cfg.api_url.clone_from(&self.telegram.api_url);
        cfg.parse_mode.clone_from(&self.telegram.parse_mode);
        cfg.timeout = self.store_timeout();
        Ok(cfg)
    }

    /// Check settings the poller depends on.
    pub fn validate(&self) -> Result<()> {
        tag::validate_instance_name(&self.instance.name)?;
        if self.instance.channel.trim().is_empty() {
            return Err(Error::Config("instance.channel must not be empty".into()));
        }
        if self.poller.poll_interval_ms == 0 {
            return Err(Error::Config("poller.poll_interval_ms must be positive".into()));
        }
        if self.poller.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "poller.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.stale_after() < self.heartbeat_interval() {
            return Err(Error::Config(
                "poller.stale_after_secs must be at least one heartbeat interval".into(),
            ));
        }
        if self.poller.lease_reclaim_secs == Some(0) {
            return Err(Error::Config("poller.lease_reclaim_secs must be positive".into()));
        }
        if self.channel.timeout_secs == 0 || self.store.timeout_secs == 0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        if self.channel.kind == ChannelKind::Shell
            && (self.channel.exists_cmd.is_none() || self.channel.inject_cmd.is_none())
        {
            return Err(Error::Config(
                "shell channel requires channel.exists_cmd and channel.inject_cmd".into(),
            ));
        }
        self.store_backend()?;
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_values(&mut merged, load_config_file(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        merge_values(&mut merged, load_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("herald").join("settings.json"))
}

/// Default `SQLite` database path.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("herald").join("herald.db"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse {val:?}")))
}

/// Apply `HERALD_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(v) = get("HERALD_INSTANCE_NAME") {
        config.instance.name = v;
    }
    if let Some(v) = get("HERALD_INSTANCE_ROLE") {
        config.instance.role = v;
    }
    if let Some(v) = get("HERALD_CHANNEL") {
        config.instance.channel = v;
    }
    if let Some(v) = get("HERALD_HOME_CHAT_ID") {
        config.instance.home_chat_id = Some(parse_env("HERALD_HOME_CHAT_ID", &v)?);
    }
    if let Some(v) = get("HERALD_POLL_INTERVAL_MS") {
        config.poller.poll_interval_ms = parse_env("HERALD_POLL_INTERVAL_MS", &v)?;
    }
    if let Some(v) = get("HERALD_HEARTBEAT_INTERVAL_SECS") {
        config.poller.heartbeat_interval_secs = parse_env("HERALD_HEARTBEAT_INTERVAL_SECS", &v)?;
    }
    if let Some(v) = get("HERALD_STALE_AFTER_SECS") {
        config.poller.stale_after_secs = Some(parse_env("HERALD_STALE_AFTER_SECS", &v)?);
    }
    if let Some(v) = get("HERALD_LEASE_RECLAIM_SECS") {
        config.poller.lease_reclaim_secs = Some(parse_env("HERALD_LEASE_RECLAIM_SECS", &v)?);
    }
    if let Some(v) = get("HERALD_CHANNEL_KIND") {
        config.channel.kind = ChannelKind::parse(&v)
            .ok_or_else(|| Error::Config(format!("HERALD_CHANNEL_KIND: unknown kind {v:?}")))?;
    }
    if let Some(v) = get("HERALD_TMUX_BIN") {
        config.channel.tmux_bin = v;
    }
    if let Some(v) = get("HERALD_SHELL_EXISTS_CMD") {
        config.channel.exists_cmd = Some(v);
    }
    if let Some(v) = get("HERALD_SHELL_INJECT_CMD") {
        config.channel.inject_cmd = Some(v);
    }
    if let Some(v) = get("HERALD_CHANNEL_TIMEOUT_SECS") {
        config.channel.timeout_secs = parse_env("HERALD_CHANNEL_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = get("HERALD_STORE_URL") {
        config.store.url = Some(v);
    }
    if let Some(v) = get("HERALD_STORE_KEY") {
        config.store.key = Some(v);
    }
    if let Some(v) = get("HERALD_DB_PATH") {
        config.store.db_path = Some(PathBuf::from(v));
    }
    if let Some(v) = get("HERALD_STORE_TIMEOUT_SECS") {
        config.store.timeout_secs = parse_env("HERALD_STORE_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = get("HERALD_TELEGRAM_TOKEN") {
        config.telegram.token = Some(v);
    }
    if let Some(v) = get("HERALD_TELEGRAM_API_URL") {
        config.telegram.api_url = v;
    }
    if let Some(v) = get("HERALD_LOG_LEVEL") {
        config.log.level = v;
    }
    if let Some(v) = get("HERALD_LOG_JSON") {
        config.log.json = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.instance.name, "ideas");
        assert_eq!(config.instance.channel, "claude");
        assert!(config.instance.home_chat_id.is_none());
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.stale_after(), Duration::from_secs(90));
        assert!(config.lease_reclaim_after().is_none());
        assert_eq!(config.channel.kind, ChannelKind::Tmux);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("HERALD_INSTANCE_NAME", "coder"),
                ("HERALD_HOME_CHAT_ID", "-1001234"),
                ("HERALD_POLL_INTERVAL_MS", "250"),
                ("HERALD_LEASE_RECLAIM_SECS", "600"),
                ("HERALD_CHANNEL_KIND", "Shell"),
                ("HERALD_LOG_JSON", "true"),
                ("HERALD_TMUX_BIN", ""),
            ]),
        )
        .unwrap();

        assert_eq!(config.instance.name, "coder");
        assert_eq!(config.instance.home_chat_id, Some(-1_001_234));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.lease_reclaim_after(), Some(Duration::from_secs(600)));
        assert_eq!(config.channel.kind, ChannelKind::Shell);
        assert!(config.log.json);
        // Empty values are ignored.
        assert_eq!(config.channel.tmux_bin, "tmux");
    }

    #[test]
    fn unparsable_env_value_is_an_error() {
        let mut config = Config::default();
        let err = apply_env_overrides(&mut config, env(&[("HERALD_POLL_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("HERALD_POLL_INTERVAL_MS"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "instance": { "name": "reviewer" }, "poller": { "heartbeat_interval_secs": 10 } }"#,
        )
        .unwrap();

        let mut merged = serde_json::to_value(Config::default()).unwrap();
        merge_values(&mut merged, load_config_file(&path).unwrap());
        let config: Config = serde_json::from_value(merged).unwrap();

        assert_eq!(config.instance.name, "reviewer");
        assert_eq!(config.instance.role, "General assistant");
        assert_eq!(config.poller.poll_interval_ms, 5000);
        assert_eq!(config.stale_after(), Duration::from_secs(30));
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.store.db_path = Some(PathBuf::from("/tmp/herald.db"));
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.instance.name = "two words".into();
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.poller.stale_after_secs = Some(5);
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.channel.kind = ChannelKind::Shell;
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.store.url = Some("https://x.supabase.co/rest/v1".into());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn store_backend_prefers_rest_when_url_set() {
        let mut config = Config::default();
        config.store.url = Some("https://x.supabase.co/rest/v1".into());
        config.store.key = Some("secret".into());
        assert_eq!(
            config.store_backend().unwrap(),
            StoreBackend::Rest {
                url: "https://x.supabase.co/rest/v1".into(),
                key: "secret".into(),
            }
        );

        config.store.url = None;
        config.store.db_path = Some(PathBuf::from("/var/lib/herald.db"));
        assert_eq!(
            config.store_backend().unwrap(),
            StoreBackend::Sqlite(PathBuf::from("/var/lib/herald.db"))
        );
    }

    #[test]
    fn telegram_config_requires_token() {
        let mut config = Config::default();
        assert!(config.telegram_config().is_err());
        config.telegram.token = Some("123:abc".into());
        let tg = config.telegram_config().unwrap();
        assert_eq!(tg.api_url, "https://api.telegram.org");
        assert_eq!(tg.parse_mode.as_deref(), Some("Markdown"));
    }
}
