//! Layered configuration for taskhub.
//!
//! Settings are read from `.taskhub/taskhub.toml`, then environment
//! variables (a `.env` file is loaded first), then CLI flags. Every field
//! has a default, so an empty or missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! db_path = ".taskhub/taskhub.db"
//! auth_token = "change-me"
//!
//! [github]
//! webhook_secret = "..."
//! frontend_url = "http://localhost:5173"
//!
//! [realtime]
//! environment = "development"
//! api_base_url = "https://hub.example.com/api"
//! reconnect_delay_ms = 5000
//! max_reconnect_attempts = 10
//! heartbeat_outgoing_ms = 4000
//! heartbeat_incoming_ms = 4000
//! project_ids = [1, 2]
//!
//! [dashboard]
//! debounce_ms = 2000
//! debounce_mode = "batch"
//! read_policy = "keep_events"
//! refresh_timeout_ms = 30000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use taskhub_common::Topic;

use crate::hub::api::GitHubSettings;
use crate::hub::server::ServerConfig;
use crate::hub::ws::StompSettings;
use crate::realtime::{DebounceMode, RealtimeConfig, ReadPolicy, SessionOptions};

/// Directory holding the config file and, by default, the database.
pub const TASKHUB_DIR: &str = ".taskhub";
pub const CONFIG_FILE: &str = "taskhub.toml";

/// Deployment environment, used to pick the fallback WebSocket URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            _ => anyhow::bail!(
                "Invalid environment '{}'. Valid values: development, production",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Permissive CORS for a local frontend dev server.
    pub dev_mode: bool,
    /// Bearer token required on STOMP CONNECT. Unset accepts anyone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Heart-beat the server offers to send, in milliseconds.
    pub heartbeat_send_ms: u64,
    /// Heart-beat the server asks clients to send, in milliseconds.
    pub heartbeat_receive_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        let server = ServerConfig::default();
        let stomp = StompSettings::default();
        Self {
            host: server.host,
            port: server.port,
            db_path: server.db_path,
            dev_mode: false,
            auth_token: None,
            heartbeat_send_ms: stomp.heart_beat.0,
            heartbeat_receive_ms: stomp.heart_beat.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Enables `/api/github/webhook` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    pub frontend_url: String,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            webhook_secret: None,
            redirect_uri: None,
            frontend_url: "http://localhost:5173".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    /// Explicit WebSocket URL; wins over everything else.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// REST base URL, e.g. `https://hub.example.com/api`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    pub environment: Environment,
    /// Host used for the production fallback `wss://<host>/ws`.
    pub public_host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_outgoing_ms: u64,
    pub heartbeat_incoming_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Projects whose activity topics are subscribed besides the global one.
    pub project_ids: Vec<i64>,
    /// Subscribe to this user's notification topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        let defaults = RealtimeConfig::default();
        Self {
            url: None,
            api_base_url: None,
            environment: Environment::default(),
            public_host: "localhost".to_string(),
            auth_token: None,
            reconnect_delay_ms: defaults.reconnect_delay.as_millis() as u64,
            max_reconnect_delay_ms: defaults.max_reconnect_delay.as_millis() as u64,
            backoff_multiplier: defaults.backoff_multiplier,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            heartbeat_outgoing_ms: defaults.heartbeat_outgoing.as_millis() as u64,
            heartbeat_incoming_ms: defaults.heartbeat_incoming.as_millis() as u64,
            handshake_timeout_ms: defaults.handshake_timeout.as_millis() as u64,
            project_ids: Vec::new(),
            user_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardSection {
    pub debounce_ms: u64,
    pub debounce_mode: DebounceMode,
    pub read_policy: ReadPolicy,
    /// Events kept in the feed; 0 keeps everything.
    pub feed_capacity: usize,
    pub mark_read_on_refresh: bool,
    pub refresh_timeout_ms: u64,
}

impl Default for DashboardSection {
    fn default() -> Self {
        let defaults = SessionOptions::default();
        Self {
            debounce_ms: defaults.debounce.as_millis() as u64,
            debounce_mode: defaults.debounce_mode,
            read_policy: defaults.read_policy,
            feed_capacity: defaults.feed_capacity.unwrap_or(0),
            mark_read_on_refresh: defaults.mark_read_on_refresh,
            refresh_timeout_ms: defaults.refresh_timeout.as_millis() as u64,
        }
    }
}

/// Contents of `taskhub.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskhubToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub realtime: RealtimeSection,
    #[serde(default)]
    pub dashboard: DashboardSection,
}

impl TaskhubToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse taskhub.toml")
    }

    /// Load `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize taskhub.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("TASKHUB_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid TASKHUB_PORT '{}'", port))?;
        }
        if let Some(path) = get("TASKHUB_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(token) = get("TASKHUB_AUTH_TOKEN") {
            self.server.auth_token = Some(token.clone());
            self.realtime.auth_token = Some(token);
        }
        if let Some(url) = get("TASKHUB_WS_URL") {
            self.realtime.url = Some(url);
        }
        if let Some(url) = get("TASKHUB_API_URL") {
            self.realtime.api_base_url = Some(url);
        }
        if let Some(env) = get("TASKHUB_ENV") {
            self.realtime.environment = env.parse()?;
        }
        if let Some(id) = get("GITHUB_CLIENT_ID") {
            self.github.client_id = Some(id);
        }
        if let Some(secret) = get("GITHUB_CLIENT_SECRET") {
            self.github.client_secret = Some(secret);
        }
        if let Some(secret) = get("GITHUB_WEBHOOK_SECRET") {
            self.github.webhook_secret = Some(secret);
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0: an ephemeral port will be chosen".to_string());
        }
        if let Some(url) = &self.realtime.url
            && !(url.starts_with("ws://") || url.starts_with("wss://"))
        {
            warnings.push(format!(
                "realtime.url '{}' should start with ws:// or wss://",
                url
            ));
        }
        if let Some(url) = &self.realtime.api_base_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            warnings.push(format!(
                "realtime.api_base_url '{}' should start with http:// or https://",
                url
            ));
        }
        if self.realtime.reconnect_delay_ms == 0 {
            warnings.push("realtime.reconnect_delay_ms is 0: reconnects will spin".to_string());
        }
        if self.realtime.max_reconnect_delay_ms < self.realtime.reconnect_delay_ms {
            warnings.push(format!(
                "realtime.max_reconnect_delay_ms ({}) is below reconnect_delay_ms ({}); the base delay is used",
                self.realtime.max_reconnect_delay_ms, self.realtime.reconnect_delay_ms
            ));
        }
        if !self.realtime.backoff_multiplier.is_finite() || self.realtime.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "realtime.backoff_multiplier {} is treated as 1.0",
                self.realtime.backoff_multiplier
            ));
        }
        if self.realtime.max_reconnect_attempts == 0 {
            warnings.push("realtime.max_reconnect_attempts is 0: treated as 1".to_string());
        }
        if self.realtime.environment == Environment::Production
            && self.realtime.url.is_none()
            && self.realtime.api_base_url.is_none()
            && self.realtime.public_host == "localhost"
        {
            warnings.push(
                "production environment without realtime.url, api_base_url or public_host"
                    .to_string(),
            );
        }
        if self.dashboard.debounce_ms == 0 {
            warnings.push("dashboard.debounce_ms is 0: every new activity refetches".to_string());
        }
        if self.dashboard.refresh_timeout_ms == 0 {
            warnings.push("dashboard.refresh_timeout_ms is 0: every refetch times out".to_string());
        }
        if self.server.auth_token.is_none() && self.realtime.environment == Environment::Production {
            warnings.push("server.auth_token is unset: /ws accepts unauthenticated clients".to_string());
        }

        warnings
    }

    /// WebSocket endpoint, resolved in priority order: explicit URL,
    /// derived from the API base URL, environment fallback.
    pub fn resolve_ws_url(&self) -> String {
        if let Some(url) = &self.realtime.url {
            return url.clone();
        }
        if let Some(api) = &self.realtime.api_base_url
            && let Some(url) = ws_url_from_api(api)
        {
            return url;
        }
        match self.realtime.environment {
            Environment::Development => format!("ws://localhost:{}/ws", self.server.port),
            Environment::Production => format!("wss://{}/ws", self.realtime.public_host),
        }
    }

    /// HTTP origin serving `/api/dashboard/*`.
    pub fn api_origin(&self) -> String {
        if let Some(api) = &self.realtime.api_base_url {
            let trimmed = api.trim_end_matches('/');
            return trimmed.strip_suffix("/api").unwrap_or(trimmed).to_string();
        }
        let ws = self.resolve_ws_url();
        let origin = if let Some(rest) = ws.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = ws.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            ws
        };
        let trimmed = origin.trim_end_matches('/');
        trimmed.strip_suffix("/ws").unwrap_or(trimmed).to_string()
    }

    /// Topics a dashboard subscribes to.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics = vec![Topic::GlobalActivities];
        topics.extend(self.realtime.project_ids.iter().map(|id| Topic::ProjectActivities(*id)));
        if let Some(user) = self.realtime.user_id {
            topics.push(Topic::UserNotifications(user));
        }
        topics
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            db_path: self.server.db_path.clone(),
            dev_mode: self.server.dev_mode,
            stomp: StompSettings {
                auth_token: self.server.auth_token.clone(),
                heart_beat: (self.server.heartbeat_send_ms, self.server.heartbeat_receive_ms),
            },
            github: GitHubSettings {
                client_id: self.github.client_id.clone(),
                client_secret: self.github.client_secret.clone(),
                webhook_secret: self.github.webhook_secret.clone(),
                redirect_uri: self.github.redirect_uri.clone(),
                frontend_url: self.github.frontend_url.clone(),
            },
        }
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        let rt = &self.realtime;
        RealtimeConfig {
            url: self.resolve_ws_url(),
            auth_token: rt.auth_token.clone().or_else(|| self.server.auth_token.clone()),
            reconnect_delay: Duration::from_millis(rt.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(rt.max_reconnect_delay_ms),
            backoff_multiplier: rt.backoff_multiplier,
            max_reconnect_attempts: rt.max_reconnect_attempts,
            heartbeat_outgoing: Duration::from_millis(rt.heartbeat_outgoing_ms),
            heartbeat_incoming: Duration::from_millis(rt.heartbeat_incoming_ms),
            handshake_timeout: Duration::from_millis(rt.handshake_timeout_ms),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_policy: self.dashboard.read_policy,
            feed_capacity: Some(self.dashboard.feed_capacity).filter(|c| *c > 0),
            debounce: Duration::from_millis(self.dashboard.debounce_ms),
            debounce_mode: self.dashboard.debounce_mode,
            mark_read_on_refresh: self.dashboard.mark_read_on_refresh,
            refresh_timeout: Duration::from_millis(self.dashboard.refresh_timeout_ms),
        }
    }
}

/// `http(s)://host[/api]` → `ws(s)://host/ws`.
fn ws_url_from_api(api: &str) -> Option<String> {
    let (scheme, rest) = if let Some(rest) = api.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = api.strip_prefix("http://") {
        ("ws", rest)
    } else {
        return None;
    };
    let rest = rest.trim_end_matches('/');
    let base = rest.strip_suffix("/api").unwrap_or(rest);
    Some(format!("{}://{}/ws", scheme, base))
}

/// Configuration loaded for one CLI invocation.
#[derive(Debug, Clone)]
pub struct TaskhubConfig {
    /// File the settings came from (it may not exist).
    pub path: PathBuf,
    pub toml: TaskhubToml,
}

impl TaskhubConfig {
    /// Default config path under `project_dir`.
    pub fn default_path(project_dir: &Path) -> PathBuf {
        project_dir.join(TASKHUB_DIR).join(CONFIG_FILE)
    }

    /// Load `path` (or the default location) and apply the environment.
    pub fn load(project_dir: &Path, path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Self::default_path(project_dir));
        let mut toml = TaskhubToml::load_or_default(&path)?;
        toml.apply_env()?;
        Ok(Self { path, toml })
    }

    pub fn file_exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let toml = TaskhubToml::parse("").unwrap();
        assert_eq!(toml.server.port, 8080);
        assert_eq!(toml.server.db_path, PathBuf::from(".taskhub/taskhub.db"));
        assert_eq!(toml.realtime.reconnect_delay_ms, 5000);
        assert_eq!(toml.realtime.max_reconnect_attempts, 10);
        assert_eq!(toml.realtime.heartbeat_incoming_ms, 4000);
        assert_eq!(toml.dashboard.debounce_ms, 2000);
        assert_eq!(toml.dashboard.debounce_mode, DebounceMode::Batch);
        assert_eq!(toml.dashboard.read_policy, ReadPolicy::KeepEvents);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_sections() {
        let content = r#"
[server]
port = 9000

[realtime]
reconnect_delay_ms = 1000
project_ids = [3, 4]

[dashboard]
debounce_mode = "trailing"
read_policy = "clear_events"
"#;
        let toml = TaskhubToml::parse(content).unwrap();
        assert_eq!(toml.server.port, 9000);
        assert_eq!(toml.server.host, "127.0.0.1");
        assert_eq!(toml.realtime.reconnect_delay_ms, 1000);
        assert_eq!(toml.realtime.max_reconnect_attempts, 10);
        assert_eq!(toml.dashboard.debounce_mode, DebounceMode::Trailing);
        assert_eq!(toml.dashboard.read_policy, ReadPolicy::ClearEvents);
        assert_eq!(
            toml.topics(),
            vec![
                Topic::GlobalActivities,
                Topic::ProjectActivities(3),
                Topic::ProjectActivities(4)
            ]
        );
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(TaskhubToml::parse("[server\nport = ").is_err());
        assert!(TaskhubToml::parse("[dashboard]\ndebounce_mode = \"sometimes\"").is_err());
    }

    #[test]
    fn test_ws_url_explicit_wins() {
        let mut toml = TaskhubToml::default();
        toml.realtime.url = Some("ws://override:1/ws".to_string());
        toml.realtime.api_base_url = Some("https://hub.example.com/api".to_string());
        toml.realtime.environment = Environment::Production;
        assert_eq!(toml.resolve_ws_url(), "ws://override:1/ws");
    }

    #[test]
    fn test_ws_url_derived_from_api_base() {
        let mut toml = TaskhubToml::default();
        toml.realtime.api_base_url = Some("https://hub.example.com/api".to_string());
        assert_eq!(toml.resolve_ws_url(), "wss://hub.example.com/ws");

        toml.realtime.api_base_url = Some("http://localhost:9000/api/".to_string());
        assert_eq!(toml.resolve_ws_url(), "ws://localhost:9000/ws");

        toml.realtime.api_base_url = Some("http://localhost:9000".to_string());
        assert_eq!(toml.resolve_ws_url(), "ws://localhost:9000/ws");
    }

    #[test]
    fn test_ws_url_environment_fallback() {
        let mut toml = TaskhubToml::default();
        assert_eq!(toml.resolve_ws_url(), "ws://localhost:8080/ws");

        toml.realtime.environment = Environment::Production;
        toml.realtime.public_host = "hub.example.com".to_string();
        assert_eq!(toml.resolve_ws_url(), "wss://hub.example.com/ws");

        // An unusable API base falls through to the environment.
        toml.realtime.api_base_url = Some("ftp://nope".to_string());
        assert_eq!(toml.resolve_ws_url(), "wss://hub.example.com/ws");
    }

    #[test]
    fn test_api_origin() {
        let mut toml = TaskhubToml::default();
        assert_eq!(toml.api_origin(), "http://localhost:8080");

        toml.realtime.url = Some("wss://hub.example.com/ws".to_string());
        assert_eq!(toml.api_origin(), "https://hub.example.com");

        toml.realtime.api_base_url = Some("https://api.example.com/api".to_string());
        assert_eq!(toml.api_origin(), "https://api.example.com");
    }

    #[test]
    fn test_env_overrides() {
        let mut toml = TaskhubToml::default();
        toml.apply_overrides(env(&[
            ("TASKHUB_PORT", "9100"),
            ("TASKHUB_DB_PATH", "/tmp/hub.db"),
            ("TASKHUB_AUTH_TOKEN", "tok"),
            ("TASKHUB_API_URL", "https://hub.example.com/api"),
            ("TASKHUB_ENV", "production"),
            ("GITHUB_WEBHOOK_SECRET", "whsec"),
            ("GITHUB_CLIENT_ID", ""),
        ]))
        .unwrap();

        assert_eq!(toml.server.port, 9100);
        assert_eq!(toml.server.db_path, PathBuf::from("/tmp/hub.db"));
        assert_eq!(toml.server.auth_token.as_deref(), Some("tok"));
        assert_eq!(toml.realtime.environment, Environment::Production);
        assert_eq!(toml.github.webhook_secret.as_deref(), Some("whsec"));
        assert!(toml.github.client_id.is_none());

        let realtime = toml.realtime_config();
        assert_eq!(realtime.url, "wss://hub.example.com/ws");
        assert_eq!(realtime.auth_token.as_deref(), Some("tok"));

        let server = toml.server_config();
        assert_eq!(server.port, 9100);
        assert_eq!(server.stomp.auth_token.as_deref(), Some("tok"));
        assert_eq!(server.github.webhook_secret.as_deref(), Some("whsec"));
    }

    #[test]
    fn test_env_override_rejects_bad_values() {
        let mut toml = TaskhubToml::default();
        assert!(toml.apply_overrides(env(&[("TASKHUB_PORT", "eighty")])).is_err());
        assert!(toml.apply_overrides(env(&[("TASKHUB_ENV", "staging")])).is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let content = r#"
[realtime]
url = "http://wrong/ws"
reconnect_delay_ms = 10000
max_reconnect_delay_ms = 1000
backoff_multiplier = 0.5
max_reconnect_attempts = 0

[dashboard]
refresh_timeout_ms = 0
"#;
        let warnings = TaskhubToml::parse(content).unwrap().validate();
        assert!(warnings.iter().any(|w| w.contains("realtime.url")));
        assert!(warnings.iter().any(|w| w.contains("max_reconnect_delay_ms")));
        assert!(warnings.iter().any(|w| w.contains("backoff_multiplier")));
        assert!(warnings.iter().any(|w| w.contains("max_reconnect_attempts")));
        assert!(warnings.iter().any(|w| w.contains("refresh_timeout_ms")));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = TaskhubConfig::default_path(dir.path());
        let mut toml = TaskhubToml::default();
        toml.server.port = 7000;
        toml.realtime.project_ids = vec![9];
        toml.save(&path).unwrap();

        let loaded = TaskhubToml::load(&path).unwrap();
        assert_eq!(loaded.server.port, 7000);
        assert_eq!(loaded.realtime.project_ids, vec![9]);
    }

    #[test]
    fn test_session_options_mapping() {
        let mut toml = TaskhubToml::default();
        toml.dashboard.feed_capacity = 0;
        toml.dashboard.debounce_ms = 750;
        toml.dashboard.refresh_timeout_ms = 1500;
        let options = toml.session_options();
        assert_eq!(options.feed_capacity, None);
        assert_eq!(options.debounce, Duration::from_millis(750));
        assert_eq!(options.refresh_timeout, Duration::from_millis(1500));
        assert!(options.mark_read_on_refresh);
    }
}
