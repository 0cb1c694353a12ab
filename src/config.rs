use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{validate_snowflake, Error, Result};

/// Connection settings for a single Lavalink node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeOptions {
    /// Unique key of the node inside the pool. Defaults to the host.
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Use `wss://` and `https://` instead of the plain schemes.
    pub secure: bool,

    /// Reconnect attempts before the node gives up.
    pub retry_amount: u32,
    /// Delay before the first reconnect attempt; doubled on each retry.
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
    /// Upper bound for the reconnect backoff.
    #[serde(with = "duration_str")]
    pub max_retry_delay: Duration,
    /// Deadline for REST requests (search, decode...).
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl NodeOptions {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            identifier: host.clone(),
            host,
            port,
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// URL of the persistent socket.
    pub fn socket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/", scheme, self.host, self.port)
    }

    /// Base URL for REST requests, without a trailing slash.
    pub fn rest_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(Error::Config("Node identifier cannot be empty".into()));
        }

        if self.host.trim().is_empty() {
            return Err(Error::Config(format!(
                "Node '{}' has an empty host",
                self.identifier
            )));
        }

        if self.port == 0 {
            return Err(Error::Config(format!(
                "Node '{}' has an invalid port 0",
                self.identifier
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::Config(format!(
                "Node '{}' request timeout must be greater than 0",
                self.identifier
            )));
        }

        Ok(())
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            identifier: "localhost".to_string(),
            host: "localhost".to_string(),
            port: 2333,
            password: "youshallnotpass".to_string(),
            secure: false,
            retry_amount: 5,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Source prefix used for plain-text searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchPlatform {
    #[default]
    Youtube,
    YoutubeMusic,
    Soundcloud,
}

impl SearchPlatform {
    pub fn prefix(&self) -> &'static str {
        match self {
            SearchPlatform::Youtube => "ytsearch",
            SearchPlatform::YoutubeMusic => "ytmsearch",
            SearchPlatform::Soundcloud => "scsearch",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "youtube" | "ytsearch" => Ok(SearchPlatform::Youtube),
            "youtubemusic" | "youtube_music" | "ytmsearch" => Ok(SearchPlatform::YoutubeMusic),
            "soundcloud" | "scsearch" => Ok(SearchPlatform::Soundcloud),
            other => Err(Error::Config(format!("Unknown search platform '{}'", other))),
        }
    }
}

/// Settings for the [`Manager`](crate::Manager).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Nodes registered when the manager is built.
    pub nodes: Vec<NodeOptions>,
    /// User id of the bot. Can also be provided later through `init`.
    pub client_id: Option<String>,
    /// Sent to the nodes in the `Client-Name` header.
    pub client_name: String,
    pub shards: u64,
    /// Play the next queued track automatically when one ends.
    pub auto_play: bool,
    pub default_search_platform: SearchPlatform,
    /// Bound on how long a player may hold half of its voice credentials.
    ///
    /// `None` keeps the credentials pending forever. When set, an incomplete
    /// record only produces a `VoiceUpdateTimeout` event; nothing is retried.
    #[serde(with = "option_duration_str")]
    pub voice_update_timeout: Option<Duration>,
}

impl ManagerOptions {
    /// Loads the options from the environment (and `.env`, if present).
    ///
    /// A single node is described by the `LAVALINK_*` variables, following
    /// the same names the bot always used for its Lavalink connection.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = NodeOptions::default();
        let host = env_or("LAVALINK_HOST", &defaults.host);

        let node = NodeOptions {
            identifier: env_or("LAVALINK_IDENTIFIER", &host),
            port: parse_env("LAVALINK_PORT", defaults.port)?,
            password: env_or("LAVALINK_PASSWORD", &defaults.password),
            secure: parse_env("LAVALINK_SECURE", defaults.secure)?,
            retry_amount: parse_env("LAVALINK_RETRY_AMOUNT", defaults.retry_amount)?,
            retry_delay: duration_env("LAVALINK_RETRY_DELAY", defaults.retry_delay)?,
            max_retry_delay: duration_env("LAVALINK_MAX_RETRY_DELAY", defaults.max_retry_delay)?,
            request_timeout: duration_env("LAVALINK_REQUEST_TIMEOUT", defaults.request_timeout)?,
            host,
        };

        let defaults = Self::default();
        let options = Self {
            nodes: vec![node],
            client_id: std::env::var("LAVALINK_CLIENT_ID")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            client_name: env_or("LAVALINK_CLIENT_NAME", &defaults.client_name),
            shards: parse_env("LAVALINK_SHARDS", defaults.shards)?,
            auto_play: parse_env("LAVALINK_AUTOPLAY", defaults.auto_play)?,
            default_search_platform: match std::env::var("LAVALINK_SEARCH_PLATFORM") {
                Ok(val) if !val.trim().is_empty() => SearchPlatform::parse(val.trim())?,
                _ => defaults.default_search_platform,
            },
            voice_update_timeout: match std::env::var("LAVALINK_VOICE_TIMEOUT") {
                Ok(val) if !val.trim().is_empty() => Some(parse_duration("LAVALINK_VOICE_TIMEOUT", &val)?),
                _ => None,
            },
        };

        options.validate()?;

        Ok(options)
    }

    /// Validates configuration values for correctness.
    ///
    /// - Node identifiers must be unique and non-empty
    /// - Ports must be non-zero
    /// - The client id, when present, must be a numeric snowflake
    /// - At least one shard is required
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            node.validate()?;

            if !seen.insert(node.identifier.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate node identifier '{}'",
                    node.identifier
                )));
            }
        }

        if let Some(client_id) = &self.client_id {
            validate_snowflake("client id", client_id)
                .map_err(|e| Error::Config(e.to_string()))?;
        }

        if self.shards == 0 {
            return Err(Error::Config("Shard count must be greater than 0".into()));
        }

        if self.client_name.trim().is_empty() {
            return Err(Error::Config("Client name cannot be empty".into()));
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Node passwords are never included.
    pub fn summary(&self) -> String {
        let nodes = self
            .nodes
            .iter()
            .map(|n| format!("{} ({})", n.identifier, n.rest_url()))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Manager Summary:\n  \
            Client: {} ({})\n  \
            Shards: {}\n  \
            Nodes: [{}]\n  \
            Features: autoplay={}, search={}, voice_timeout={}",
            self.client_name,
            self.client_id.as_deref().unwrap_or("pending init"),
            self.shards,
            nodes,
            self.auto_play,
            self.default_search_platform.prefix(),
            self.voice_update_timeout
                .map(|d| humantime::format_duration(d).to_string())
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            client_id: None,
            client_name: format!("lavalink-manager/{}", env!("CARGO_PKG_VERSION")),
            shards: 1,
            auto_play: true,
            default_search_platform: SearchPlatform::Youtube,
            voice_update_timeout: None,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}: {}", key, e))),
        _ => Ok(default),
    }
}

fn duration_env(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => parse_duration(key, &val),
        _ => Ok(default),
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| Error::Config(format!("{}: {}", key, e)))
}

/// Durations written the humantime way ("5s", "1m 30s").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod option_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_node_urls() {
        let node = NodeOptions::new("lava.example", 443, "pw").secure(true);
        assert_eq!(node.socket_url(), "wss://lava.example:443/");
        assert_eq!(node.rest_url(), "https://lava.example:443");
        assert_eq!(node.identifier, "lava.example");
    }

    #[test]
    fn test_duplicate_identifiers_rejected() {
        let options = ManagerOptions {
            nodes: vec![
                NodeOptions::new("a", 2333, "pw").with_identifier("main"),
                NodeOptions::new("b", 2333, "pw").with_identifier("main"),
            ],
            ..ManagerOptions::default()
        };

        assert!(matches!(options.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_client_id_must_be_numeric() {
        let options = ManagerOptions {
            client_id: Some("bot".into()),
            ..ManagerOptions::default()
        };
        assert!(options.validate().is_err());

        let options = ManagerOptions {
            client_id: Some("1234".into()),
            ..ManagerOptions::default()
        };
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_deserialize_with_humantime() {
        let options: ManagerOptions = serde_json::from_value(serde_json::json!({
            "nodes": [{ "identifier": "main", "host": "10.0.0.2", "retry_delay": "250ms" }],
            "voice_update_timeout": "30s",
        }))
        .unwrap();

        assert_eq!(options.nodes[0].retry_delay, Duration::from_millis(250));
        assert_eq!(options.nodes[0].port, 2333);
        assert_eq!(options.voice_update_timeout, Some(Duration::from_secs(30)));
        assert!(options.auto_play);
    }

    #[test]
    fn test_summary_hides_password() {
        let options = ManagerOptions {
            nodes: vec![NodeOptions::new("localhost", 2333, "supersecret")],
            ..ManagerOptions::default()
        };

        let summary = options.summary();
        assert!(summary.contains("localhost"));
        assert!(!summary.contains("supersecret"));
    }
}
