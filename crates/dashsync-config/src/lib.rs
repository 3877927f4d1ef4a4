//! Layered configuration for dashsync.
//!
//! TOML file + `DASHSYNC_`-prefixed environment variables, with
//! translation into the typed configs the core and realtime crates
//! consume. Every field has a default, so an empty file is valid.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use dashsync_core::queue::ConflictStrategy;
use dashsync_core::{QueryConfig, SyncQueueConfig};
use dashsync_realtime::{CollabConfig, NotificationConfig, ReconnectConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Config sections ─────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub query: QuerySection,

    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub realtime: RealtimeSection,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CacheSection {
    /// Directory for the file-backed cache mirror. Defaults to the
    /// platform data dir.
    pub data_dir: Option<PathBuf>,

    /// TTL applied to cache writes that don't specify one, in seconds.
    #[serde(default = "default_cache_secs")]
    pub default_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_ttl_secs: default_cache_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QuerySection {
    #[serde(default = "default_stale_secs")]
    pub stale_secs: u64,

    #[serde(default = "default_cache_secs")]
    pub cache_secs: u64,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Optional polling interval, in seconds. Absent means no polling.
    pub refetch_interval_secs: Option<u64>,

    #[serde(default = "default_true")]
    pub refetch_on_focus: bool,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            stale_secs: default_stale_secs(),
            cache_secs: default_cache_secs(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            refetch_interval_secs: None,
            refetch_on_focus: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SyncSection {
    #[serde(default = "default_retry_count")]
    pub max_retries: u32,

    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            max_retries: default_retry_count(),
            conflict_strategy: ConflictStrategy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RealtimeSection {
    /// SSE notification endpoint. Empty disables notifications.
    #[serde(default)]
    pub notifications_url: String,

    /// Collaboration WebSocket endpoint. Empty disables collaboration.
    #[serde(default)]
    pub collab_url: String,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// `None` retries forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: Option<u32>,

    #[serde(default = "default_liveness_secs")]
    pub liveness_timeout_secs: u64,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            notifications_url: String::new(),
            collab_url: String::new(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            liveness_timeout_secs: default_liveness_secs(),
        }
    }
}

fn default_stale_secs() -> u64 {
    300
}
fn default_cache_secs() -> u64 {
    1800
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_reconnect_attempts() -> Option<u32> {
    Some(10)
}
fn default_liveness_secs() -> u64 {
    45
}
fn default_true() -> bool {
    true
}

// ── Paths ───────────────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "dashsync", "dashsync").map_or_else(
        || PathBuf::from("dashsync.toml"),
        |dirs| dirs.config_dir().join("dashsync.toml"),
    )
}

/// Resolve the data directory for the file-backed cache mirror.
pub fn data_dir() -> PathBuf {
    ProjectDirs::from("io", "dashsync", "dashsync").map_or_else(
        || PathBuf::from(".dashsync"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

impl Config {
    /// Load from the canonical config path plus environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path())
    }

    /// Load from an explicit TOML path plus environment. Nested keys
    /// come from doubled underscores, e.g.
    /// `DASHSYNC_QUERY__RETRY_COUNT=5`.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DASHSYNC_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to the canonical config path as TOML.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_path())
    }

    /// Write the configuration to an explicit path, creating parent
    /// directories as needed.
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        std::fs::write(path, rendered)?;
        Ok(())
    }

    /// Reject configurations that would disable retry machinery or
    /// point realtime at nothing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query.retry_count == 0 {
            return Err(invalid("query.retry_count", "must be at least 1"));
        }
        if self.sync.max_retries == 0 {
            return Err(invalid("sync.max_retries", "must be at least 1"));
        }
        if self.realtime.base_delay_ms == 0 {
            return Err(invalid("realtime.base_delay_ms", "must be non-zero"));
        }
        if self.realtime.max_delay_ms < self.realtime.base_delay_ms {
            return Err(invalid(
                "realtime.max_delay_ms",
                "must be >= base_delay_ms",
            ));
        }
        for (field, value) in [
            ("realtime.notifications_url", &self.realtime.notifications_url),
            ("realtime.collab_url", &self.realtime.collab_url),
        ] {
            if !value.is_empty() && Url::parse(value).is_err() {
                return Err(invalid(field, format!("invalid URL: {value}")));
            }
        }
        Ok(())
    }

    // ── Translation ──────────────────────────────────────────────────

    pub fn query_config(&self) -> QueryConfig {
        QueryConfig {
            stale_time: Duration::from_secs(self.query.stale_secs),
            cache_time: Duration::from_secs(self.query.cache_secs),
            retry_count: self.query.retry_count,
            retry_delay: Duration::from_millis(self.query.retry_delay_ms),
            refetch_interval: self.query.refetch_interval_secs.map(Duration::from_secs),
            refetch_on_focus: self.query.refetch_on_focus,
        }
    }

    pub fn sync_config(&self) -> SyncQueueConfig {
        SyncQueueConfig {
            max_retries: self.sync.max_retries,
            default_strategy: self.sync.conflict_strategy,
        }
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(self.realtime.base_delay_ms),
            max_delay: Duration::from_millis(self.realtime.max_delay_ms),
            max_attempts: self.realtime.max_reconnect_attempts,
        }
    }

    /// Build the notification stream config; requires a non-empty URL.
    pub fn notification_config(&self) -> Result<NotificationConfig, ConfigError> {
        let url = self.parse_realtime_url(
            "realtime.notifications_url",
            &self.realtime.notifications_url,
        )?;
        Ok(NotificationConfig {
            url,
            reconnect: self.reconnect_config(),
            liveness_timeout: Duration::from_secs(self.realtime.liveness_timeout_secs),
        })
    }

    /// Build the collaboration socket config; requires a non-empty URL.
    pub fn collab_config(&self, sender_id: impl Into<String>) -> Result<CollabConfig, ConfigError> {
        let url = self.parse_realtime_url("realtime.collab_url", &self.realtime.collab_url)?;
        Ok(CollabConfig {
            url,
            sender_id: sender_id.into(),
            sender_name: None,
            reconnect: self.reconnect_config(),
            liveness_timeout: Duration::from_secs(self.realtime.liveness_timeout_secs),
        })
    }

    /// Directory for the file-backed cache mirror.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache.data_dir.clone().unwrap_or_else(data_dir)
    }

    fn parse_realtime_url(&self, field: &str, value: &str) -> Result<Url, ConfigError> {
        if value.is_empty() {
            return Err(invalid(field, "not configured"));
        }
        Url::parse(value).map_err(|e| invalid(field, format!("invalid URL: {e}")))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        config.validate().unwrap();

        let query = config.query_config();
        assert_eq!(query.stale_time, Duration::from_secs(300));
        assert_eq!(query.cache_time, Duration::from_secs(1800));
        assert_eq!(query.retry_count, 3);
        assert_eq!(query.retry_delay, Duration::from_secs(1));
        assert!(query.refetch_interval.is_none());
        assert!(query.refetch_on_focus);

        let sync = config.sync_config();
        assert_eq!(sync.max_retries, 3);
        assert_eq!(sync.default_strategy, ConflictStrategy::ClientWins);

        let reconnect = config.reconnect_config();
        assert_eq!(reconnect.base_delay, Duration::from_secs(1));
        assert_eq!(reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(reconnect.max_attempts, Some(10));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "dashsync.toml",
                r#"
                [query]
                stale_secs = 60
                retry_count = 5

                [sync]
                conflict_strategy = "manual_merge"

                [realtime]
                notifications_url = "https://api.example.com/notifications/stream"
                "#,
            )?;

            let config = Config::load_from(std::path::Path::new("dashsync.toml"))
                .expect("config should load");
            assert_eq!(config.query.stale_secs, 60);
            assert_eq!(config.query.retry_count, 5);
            // Untouched fields keep their defaults.
            assert_eq!(config.query.cache_secs, 1800);
            assert_eq!(config.sync.conflict_strategy, ConflictStrategy::ManualMerge);

            let notifications = config.notification_config().expect("url configured");
            assert_eq!(notifications.url.host_str(), Some("api.example.com"));
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_the_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("dashsync.toml", "[query]\nretry_count = 5\n")?;
            jail.set_env("DASHSYNC_QUERY__RETRY_COUNT", "7");
            jail.set_env("DASHSYNC_REALTIME__MAX_DELAY_MS", "60000");

            let config = Config::load_from(std::path::Path::new("dashsync.toml"))
                .expect("config should load");
            assert_eq!(config.query.retry_count, 7);
            assert_eq!(config.realtime.max_delay_ms, 60_000);
            Ok(())
        });
    }

    #[test]
    fn saved_config_loads_back_unchanged() {
        figment::Jail::expect_with(|jail| {
            let mut config = Config::default();
            config.query.retry_count = 5;
            config.query.refetch_interval_secs = Some(30);
            config.sync.conflict_strategy = ConflictStrategy::ManualMerge;
            config.realtime.collab_url = "wss://api.example.com/collab".into();

            let path = jail.directory().join("nested").join("dashsync.toml");
            config.save_to(&path).expect("config should save");

            let restored = Config::load_from(&path).expect("config should load");
            assert_eq!(restored.query.retry_count, 5);
            assert_eq!(restored.query.refetch_interval_secs, Some(30));
            assert_eq!(restored.sync.conflict_strategy, ConflictStrategy::ManualMerge);
            assert_eq!(restored.realtime.collab_url, "wss://api.example.com/collab");
            Ok(())
        });
    }

    #[test]
    fn zero_retry_ceilings_are_rejected() {
        let mut config = Config::default();
        config.query.retry_count = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Validation { field, .. } if field == "query.retry_count"
        ));

        let mut config = Config::default();
        config.sync.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_urls_are_rejected() {
        let mut config = Config::default();
        config.realtime.collab_url = "not a url".into();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Validation { field, .. } if field == "realtime.collab_url"
        ));
    }

    #[test]
    fn inverted_delay_bounds_are_rejected() {
        let mut config = Config::default();
        config.realtime.max_delay_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unconfigured_realtime_urls_fail_translation_not_validation() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.notification_config().is_err());
        assert!(config.collab_config("merchant-42").is_err());
    }
}
