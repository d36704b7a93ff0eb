//! Configuration file parser for ~/.config/feedpoll/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged as warnings, since they are most
//! likely typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::feed::PROXY_LIST_URL;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Poller configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be given.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file. Defaults to `feeds.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Product token that starts the crawler User-Agent.
    pub user_agent: String,

    /// Host name advertised in the crawler User-Agent.
    pub server: String,

    /// Sources polled per batch.
    pub max_feeds: usize,

    /// Polls running at once within a batch.
    pub concurrency: usize,

    /// Per-request timeout in seconds, for primary and redirect follow-up.
    pub fetch_timeout_secs: u64,

    /// Feed bodies larger than this are rejected.
    pub max_feed_bytes: usize,

    /// Plain-text proxy list used to refill the pool.
    pub proxy_list_url: String,

    /// Placeholders stored when the proxy list yields nothing.
    pub dead_proxy_count: usize,

    /// Characters of post text kept as the stored body.
    pub excerpt_chars: usize,

    /// Batch tick for `feedpoll run`, in minutes.
    pub poll_every_minutes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            user_agent: format!("feedpoll/{}", env!("CARGO_PKG_VERSION")),
            server: "localhost".to_string(),
            max_feeds: 3,
            concurrency: 4,
            fetch_timeout_secs: 20,
            max_feed_bytes: 10 * 1024 * 1024,
            proxy_list_url: PROXY_LIST_URL.to_string(),
            dead_proxy_count: 20,
            excerpt_chars: 300,
            poll_every_minutes: 5,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 11] = [
        "database_path",
        "user_agent",
        "server",
        "max_feeds",
        "concurrency",
        "fetch_timeout_secs",
        "max_feed_bytes",
        "proxy_list_url",
        "dead_proxy_count",
        "excerpt_chars",
        "poll_every_minutes",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            max_feeds = config.max_feeds,
            concurrency = config.concurrency,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Database file, resolving the default against `config_dir`.
    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("feeds.db"))
    }
}

// ============================================================================
// Tests
// ============================================================================
