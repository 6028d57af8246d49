//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (CHUNKVAULT_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [storage]
//! data_dir = "/var/lib/chunkvault/data"
//! save_retries = 2
//!
//! [history]
//! max_commits = 50
//!
//! [session]
//! idle_timeout_secs = 3600
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! CHUNKVAULT_STORAGE__DATA_DIR=/custom/path
//! CHUNKVAULT_SESSION__IDLE_TIMEOUT_SECS=600
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};
use crate::model::MAX_CHUNK_TEXT_CHARS;
use crate::session::SessionConfig;
use crate::store::StoreConfig;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Base directory for dataset JSON documents
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Additional save attempts after a transient persistence failure
    #[serde(default = "default_save_retries")]
    pub save_retries: u32,

    /// Maximum chunk text length in characters
    #[serde(default = "default_max_chunk_text")]
    pub max_chunk_text: usize,
}

/// Commit history settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySection {
    /// Commits retained per dataset before FIFO eviction
    #[serde(default = "default_max_commits")]
    pub max_commits: usize,
}

/// Session registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Maximum number of concurrent sessions (0 = unlimited)
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Seconds an empty session may linger before sweeping (0 = never)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Sweeper tick interval in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_save_retries() -> u32 {
    2
}
fn default_max_chunk_text() -> usize {
    MAX_CHUNK_TEXT_CHARS
}
fn default_max_commits() -> usize {
    crate::history::DEFAULT_HISTORY_CAPACITY
}
fn default_max_sessions() -> usize {
    1_000
}
fn default_idle_timeout_secs() -> u64 {
    3600
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (CHUNKVAULT_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("CHUNKVAULT_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CHUNKVAULT_").split("__"))
            .extract()
    }

    /// Reject values the store cannot operate with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.history.max_commits == 0 {
            return Err(StoreError::InvalidInput(
                "history.max_commits must be at least 1".to_string(),
            ));
        }
        if self.storage.max_chunk_text == 0 {
            return Err(StoreError::InvalidInput(
                "storage.max_chunk_text must be at least 1".to_string(),
            ));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(StoreError::InvalidInput(format!(
                "logging.level must be one of trace/debug/info/warn/error, got {other}"
            ))),
        }
    }

    /// Store tuning derived from this configuration.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            history_capacity: self.history.max_commits,
            max_chunk_text: self.storage.max_chunk_text,
            save_retries: self.storage.save_retries,
        }
    }

    /// Session registry tuning derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_sessions: self.session.max_sessions,
            idle_timeout_secs: self.session.idle_timeout_secs,
            sweep_interval_secs: self.session.sweep_interval_secs,
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        StorageSection {
            data_dir: default_data_dir(),
            save_retries: default_save_retries(),
            max_chunk_text: default_max_chunk_text(),
        }
    }
}

impl Default for HistorySection {
    fn default() -> Self {
        HistorySection {
            max_commits: default_max_commits(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: default_log_level(),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. The subscriber can
/// only be installed once per process; callers embedding the crate should
/// skip this if they already installed one.
pub fn init_tracing(logging: &LoggingSection) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| anyhow::anyhow!("invalid log filter: {e}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
    Ok(())
}
