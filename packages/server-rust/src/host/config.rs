//! Host runtime configuration and per-application configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::context::CompletionLimits;
use crate::network::NetworkConfig;

/// Runtime configuration for the host process.
#[derive(Debug, Clone, Parser)]
#[command(name = "vmrt-host", about = "Multi-tenant application host")]
pub struct HostConfig {
    /// Bind address.
    #[arg(long, env = "VMRT_HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
    /// Application directory.
    #[arg(long, env = "VMRT_APP_DIR", default_value = ".")]
    pub app_dir: PathBuf,
    /// Application config file, relative to the application directory.
    #[arg(long, env = "VMRT_APP_CONFIG", default_value = "vmrt-app.json")]
    pub app_config_file: String,
    /// `host:port` of the outbound API server.
    #[arg(long, env = "VMRT_API_ADDRESS", default_value = "localhost:10001")]
    pub api_address: String,
    /// Base URL of the metadata server. Without it only env vars are consulted.
    #[arg(long, env = "VMRT_METADATA_URL")]
    pub metadata_url: Option<String>,
    #[arg(long, default_value_t = 1_000)]
    pub metadata_timeout_ms: u64,
    #[arg(long, default_value_t = 2_000)]
    pub interrupt_wait_ms: u64,
    #[arg(long, default_value_t = 2_000)]
    pub api_call_wait_ms: u64,
    #[arg(long, default_value_t = 60_000)]
    pub async_deadline_ms: u64,
    /// Upper bound on a request environment's lifetime.
    #[arg(long, default_value_t = 86_400_000)]
    pub long_timeout_ms: u64,
    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,
    /// Bound on draining requests and queued session writes at shutdown.
    #[arg(long, default_value_t = 30)]
    pub drain_timeout_secs: u64,
    /// Path of the durable session database. In-memory when unset.
    #[arg(long, env = "VMRT_SESSION_DB")]
    pub session_db: Option<PathBuf>,
    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            app_dir: PathBuf::from("."),
            app_config_file: "vmrt-app.json".to_string(),
            api_address: "localhost:10001".to_string(),
            metadata_url: None,
            metadata_timeout_ms: 1_000,
            interrupt_wait_ms: 2_000,
            api_call_wait_ms: 2_000,
            async_deadline_ms: 60_000,
            long_timeout_ms: 86_400_000,
            request_timeout_secs: 30,
            drain_timeout_secs: 30,
            session_db: None,
            log_json: false,
        }
    }
}

impl HostConfig {
    #[must_use]
    pub fn completion_limits(&self) -> CompletionLimits {
        CompletionLimits {
            interrupt_wait: Duration::from_millis(self.interrupt_wait_ms),
            api_call_wait: Duration::from_millis(self.api_call_wait_ms),
            async_deadline: Duration::from_millis(self.async_deadline_ms),
        }
    }

    #[must_use]
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read app config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed app config {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid app config: {0}")]
    Invalid(String),
}

fn default_queue_name() -> String {
    "default".to_string()
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_session_timeout_secs() -> u64 {
    86_400
}

/// Application configuration read from the application directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sessions_enabled: bool,
    /// Write durable session state through a task queue instead of inline.
    #[serde(default)]
    pub async_session_persistence: bool,
    #[serde(default = "default_queue_name")]
    pub async_session_persistence_queue_name: String,
    #[serde(default = "default_cache_capacity")]
    pub session_cache_capacity: usize,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sessions_enabled: false,
            async_session_persistence: false,
            async_session_persistence_queue_name: default_queue_name(),
            session_cache_capacity: default_cache_capacity(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// Loads `file_name` from `app_dir`.
    ///
    /// A missing file means the application has no configuration and yields
    /// `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read, parsed,
    /// or validated.
    pub fn load(app_dir: &Path, file_name: &str) -> Result<Option<Self>, ConfigError> {
        let path = app_dir.join(file_name);
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|source| ConfigError::Malformed { path, source })?;
        config.validate()?;
        Ok(Some(config))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.async_session_persistence && self.async_session_persistence_queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "async session persistence requires a queue name".to_string(),
            ));
        }
        if self.sessions_enabled && self.session_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session cache capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
