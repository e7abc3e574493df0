//! Configuration management for taplive
//!
//! Backend endpoints, refresh cadence, feed capacities and the reconnect
//! policy of the push channel. Every field has a default so a partial file
//! (or no file at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::{LiveError, Result};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "taplive.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,

    #[serde(default)]
    pub feeds: FeedConfig,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

/// Where the backend lives and how to authenticate against it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the pull endpoints
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// URL of the push channel
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

/// Snapshot polling cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_ms")]
    pub totals_interval_ms: u64,

    #[serde(default = "default_refresh_ms")]
    pub top_products_interval_ms: u64,

    /// N of the top-N ranking
    #[serde(default = "default_top_products_limit")]
    pub top_products_limit: usize,
}

/// Ring buffer capacities of the live feeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_sales_capacity")]
    pub sales_capacity: usize,

    #[serde(default = "default_alerts_capacity")]
    pub alerts_capacity: usize,
}

/// Bounded, capped-exponential reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before the connection settles disconnected
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

// Default value providers
fn default_api_base_url() -> String {
    "http://localhost:3000/api".to_string()
}

fn default_ws_url() -> String {
    "ws://localhost:3000/live".to_string()
}

fn default_token_env() -> String {
    "TAPLIVE_TOKEN".to_string()
}

fn default_refresh_ms() -> u64 {
    30_000
}

fn default_top_products_limit() -> usize {
    5
}

fn default_sales_capacity() -> usize {
    25
}

fn default_alerts_capacity() -> usize {
    15
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl LiveConfig {
    /// Load configuration from `path`, or use defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LiveError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write the default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| LiveError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.feeds.sales_capacity == 0 || self.feeds.alerts_capacity == 0 {
            return Err(LiveError::Config(
                "feed capacities must be greater than zero".to_string(),
            ));
        }
        if self.refresh.totals_interval_ms == 0 || self.refresh.top_products_interval_ms == 0 {
            return Err(LiveError::Config(
                "refresh intervals must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(LiveError::Config(
                "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Read the bearer token from the configured environment variable
    pub fn auth_token(&self) -> Option<String> {
        std::env::var(&self.backend.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

impl RefreshConfig {
    pub fn totals_interval(&self) -> Duration {
        Duration::from_millis(self.totals_interval_ms)
    }

    pub fn top_products_interval(&self) -> Duration {
        Duration::from_millis(self.top_products_interval_ms)
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ws_url: default_ws_url(),
            token_env: default_token_env(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            totals_interval_ms: default_refresh_ms(),
            top_products_interval_ms: default_refresh_ms(),
            top_products_limit: default_top_products_limit(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            sales_capacity: default_sales_capacity(),
            alerts_capacity: default_alerts_capacity(),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}
