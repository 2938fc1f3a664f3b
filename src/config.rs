use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::capabilities::ValidatedUrl;

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECHECK_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_CACHE_EXPIRY_MS: u64 = 7 * 24 * 60 * 60 * 1000;
pub const DEFAULT_EXPIRY_BUFFER_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_REFRESH_PATH: &str = "/api/auth/jwt/refresh/";
pub const DEFAULT_PLACEHOLDER_IMAGE_URL: &str = "https://via.placeholder.com/300x300?text=No+Image";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Backoff schedule shared by every executor call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub default_max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `min(base * 2^retry, max)`,
    /// so 2 s, 4 s, 8 s, then 10 s with the defaults.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.min(63);
        let exponential = self
            .base_backoff_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::invalid("retry.base_backoff_ms", "must be > 0"));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.max_backoff_ms",
                "must be >= base_backoff_ms",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    /// Directory holding one file per cached image.
    pub dir: PathBuf,
    pub max_size_bytes: u64,
    pub expiry_ms: u64,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("images"),
            max_size_bytes: DEFAULT_MAX_CACHE_BYTES,
            expiry_ms: DEFAULT_CACHE_EXPIRY_MS,
        }
    }
}

impl ImageCacheConfig {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("cache.dir", "cannot be empty"));
        }
        if self.max_size_bytes == 0 {
            return Err(ConfigError::invalid("cache.max_size_bytes", "must be > 0"));
        }
        if self.expiry_ms == 0 {
            return Err(ConfigError::invalid("cache.expiry_ms", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Refresh when the access token expires within this window.
    pub expiry_buffer_ms: u64,
    pub refresh_path: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            expiry_buffer_ms: DEFAULT_EXPIRY_BUFFER_MS,
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
        }
    }
}

impl TokenConfig {
    pub fn expiry_buffer(&self) -> Duration {
        Duration::from_millis(self.expiry_buffer_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_path.trim().is_empty() {
            return Err(ConfigError::invalid("token.refresh_path", "cannot be empty"));
        }
        Ok(())
    }
}

/// Startup configuration for the whole core. The API base URL is shared by the
/// liveness probe, the request executor and the token refresh call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoreConfig {
    pub api_base_url: String,
    pub image_base_url: String,
    #[serde(default = "default_placeholder")]
    pub placeholder_image_url: String,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval_ms: u64,
    /// Drain the offline queue whenever connectivity comes back.
    #[serde(default = "default_true")]
    pub auto_replay: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub cache: ImageCacheConfig,
    #[serde(default)]
    pub token: TokenConfig,
}

fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER_IMAGE_URL.to_string()
}

fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

fn default_recheck_interval() -> u64 {
    DEFAULT_RECHECK_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

impl CoreConfig {
    pub fn new(api_base_url: impl Into<String>, image_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            image_base_url: image_base_url.into(),
            placeholder_image_url: default_placeholder(),
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            recheck_interval_ms: DEFAULT_RECHECK_INTERVAL_MS,
            auto_replay: true,
            retry: RetryPolicy::default(),
            cache: ImageCacheConfig::default(),
            token: TokenConfig::default(),
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = dir.into();
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatedUrl::new(&self.api_base_url)
            .map_err(|e| ConfigError::invalid("api_base_url", e.to_string()))?;
        ValidatedUrl::new(&self.image_base_url)
            .map_err(|e| ConfigError::invalid("image_base_url", e.to_string()))?;
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::invalid("probe_timeout_ms", "must be > 0"));
        }
        if self.recheck_interval_ms == 0 {
            return Err(ConfigError::invalid("recheck_interval_ms", "must be > 0"));
        }
        self.retry.validate()?;
        self.cache.validate()?;
        self.token.validate()?;
        Ok(())
    }
}
