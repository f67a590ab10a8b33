//! # Mesh Configuration
//!
//! Runtime settings for channels and correlators, loadable from the
//! environment so agents can be tuned without rebuilds.
//!
//! ## Environment Variables
//!
//! - `PIPELINK_SOCKET_DIR` - Directory holding Unix socket files (default: OS temp dir)
//! - `PIPELINK_WARMUP_MS` - Correlator warm-up delay in milliseconds (default: 1000)
//! - `PIPELINK_REQUEST_TIMEOUT_SECS` - Default request timeout in seconds (default: 30)
//! - `PIPELINK_MAX_LINE_BYTES` - Longest accepted wire line in bytes (default: 1048576)
//! - `PIPELINK_MAX_PENDING` - Outstanding requests allowed per correlator (default: 1000)

use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, time::Duration};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Settings shared by channels, the pool and correlators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Directory where local socket files live
    pub socket_dir: PathBuf,
    /// Pause after a correlator starts its read loop, giving the peer time to settle
    #[serde(with = "duration_millis")]
    pub warmup: Duration,
    /// Default deadline for a request/response round trip
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    /// Lines longer than this are skipped as malformed
    pub max_line_bytes: usize,
    /// Maximum outstanding requests per correlator
    pub max_pending: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            socket_dir: env::temp_dir(),
            warmup: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            max_line_bytes: 1024 * 1024, // 1MB
            max_pending: 1000,
        }
    }
}

impl MeshConfig {
    /// Create a builder seeded with defaults
    #[must_use]
    pub fn builder() -> MeshConfigBuilder {
        MeshConfigBuilder::default()
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable holds an unparsable value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        MeshConfigBuilder::from_env()?.build()
    }

    /// Check invariants that the runtime relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max_line_bytes must be greater than 0".to_string(),
            ));
        }
        if self.max_pending == 0 {
            return Err(ConfigError::ValidationError(
                "max_pending must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for `MeshConfig` with environment variable support
#[derive(Debug, Clone, Default)]
pub struct MeshConfigBuilder {
    config: MeshConfig,
}

impl MeshConfigBuilder {
    /// Start from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::default();

        if let Some(dir) = get_env_string("PIPELINK_SOCKET_DIR") {
            builder = builder.socket_dir(PathBuf::from(dir));
        }
        if let Some(ms) = get_env_u64("PIPELINK_WARMUP_MS")? {
            builder = builder.warmup(Duration::from_millis(ms));
        }
        if let Some(secs) = get_env_u64("PIPELINK_REQUEST_TIMEOUT_SECS")? {
            builder = builder.request_timeout(Duration::from_secs(secs));
        }
        if let Some(bytes) = get_env_usize("PIPELINK_MAX_LINE_BYTES")? {
            builder = builder.max_line_bytes(bytes);
        }
        if let Some(pending) = get_env_usize("PIPELINK_MAX_PENDING")? {
            builder = builder.max_pending(pending);
        }

        Ok(builder)
    }

    #[must_use]
    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.socket_dir = dir.into();
        self
    }

    #[must_use]
    pub fn warmup(mut self, warmup: Duration) -> Self {
        self.config.warmup = warmup;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_line_bytes(mut self, bytes: usize) -> Self {
        self.config.max_line_bytes = bytes;
        self
    }

    #[must_use]
    pub fn max_pending(mut self, pending: usize) -> Self {
        self.config.max_pending = pending;
        self
    }

    /// Validate and produce the final configuration
    pub fn build(self) -> Result<MeshConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// Environment variable helper functions

fn get_env_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn get_env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid u64 value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn get_env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid usize value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}
