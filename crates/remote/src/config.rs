//! Configuration types for the remote cache client

use crate::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest chunk we will put in one ByteStream message (gRPC default max is 4MB)
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Configuration for the remote cache client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Remote cache endpoint (e.g., "grpcs://cache.example.com:443")
    pub endpoint: String,

    /// Instance name for multi-tenant servers; prefixes resource names
    pub instance_name: String,

    /// Look up action results before running spawns
    pub accept_cached: bool,

    /// Upload results of locally executed spawns
    pub upload_local_results: bool,

    /// Which outputs to materialize on a cache hit
    pub download_outputs: DownloadMode,

    /// Maximum concurrent blob transfers (uploads and downloads)
    pub max_concurrent_transfers: usize,

    /// Upper bound on one FindMissingBlobs request, in encoded bytes
    pub max_batch_request_bytes: usize,

    /// ByteStream chunk size in bytes
    pub chunk_size: usize,

    /// Deadline for a single RPC attempt, in seconds
    pub timeout_secs: u64,

    /// Retry configuration
    pub retry: RetryConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            instance_name: String::new(),
            accept_cached: true,
            upload_local_results: true,
            download_outputs: DownloadMode::default(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            max_batch_request_bytes: default_max_batch_request_bytes(),
            chunk_size: default_chunk_size(),
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl RemoteConfig {
    /// Parse a TOML document and validate it
    ///
    /// # Errors
    ///
    /// Returns `SerializationError` for malformed TOML and `ConfigError`
    /// for out-of-range values.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RemoteError::serialization(format!("invalid remote config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be read, otherwise as
    /// [`RemoteConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RemoteError::io_error(format!("read {}", path.display()), e))?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(RemoteError::config_error(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(RemoteError::config_error(
                "max_concurrent_transfers must be at least 1",
            ));
        }
        if self.max_batch_request_bytes < 1024 {
            return Err(RemoteError::config_error(
                "max_batch_request_bytes must be at least 1024",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(RemoteError::config_error("timeout_secs must be at least 1"));
        }
        self.retry.validate()
    }

    /// Per-attempt RPC deadline
    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// What to do with outputs on a cache hit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// Fetch and write every output file
    #[default]
    All,
    /// Record output digests only; fetch when a file is actually needed
    Minimal,
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempt budget, including the first attempt
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f64,

    /// Randomization factor applied to each delay (0 disables jitter)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(RemoteError::config_error(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(RemoteError::config_error(
                "retry.backoff_multiplier must be >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(RemoteError::config_error(
                "retry.jitter must be between 0.0 and 1.0",
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(RemoteError::config_error(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_max_concurrent_transfers() -> usize {
    16
}

fn default_max_batch_request_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_chunk_size() -> usize {
    16 * 1024
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RemoteConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.download_outputs, DownloadMode::All);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_from_toml_partial_document() {
        let config = RemoteConfig::from_toml_str(
            r#"
            endpoint = "grpcs://cache.example.com"
            instance_name = "main"
            download_outputs = "minimal"

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint, "grpcs://cache.example.com");
        assert_eq!(config.instance_name, "main");
        assert_eq!(config.download_outputs, DownloadMode::Minimal);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.chunk_size, 16 * 1024);
    }

    #[test]
    fn test_rejects_oversized_chunks() {
        let err = RemoteConfig::from_toml_str("chunk_size = 8388608").unwrap_err();
        assert!(matches!(err, RemoteError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let config = RemoteConfig {
            retry: RetryConfig {
                max_attempts: 0,
                ..RetryConfig::default()
            },
            ..RemoteConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = RemoteConfig::from_toml_str("endpoint = [").unwrap_err();
        assert!(matches!(err, RemoteError::SerializationError { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.toml");
        std::fs::write(&path, "max_concurrent_transfers = 4\n").unwrap();

        let config = RemoteConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent_transfers, 4);
    }
}
