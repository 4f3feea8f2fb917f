use serde::{Deserialize, Serialize};
use std::time::Duration;
use tierlog_core::{Result, StorageError};

/// Behaviour of `append` when the sequencer already tracks `sequencer_capacity` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
    /// Suspend the producer until a slot frees up.
    #[default]
    Wait,
    /// Fail the append immediately with a backpressure error.
    Fail,
}

/// Retry policy applied to each phase of a WAL object upload.
///
/// `max_attempts = 1` disables retries; failed uploads are then left to the
/// supervising layer (see `S3Storage::retry_failed_uploads`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadRetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl UploadRetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for UploadRetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

/// Tiered storage engine configuration, usually loaded from the broker YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Size (bytes) at which the open log cache block is sealed and uploaded
    pub log_cache_capacity: usize,
    /// Maximum size (bytes) of one data block inside a WAL object
    pub object_block_size: usize,
    /// Part size (bytes) of the chunked object writer
    pub object_part_size: usize,
    /// Maximum number of appends tracked by the sequencer at once
    pub sequencer_capacity: usize,
    pub backpressure: BackpressureMode,
    /// How long a prepared object id stays reserved before it expires
    pub object_prepare_ttl_secs: u64,
    pub upload_retry: UploadRetryPolicy,
    /// Number of decoded object data blocks kept by the block cache
    pub block_cache_capacity: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_cache_capacity: 512 * 1024 * 1024,
            object_block_size: 16 * 1024 * 1024,
            object_part_size: 16 * 1024 * 1024,
            sequencer_capacity: 4096,
            backpressure: BackpressureMode::Wait,
            object_prepare_ttl_secs: 30 * 60,
            upload_retry: UploadRetryPolicy::default(),
            block_cache_capacity: 1024,
        }
    }
}

impl StorageConfig {
    /// Parse a YAML document; missing fields take their defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let cfg: StorageConfig = serde_yaml::from_str(content)
            .map_err(|e| StorageError::Config(format!("invalid storage config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_cache_capacity == 0 {
            return Err(StorageError::Config(
                "log_cache_capacity must be greater than 0".to_string(),
            ));
        }
        if self.object_block_size == 0 || self.object_part_size == 0 {
            return Err(StorageError::Config(
                "object_block_size and object_part_size must be greater than 0".to_string(),
            ));
        }
        if self.sequencer_capacity == 0 {
            return Err(StorageError::Config(
                "sequencer_capacity must be greater than 0".to_string(),
            ));
        }
        if self.upload_retry.max_attempts == 0 {
            return Err(StorageError::Config(
                "upload_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn object_prepare_ttl(&self) -> Duration {
        Duration::from_secs(self.object_prepare_ttl_secs)
    }
}
