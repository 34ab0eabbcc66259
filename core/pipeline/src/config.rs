//! Pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use snapvault_common::{Error, Result};

/// Largest item accepted for upload by default (10 MiB).
pub const DEFAULT_MAX_ITEM_SIZE: u64 = 10 * 1024 * 1024;

/// Default capacity of a spawned pipeline's update channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Limits and retry behaviour shared by the upload and download pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum plaintext size of a single item, in bytes.
    pub max_item_size: u64,
    /// Buffered updates per spawned pipeline before the task waits for the receiver.
    pub channel_capacity: usize,
    /// Retry policy used by the upload queue.
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Set the maximum item size.
    pub fn with_max_item_size(mut self, max_item_size: u64) -> Self {
        self.max_item_size = max_item_size;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Check that the configuration can be used.
    ///
    /// # Errors
    /// - `InvalidInput` if the item size limit or the channel capacity is zero
    pub fn validate(&self) -> Result<()> {
        if self.max_item_size == 0 {
            return Err(Error::InvalidInput(
                "Maximum item size must be positive".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidInput(
                "Channel capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
