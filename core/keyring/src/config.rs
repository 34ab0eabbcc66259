//! Keyring configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use snapvault_common::{Error, Result};
use snapvault_crypto::KdfParams;

/// Freshness window of device-cached keys (14 days).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 14 * 24 * 60 * 60;

/// Configuration of key derivation and the local key cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringConfig {
    /// Parameters for deriving new root secrets. Existing accounts keep the
    /// parameters recorded with their keys.
    pub root_kdf: KdfParams,
    /// Parameters for deriving the device key of the local cache.
    pub device_kdf: KdfParams,
    /// Lifetime of cached keys, in seconds.
    pub cache_ttl_secs: u64,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            root_kdf: KdfParams::root_secret(),
            device_kdf: KdfParams::device(),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

impl KeyringConfig {
    /// Check the configuration against the hardening floor.
    ///
    /// # Errors
    /// - Returns `InvalidInput` naming the first offending field
    pub fn validate(&self) -> Result<()> {
        if !self.root_kdf.meets_policy() {
            return Err(Error::InvalidInput(
                "root_kdf is below the minimum work factor".to_string(),
            ));
        }
        if !self.device_kdf.meets_policy() {
            return Err(Error::InvalidInput(
                "device_kdf is below the minimum work factor".to_string(),
            ));
        }
        if self.cache_ttl_secs == 0 || self.cache_ttl_secs > i64::MAX as u64 {
            return Err(Error::InvalidInput(
                "cache_ttl_secs is out of range".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache lifetime as a duration.
    pub fn cache_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.cache_ttl_secs).unwrap_or(i64::MAX))
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}
