//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use snapvault_common::{codec, Error, KeyUsage, KeyUsages, Result};

/// Length of symmetric keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of per-user salts in bytes.
pub const SALT_LENGTH: usize = 32;

/// Key derived from the user's password.
///
/// This key is the root of the key hierarchy. It wraps the user's private
/// key and every collection key the user holds. It is never persisted or
/// transmitted in this form.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootSecret {
    key: [u8; KEY_LENGTH],
}

impl RootSecret {
    /// Create a root secret from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootSecret([REDACTED])")
    }
}

/// Key encrypting every item of one collection.
///
/// Carries the usage set it was granted with; a read-only grantee's copy
/// only allows decryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CollectionKey {
    key: [u8; KEY_LENGTH],
    #[zeroize(skip)]
    usages: KeyUsages,
}

impl CollectionKey {
    /// Create a collection key from raw bytes and a usage set.
    pub fn from_bytes(key: [u8; KEY_LENGTH], usages: KeyUsages) -> Self {
        Self { key, usages }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Usage set of this key.
    pub fn usages(&self) -> KeyUsages {
        self.usages
    }

    /// Whether this key may be used for `usage`.
    pub fn allows(&self, usage: KeyUsage) -> bool {
        self.usages.allows(usage)
    }

    /// Copy of this key limited to the intersection with `usages`.
    pub fn restrict(&self, usages: KeyUsages) -> Self {
        Self {
            key: self.key,
            usages: self.usages.intersect(usages),
        }
    }

    /// Serialize into the payload that gets wrapped: `usages || key`.
    pub fn to_payload(&self) -> Zeroizing<Vec<u8>> {
        let mut payload = Zeroizing::new(Vec::with_capacity(1 + KEY_LENGTH));
        payload.push(self.usages.to_byte());
        payload.extend_from_slice(&self.key);
        payload
    }

    /// Parse a payload produced by [`CollectionKey::to_payload`].
    ///
    /// # Errors
    /// - Returns `Primitive` if the payload has the wrong length or unknown usage bits
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() != 1 + KEY_LENGTH {
            return Err(Error::Primitive(format!(
                "Invalid collection key payload length: {}",
                payload.len()
            )));
        }
        let usages = KeyUsages::from_byte(payload[0])
            .map_err(|e| Error::Primitive(e.to_string()))?;
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&payload[1..]);
        Ok(Self { key, usages })
    }
}

impl PartialEq for CollectionKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.key.ct_eq(&other.key)) && self.usages == other.usages
    }
}

impl Eq for CollectionKey {}

impl fmt::Debug for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionKey([REDACTED], {:?})", self.usages)
    }
}

/// Key wrapping local cache entries on one device for one user.
///
/// Derived from a device fingerprint, never from the password.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DeviceKey {
    key: [u8; KEY_LENGTH],
}

impl DeviceKey {
    /// Create a device key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceKey([REDACTED])")
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Salt(pub [u8; SALT_LENGTH]);

impl Salt {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

impl TryFrom<String> for Salt {
    type Error = Error;

    fn try_from(encoded: String) -> Result<Self> {
        codec::decode_array::<SALT_LENGTH>(&encoded).map(Salt)
    }
}

impl From<Salt> for String {
    fn from(salt: Salt) -> Self {
        codec::encode(salt.0)
    }
}

/// Keys that may be kept in the device-local cache.
pub trait CacheableKey: Sized {
    /// Short label used in logs.
    const KIND: &'static str;

    /// Raw key material.
    fn material(&self) -> &[u8; KEY_LENGTH];

    /// Usage set stored alongside the cached key.
    fn usages(&self) -> KeyUsages;

    /// Rebuild the key from cached parts.
    fn from_parts(key: [u8; KEY_LENGTH], usages: KeyUsages) -> Self;
}

impl CacheableKey for RootSecret {
    const KIND: &'static str = "root-secret";

    fn material(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    fn usages(&self) -> KeyUsages {
        KeyUsages::from_usages(&[
            KeyUsage::Encrypt,
            KeyUsage::Decrypt,
            KeyUsage::WrapKey,
            KeyUsage::UnwrapKey,
        ])
    }

    fn from_parts(key: [u8; KEY_LENGTH], _usages: KeyUsages) -> Self {
        Self::from_bytes(key)
    }
}

impl CacheableKey for CollectionKey {
    const KIND: &'static str = "collection-key";

    fn material(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    fn usages(&self) -> KeyUsages {
        self.usages
    }

    fn from_parts(key: [u8; KEY_LENGTH], usages: KeyUsages) -> Self {
        Self::from_bytes(key, usages)
    }
}
