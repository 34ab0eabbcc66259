//! Device-local key cache.
//!
//! Keys are stored wrapped under a device key that is derived from a device
//! fingerprint and the user id, never from the password. Entries expire a
//! fixed duration after they were written.
//!
//! # Entry format
//!
//! Each entry is a JSON document:
//!
//! ```text
//! { "key_id", "kind", "wrapped": { "nonce", "ciphertext" }, "usages", "created_at" }
//! ```
//!
//! The key id and usage set are authenticated with the wrapped key, so an
//! entry cannot be renamed or given more usages than it was stored with.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::KeyringConfig;
use snapvault_common::{Clock, CollectionId, Error, KeyUsages, Result, UserId};
use snapvault_crypto::{
    CacheableKey, DeviceKey, KdfParams, PrimitiveProvider, Sealed, KEY_LENGTH,
};
use snapvault_storage::LocalStore;

/// Cache id of a user's root secret.
pub const ROOT_SECRET_ID: &str = "root-secret";

/// Cache id of a collection key.
pub fn collection_key_id(collection_id: &CollectionId) -> String {
    format!("collection-key:{}", collection_id)
}

/// Stable, non-secret identifier of the current device.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceFingerprint(String);

impl DeviceFingerprint {
    /// # Errors
    /// - Returns `InvalidInput` if the fingerprint is empty
    pub fn new(fingerprint: impl Into<String>) -> Result<Self> {
        let fingerprint = fingerprint.into();
        if fingerprint.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Device fingerprint cannot be empty".to_string(),
            ));
        }
        Ok(Self(fingerprint))
    }

    /// Fingerprint of the running machine.
    ///
    /// Uses the machine id where the platform provides one, falling back to
    /// the operating system and architecture.
    pub fn detect() -> Self {
        let machine_id = ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .find_map(|path| std::fs::read_to_string(path).ok())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        let base = format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH);
        match machine_id {
            Some(id) => Self(format!("{}:{}", base, id)),
            None => Self(base),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceFingerprint({} chars)", self.0.len())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key_id: String,
    kind: String,
    wrapped: Sealed,
    usages: KeyUsages,
    created_at: DateTime<Utc>,
}

fn entry_aad(key_id: &str, usages: KeyUsages) -> Vec<u8> {
    let mut aad = Vec::with_capacity(key_id.len() + 1);
    aad.extend_from_slice(key_id.as_bytes());
    aad.push(usages.to_byte());
    aad
}

/// Why a cached entry was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purge {
    Expired,
    Corrupt,
    Unreadable,
}

/// Device-wrapped key cache for one user on one device.
pub struct KeyCache {
    user_id: UserId,
    fingerprint: DeviceFingerprint,
    device_kdf: KdfParams,
    ttl: Duration,
    store: Arc<dyn LocalStore>,
    provider: Arc<dyn PrimitiveProvider>,
    clock: Arc<dyn Clock>,
    device_key: OnceCell<DeviceKey>,
}

impl KeyCache {
    pub fn new(
        user_id: UserId,
        fingerprint: DeviceFingerprint,
        config: &KeyringConfig,
        store: Arc<dyn LocalStore>,
        provider: Arc<dyn PrimitiveProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            user_id,
            fingerprint,
            device_kdf: config.device_kdf,
            ttl: config.cache_ttl(),
            store,
            provider,
            clock,
            device_key: OnceCell::new(),
        }
    }

    /// User this cache belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Freshness window of entries.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn store_key(&self, key_id: &str) -> String {
        format!("{}/{}", self.user_id, key_id)
    }

    /// Derive the device key on first use.
    async fn device_key(&self) -> Result<&DeviceKey> {
        self.device_key
            .get_or_try_init(|| async {
                let mut secret = self.fingerprint.as_str().as_bytes().to_vec();
                secret.extend_from_slice(self.user_id.as_str().as_bytes());
                let salt = self.user_id.as_str().as_bytes().to_vec();
                let provider = self.provider.clone();
                let params = self.device_kdf;

                let key = tokio::task::spawn_blocking(move || {
                    provider.derive_key(&secret, &salt, &params)
                })
                .await
                .map_err(|e| Error::Primitive(format!("Device key task failed: {}", e)))??;

                debug!(user = %self.user_id, "Device key derived");
                Ok::<_, Error>(DeviceKey::from_bytes(*key))
            })
            .await
    }

    async fn encode_entry<K: CacheableKey>(&self, key_id: &str, key: &K) -> Result<String> {
        let device_key = self.device_key().await?;
        let usages = key.usages();
        let wrapped = self.provider.seal(
            device_key.as_bytes(),
            key.material(),
            &entry_aad(key_id, usages),
        )?;

        let entry = CacheEntry {
            key_id: key_id.to_string(),
            kind: K::KIND.to_string(),
            wrapped,
            usages,
            created_at: self.clock.now(),
        };
        Ok(serde_json::to_string(&entry)?)
    }

    /// Cache a key unless an entry already exists.
    ///
    /// Returns `true` if the key was written.
    pub async fn store<K: CacheableKey>(&self, key_id: &str, key: &K) -> Result<bool> {
        let value = self.encode_entry(key_id, key).await?;
        let written = self
            .store
            .put_if_absent(&self.store_key(key_id), value)
            .await?;
        debug!(key_id, kind = K::KIND, written, "Cache store");
        Ok(written)
    }

    /// Cache a key, replacing any existing entry.
    pub async fn update<K: CacheableKey>(&self, key_id: &str, key: &K) -> Result<()> {
        let value = self.encode_entry(key_id, key).await?;
        self.store.put(&self.store_key(key_id), value).await?;
        debug!(key_id, kind = K::KIND, "Cache update");
        Ok(())
    }

    /// Read a cached key.
    ///
    /// Expired, undecodable and unopenable entries are deleted and reported
    /// as absent. An entry holding a different kind of key is left in place.
    pub async fn get<K: CacheableKey>(&self, key_id: &str) -> Result<Option<K>> {
        let store_key = self.store_key(key_id);
        let Some(raw) = self.store.get(&store_key).await? else {
            return Ok(None);
        };

        match self.decode_entry::<K>(key_id, &raw).await? {
            Ok(key) => Ok(key),
            Err(reason) => {
                warn!(key_id, ?reason, "Discarding cached key");
                self.store.delete(&store_key).await?;
                Ok(None)
            }
        }
    }

    async fn decode_entry<K: CacheableKey>(
        &self,
        key_id: &str,
        raw: &str,
    ) -> Result<std::result::Result<Option<K>, Purge>> {
        let entry: CacheEntry = match serde_json::from_str(raw) {
            Ok(entry) => entry,
            Err(_) => return Ok(Err(Purge::Corrupt)),
        };
        if entry.key_id != key_id {
            return Ok(Err(Purge::Corrupt));
        }
        if entry.kind != K::KIND {
            debug!(key_id, stored = %entry.kind, requested = K::KIND, "Cached key kind differs");
            return Ok(Ok(None));
        }
        // Entries dated in the future come from a clock that moved backwards
        let age = self.clock.now() - entry.created_at;
        if age < Duration::zero() || age >= self.ttl {
            return Ok(Err(Purge::Expired));
        }

        let device_key = self.device_key().await?;
        let opened = self.provider.open(
            device_key.as_bytes(),
            &entry.wrapped,
            &entry_aad(key_id, entry.usages),
        );
        let material: [u8; KEY_LENGTH] = match opened {
            Ok(plaintext) => match plaintext.as_slice().try_into() {
                Ok(bytes) => bytes,
                Err(_) => return Ok(Err(Purge::Unreadable)),
            },
            Err(_) => return Ok(Err(Purge::Unreadable)),
        };

        Ok(Ok(Some(K::from_parts(material, entry.usages))))
    }

    /// Delete one cached key.
    pub async fn remove(&self, key_id: &str) -> Result<()> {
        self.store.delete(&self.store_key(key_id)).await
    }

    /// Delete every cached key on this device.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await?;
        debug!(user = %self.user_id, "Cache cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_common::{KeyUsage, ManualClock};
    use snapvault_crypto::{CollectionKey, RootSecret, StandardProvider};
    use snapvault_storage::MemoryStore;

    struct Fixture {
        cache: KeyCache,
        store: MemoryStore,
        clock: Arc<ManualClock>,
    }

    fn test_config() -> KeyringConfig {
        KeyringConfig {
            root_kdf: KdfParams::pbkdf2(1_000),
            device_kdf: KdfParams::pbkdf2(1_000),
            ..KeyringConfig::default()
        }
    }

    fn fixture_for(user: &str, device: &str, store: MemoryStore) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = KeyCache::new(
            UserId::new(user).unwrap(),
            DeviceFingerprint::new(device).unwrap(),
            &test_config(),
            Arc::new(store.clone()),
            Arc::new(StandardProvider::new()),
            clock.clone(),
        );
        Fixture {
            cache,
            store,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_for("alice", "laptop", MemoryStore::new())
    }

    fn album_key() -> CollectionKey {
        CollectionKey::from_bytes([4u8; KEY_LENGTH], KeyUsages::CONTENT)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let f = fixture();
        let id = collection_key_id(&CollectionId::new("vacation").unwrap());

        assert!(f.cache.store(&id, &album_key()).await.unwrap());
        let cached: CollectionKey = f.cache.get(&id).await.unwrap().unwrap();
        assert_eq!(cached, album_key());
    }

    #[tokio::test]
    async fn test_store_first_write_wins() {
        let f = fixture();
        let other = CollectionKey::from_bytes([5u8; KEY_LENGTH], KeyUsages::CONTENT);

        assert!(f.cache.store("k", &album_key()).await.unwrap());
        assert!(!f.cache.store("k", &other).await.unwrap());
        let cached: CollectionKey = f.cache.get("k").await.unwrap().unwrap();
        assert_eq!(cached, album_key());

        f.cache.update("k", &other).await.unwrap();
        let cached: CollectionKey = f.cache.get("k").await.unwrap().unwrap();
        assert_eq!(cached, other);
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let f = fixture();
        let root = RootSecret::from_bytes([9u8; KEY_LENGTH]);
        f.cache.update(ROOT_SECRET_ID, &root).await.unwrap();

        f.clock.advance(Duration::days(14) - Duration::seconds(1));
        let fresh: Option<RootSecret> = f.cache.get(ROOT_SECRET_ID).await.unwrap();
        assert!(fresh.is_some());

        f.clock.advance(Duration::seconds(1));
        let expired: Option<RootSecret> = f.cache.get(ROOT_SECRET_ID).await.unwrap();
        assert!(expired.is_none());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_purged() {
        let f = fixture();
        f.store
            .put("alice/k", "{not json".to_string())
            .await
            .unwrap();

        let cached: Option<CollectionKey> = f.cache.get("k").await.unwrap();
        assert!(cached.is_none());
        assert!(f.store.get("alice/k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_escalated_usages_fail_to_open() {
        let f = fixture();
        let read_only = album_key().restrict(KeyUsages::from_usages(&[KeyUsage::Decrypt]));
        f.cache.store("k", &read_only).await.unwrap();

        let raw = f.store.get("alice/k").await.unwrap().unwrap();
        let mut entry: serde_json::Value = serde_json::from_str(&raw).unwrap();
        entry["usages"] = serde_json::json!(["encrypt", "decrypt"]);
        f.store.put("alice/k", entry.to_string()).await.unwrap();

        let cached: Option<CollectionKey> = f.cache.get("k").await.unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_other_device_cannot_read_entries() {
        let store = MemoryStore::new();
        let laptop = fixture_for("alice", "laptop", store.clone());
        laptop.cache.store("k", &album_key()).await.unwrap();

        let phone = fixture_for("alice", "phone", store);
        let cached: Option<CollectionKey> = phone.cache.get("k").await.unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let f = fixture();
        f.cache.store("a", &album_key()).await.unwrap();
        f.cache.store("b", &album_key()).await.unwrap();

        f.cache.remove("a").await.unwrap();
        assert!(f.cache.get::<CollectionKey>("a").await.unwrap().is_none());
        assert!(f.cache.get::<CollectionKey>("b").await.unwrap().is_some());

        f.cache.clear().await.unwrap();
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_kind_mismatch_keeps_entry() {
        let f = fixture();
        f.cache.store("k", &album_key()).await.unwrap();

        let as_root: Option<RootSecret> = f.cache.get("k").await.unwrap();
        assert!(as_root.is_none());

        let cached: Option<CollectionKey> = f.cache.get("k").await.unwrap();
        assert_eq!(cached, Some(album_key()));
    }

    #[tokio::test]
    async fn test_entry_from_the_future_is_expired() {
        let f = fixture();
        f.cache.store("k", &album_key()).await.unwrap();

        // The device clock is set back after the entry was written
        f.clock.set(Utc::now() - Duration::days(1));
        let cached: Option<CollectionKey> = f.cache.get("k").await.unwrap();
        assert!(cached.is_none());
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_fingerprint_rejects_empty() {
        assert!(DeviceFingerprint::new("  ").is_err());
        assert!(!DeviceFingerprint::detect().as_str().is_empty());
    }
}
