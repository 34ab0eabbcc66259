//! Key manager session.
//!
//! The session holds the unlocked root secret and private key in memory and
//! resolves collection keys through the local cache and the wrapped key store.
//! Keys are zeroized when the session is locked or dropped.

use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::cache::{collection_key_id, KeyCache, ROOT_SECRET_ID};
use crate::config::KeyringConfig;
use crate::hierarchy::KeyHierarchy;
use crate::root::{self, PasswordPolicy};
use snapvault_common::{CollectionId, Error, Result, UserId};
use snapvault_crypto::{CollectionKey, PrimitiveProvider, PrivateKey, PublicKey, RootSecret};
use snapvault_storage::{AccountKeys, AccountStore, WrappedKeyStore};

/// State of the key manager session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Keys are available.
    Unlocked,
    /// Keys have been cleared.
    Locked,
}

struct UnlockedKeys {
    root_secret: RootSecret,
    private_key: PrivateKey,
    public_key: PublicKey,
}

/// Server-side stores the key manager reads and writes.
#[derive(Clone)]
pub struct KeyStores {
    pub accounts: Arc<dyn AccountStore>,
    pub wrapped_keys: Arc<dyn WrappedKeyStore>,
}

/// A user's key session on one device.
pub struct KeyManager {
    user_id: UserId,
    config: KeyringConfig,
    hierarchy: KeyHierarchy,
    stores: KeyStores,
    cache: Arc<KeyCache>,
    policy: PasswordPolicy,
    keys: RwLock<Option<UnlockedKeys>>,
}

impl KeyManager {
    /// Create a locked session.
    pub fn new(
        user_id: UserId,
        config: KeyringConfig,
        provider: Arc<dyn PrimitiveProvider>,
        stores: KeyStores,
        cache: Arc<KeyCache>,
    ) -> Self {
        Self {
            user_id,
            config,
            hierarchy: KeyHierarchy::new(provider),
            stores,
            cache,
            policy: PasswordPolicy::default(),
            keys: RwLock::new(None),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn hierarchy(&self) -> &KeyHierarchy {
        &self.hierarchy
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    fn provider(&self) -> Arc<dyn PrimitiveProvider> {
        self.hierarchy.provider().clone()
    }

    fn set_unlocked(&self, root_secret: RootSecret, private_key: PrivateKey) {
        let public_key = private_key.public_key();
        *self.keys.write().unwrap() = Some(UnlockedKeys {
            root_secret,
            private_key,
            public_key,
        });
    }

    async fn account_keys(&self) -> Result<AccountKeys> {
        self.stores
            .accounts
            .get_account_keys(&self.user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Account not initialized: {}", self.user_id)))
    }

    fn unwrap_account_private_key(
        &self,
        keys: &AccountKeys,
        root_secret: &RootSecret,
    ) -> Result<PrivateKey> {
        let private_key = self
            .hierarchy
            .unwrap_private_key(&keys.wrapped_private_key, root_secret)?;
        let published = PublicKey::from_descriptor(&keys.public_key)?;
        if private_key.public_key() != published {
            return Err(Error::Primitive(
                "Private key does not match the published public key".to_string(),
            ));
        }
        Ok(private_key)
    }

    /// Set up a new account: root secret, verifier and key pair.
    ///
    /// # Preconditions
    /// - The account has no key material yet
    ///
    /// # Postconditions
    /// - Account keys are stored server-side
    /// - The root secret is cached on this device
    /// - The session is unlocked
    ///
    /// # Errors
    /// - `InvalidInput` if the password does not meet the policy
    /// - `AlreadyExists` if the account already has a salt
    pub async fn initialize_account(&self, password: &str) -> Result<()> {
        self.policy.check(password)?;
        if self
            .stores
            .accounts
            .get_account_keys(&self.user_id)
            .await?
            .is_some()
        {
            return Err(Error::AlreadyExists(format!(
                "Salt already set for user: {}",
                self.user_id
            )));
        }

        let setup = root::initialize_root_secret(
            self.provider(),
            &self.user_id,
            password,
            self.config.root_kdf,
        )
        .await?;
        let pair = self.hierarchy.create_key_pair();
        let wrapped_private_key = self
            .hierarchy
            .wrap_private_key(&pair.private, &setup.root_secret)?;

        self.stores
            .accounts
            .put_account_keys(
                &self.user_id,
                AccountKeys {
                    salt: setup.salt,
                    verifier: setup.verifier,
                    public_key: pair.public.to_descriptor(),
                    wrapped_private_key,
                    kdf: self.config.root_kdf,
                },
            )
            .await?;

        self.cache.update(ROOT_SECRET_ID, &setup.root_secret).await?;
        self.set_unlocked(setup.root_secret, pair.private);
        info!(user = %self.user_id, "Account initialized");
        Ok(())
    }

    /// Unlock with the password and cache the root secret on this device.
    ///
    /// # Errors
    /// - `NotFound` if the account has no key material
    /// - `WrongPassword` if the password does not match
    pub async fn unlock(&self, password: &str) -> Result<()> {
        let keys = self.account_keys().await?;
        let root_secret = root::verify_password(
            self.provider(),
            &self.user_id,
            password,
            &keys.salt,
            &keys.verifier,
            keys.kdf,
        )
        .await?;
        let private_key = self.unwrap_account_private_key(&keys, &root_secret)?;

        self.cache.update(ROOT_SECRET_ID, &root_secret).await?;
        self.set_unlocked(root_secret, private_key);
        debug!(user = %self.user_id, "Session unlocked");
        Ok(())
    }

    /// Unlock from the device cache without the password.
    ///
    /// Returns `false` if no usable root secret is cached. A cached secret
    /// that no longer matches the account (after a password change on another
    /// device) is removed.
    pub async fn resume(&self) -> Result<bool> {
        let Some(root_secret) = self.cache.get::<RootSecret>(ROOT_SECRET_ID).await? else {
            return Ok(false);
        };
        let keys = self.account_keys().await?;

        let provider = self.provider();
        if !root::matches_verifier(provider.as_ref(), &root_secret, &keys.salt, &keys.verifier) {
            self.cache.remove(ROOT_SECRET_ID).await?;
            debug!(user = %self.user_id, "Cached root secret is stale");
            return Ok(false);
        }

        let private_key = self.unwrap_account_private_key(&keys, &root_secret)?;
        self.set_unlocked(root_secret, private_key);
        debug!(user = %self.user_id, "Session resumed from cache");
        Ok(true)
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        if self.keys.read().unwrap().is_some() {
            SessionState::Unlocked
        } else {
            SessionState::Locked
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == SessionState::Unlocked
    }

    fn with_keys<T>(&self, f: impl FnOnce(&UnlockedKeys) -> T) -> Result<T> {
        self.keys
            .read()
            .unwrap()
            .as_ref()
            .map(f)
            .ok_or_else(|| Error::NotPermitted("Session is locked".to_string()))
    }

    /// The unlocked root secret.
    ///
    /// # Errors
    /// - `NotPermitted` if the session is locked
    pub fn root_secret(&self) -> Result<RootSecret> {
        self.with_keys(|keys| keys.root_secret.clone())
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        self.with_keys(|keys| keys.public_key)
    }

    pub fn private_key(&self) -> Result<PrivateKey> {
        self.with_keys(|keys| keys.private_key.clone())
    }

    /// Create a collection owned by this user.
    ///
    /// # Errors
    /// - `NotPermitted` if the session is locked
    /// - `AlreadyExists` if this user already holds a key for the collection
    pub async fn create_collection(&self, collection_id: &CollectionId) -> Result<CollectionKey> {
        let root_secret = self.root_secret()?;
        if self
            .stores
            .wrapped_keys
            .get_wrapped_collection_key(collection_id, &self.user_id)
            .await?
            .is_some()
        {
            return Err(Error::AlreadyExists(format!(
                "Album already exists: {}",
                collection_id
            )));
        }

        let key = self.hierarchy.create_collection_key();
        let wrapped = self
            .hierarchy
            .wrap_collection_key(&key, collection_id, &root_secret)?;
        self.stores
            .wrapped_keys
            .put_wrapped_collection_key(collection_id, &self.user_id, wrapped)
            .await?;

        self.cache.store(&collection_key_id(collection_id), &key).await?;
        info!(collection = %collection_id, owner = %self.user_id, "Collection created");
        Ok(key)
    }

    /// Collection key from the device cache only.
    pub async fn cached_collection_key(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Option<CollectionKey>> {
        self.cache.get(&collection_key_id(collection_id)).await
    }

    /// Collection key from the cache, or else from the wrapped key store.
    ///
    /// Returns `None` if this user holds no key for the collection, or if the
    /// key is not cached and the session is locked.
    pub async fn held_collection_key(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Option<CollectionKey>> {
        if let Some(key) = self.cached_collection_key(collection_id).await? {
            return Ok(Some(key));
        }
        let Ok(root_secret) = self.root_secret() else {
            return Ok(None);
        };

        let Some(wrapped) = self
            .stores
            .wrapped_keys
            .get_wrapped_collection_key(collection_id, &self.user_id)
            .await?
        else {
            return Ok(None);
        };

        let key = self
            .hierarchy
            .unwrap_collection_key(&wrapped, collection_id, &root_secret)?;
        self.cache.store(&collection_key_id(collection_id), &key).await?;
        Ok(Some(key))
    }

    /// Collection key, reading through the cache.
    ///
    /// # Errors
    /// - `KeyNotFound` if no key is available
    pub async fn collection_key(&self, collection_id: &CollectionId) -> Result<CollectionKey> {
        self.held_collection_key(collection_id)
            .await?
            .ok_or_else(|| Error::KeyNotFound(format!("No key for album: {}", collection_id)))
    }

    /// Cache a collection key obtained outside the wrapped key store.
    pub async fn cache_collection_key(
        &self,
        collection_id: &CollectionId,
        key: &CollectionKey,
    ) -> Result<()> {
        self.cache.update(&collection_key_id(collection_id), key).await
    }

    /// Lock the session, clearing all keys from memory.
    ///
    /// # Postconditions
    /// - Root secret and private key are zeroized and removed
    /// - Cached entries on the device are kept
    pub fn lock(&self) {
        if let Some(keys) = self.keys.write().unwrap().take() {
            // Keys are zeroized on drop
            drop(keys);
        }
    }

    /// Clear the device cache and lock.
    pub async fn sign_out(&self) -> Result<()> {
        self.cache.clear().await?;
        self.lock();
        info!(user = %self.user_id, "Signed out");
        Ok(())
    }

    /// Replace the password.
    ///
    /// A new salt and root secret are generated; the private key and every
    /// collection key are re-wrapped and stored in one step.
    ///
    /// # Errors
    /// - `WrongPassword` if `old_password` is incorrect
    /// - `InvalidInput` if `new_password` does not meet the policy
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<()> {
        self.policy.check(new_password)?;

        let keys = self.account_keys().await?;
        let old_root = root::verify_password(
            self.provider(),
            &self.user_id,
            old_password,
            &keys.salt,
            &keys.verifier,
            keys.kdf,
        )
        .await?;
        let private_key = self.unwrap_account_private_key(&keys, &old_root)?;

        let setup = root::initialize_root_secret(
            self.provider(),
            &self.user_id,
            new_password,
            self.config.root_kdf,
        )
        .await?;

        let mut rewrapped = Vec::new();
        for (collection_id, wrapped) in self
            .stores
            .wrapped_keys
            .list_wrapped_collection_keys(&self.user_id)
            .await?
        {
            let key = self
                .hierarchy
                .unwrap_collection_key(&wrapped, &collection_id, &old_root)?;
            let wrapped = self
                .hierarchy
                .wrap_collection_key(&key, &collection_id, &setup.root_secret)?;
            rewrapped.push((collection_id, wrapped));
        }

        let wrapped_private_key = self
            .hierarchy
            .wrap_private_key(&private_key, &setup.root_secret)?;
        let count = rewrapped.len();
        self.stores
            .accounts
            .replace_account_keys(
                &self.user_id,
                AccountKeys {
                    salt: setup.salt,
                    verifier: setup.verifier,
                    public_key: keys.public_key,
                    wrapped_private_key,
                    kdf: self.config.root_kdf,
                },
                rewrapped,
            )
            .await?;

        self.cache.update(ROOT_SECRET_ID, &setup.root_secret).await?;
        self.set_unlocked(setup.root_secret, private_key);
        info!(user = %self.user_id, collections = count, "Password changed");
        Ok(())
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        // Ensure keys are zeroized
        self.lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DeviceFingerprint;
    use chrono::{Duration, Utc};
    use snapvault_common::{KeyUsage, ManualClock};
    use snapvault_crypto::{KdfParams, StandardProvider};
    use snapvault_storage::{MemoryBackend, MemoryStore};

    const PASSWORD: &str = "Sunny#Beach1";

    struct Fixture {
        manager: KeyManager,
        backend: MemoryBackend,
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

    fn manager_for(
        user: &str,
        backend: &MemoryBackend,
        store: &MemoryStore,
        clock: Arc<ManualClock>,
    ) -> KeyManager {
        let provider: Arc<dyn PrimitiveProvider> = Arc::new(StandardProvider::new());
        let user_id = UserId::new(user).unwrap();
        let cache = Arc::new(KeyCache::new(
            user_id.clone(),
            DeviceFingerprint::new("test-device").unwrap(),
            &test_config(),
            Arc::new(store.clone()),
            provider.clone(),
            clock,
        ));
        KeyManager::new(
            user_id,
            test_config(),
            provider,
            KeyStores {
                accounts: Arc::new(backend.clone()),
                wrapped_keys: Arc::new(backend.clone()),
            },
            cache,
        )
    }

    fn fixture() -> Fixture {
        let backend = MemoryBackend::new();
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = manager_for("alice", &backend, &store, clock.clone());
        Fixture {
            manager,
            backend,
            store,
            clock,
        }
    }

    fn album(id: &str) -> CollectionId {
        CollectionId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_unlocks_and_caches() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();

        assert!(f.manager.is_unlocked());
        assert!(f.manager.public_key().is_ok());
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();

        let result = f.manager.initialize_account("Other#Pass2").await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_weak_password_rejected_at_setup() {
        let f = fixture();
        let result = f.manager.initialize_account("password").await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(!f.manager.is_unlocked());
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();
        let public = f.manager.public_key().unwrap();

        f.manager.lock();
        assert_eq!(f.manager.state(), SessionState::Locked);
        assert!(matches!(f.manager.root_secret(), Err(Error::NotPermitted(_))));

        assert!(matches!(
            f.manager.unlock("Wrong#Pass1").await,
            Err(Error::WrongPassword)
        ));
        f.manager.unlock(PASSWORD).await.unwrap();
        assert_eq!(f.manager.public_key().unwrap(), public);
    }

    #[tokio::test]
    async fn test_resume_from_cache() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();

        let second = manager_for("alice", &f.backend, &f.store, f.clock.clone());
        assert!(second.resume().await.unwrap());
        assert_eq!(
            second.root_secret().unwrap().as_bytes(),
            f.manager.root_secret().unwrap().as_bytes()
        );
    }

    #[tokio::test]
    async fn test_resume_fails_after_ttl() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();
        f.clock.advance(Duration::days(14));

        let second = manager_for("alice", &f.backend, &f.store, f.clock.clone());
        assert!(!second.resume().await.unwrap());
        assert!(!second.is_unlocked());
    }

    #[tokio::test]
    async fn test_collection_key_read_through() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();
        let key = f.manager.create_collection(&album("vacation")).await.unwrap();

        f.manager.cache().clear().await.unwrap();
        assert!(f
            .manager
            .cached_collection_key(&album("vacation"))
            .await
            .unwrap()
            .is_none());

        let fetched = f.manager.collection_key(&album("vacation")).await.unwrap();
        assert_eq!(fetched, key);
        assert!(fetched.allows(KeyUsage::Encrypt));
        assert!(f
            .manager
            .cached_collection_key(&album("vacation"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_missing_collection_key() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();

        let result = f.manager.collection_key(&album("nope")).await;
        assert!(matches!(result, Err(Error::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_create_collection_twice_fails() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();
        f.manager.create_collection(&album("vacation")).await.unwrap();

        let result = f.manager.create_collection(&album("vacation")).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_sign_out_clears_cache() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();
        f.manager.create_collection(&album("vacation")).await.unwrap();

        f.manager.sign_out().await.unwrap();
        assert!(!f.manager.is_unlocked());
        assert!(f.store.is_empty());
        assert!(!f.manager.resume().await.unwrap());
    }

    #[tokio::test]
    async fn test_change_password_rewraps_keys() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();
        let key = f.manager.create_collection(&album("vacation")).await.unwrap();

        f.manager
            .change_password(PASSWORD, "Rainy#Hills2")
            .await
            .unwrap();
        f.manager.lock();
        f.manager.cache().clear().await.unwrap();

        assert!(matches!(
            f.manager.unlock(PASSWORD).await,
            Err(Error::WrongPassword)
        ));
        f.manager.unlock("Rainy#Hills2").await.unwrap();
        f.manager.cache().clear().await.unwrap();
        assert_eq!(
            f.manager.collection_key(&album("vacation")).await.unwrap(),
            key
        );
    }

    #[tokio::test]
    async fn test_stale_cached_root_is_dropped() {
        let f = fixture();
        f.manager.initialize_account(PASSWORD).await.unwrap();

        let other_store = MemoryStore::new();
        let other_device = manager_for("alice", &f.backend, &other_store, f.clock.clone());
        other_device.unlock(PASSWORD).await.unwrap();
        other_device
            .change_password(PASSWORD, "Rainy#Hills2")
            .await
            .unwrap();

        let second = manager_for("alice", &f.backend, &f.store, f.clock.clone());
        assert!(!second.resume().await.unwrap());
        assert!(f.store.is_empty());
    }
}
