//! In-memory server backend.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::provider::{
    AccountStore, GrantStore, IdentityDirectory, ObjectTransport, TransferService,
    WrappedKeyStore,
};
use crate::records::{
    AccountKeys, GrantAcceptance, GrantRequest, ItemRecord, PublicIdentity, ShareGrant,
    TransferTarget,
};
use snapvault_common::{codec, CollectionId, Error, GrantId, ItemId, Permission, Result, UserId};
use snapvault_crypto::Sealed;

/// Lifetime of issued transfer targets.
const TARGET_LIFETIME_MINUTES: i64 = 15;

const URL_SCHEME: &str = "memory://objects/";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CollectionEntry {
    owner: Option<UserId>,
    members: BTreeMap<UserId, Permission>,
    wrapped_keys: BTreeMap<UserId, Sealed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
struct StoredObject(#[serde(with = "codec::base64_bytes")] Vec<u8>);

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackendState {
    accounts: BTreeMap<UserId, AccountKeys>,
    aliases: BTreeMap<String, UserId>,
    collections: BTreeMap<CollectionId, CollectionEntry>,
    grants: BTreeMap<GrantId, ShareGrant>,
    items: BTreeMap<CollectionId, BTreeMap<ItemId, ItemRecord>>,
    objects: BTreeMap<String, StoredObject>,
    #[serde(skip)]
    pending_transport_failures: usize,
}

impl BackendState {
    fn permission_of(&self, collection: &CollectionId, user: &UserId) -> Option<Permission> {
        self.collections
            .get(collection)
            .and_then(|entry| entry.members.get(user).copied())
    }

    fn take_injected_failure(&mut self) -> bool {
        if self.pending_transport_failures > 0 {
            self.pending_transport_failures -= 1;
            true
        } else {
            false
        }
    }
}

/// In-memory implementation of every server-side collaborator.
///
/// All state sits behind a single lock, so multi-record operations such as
/// [`GrantStore::accept_grant`] are applied atomically. State can be exported
/// as JSON with [`MemoryBackend::snapshot`] and reloaded with
/// [`MemoryBackend::restore`].
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<BackendState>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a backend from a [`MemoryBackend::snapshot`].
    ///
    /// # Errors
    /// - Returns `Serialization` if the snapshot is malformed
    pub fn restore(snapshot: &str) -> Result<Self> {
        let state: BackendState = serde_json::from_str(snapshot)?;
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Export the full state as JSON.
    pub fn snapshot(&self) -> Result<String> {
        let state = self.state.read().unwrap();
        Ok(serde_json::to_string_pretty(&*state)?)
    }

    /// Register an alias (such as an email address) resolving to `user`.
    pub fn register_alias(&self, alias: impl Into<String>, user: &UserId) {
        self.state
            .write()
            .unwrap()
            .aliases
            .insert(alias.into(), user.clone());
    }

    /// Remove `user`'s access to a collection and their wrapped key copy.
    ///
    /// # Errors
    /// - `NotFound` if the collection does not exist
    /// - `NotPermitted` if `user` owns the collection
    pub fn revoke_access(&self, collection: &CollectionId, user: &UserId) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let entry = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::NotFound(format!("Album not found: {}", collection)))?;

        if entry.owner.as_ref() == Some(user) {
            return Err(Error::NotPermitted(
                "Cannot revoke the owner's access".to_string(),
            ));
        }
        entry.members.remove(user);
        entry.wrapped_keys.remove(user);
        debug!(%collection, %user, "Access revoked");
        Ok(())
    }

    /// Permission `user` holds on a collection, if any.
    pub fn permission_of(&self, collection: &CollectionId, user: &UserId) -> Option<Permission> {
        self.state.read().unwrap().permission_of(collection, user)
    }

    /// Make the next `count` object transfers fail with a transport error.
    pub fn inject_transport_failures(&self, count: usize) {
        self.state.write().unwrap().pending_transport_failures = count;
    }

    fn object_url(collection: &CollectionId, item: &ItemId) -> String {
        format!("{}{}/{}", URL_SCHEME, collection, item)
    }

    fn target(url: String) -> TransferTarget {
        TransferTarget {
            url,
            expires_at: Utc::now() + Duration::minutes(TARGET_LIFETIME_MINUTES),
        }
    }

    fn check_target(target: &TransferTarget) -> Result<()> {
        if !target.url.starts_with(URL_SCHEME) {
            return Err(Error::InvalidInput(format!("Unknown target: {}", target.url)));
        }
        if target.expires_at <= Utc::now() {
            return Err(Error::Transport("Transfer target expired".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityDirectory for MemoryBackend {
    async fn find_public_key(&self, identity: &str) -> Result<Option<PublicIdentity>> {
        let state = self.state.read().unwrap();

        let user = match state.aliases.get(identity) {
            Some(user) => user.clone(),
            None => match UserId::new(identity) {
                Ok(user) => user,
                Err(_) => return Ok(None),
            },
        };

        Ok(state.accounts.get(&user).map(|keys| PublicIdentity {
            user_id: user.clone(),
            public_key: keys.public_key.clone(),
        }))
    }
}

#[async_trait]
impl AccountStore for MemoryBackend {
    async fn get_account_keys(&self, user: &UserId) -> Result<Option<AccountKeys>> {
        Ok(self.state.read().unwrap().accounts.get(user).cloned())
    }

    async fn put_account_keys(&self, user: &UserId, keys: AccountKeys) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.accounts.contains_key(user) {
            return Err(Error::AlreadyExists(format!(
                "Salt already set for user: {}",
                user
            )));
        }
        state.accounts.insert(user.clone(), keys);
        Ok(())
    }

    async fn replace_account_keys(
        &self,
        user: &UserId,
        keys: AccountKeys,
        collection_keys: Vec<(CollectionId, Sealed)>,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if !state.accounts.contains_key(user) {
            return Err(Error::NotFound(format!("User not found: {}", user)));
        }
        for (collection, _) in &collection_keys {
            if state.permission_of(collection, user).is_none() {
                return Err(Error::NotPermitted(format!(
                    "Not a member of album: {}",
                    collection
                )));
            }
        }

        state.accounts.insert(user.clone(), keys);
        for (collection, wrapped) in collection_keys {
            if let Some(entry) = state.collections.get_mut(&collection) {
                entry.wrapped_keys.insert(user.clone(), wrapped);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WrappedKeyStore for MemoryBackend {
    async fn put_wrapped_collection_key(
        &self,
        collection: &CollectionId,
        user: &UserId,
        wrapped: Sealed,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let entry = state.collections.entry(collection.clone()).or_default();

        if entry.owner.is_none() {
            entry.owner = Some(user.clone());
            entry.members.insert(user.clone(), Permission::ReadWrite);
            debug!(%collection, owner = %user, "Collection registered");
        } else if !entry.members.contains_key(user) {
            return Err(Error::NotPermitted(format!(
                "Not a member of album: {}",
                collection
            )));
        }

        entry.wrapped_keys.insert(user.clone(), wrapped);
        Ok(())
    }

    async fn get_wrapped_collection_key(
        &self,
        collection: &CollectionId,
        user: &UserId,
    ) -> Result<Option<Sealed>> {
        let state = self.state.read().unwrap();
        Ok(state
            .collections
            .get(collection)
            .and_then(|entry| entry.wrapped_keys.get(user).cloned()))
    }

    async fn list_wrapped_collection_keys(
        &self,
        user: &UserId,
    ) -> Result<Vec<(CollectionId, Sealed)>> {
        let state = self.state.read().unwrap();
        Ok(state
            .collections
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .wrapped_keys
                    .get(user)
                    .map(|wrapped| (id.clone(), wrapped.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl GrantStore for MemoryBackend {
    async fn create_grant(&self, request: GrantRequest) -> Result<ShareGrant> {
        let mut state = self.state.write().unwrap();

        let entry = state
            .collections
            .get(&request.collection_id)
            .ok_or_else(|| Error::NotFound(format!("Album not found: {}", request.collection_id)))?;
        if entry.owner.as_ref() != Some(&request.granter) {
            return Err(Error::NotPermitted(
                "Only the owner can share this album".to_string(),
            ));
        }
        if entry.members.contains_key(&request.grantee) {
            return Err(Error::AlreadyExists(format!(
                "{} already has access",
                request.grantee
            )));
        }

        let grant = ShareGrant {
            id: GrantId::new(Uuid::new_v4().to_string())?,
            collection_id: request.collection_id,
            granter: request.granter,
            grantee: request.grantee,
            sealed_key: request.sealed_key,
            permission: request.permission,
            created_at: Utc::now(),
        };
        state.grants.insert(grant.id.clone(), grant.clone());
        debug!(grant = %grant.id, collection = %grant.collection_id, "Grant created");

        Ok(grant)
    }

    async fn get_grant(&self, id: &GrantId) -> Result<Option<ShareGrant>> {
        Ok(self.state.read().unwrap().grants.get(id).cloned())
    }

    async fn list_grants_for(&self, grantee: &UserId) -> Result<Vec<ShareGrant>> {
        let state = self.state.read().unwrap();
        Ok(state
            .grants
            .values()
            .filter(|grant| &grant.grantee == grantee)
            .cloned()
            .collect())
    }

    async fn accept_grant(&self, acceptance: GrantAcceptance) -> Result<()> {
        let mut state = self.state.write().unwrap();

        let grant = state
            .grants
            .get(&acceptance.grant_id)
            .ok_or_else(|| Error::NotFound(format!("Invite not found: {}", acceptance.grant_id)))?;
        if grant.grantee != acceptance.grantee {
            return Err(Error::NotPermitted(
                "Invite is addressed to another user".to_string(),
            ));
        }
        if grant.collection_id != acceptance.collection_id
            || grant.permission != acceptance.permission
        {
            return Err(Error::InvalidInput(
                "Acceptance does not match the invite".to_string(),
            ));
        }
        if !state.collections.contains_key(&acceptance.collection_id) {
            return Err(Error::NotFound(format!(
                "Album not found: {}",
                acceptance.collection_id
            )));
        }

        // Every check passed; apply all three changes under the same lock.
        state.grants.remove(&acceptance.grant_id);
        if let Some(entry) = state.collections.get_mut(&acceptance.collection_id) {
            entry
                .members
                .insert(acceptance.grantee.clone(), acceptance.permission);
            entry
                .wrapped_keys
                .insert(acceptance.grantee.clone(), acceptance.wrapped_key);
        }
        debug!(grant = %acceptance.grant_id, grantee = %acceptance.grantee, "Grant accepted");

        Ok(())
    }
}

#[async_trait]
impl TransferService for MemoryBackend {
    async fn request_upload_target(
        &self,
        user: &UserId,
        collection: &CollectionId,
        item: &ItemId,
        len: u64,
    ) -> Result<TransferTarget> {
        let state = self.state.read().unwrap();
        match state.permission_of(collection, user) {
            Some(permission) if permission.can_write() => {}
            _ => {
                return Err(Error::NotPermitted(
                    "You don't have permission to upload to this album".to_string(),
                ))
            }
        }
        if len == 0 {
            return Err(Error::InvalidInput("Missing required fields".to_string()));
        }
        Ok(Self::target(Self::object_url(collection, item)))
    }

    async fn request_download_source(
        &self,
        user: &UserId,
        collection: &CollectionId,
        item: &ItemId,
    ) -> Result<TransferTarget> {
        let state = self.state.read().unwrap();
        if state.permission_of(collection, user).is_none() {
            return Err(Error::NotPermitted(format!(
                "No access to album: {}",
                collection
            )));
        }
        let exists = state
            .items
            .get(collection)
            .is_some_and(|items| items.contains_key(item));
        if !exists {
            return Err(Error::NotFound(format!("Photo not found: {}", item)));
        }
        Ok(Self::target(Self::object_url(collection, item)))
    }

    async fn store_item_record(&self, user: &UserId, record: ItemRecord) -> Result<()> {
        let mut state = self.state.write().unwrap();
        match state.permission_of(&record.collection_id, user) {
            Some(permission) if permission.can_write() => {}
            _ => {
                return Err(Error::NotPermitted(
                    "You don't have permission to upload to this album".to_string(),
                ))
            }
        }

        let url = Self::object_url(&record.collection_id, &record.item_id);
        let stored_len = state.objects.get(&url).map(|object| object.0.len() as u64);
        if stored_len != Some(record.ciphertext_len) {
            return Err(Error::InvalidInput(
                "Stored object does not match the record".to_string(),
            ));
        }

        state
            .items
            .entry(record.collection_id.clone())
            .or_default()
            .insert(record.item_id.clone(), record);
        Ok(())
    }

    async fn get_item_record(
        &self,
        user: &UserId,
        collection: &CollectionId,
        item: &ItemId,
    ) -> Result<Option<ItemRecord>> {
        let state = self.state.read().unwrap();
        if state.permission_of(collection, user).is_none() {
            return Err(Error::NotPermitted(format!(
                "No access to album: {}",
                collection
            )));
        }
        Ok(state
            .items
            .get(collection)
            .and_then(|items| items.get(item).cloned()))
    }
}

#[async_trait]
impl ObjectTransport for MemoryBackend {
    async fn put(&self, target: &TransferTarget, data: Bytes) -> Result<()> {
        Self::check_target(target)?;
        let mut state = self.state.write().unwrap();
        if state.take_injected_failure() {
            return Err(Error::Transport("Failed to upload file".to_string()));
        }
        state
            .objects
            .insert(target.url.clone(), StoredObject(data.to_vec()));
        Ok(())
    }

    async fn get(&self, target: &TransferTarget) -> Result<Bytes> {
        Self::check_target(target)?;
        let mut state = self.state.write().unwrap();
        if state.take_injected_failure() {
            return Err(Error::Transport("Failed to download file".to_string()));
        }
        state
            .objects
            .get(&target.url)
            .map(|object| Bytes::from(object.0.clone()))
            .ok_or_else(|| Error::NotFound(format!("Object not found: {}", target.url)))
    }
}
