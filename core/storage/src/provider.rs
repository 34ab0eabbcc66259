//! Collaborator trait definitions.
//!
//! The key hierarchy and the pipelines only ever talk to the server and to
//! local storage through these traits.

use async_trait::async_trait;
use bytes::Bytes;

use crate::records::{
    AccountKeys, GrantAcceptance, GrantRequest, ItemRecord, PublicIdentity, ShareGrant,
    TransferTarget,
};
use snapvault_common::{CollectionId, GrantId, ItemId, Result, UserId};
use snapvault_crypto::Sealed;

/// Lookup of users' public keys.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Find the public key published for `identity` (a user id or a registered alias).
    ///
    /// Returns `None` if the identity is unknown or has no key pair yet.
    async fn find_public_key(&self, identity: &str) -> Result<Option<PublicIdentity>>;
}

/// Server-side storage of per-user key material.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account_keys(&self, user: &UserId) -> Result<Option<AccountKeys>>;

    /// Record a user's key material for the first time.
    ///
    /// # Errors
    /// - `AlreadyExists` if the user already has a salt recorded
    async fn put_account_keys(&self, user: &UserId, keys: AccountKeys) -> Result<()>;

    /// Replace existing key material after a password change.
    ///
    /// The account keys and every re-wrapped collection key are replaced as
    /// one unit, so the stored keys never mix two root secrets.
    ///
    /// # Errors
    /// - `NotFound` if the user has no key material
    /// - `NotPermitted` if a collection key is given for a collection the user is not a member of
    async fn replace_account_keys(
        &self,
        user: &UserId,
        keys: AccountKeys,
        collection_keys: Vec<(CollectionId, Sealed)>,
    ) -> Result<()>;
}

/// Server-side storage of collection keys wrapped under each member's root secret.
#[async_trait]
pub trait WrappedKeyStore: Send + Sync {
    /// Store `user`'s wrapped copy of a collection key.
    ///
    /// The first key stored for an unknown collection makes `user` its owner.
    ///
    /// # Errors
    /// - `NotPermitted` if the collection exists and `user` is not a member
    async fn put_wrapped_collection_key(
        &self,
        collection: &CollectionId,
        user: &UserId,
        wrapped: Sealed,
    ) -> Result<()>;

    async fn get_wrapped_collection_key(
        &self,
        collection: &CollectionId,
        user: &UserId,
    ) -> Result<Option<Sealed>>;

    /// Every collection key `user` holds a wrapped copy of.
    async fn list_wrapped_collection_keys(&self, user: &UserId)
        -> Result<Vec<(CollectionId, Sealed)>>;
}

/// Server-side storage of pending share grants.
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Persist a pending grant.
    ///
    /// # Errors
    /// - `NotPermitted` if the granter does not own the collection
    /// - `AlreadyExists` if the grantee already has access
    async fn create_grant(&self, request: GrantRequest) -> Result<ShareGrant>;

    async fn get_grant(&self, id: &GrantId) -> Result<Option<ShareGrant>>;

    /// Pending grants addressed to `grantee`.
    async fn list_grants_for(&self, grantee: &UserId) -> Result<Vec<ShareGrant>>;

    /// Consume a grant.
    ///
    /// Deleting the grant, recording the permission and storing the wrapped
    /// key happen as one unit: either all are applied or none.
    ///
    /// # Errors
    /// - `NotFound` if the grant does not exist
    /// - `NotPermitted` if the grant is addressed to someone else
    async fn accept_grant(&self, acceptance: GrantAcceptance) -> Result<()>;
}

/// Issues transfer targets and records item metadata.
#[async_trait]
pub trait TransferService: Send + Sync {
    /// Request a target to upload `len` bytes of ciphertext for an item.
    ///
    /// # Errors
    /// - `NotPermitted` if `user` may not write to the collection
    async fn request_upload_target(
        &self,
        user: &UserId,
        collection: &CollectionId,
        item: &ItemId,
        len: u64,
    ) -> Result<TransferTarget>;

    /// Request a target to download an item's ciphertext.
    ///
    /// # Errors
    /// - `NotPermitted` if `user` has no access to the collection
    /// - `NotFound` if the item does not exist
    async fn request_download_source(
        &self,
        user: &UserId,
        collection: &CollectionId,
        item: &ItemId,
    ) -> Result<TransferTarget>;

    async fn store_item_record(&self, user: &UserId, record: ItemRecord) -> Result<()>;

    async fn get_item_record(
        &self,
        user: &UserId,
        collection: &CollectionId,
        item: &ItemId,
    ) -> Result<Option<ItemRecord>>;
}

/// Moves opaque bytes to and from transfer targets.
#[async_trait]
pub trait ObjectTransport: Send + Sync {
    async fn put(&self, target: &TransferTarget, data: Bytes) -> Result<()>;

    async fn get(&self, target: &TransferTarget) -> Result<Bytes>;
}

/// Device-local key-value storage of JSON strings.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite a value.
    async fn put(&self, key: &str, value: String) -> Result<()>;

    /// Insert a value unless the key is present.
    ///
    /// Returns `true` if the value was written.
    async fn put_if_absent(&self, key: &str, value: String) -> Result<bool>;

    /// Remove a value. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}
