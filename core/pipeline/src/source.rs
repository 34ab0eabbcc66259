//! Where pipelines get collection keys from.

use async_trait::async_trait;

use snapvault_common::{CollectionId, Result};
use snapvault_crypto::CollectionKey;
use snapvault_keyring::{collection_key_id, KeyCache, KeyManager};

/// Resolves the collection key for an item's collection.
///
/// Pipelines never derive a root secret; they only consume keys that are
/// already held by a session or cached on the device.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// The key for `collection_id`, or `None` if none is held.
    async fn collection_key(&self, collection_id: &CollectionId) -> Result<Option<CollectionKey>>;
}

#[async_trait]
impl KeySource for KeyManager {
    async fn collection_key(&self, collection_id: &CollectionId) -> Result<Option<CollectionKey>> {
        self.held_collection_key(collection_id).await
    }
}

#[async_trait]
impl KeySource for KeyCache {
    async fn collection_key(&self, collection_id: &CollectionId) -> Result<Option<CollectionKey>> {
        self.get(&collection_key_id(collection_id)).await
    }
}
