//! Registry of decrypted media.
//!
//! Downloads hand out a [`MediaHandle`] instead of raw bytes. The plaintext
//! stays in the registry until the handle is released, and is zeroized when
//! the last reference to it is dropped.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

use snapvault_common::{CollectionId, Error, ItemId, Result, SensitiveBytes};

const HANDLE_SCHEME: &str = "media://";

/// Revocable reference to decrypted media.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle {
    id: Uuid,
    collection_id: CollectionId,
    item_id: ItemId,
    len: usize,
}

impl MediaHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }

    pub fn item_id(&self) -> &ItemId {
        &self.item_id
    }

    /// Plaintext length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Local URL identifying this handle.
    pub fn url(&self) -> String {
        format!("{}{}", HANDLE_SCHEME, self.id)
    }
}

struct MediaEntry {
    handle: MediaHandle,
    data: Arc<SensitiveBytes>,
}

/// Decrypted media shared by all downloads of one session.
#[derive(Default)]
pub struct MediaRegistry {
    entries: RwLock<HashMap<(CollectionId, ItemId), MediaEntry>>,
}

impl MediaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register decrypted media for an item.
    ///
    /// If the item is already registered the existing handle is returned and
    /// `data` is dropped.
    pub fn register(
        &self,
        collection_id: &CollectionId,
        item_id: &ItemId,
        data: SensitiveBytes,
    ) -> MediaHandle {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry((collection_id.clone(), item_id.clone()))
            .or_insert_with(|| MediaEntry {
                handle: MediaHandle {
                    id: Uuid::new_v4(),
                    collection_id: collection_id.clone(),
                    item_id: item_id.clone(),
                    len: data.len(),
                },
                data: Arc::new(data),
            });
        debug!(url = %entry.handle.url(), "Media registered");
        entry.handle.clone()
    }

    /// Handle of an item that is still registered.
    pub fn lookup(&self, collection_id: &CollectionId, item_id: &ItemId) -> Option<MediaHandle> {
        self.entries
            .read()
            .unwrap()
            .get(&(collection_id.clone(), item_id.clone()))
            .map(|entry| entry.handle.clone())
    }

    /// Plaintext behind a handle.
    ///
    /// # Errors
    /// - `NotFound` if the handle has been released
    pub fn read(&self, handle: &MediaHandle) -> Result<Arc<SensitiveBytes>> {
        self.entries
            .read()
            .unwrap()
            .get(&(handle.collection_id.clone(), handle.item_id.clone()))
            .filter(|entry| entry.handle.id == handle.id)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| Error::NotFound(format!("Media released: {}", handle.url())))
    }

    /// Revoke a handle. Returns `false` if it was already released.
    pub fn release(&self, handle: &MediaHandle) -> bool {
        let mut entries = self.entries.write().unwrap();
        let key = (handle.collection_id.clone(), handle.item_id.clone());
        match entries.get(&key) {
            Some(entry) if entry.handle.id == handle.id => {
                entries.remove(&key);
                debug!(url = %handle.url(), "Media released");
                true
            }
            _ => false,
        }
    }

    /// Revoke every handle.
    pub fn release_all(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (CollectionId, ItemId) {
        (
            CollectionId::new("vacation").unwrap(),
            ItemId::new("p1").unwrap(),
        )
    }

    #[test]
    fn test_register_and_read() {
        let registry = MediaRegistry::new();
        let (album, item) = ids();

        let handle = registry.register(&album, &item, SensitiveBytes::new(b"beach".to_vec()));
        assert_eq!(handle.len(), 5);
        assert!(handle.url().starts_with("media://"));
        assert_eq!(registry.read(&handle).unwrap().as_bytes(), b"beach");
        assert_eq!(registry.lookup(&album, &item), Some(handle));
    }

    #[test]
    fn test_register_twice_keeps_first_handle() {
        let registry = MediaRegistry::new();
        let (album, item) = ids();

        let first = registry.register(&album, &item, SensitiveBytes::new(b"one".to_vec()));
        let second = registry.register(&album, &item, SensitiveBytes::new(b"two".to_vec()));
        assert_eq!(first, second);
        assert_eq!(registry.read(&second).unwrap().as_bytes(), b"one");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_revokes_handle() {
        let registry = MediaRegistry::new();
        let (album, item) = ids();

        let handle = registry.register(&album, &item, SensitiveBytes::new(b"beach".to_vec()));
        let data = registry.read(&handle).unwrap();

        assert!(registry.release(&handle));
        assert!(!registry.release(&handle));
        assert!(matches!(registry.read(&handle), Err(Error::NotFound(_))));
        assert!(registry.lookup(&album, &item).is_none());
        // Readers holding the bytes keep them until they drop
        assert_eq!(data.as_bytes(), b"beach");
    }

    #[test]
    fn test_stale_handle_cannot_read_new_registration() {
        let registry = MediaRegistry::new();
        let (album, item) = ids();

        let old = registry.register(&album, &item, SensitiveBytes::new(b"old".to_vec()));
        registry.release(&old);
        let new = registry.register(&album, &item, SensitiveBytes::new(b"new".to_vec()));

        assert_ne!(old, new);
        assert!(registry.read(&old).is_err());
        assert!(!registry.release(&old));
        assert_eq!(registry.read(&new).unwrap().as_bytes(), b"new");
    }

    #[test]
    fn test_release_all() {
        let registry = MediaRegistry::new();
        let (album, item) = ids();
        registry.register(&album, &item, SensitiveBytes::new(b"beach".to_vec()));
        registry.release_all();
        assert!(registry.is_empty());
    }
}
