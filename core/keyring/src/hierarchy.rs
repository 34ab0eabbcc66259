//! Key wrapping hierarchy.
//!
//! ```text
//! password ──kdf──> RootSecret ──wraps──> PrivateKey
//!                              └─wraps──> CollectionKey (one per collection)
//! ```
//!
//! Wrapped forms are the only ones that leave this module; raw keys are handed
//! out as zeroizing in-memory handles.

use std::sync::Arc;

use snapvault_common::{CollectionId, Error, KeyUsages, Result};
use snapvault_crypto::{
    CollectionKey, KeyPair, PrimitiveProvider, PrivateKey, PublicKey, RootSecret, Sealed,
    KEY_LENGTH,
};

const PRIVATE_KEY_AAD: &[u8] = b"snapvault-private-key";

fn collection_aad(collection_id: &CollectionId) -> Vec<u8> {
    format!("snapvault-collection:{}", collection_id).into_bytes()
}

/// Creates, wraps and unwraps the keys below a root secret.
#[derive(Clone)]
pub struct KeyHierarchy {
    provider: Arc<dyn PrimitiveProvider>,
}

impl KeyHierarchy {
    pub fn new(provider: Arc<dyn PrimitiveProvider>) -> Self {
        Self { provider }
    }

    /// The primitive provider used by this hierarchy.
    pub fn provider(&self) -> &Arc<dyn PrimitiveProvider> {
        &self.provider
    }

    /// Generate a user's key pair.
    pub fn create_key_pair(&self) -> KeyPair {
        self.provider.generate_keypair()
    }

    /// Wrap a private key under the root secret.
    pub fn wrap_private_key(&self, private: &PrivateKey, root: &RootSecret) -> Result<Sealed> {
        let bytes = private.to_bytes();
        self.provider
            .seal(root.as_bytes(), &bytes[..], PRIVATE_KEY_AAD)
    }

    /// Recover a private key wrapped with [`KeyHierarchy::wrap_private_key`].
    ///
    /// # Errors
    /// - Returns `Primitive` if the root secret is wrong or the wrapped key is damaged
    pub fn unwrap_private_key(&self, sealed: &Sealed, root: &RootSecret) -> Result<PrivateKey> {
        let plaintext = self
            .provider
            .open(root.as_bytes(), sealed, PRIVATE_KEY_AAD)?;
        let bytes: [u8; KEY_LENGTH] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| Error::Primitive("Invalid private key length".to_string()))?;
        Ok(PrivateKey::from_bytes(bytes))
    }

    /// Generate a fresh collection key allowing encryption and decryption.
    pub fn create_collection_key(&self) -> CollectionKey {
        let bytes = self.provider.generate_key_bytes();
        CollectionKey::from_bytes(*bytes, KeyUsages::CONTENT)
    }

    /// Wrap a collection key under the root secret.
    ///
    /// The collection id is authenticated, so a wrapped key cannot be
    /// presented as belonging to another collection.
    pub fn wrap_collection_key(
        &self,
        key: &CollectionKey,
        collection_id: &CollectionId,
        root: &RootSecret,
    ) -> Result<Sealed> {
        let payload = key.to_payload();
        self.provider
            .seal(root.as_bytes(), &payload, &collection_aad(collection_id))
    }

    /// Recover a collection key, with the usage set it was wrapped with.
    ///
    /// # Errors
    /// - Returns `Primitive` if the root secret or collection id is wrong
    pub fn unwrap_collection_key(
        &self,
        sealed: &Sealed,
        collection_id: &CollectionId,
        root: &RootSecret,
    ) -> Result<CollectionKey> {
        let payload = self
            .provider
            .open(root.as_bytes(), sealed, &collection_aad(collection_id))?;
        CollectionKey::from_payload(&payload)
    }

    /// Wrap a collection key for another user's public key.
    pub fn seal_for_recipient(&self, key: &CollectionKey, recipient: &PublicKey) -> Result<Vec<u8>> {
        let payload = key.to_payload();
        self.provider.wrap_for(recipient, &payload)
    }

    /// Open a collection key sealed with [`KeyHierarchy::seal_for_recipient`].
    ///
    /// # Errors
    /// - Returns `Primitive` if the key was sealed for someone else or is damaged
    pub fn open_from_granter(&self, sealed: &[u8], private: &PrivateKey) -> Result<CollectionKey> {
        let payload = self.provider.unwrap_with(private, sealed)?;
        CollectionKey::from_payload(&payload)
    }
}
