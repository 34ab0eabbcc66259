//! Shared fixtures for pipeline tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::retry::RetryConfig;
use crate::source::KeySource;
use snapvault_common::{CollectionId, ItemId, KeyUsages, Permission, Result, UserId};
use snapvault_crypto::{CollectionKey, Sealed, StandardProvider, KEY_LENGTH};
use snapvault_storage::{GrantAcceptance, GrantRequest, GrantStore, MemoryBackend, WrappedKeyStore};

/// Key source backed by a plain map.
#[derive(Default)]
pub(crate) struct StaticKeys(RwLock<HashMap<CollectionId, CollectionKey>>);

impl StaticKeys {
    pub(crate) fn with(collection_id: &CollectionId, key: CollectionKey) -> Self {
        let keys = Self::default();
        keys.0.write().unwrap().insert(collection_id.clone(), key);
        keys
    }

    pub(crate) fn and(self, collection_id: &CollectionId, key: CollectionKey) -> Self {
        self.0.write().unwrap().insert(collection_id.clone(), key);
        self
    }
}

#[async_trait]
impl KeySource for StaticKeys {
    async fn collection_key(&self, collection_id: &CollectionId) -> Result<Option<CollectionKey>> {
        Ok(self.0.read().unwrap().get(collection_id).cloned())
    }
}

pub(crate) fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

pub(crate) fn album() -> CollectionId {
    CollectionId::new("vacation").unwrap()
}

pub(crate) fn item(id: &str) -> ItemId {
    ItemId::new(id).unwrap()
}

pub(crate) fn content_key() -> CollectionKey {
    CollectionKey::from_bytes([7u8; KEY_LENGTH], KeyUsages::CONTENT)
}

pub(crate) fn fast_config() -> PipelineConfig {
    PipelineConfig::default().with_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false),
    )
}

pub(crate) fn context(
    backend: &MemoryBackend,
    user_id: &str,
    keys: impl KeySource + 'static,
) -> PipelineContext {
    PipelineContext::new(
        user(user_id),
        Arc::new(keys),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(StandardProvider::new()),
    )
    .with_config(fast_config())
}

/// Make alice the owner of `collection_id`.
pub(crate) async fn own_collection(backend: &MemoryBackend, collection_id: &CollectionId) {
    backend
        .put_wrapped_collection_key(
            collection_id,
            &user("alice"),
            Sealed::new(vec![0; 24], vec![0; 48]),
        )
        .await
        .unwrap();
}

/// A backend where alice owns "vacation", plus her pipeline context.
pub(crate) async fn owner_fixture() -> (MemoryBackend, PipelineContext) {
    let backend = MemoryBackend::new();
    own_collection(&backend, &album()).await;
    let ctx = context(&backend, "alice", StaticKeys::with(&album(), content_key()));
    (backend, ctx)
}

/// Make `grantee` a member of "vacation" without running the key exchange.
pub(crate) async fn add_member(backend: &MemoryBackend, grantee: &str, permission: Permission) {
    let grant = backend
        .create_grant(GrantRequest {
            collection_id: album(),
            granter: user("alice"),
            grantee: user(grantee),
            sealed_key: vec![1; 80],
            permission,
        })
        .await
        .unwrap();
    backend
        .accept_grant(GrantAcceptance {
            grant_id: grant.id,
            grantee: user(grantee),
            collection_id: album(),
            permission,
            wrapped_key: Sealed::new(vec![2; 24], vec![2; 48]),
        })
        .await
        .unwrap();
}
