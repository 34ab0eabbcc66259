//! End-to-end flow across keyring, storage and pipelines.

use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::context::PipelineContext;
use crate::download::DownloadRequest;
use crate::queue::UploadQueue;
use crate::source::KeySource;
use crate::state::{DownloadState, ErrorKind, Stage, UploadState};
use crate::task::{spawn_download, spawn_upload};
use crate::testing::fast_config;
use crate::upload::UploadRequest;
use snapvault_common::{CollectionId, ItemId, KeyUsage, ManualClock, Permission, UserId};
use snapvault_crypto::{KdfParams, PrimitiveProvider, StandardProvider};
use snapvault_keyring::{
    DeviceFingerprint, KeyCache, KeyManager, KeyStores, KeyringConfig, SharingService,
};
use snapvault_storage::{MemoryBackend, MemoryStore};

const ALICE_PASSWORD: &str = "Tr0ub4dor&3!";
const BOB_PASSWORD: &str = "Rainy#Hills2";
const PHOTO: &[u8] = b"\x89PNG\r\n\x1a\n sunset over the bay";

struct Device {
    manager: Arc<KeyManager>,
    sharing: SharingService,
    clock: Arc<ManualClock>,
    backend: MemoryBackend,
}

impl Device {
    fn new(user: &str, backend: &MemoryBackend) -> Self {
        let config = KeyringConfig {
            root_kdf: KdfParams::pbkdf2(1_000),
            device_kdf: KdfParams::pbkdf2(1_000),
            ..KeyringConfig::default()
        };
        let provider: Arc<dyn PrimitiveProvider> = Arc::new(StandardProvider::new());
        let user_id = UserId::new(user).unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(KeyCache::new(
            user_id.clone(),
            DeviceFingerprint::new(format!("{}-laptop", user)).unwrap(),
            &config,
            Arc::new(MemoryStore::new()),
            provider.clone(),
            clock.clone(),
        ));
        let manager = Arc::new(KeyManager::new(
            user_id,
            config,
            provider,
            KeyStores {
                accounts: Arc::new(backend.clone()),
                wrapped_keys: Arc::new(backend.clone()),
            },
            cache,
        ));
        let sharing = SharingService::new(
            manager.clone(),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
        );
        Self {
            manager,
            sharing,
            clock,
            backend: backend.clone(),
        }
    }

    fn pipelines(&self, keys: Arc<dyn KeySource>) -> PipelineContext {
        PipelineContext::new(
            self.manager.user_id().clone(),
            keys,
            Arc::new(self.backend.clone()),
            Arc::new(self.backend.clone()),
            self.manager.hierarchy().provider().clone(),
        )
        .with_config(fast_config())
    }

    fn session_pipelines(&self) -> PipelineContext {
        self.pipelines(self.manager.clone())
    }

    fn cache_pipelines(&self) -> PipelineContext {
        self.pipelines(self.manager.cache().clone())
    }
}

fn vacation() -> CollectionId {
    CollectionId::new("vacation").unwrap()
}

fn p(id: &str) -> ItemId {
    ItemId::new(id).unwrap()
}

async fn download(ctx: &PipelineContext, item: &str) -> DownloadState {
    spawn_download(ctx.clone(), DownloadRequest::new(vacation(), p(item)))
        .finish()
        .await
        .unwrap()
}

fn plaintext(ctx: &PipelineContext, state: &DownloadState) -> Vec<u8> {
    let DownloadState::Done(handle) = state else {
        panic!("download failed: {:?}", state);
    };
    let bytes = ctx.media.read(handle).unwrap().as_bytes().to_vec();
    ctx.media.release(handle);
    bytes
}

#[tokio::test]
async fn test_share_read_only_album_and_revoke() {
    let backend = MemoryBackend::new();
    let alice = Device::new("alice", &backend);
    let bob = Device::new("bob", &backend);

    alice.manager.initialize_account(ALICE_PASSWORD).await.unwrap();
    bob.manager.initialize_account(BOB_PASSWORD).await.unwrap();
    alice.manager.create_collection(&vacation()).await.unwrap();

    // Alice uploads p1
    let uploaded = spawn_upload(
        alice.session_pipelines(),
        UploadRequest::new(vacation(), p("p1"), PHOTO),
    )
    .finish()
    .await;
    assert!(matches!(uploaded, Some(UploadState::Done(_))));

    // Alice grants bob read-only access; bob accepts from a locked session
    alice
        .sharing
        .grant_access(&vacation(), "bob", Permission::ReadOnly)
        .await
        .unwrap();
    bob.manager.lock();
    let grant = bob.sharing.pending_grants().await.unwrap().remove(0);
    let key = bob.sharing.accept_grant(&grant.id, BOB_PASSWORD).await.unwrap();
    assert!(!key.allows(KeyUsage::Encrypt));
    assert_eq!(
        backend.permission_of(&vacation(), bob.manager.user_id()),
        Some(Permission::ReadOnly)
    );

    // Bob decrypts p1 to the original bytes
    let bob_ctx = bob.session_pipelines();
    assert_eq!(plaintext(&bob_ctx, &download(&bob_ctx, "p1").await), PHOTO);

    // Bob cannot upload with a read-only key
    let refused = spawn_upload(bob_ctx.clone(), UploadRequest::new(vacation(), p("p2"), PHOTO))
        .finish()
        .await;
    let Some(UploadState::Error(err)) = refused else {
        panic!("read-only upload should fail");
    };
    assert_eq!(err.kind, ErrorKind::Permission);
    assert_eq!(err.stage, Stage::Preparing);

    // Alice revokes bob on the server
    backend.revoke_access(&vacation(), bob.manager.user_id()).unwrap();

    // The server refuses him, but his cached key stays usable until it expires
    let refused = download(&bob_ctx, "p1").await;
    assert!(matches!(refused, DownloadState::Error(ref e) if e.kind == ErrorKind::Permission));
    bob.manager.lock();
    let cached = bob.manager.cache().collection_key(&vacation()).await.unwrap();
    assert_eq!(cached, Some(key));

    bob.clock.advance(Duration::days(14));
    let expired = bob.manager.cache().collection_key(&vacation()).await.unwrap();
    assert!(expired.is_none());
}

#[tokio::test]
async fn test_cache_only_pipelines_after_restart() {
    let backend = MemoryBackend::new();
    let alice = Device::new("alice", &backend);
    alice.manager.initialize_account(ALICE_PASSWORD).await.unwrap();
    alice.manager.create_collection(&vacation()).await.unwrap();

    // A locked session still uploads with keys cached on the device
    alice.manager.lock();
    let ctx = alice.cache_pipelines();
    let uploaded = spawn_upload(ctx.clone(), UploadRequest::new(vacation(), p("p1"), PHOTO))
        .finish()
        .await;
    assert!(matches!(uploaded, Some(UploadState::Done(_))));
    assert_eq!(plaintext(&ctx, &download(&ctx, "p1").await), PHOTO);

    // Signing out wipes the cache, so nothing can be decrypted
    alice.manager.sign_out().await.unwrap();
    let state = download(&ctx, "p1").await;
    assert!(matches!(state, DownloadState::Error(ref e) if e.kind == ErrorKind::Permission));
}

#[tokio::test]
async fn test_queue_survives_flaky_transport() {
    let backend = MemoryBackend::new();
    let alice = Device::new("alice", &backend);
    alice.manager.initialize_account(ALICE_PASSWORD).await.unwrap();
    alice.manager.create_collection(&vacation()).await.unwrap();

    let queue = UploadQueue::new(alice.session_pipelines());
    backend.inject_transport_failures(2);
    for id in ["p1", "p2", "p3"] {
        assert!(queue.enqueue(UploadRequest::new(vacation(), p(id), PHOTO)).await);
    }
    queue.drain().await;

    for (_, entry) in queue.entries().await {
        assert!(matches!(entry.state, UploadState::Done(_)));
    }

    let ctx = alice.session_pipelines();
    for id in ["p1", "p2", "p3"] {
        assert_eq!(plaintext(&ctx, &download(&ctx, id).await), PHOTO);
    }
}
