//! Download-then-decrypt pipeline.
//!
//! ```text
//! Preparing → PreparingDownload → Downloading → Decrypting → Done(MediaHandle)
//! ```
//!
//! An item whose plaintext is still registered finishes straight from
//! `Preparing` with its existing handle.

use bytes::Bytes;
use futures::stream::{self, Stream};
use tracing::{debug, info, warn};

use crate::context::{item_aad, PipelineContext};
use crate::state::{DownloadState, ErrorKind, PipelineError, Stage};
use snapvault_common::{CollectionId, ItemId, KeyUsage, SensitiveBytes};
use snapvault_crypto::{CollectionKey, Sealed};
use snapvault_storage::{ItemRecord, TransferTarget};

/// An item to fetch and decrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub collection_id: CollectionId,
    pub item_id: ItemId,
}

impl DownloadRequest {
    pub fn new(collection_id: CollectionId, item_id: ItemId) -> Self {
        Self {
            collection_id,
            item_id,
        }
    }
}

struct Resolved {
    key: CollectionKey,
    record: ItemRecord,
}

enum Step {
    Begin,
    Prepare,
    RequestSource(Resolved),
    Download(Resolved, TransferTarget),
    Decrypt(Resolved, Bytes),
}

type Advance = std::result::Result<(DownloadState, Option<Step>), PipelineError>;

struct DownloadRun {
    ctx: PipelineContext,
    request: DownloadRequest,
}

impl DownloadRun {
    async fn advance(&self, step: Step) -> Advance {
        match step {
            Step::Begin => Ok((DownloadState::Preparing, Some(Step::Prepare))),
            Step::Prepare => {
                let registered = self
                    .ctx
                    .media
                    .lookup(&self.request.collection_id, &self.request.item_id);
                if let Some(handle) = registered {
                    debug!(url = %handle.url(), "Reusing registered media");
                    return Ok((DownloadState::Done(handle), None));
                }
                let resolved = self.prepare().await?;
                Ok((
                    DownloadState::PreparingDownload,
                    Some(Step::RequestSource(resolved)),
                ))
            }
            Step::RequestSource(resolved) => {
                let target = self
                    .ctx
                    .transfers
                    .request_download_source(
                        &self.ctx.user_id,
                        &self.request.collection_id,
                        &self.request.item_id,
                    )
                    .await
                    .map_err(|e| PipelineError::from_error(Stage::PreparingDownload, e))?;
                Ok((
                    DownloadState::Downloading,
                    Some(Step::Download(resolved, target)),
                ))
            }
            Step::Download(resolved, target) => {
                let ciphertext = self
                    .ctx
                    .transport
                    .get(&target)
                    .await
                    .map_err(|e| PipelineError::from_error(Stage::Downloading, e))?;
                if ciphertext.len() as u64 != resolved.record.ciphertext_len {
                    return Err(PipelineError::new(
                        Stage::Downloading,
                        ErrorKind::Transport,
                        format!(
                            "Downloaded {} bytes, expected {}",
                            ciphertext.len(),
                            resolved.record.ciphertext_len
                        ),
                    ));
                }
                Ok((
                    DownloadState::Decrypting,
                    Some(Step::Decrypt(resolved, ciphertext)),
                ))
            }
            Step::Decrypt(resolved, ciphertext) => {
                let plaintext = self.decrypt(resolved, ciphertext).await?;
                let handle = self.ctx.media.register(
                    &self.request.collection_id,
                    &self.request.item_id,
                    plaintext,
                );
                Ok((DownloadState::Done(handle), None))
            }
        }
    }

    /// Resolve a key that may decrypt, and the item's record.
    async fn prepare(&self) -> std::result::Result<Resolved, PipelineError> {
        let key = self
            .ctx
            .keys
            .collection_key(&self.request.collection_id)
            .await
            .map_err(|e| PipelineError::from_error(Stage::Preparing, e))?;
        let key = match key {
            Some(key) if key.allows(KeyUsage::Decrypt) => key,
            _ => {
                return Err(PipelineError::permission(
                    Stage::Preparing,
                    format!("No key for album: {}", self.request.collection_id),
                ))
            }
        };

        let record = self
            .ctx
            .transfers
            .get_item_record(
                &self.ctx.user_id,
                &self.request.collection_id,
                &self.request.item_id,
            )
            .await
            .map_err(|e| PipelineError::from_error(Stage::Preparing, e))?
            .ok_or_else(|| {
                PipelineError::invalid_input(
                    Stage::Preparing,
                    format!("Photo not found: {}", self.request.item_id),
                )
            })?;

        Ok(Resolved { key, record })
    }

    async fn decrypt(
        &self,
        resolved: Resolved,
        ciphertext: Bytes,
    ) -> std::result::Result<SensitiveBytes, PipelineError> {
        let provider = self.ctx.provider.clone();
        let aad = item_aad(&self.request.collection_id, &self.request.item_id);
        let Resolved { key, record } = resolved;
        let sealed = Sealed::new(record.nonce, ciphertext.to_vec());

        let plaintext = tokio::task::spawn_blocking(move || {
            provider.open(key.as_bytes(), &sealed, &aad)
        })
        .await
        .map_err(|e| {
            PipelineError::new(
                Stage::Decrypting,
                ErrorKind::Primitive,
                format!("Decryption task failed: {}", e),
            )
        })?
        .map_err(|e| PipelineError::from_error(Stage::Decrypting, e))?;

        if plaintext.len() as u64 != record.plaintext_len {
            return Err(PipelineError::new(
                Stage::Decrypting,
                ErrorKind::Primitive,
                "Decrypted length does not match the record",
            ));
        }
        Ok(SensitiveBytes::new(plaintext.to_vec()))
    }
}

/// Lazy stream of download progress, ending in `Done` or `Error`.
///
/// The handle in `Done` must be released through the context's media
/// registry once the caller is finished with the plaintext.
pub fn download_updates(
    ctx: PipelineContext,
    request: DownloadRequest,
) -> impl Stream<Item = DownloadState> + Send + 'static {
    let run = DownloadRun { ctx, request };

    stream::unfold(Some((run, Step::Begin)), |state| async move {
        let (run, step) = state?;
        match run.advance(step).await {
            Ok((update, next)) => {
                debug!(item = %run.request.item_id, state = update.name(), "Download progressed");
                if let DownloadState::Done(handle) = &update {
                    info!(item = %run.request.item_id, url = %handle.url(), "Item decrypted");
                }
                Some((update, next.map(|next| (run, next))))
            }
            Err(err) => {
                warn!(item = %run.request.item_id, error = %err, "Download failed");
                Some((DownloadState::Error(err), None))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_member, album, content_key, context, item, owner_fixture, StaticKeys};
    use crate::upload::{upload_updates, UploadRequest};
    use futures::StreamExt;
    use snapvault_common::{KeyUsages, Permission};
    use snapvault_crypto::KEY_LENGTH;

    async fn upload(ctx: &PipelineContext, id: &str, data: &'static [u8]) {
        let last = upload_updates(ctx.clone(), UploadRequest::new(album(), item(id), data))
            .collect::<Vec<_>>()
            .await
            .pop();
        assert!(matches!(last, Some(crate::state::UploadState::Done(_))));
    }

    async fn download(ctx: &PipelineContext, id: &str) -> Vec<DownloadState> {
        download_updates(ctx.clone(), DownloadRequest::new(album(), item(id)))
            .collect()
            .await
    }

    fn error_of(states: &[DownloadState]) -> &PipelineError {
        match states.last() {
            Some(DownloadState::Error(err)) => err,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_roundtrip() {
        let (_backend, ctx) = owner_fixture().await;
        upload(&ctx, "p1", b"sunset over the bay").await;

        let states = download(&ctx, "p1").await;
        let names: Vec<_> = states.iter().map(DownloadState::name).collect();
        assert_eq!(
            names,
            vec![
                "preparing",
                "preparing download",
                "downloading",
                "decrypting",
                "done"
            ]
        );

        let Some(DownloadState::Done(handle)) = states.last() else {
            panic!("download did not finish");
        };
        let plaintext = ctx.media.read(handle).unwrap();
        assert_eq!(plaintext.as_bytes(), b"sunset over the bay");
        assert!(ctx.media.release(handle));
    }

    #[tokio::test]
    async fn test_repeat_download_reuses_handle() {
        let (backend, ctx) = owner_fixture().await;
        upload(&ctx, "p1", b"beach").await;

        let first = download(&ctx, "p1").await;
        // The second run never reaches the transport
        backend.inject_transport_failures(1);
        let second = download(&ctx, "p1").await;

        assert_eq!(second.len(), 2);
        assert_eq!(first.last(), second.last());
    }

    #[tokio::test]
    async fn test_read_only_key_can_download() {
        let (backend, ctx) = owner_fixture().await;
        upload(&ctx, "p1", b"beach").await;
        add_member(&backend, "bob", Permission::ReadOnly).await;

        let read_only = content_key().restrict(KeyUsages::from_usages(&[KeyUsage::Decrypt]));
        let bob = context(&backend, "bob", StaticKeys::with(&album(), read_only));

        let states = download(&bob, "p1").await;
        assert!(matches!(states.last(), Some(DownloadState::Done(_))));
    }

    #[tokio::test]
    async fn test_missing_key_is_permission_error() {
        let (backend, ctx) = owner_fixture().await;
        upload(&ctx, "p1", b"beach").await;
        let no_keys = context(&backend, "alice", StaticKeys::default());

        let states = download(&no_keys, "p1").await;
        assert_eq!(error_of(&states).kind, ErrorKind::Permission);
    }

    #[tokio::test]
    async fn test_unknown_item() {
        let (_backend, ctx) = owner_fixture().await;
        let states = download(&ctx, "missing").await;

        let err = error_of(&states);
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert_eq!(err.stage, Stage::Preparing);
    }

    #[tokio::test]
    async fn test_non_member_refused() {
        let (backend, ctx) = owner_fixture().await;
        upload(&ctx, "p1", b"beach").await;
        let eve = context(&backend, "eve", StaticKeys::with(&album(), content_key()));

        let states = download(&eve, "p1").await;
        assert_eq!(error_of(&states).kind, ErrorKind::Permission);
    }

    #[tokio::test]
    async fn test_wrong_key_fails_to_decrypt() {
        let (backend, ctx) = owner_fixture().await;
        upload(&ctx, "p1", b"beach").await;

        let wrong = CollectionKey::from_bytes([9u8; KEY_LENGTH], KeyUsages::CONTENT);
        let other = context(&backend, "alice", StaticKeys::with(&album(), wrong));

        let states = download(&other, "p1").await;
        let err = error_of(&states);
        assert_eq!(err.kind, ErrorKind::Primitive);
        assert_eq!(err.stage, Stage::Decrypting);
        assert!(other.media.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_during_download() {
        let (backend, ctx) = owner_fixture().await;
        upload(&ctx, "p1", b"beach").await;
        backend.inject_transport_failures(1);

        let states = download(&ctx, "p1").await;
        let err = error_of(&states);
        assert_eq!(err.stage, Stage::Downloading);
        assert!(err.is_retryable());
    }
}
