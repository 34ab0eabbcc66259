//! Encrypt-then-upload pipeline.
//!
//! ```text
//! Pending → Preparing → Encrypting → PreparingUpload → Uploading → Storing → Done
//!               └──────────────┴──────────────┴────────────┴──────────┴──> Error
//! ```
//!
//! Each update is yielded before the work of that stage runs, so a consumer
//! that stops polling stops the upload at the next stage boundary.

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, Stream};
use tracing::{debug, info, warn};

use crate::context::{item_aad, PipelineContext};
use crate::state::{ErrorKind, PipelineError, Stage, UploadState};
use snapvault_common::{CollectionId, ItemId, KeyUsage};
use snapvault_crypto::{CollectionKey, Sealed};
use snapvault_storage::{ItemRecord, TransferTarget};

const NO_UPLOAD_PERMISSION: &str = "You don't have permission to upload to this album";

/// An item to encrypt and upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub collection_id: CollectionId,
    pub item_id: ItemId,
    pub data: Bytes,
}

impl UploadRequest {
    pub fn new(collection_id: CollectionId, item_id: ItemId, data: impl Into<Bytes>) -> Self {
        Self {
            collection_id,
            item_id,
            data: data.into(),
        }
    }
}

enum Step {
    Begin,
    Queued,
    Prepare,
    Encrypt(CollectionKey),
    RequestTarget(Sealed),
    Upload {
        nonce: Vec<u8>,
        ciphertext: Bytes,
        target: TransferTarget,
    },
    Store {
        nonce: Vec<u8>,
        ciphertext_len: u64,
    },
}

type Advance = std::result::Result<(UploadState, Option<Step>), PipelineError>;

struct UploadRun {
    ctx: PipelineContext,
    request: UploadRequest,
}

impl UploadRun {
    async fn advance(&self, step: Step) -> Advance {
        match step {
            Step::Begin => Ok((UploadState::Pending, Some(Step::Queued))),
            Step::Queued => Ok((UploadState::Preparing, Some(Step::Prepare))),
            Step::Prepare => {
                let key = self.prepare().await?;
                Ok((UploadState::Encrypting, Some(Step::Encrypt(key))))
            }
            Step::Encrypt(key) => {
                let sealed = self.encrypt(key).await?;
                Ok((UploadState::PreparingUpload, Some(Step::RequestTarget(sealed))))
            }
            Step::RequestTarget(sealed) => {
                let target = self
                    .ctx
                    .transfers
                    .request_upload_target(
                        &self.ctx.user_id,
                        &self.request.collection_id,
                        &self.request.item_id,
                        sealed.ciphertext.len() as u64,
                    )
                    .await
                    .map_err(|e| PipelineError::from_error(Stage::PreparingUpload, e))?;
                let next = Step::Upload {
                    nonce: sealed.nonce,
                    ciphertext: Bytes::from(sealed.ciphertext),
                    target,
                };
                Ok((UploadState::Uploading, Some(next)))
            }
            Step::Upload {
                nonce,
                ciphertext,
                target,
            } => {
                let ciphertext_len = ciphertext.len() as u64;
                self.ctx
                    .transport
                    .put(&target, ciphertext)
                    .await
                    .map_err(|e| PipelineError::from_error(Stage::Uploading, e))?;
                Ok((
                    UploadState::Storing,
                    Some(Step::Store {
                        nonce,
                        ciphertext_len,
                    }),
                ))
            }
            Step::Store {
                nonce,
                ciphertext_len,
            } => {
                let record = ItemRecord {
                    item_id: self.request.item_id.clone(),
                    collection_id: self.request.collection_id.clone(),
                    owner: self.ctx.user_id.clone(),
                    nonce,
                    ciphertext_len,
                    plaintext_len: self.request.data.len() as u64,
                    created_at: Utc::now(),
                };
                self.ctx
                    .transfers
                    .store_item_record(&self.ctx.user_id, record.clone())
                    .await
                    .map_err(|e| PipelineError::from_error(Stage::Storing, e))?;
                Ok((UploadState::Done(record), None))
            }
        }
    }

    /// Validate the request, then resolve a key that may encrypt.
    async fn prepare(&self) -> std::result::Result<CollectionKey, PipelineError> {
        let size = self.request.data.len() as u64;
        if size > self.ctx.config.max_item_size {
            return Err(PipelineError::invalid_input(
                Stage::Preparing,
                format!(
                    "File is too large: {} bytes (max {})",
                    size, self.ctx.config.max_item_size
                ),
            ));
        }

        let key = self
            .ctx
            .keys
            .collection_key(&self.request.collection_id)
            .await
            .map_err(|e| PipelineError::from_error(Stage::Preparing, e))?;
        match key {
            Some(key) if key.allows(KeyUsage::Encrypt) => Ok(key),
            _ => Err(PipelineError::permission(
                Stage::Preparing,
                NO_UPLOAD_PERMISSION,
            )),
        }
    }

    async fn encrypt(&self, key: CollectionKey) -> std::result::Result<Sealed, PipelineError> {
        let provider = self.ctx.provider.clone();
        let data = self.request.data.clone();
        let aad = item_aad(&self.request.collection_id, &self.request.item_id);

        tokio::task::spawn_blocking(move || provider.seal(key.as_bytes(), &data, &aad))
            .await
            .map_err(|e| {
                PipelineError::new(
                    Stage::Encrypting,
                    ErrorKind::Primitive,
                    format!("Encryption task failed: {}", e),
                )
            })?
            .map_err(|e| PipelineError::from_error(Stage::Encrypting, e))
    }
}

/// Lazy stream of upload progress, ending in `Done` or `Error`.
///
/// Nothing runs until the stream is polled.
pub fn upload_updates(
    ctx: PipelineContext,
    request: UploadRequest,
) -> impl Stream<Item = UploadState> + Send + 'static {
    let run = UploadRun { ctx, request };

    stream::unfold(Some((run, Step::Begin)), |state| async move {
        let (run, step) = state?;
        match run.advance(step).await {
            Ok((update, next)) => {
                debug!(item = %run.request.item_id, state = update.name(), "Upload progressed");
                if let UploadState::Done(record) = &update {
                    info!(
                        collection = %record.collection_id,
                        item = %record.item_id,
                        bytes = record.plaintext_len,
                        "Item uploaded"
                    );
                }
                Some((update, next.map(|next| (run, next))))
            }
            Err(err) => {
                warn!(item = %run.request.item_id, error = %err, "Upload failed");
                Some((UploadState::Error(err), None))
            }
        }
    })
}
