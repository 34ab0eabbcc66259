//! Upload queue with retry.
//!
//! Each queued item runs on its own task. Transport failures re-run the item
//! from `Pending` with exponential backoff; every other failure is final.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::PipelineContext;
use crate::retry::RetryExecutor;
use crate::state::{ErrorKind, PipelineError, Stage, UploadState};
use crate::upload::{upload_updates, UploadRequest};
use snapvault_common::{CollectionId, ItemId};
use snapvault_storage::ItemRecord;

const BROADCAST_CAPACITY: usize = 256;

/// Latest known state of a queued item.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub collection_id: CollectionId,
    pub state: UploadState,
    /// Attempts started so far.
    pub attempts: u32,
}

/// A state change of one queued item.
#[derive(Debug, Clone)]
pub struct QueueUpdate {
    pub collection_id: CollectionId,
    pub item_id: ItemId,
    /// Zero-based attempt the state belongs to.
    pub attempt: u32,
    pub state: UploadState,
}

type Entries = Arc<RwLock<HashMap<(CollectionId, ItemId), QueueEntry>>>;

/// Queue of uploads, deduplicated by item within its collection.
pub struct UploadQueue {
    ctx: PipelineContext,
    entries: Entries,
    updates: broadcast::Sender<QueueUpdate>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UploadQueue {
    pub fn new(ctx: PipelineContext) -> Self {
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            ctx,
            entries: Arc::new(RwLock::new(HashMap::new())),
            updates,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Receive every state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueUpdate> {
        self.updates.subscribe()
    }

    /// Queue an upload.
    ///
    /// Returns `false` if the item is already queued, uploading or uploaded.
    /// An item whose last run failed may be queued again.
    pub async fn enqueue(&self, request: UploadRequest) -> bool {
        {
            let mut entries = self.entries.write().await;
            let key = (request.collection_id.clone(), request.item_id.clone());
            if let Some(existing) = entries.get(&key) {
                if !matches!(existing.state, UploadState::Error(_)) {
                    debug!(
                        collection = %request.collection_id,
                        item = %request.item_id,
                        "Upload already queued"
                    );
                    return false;
                }
            }
            entries.insert(
                key,
                QueueEntry {
                    collection_id: request.collection_id.clone(),
                    state: UploadState::Pending,
                    attempts: 0,
                },
            );
        }

        let handle = tokio::spawn(run_item(
            self.ctx.clone(),
            request,
            self.entries.clone(),
            self.updates.clone(),
        ));
        self.tasks.lock().unwrap().push(handle);
        true
    }

    /// Latest state of an item.
    pub async fn status(
        &self,
        collection_id: &CollectionId,
        item_id: &ItemId,
    ) -> Option<UploadState> {
        self.entries
            .read()
            .await
            .get(&(collection_id.clone(), item_id.clone()))
            .map(|entry| entry.state.clone())
    }

    /// Snapshot of every tracked item.
    pub async fn entries(&self) -> Vec<(ItemId, QueueEntry)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|((_, item_id), entry)| (item_id.clone(), entry.clone()))
            .collect()
    }

    /// Stop tracking finished uploads. Returns how many were removed.
    pub async fn remove_finished(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !matches!(entry.state, UploadState::Done(_)));
        before - entries.len()
    }

    /// Wait until every queued upload has finished.
    pub async fn drain(&self) {
        loop {
            let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("Upload task ended abnormally: {}", e);
                }
            }
        }
    }
}

impl Drop for UploadQueue {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn run_item(
    ctx: PipelineContext,
    request: UploadRequest,
    entries: Entries,
    updates: broadcast::Sender<QueueUpdate>,
) {
    let executor = RetryExecutor::new(ctx.config.retry.clone());
    let item_id = request.item_id.clone();

    let result = executor
        .execute(|attempt| {
            let ctx = ctx.clone();
            let request = request.clone();
            let entries = entries.clone();
            let updates = updates.clone();
            async move { run_attempt(ctx, request, attempt, entries, updates).await }
        })
        .await;

    match result {
        Ok(record) => info!(item = %item_id, bytes = record.ciphertext_len, "Queued upload finished"),
        Err(err) => warn!(item = %item_id, error = %err, "Queued upload gave up"),
    }
}

async fn run_attempt(
    ctx: PipelineContext,
    request: UploadRequest,
    attempt: u32,
    entries: Entries,
    updates: broadcast::Sender<QueueUpdate>,
) -> std::result::Result<ItemRecord, PipelineError> {
    let key = (request.collection_id.clone(), request.item_id.clone());
    let mut stream = std::pin::pin!(upload_updates(ctx, request));
    let mut outcome = None;

    while let Some(state) = stream.next().await {
        if let Some(entry) = entries.write().await.get_mut(&key) {
            entry.state = state.clone();
            entry.attempts = attempt + 1;
        }
        // No subscribers is fine
        let _ = updates.send(QueueUpdate {
            collection_id: key.0.clone(),
            item_id: key.1.clone(),
            attempt,
            state: state.clone(),
        });

        match state {
            UploadState::Done(record) => outcome = Some(Ok(record)),
            UploadState::Error(err) => outcome = Some(Err(err)),
            _ => {}
        }
    }

    outcome.unwrap_or_else(|| {
        Err(PipelineError::new(
            Stage::Preparing,
            ErrorKind::InvalidInput,
            "Upload ended without a result",
        ))
    })
}
