//! One tokio task per pipeline item.

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::PipelineContext;
use crate::download::{download_updates, DownloadRequest};
use crate::state::{DownloadState, UploadState};
use crate::upload::{upload_updates, UploadRequest};

/// A running pipeline and the channel its updates arrive on.
///
/// Dropping the task (or just its receiver) cancels the pipeline at its next
/// suspension point.
pub struct PipelineTask<S> {
    updates: mpsc::Receiver<S>,
    handle: JoinHandle<()>,
}

impl<S> PipelineTask<S> {
    /// Next update, or `None` once the pipeline has finished.
    pub async fn recv(&mut self) -> Option<S> {
        self.updates.recv().await
    }

    /// Wait for the pipeline to finish and return its last update.
    pub async fn finish(mut self) -> Option<S> {
        let mut last = None;
        while let Some(update) = self.updates.recv().await {
            last = Some(update);
        }
        last
    }

    /// Stop the pipeline immediately.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Whether the pipeline task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn spawn_stream<S>(
    updates: impl Stream<Item = S> + Send + 'static,
    capacity: usize,
) -> PipelineTask<S>
where
    S: Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::spawn(async move {
        let forward = async {
            let mut updates = std::pin::pin!(updates);
            while let Some(update) = updates.next().await {
                if tx.send(update).await.is_err() {
                    break;
                }
            }
        };

        tokio::select! {
            _ = forward => {}
            _ = tx.closed() => {
                debug!("Pipeline receiver dropped, cancelling");
            }
        }
    });

    PipelineTask {
        updates: rx,
        handle,
    }
}

/// Run an upload on its own task.
pub fn spawn_upload(ctx: PipelineContext, request: UploadRequest) -> PipelineTask<UploadState> {
    let capacity = ctx.config.channel_capacity;
    spawn_stream(upload_updates(ctx, request), capacity)
}

/// Run a download on its own task.
pub fn spawn_download(
    ctx: PipelineContext,
    request: DownloadRequest,
) -> PipelineTask<DownloadState> {
    let capacity = ctx.config.channel_capacity;
    spawn_stream(download_updates(ctx, request), capacity)
}
