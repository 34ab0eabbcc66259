//! Media pipelines for SnapVault.
//!
//! This module provides:
//! - Encrypt-then-upload and download-then-decrypt state machines as lazy streams
//! - One tokio task per item, cancelled by dropping its update channel
//! - A deduplicating upload queue that retries transport failures
//! - A registry of decrypted media behind revocable handles
//!
//! Pipelines only consume collection keys through [`KeySource`]; they never
//! see a password or a root secret.

pub mod config;
pub mod context;
pub mod download;
pub mod media;
pub mod queue;
pub mod retry;
pub mod source;
pub mod state;
pub mod task;
pub mod upload;

#[cfg(test)]
mod scenario;
#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use context::PipelineContext;
pub use download::{download_updates, DownloadRequest};
pub use media::{MediaHandle, MediaRegistry};
pub use queue::{QueueEntry, QueueUpdate, UploadQueue};
pub use retry::{RetryConfig, RetryExecutor, Retryable};
pub use source::KeySource;
pub use state::{DownloadState, ErrorKind, PipelineError, Stage, UploadState};
pub use task::{spawn_download, spawn_upload, PipelineTask};
pub use upload::{upload_updates, UploadRequest};
