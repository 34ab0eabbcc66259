//! Pipeline progress states and errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::media::MediaHandle;
use crate::retry::Retryable;
use snapvault_common::Error;
use snapvault_storage::ItemRecord;

/// Step of a pipeline at which work happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Preparing,
    Encrypting,
    PreparingUpload,
    Uploading,
    Storing,
    PreparingDownload,
    Downloading,
    Decrypting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preparing => "preparing",
            Stage::Encrypting => "encrypting",
            Stage::PreparingUpload => "preparing upload",
            Stage::Uploading => "uploading",
            Stage::Storing => "storing",
            Stage::PreparingDownload => "preparing download",
            Stage::Downloading => "downloading",
            Stage::Decrypting => "decrypting",
        };
        f.write_str(name)
    }
}

/// Category of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No usable key, or the server refused access.
    Permission,
    /// The request itself is malformed, too large, or refers to nothing.
    InvalidInput,
    /// Encryption or decryption failed.
    Primitive,
    /// A transfer or storage leg failed; re-running may succeed.
    Transport,
}

/// Failure reported as the terminal state of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} failed: {message}")]
pub struct PipelineError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    pub fn permission(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, ErrorKind::Permission, message)
    }

    pub fn invalid_input(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, ErrorKind::InvalidInput, message)
    }

    /// Classify an error raised while running `stage`.
    pub fn from_error(stage: Stage, err: Error) -> Self {
        let kind = match &err {
            Error::WrongPassword | Error::KeyNotFound(_) | Error::NotPermitted(_) => {
                ErrorKind::Permission
            }
            Error::InvalidInput(_)
            | Error::NotFound(_)
            | Error::AlreadyExists(_)
            | Error::Serialization(_) => ErrorKind::InvalidInput,
            Error::Primitive(_) => ErrorKind::Primitive,
            Error::Transport(_) | Error::Io(_) | Error::Storage(_) => ErrorKind::Transport,
        };
        Self::new(stage, kind, err.to_string())
    }

    /// Whether re-running the pipeline may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transport
    }
}

impl Retryable for PipelineError {
    fn is_retryable(&self) -> bool {
        PipelineError::is_retryable(self)
    }
}

/// Progress of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    Preparing,
    Encrypting,
    PreparingUpload,
    Uploading,
    Storing,
    Done(ItemRecord),
    Error(PipelineError),
}

impl UploadState {
    /// Whether no further updates follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Done(_) | UploadState::Error(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::Preparing => "preparing",
            UploadState::Encrypting => "encrypting",
            UploadState::PreparingUpload => "preparing upload",
            UploadState::Uploading => "uploading",
            UploadState::Storing => "storing",
            UploadState::Done(_) => "done",
            UploadState::Error(_) => "error",
        }
    }
}

/// Progress of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Preparing,
    PreparingDownload,
    Downloading,
    Decrypting,
    Done(MediaHandle),
    Error(PipelineError),
}

impl DownloadState {
    /// Whether no further updates follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Done(_) | DownloadState::Error(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            DownloadState::Preparing => "preparing",
            DownloadState::PreparingDownload => "preparing download",
            DownloadState::Downloading => "downloading",
            DownloadState::Decrypting => "decrypting",
            DownloadState::Done(_) => "done",
            DownloadState::Error(_) => "error",
        }
    }
}
