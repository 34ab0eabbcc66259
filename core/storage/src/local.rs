//! Local filesystem key-value store.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::debug;
use uuid::Uuid;

use crate::provider::LocalStore;
use snapvault_common::{Error, Result};

const ENTRY_EXTENSION: &str = "json";

/// [`LocalStore`] keeping one file per entry in a directory.
///
/// The directory is created on first use. Writes go to a temporary file that
/// is then moved into place, so a reader never sees a partial entry.
pub struct FileStore {
    root: PathBuf,
    opened: OnceCell<()>,
}

impl FileStore {
    /// Create a store rooted at `root`.
    ///
    /// Nothing touches the filesystem until the first operation.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            opened: OnceCell::new(),
        }
    }

    /// Directory holding the entries.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory once. Concurrent callers wait for the same
    /// initialization; a failed attempt is retried by the next caller.
    async fn open(&self) -> Result<()> {
        self.opened
            .get_or_try_init(|| async {
                fs::create_dir_all(&self.root).await?;
                debug!(root = %self.root.display(), "Opened local store");
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// Map a key to a file name. Keys are hex-encoded so any string is safe.
    fn entry_path(&self, key: &str) -> PathBuf {
        let encoded: String = key.bytes().map(|b| format!("{:02x}", b)).collect();
        self.root.join(format!("{}.{}", encoded, ENTRY_EXTENSION))
    }

    async fn write_temp(&self, value: &str) -> Result<PathBuf> {
        let temp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp, value.as_bytes()).await?;
        Ok(temp)
    }
}

#[async_trait]
impl LocalStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.open().await?;
        match fs::read_to_string(self.entry_path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.open().await?;
        let temp = self.write_temp(&value).await?;
        if let Err(e) = fs::rename(&temp, self.entry_path(key)).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: String) -> Result<bool> {
        self.open().await?;
        let temp = self.write_temp(&value).await?;

        // Linking fails if the destination exists, which makes the check and
        // the write a single filesystem operation.
        let linked = fs::hard_link(&temp, self.entry_path(key)).await;
        let _ = fs::remove_file(&temp).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.open().await?;
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        self.open().await?;
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION) {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}
