//! Backup Store
//!
//! Holds one opaque blob at a fixed path. Writes go to a sibling temp file
//! that is renamed over the target, so readers see either the previous blob
//! or the new one, never a partial write.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::Result;

/// Single-file blob store
#[derive(Debug, Clone)]
pub struct BackupStore {
    path: PathBuf,
}

impl BackupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the blob; `None` when no backup has been written yet
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the blob atomically
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
        }

        // data must be durable before the rename makes it visible
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Backup written");
        Ok(())
    }
}
