//! Filesystem snapshot adapter for hivestore
//!
//! Stores one JSON file per storage key under a base directory. Writes go
//! to a temp file first and are renamed into place, so a crash mid-write
//! never leaves a truncated snapshot behind and a retried save is
//! idempotent.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use hivestore_core::{Result, SnapshotEnvelope, StorageAdapter, StoreError};

/// JSON-file storage adapter rooted at one directory.
#[derive(Debug, Clone)]
pub struct FileAdapter {
    dir: PathBuf,
}

impl FileAdapter {
    /// Open (creating if needed) the base directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(storage_error)?;
        Ok(FileAdapter { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(key)))
    }
}

/// Storage keys contain `:` separators; keep filenames portable.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn storage_error(err: io::Error) -> StoreError {
    StoreError::Storage(err.to_string())
}

#[async_trait]
impl StorageAdapter for FileAdapter {
    async fn save(&self, key: &str, envelope: &SnapshotEnvelope) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        let bytes =
            serde_json::to_vec_pretty(envelope).map_err(|e| StoreError::Storage(e.to_string()))?;
        tokio::fs::write(&tmp, &bytes).await.map_err(storage_error)?;
        tokio::fs::rename(&tmp, &path).await.map_err(storage_error)?;
        debug!(key, path = %path.display(), bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<SnapshotEnvelope>> {
        let path = self.path_for(key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(storage_error(err)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| StoreError::Storage(e.to_string()))
    }
}
