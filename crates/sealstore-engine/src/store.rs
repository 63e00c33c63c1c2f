//! Local on-disk chunk store and sidecar records
//!
//! A blob lives in two files under the store root:
//!
//! - `{id}.blob` — the envelope stream, appended sequentially by exactly one
//!   writer and never mutated afterwards
//! - `{id}.meta` — the JSON sidecar, written atomically (temp + rename) only
//!   after the stream is complete
//!
//! Sidecar-last ordering is the crash-consistency rule: a blob with a sidecar
//! is complete; a blob without one is incomplete or legacy and must be
//! recounted. New streams are staged under a temp name and renamed into
//! place, so a half-written stream is never visible under the blob's name.
//!
//! Blob ids are reduced to their final path component before any path is
//! derived, so an id can never address files outside the store root.

use crate::error::{EngineError, Result};
use dashmap::DashMap;
use sealstore_crypto::KeyVersion;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// File suffix for chunk streams
pub const BLOB_SUFFIX: &str = ".blob";

/// File suffix for sidecars
pub const SIDECAR_SUFFIX: &str = ".meta";

/// Per-blob metadata, written after the last chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidecar {
    /// Total plaintext size in bytes
    pub plaintext_size: u64,
    /// Plaintext size of every chunk except possibly the last
    pub chunk_size: u32,
    /// Key version the blob was encrypted under
    pub key_version: KeyVersion,
}

/// Releases the per-blob writer slot on drop
pub struct WriterGuard {
    id: String,
    registry: Arc<DashMap<String, ()>>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Directory-backed blob store
pub struct LocalBlobStore {
    root: PathBuf,
    writers: Arc<DashMap<String, ()>>,
}

impl LocalBlobStore {
    /// Create a store rooted at `root` (created lazily on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writers: Arc::new(DashMap::new()),
        }
    }

    /// The store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sanitized(&self, blob_id: &str) -> String {
        Path::new(blob_id)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "_".to_string())
    }

    fn blob_path(&self, blob_id: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", self.sanitized(blob_id), BLOB_SUFFIX))
    }

    fn sidecar_path(&self, blob_id: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", self.sanitized(blob_id), SIDECAR_SUFFIX))
    }

    /// Claim the single writer slot for `blob_id`
    pub fn acquire_writer(&self, blob_id: &str) -> Result<WriterGuard> {
        let id = self.sanitized(blob_id);
        match self.writers.entry(id.clone()) {
            dashmap::Entry::Occupied(_) => Err(EngineError::WriteConflict(blob_id.to_string())),
            dashmap::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(WriterGuard {
                    id,
                    registry: Arc::clone(&self.writers),
                })
            }
        }
    }

    /// Create the store root if missing
    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// True when a chunk stream exists for `blob_id`
    pub async fn exists(&self, blob_id: &str) -> Result<bool> {
        Ok(fs::try_exists(self.blob_path(blob_id)).await?)
    }

    /// Open the chunk stream for reading
    pub async fn open_stream(&self, blob_id: &str) -> Result<fs::File> {
        match fs::File::open(self.blob_path(blob_id)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::BlobNotFound(blob_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stage a new chunk stream under a temp name; `suffix` distinguishes
    /// writers (`.tmp`) from the rotation sweep (`.rewrap`)
    pub(crate) async fn create_staged_stream(
        &self,
        blob_id: &str,
        suffix: &str,
    ) -> Result<(fs::File, PathBuf)> {
        let mut path = self.blob_path(blob_id).into_os_string();
        path.push(suffix);
        let path = PathBuf::from(path);
        let file = fs::File::create(&path).await?;
        Ok((file, path))
    }

    /// Atomically move a staged stream into place under the blob's name
    pub(crate) async fn publish_stream(&self, blob_id: &str, staged: &Path) -> Result<()> {
        fs::rename(staged, self.blob_path(blob_id)).await?;
        Ok(())
    }

    /// Remove a staged stream after a failed write, best-effort
    pub(crate) async fn discard_staged(&self, staged: &Path) {
        if let Err(e) = fs::remove_file(staged).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %staged.display(), error = %e, "staged stream not removed");
            }
        }
    }

    /// Read the sidecar. `None` when absent — or unparseable, which is
    /// treated as absent so the recount safety net can take over.
    pub async fn read_sidecar(&self, blob_id: &str) -> Result<Option<Sidecar>> {
        match fs::read(self.sidecar_path(blob_id)).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(sidecar) => Ok(Some(sidecar)),
                Err(e) => {
                    tracing::warn!(blob_id, error = %e, "unreadable sidecar; will recount");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the sidecar atomically (temp file, fsync, rename)
    pub async fn write_sidecar(&self, blob_id: &str, sidecar: &Sidecar) -> Result<()> {
        let bytes =
            serde_json::to_vec(sidecar).map_err(|e| EngineError::Sidecar(e.to_string()))?;
        let target = self.sidecar_path(blob_id);
        let mut staged = target.clone().into_os_string();
        staged.push(".tmp");
        let staged = PathBuf::from(staged);

        let mut file = fs::File::create(&staged).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staged, &target).await?;
        Ok(())
    }

    /// Delete a blob (stream + sidecar) as a unit
    pub async fn delete(&self, blob_id: &str) -> Result<()> {
        match fs::remove_file(self.blob_path(blob_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::BlobNotFound(blob_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.sidecar_path(blob_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List blob ids with a published chunk stream, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(BLOB_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
