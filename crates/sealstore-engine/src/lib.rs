//! # Sealstore Engine
//!
//! Chunked authenticated-encryption blob engine for the Sealstore system.
//!
//! This crate provides:
//! - **Blob writes**: split a byte source into fixed-size chunks, encrypt
//!   each independently, append envelopes sequentially
//! - **Ranged reads**: map a plaintext byte range onto chunk indices and
//!   stream the decrypted slice with O(chunk_size) memory
//! - **Key providers**: pluggable, rotatable sources of versioned key material
//! - **Rotation**: re-wrap the blob population under a new key without
//!   blocking readers
//! - **Audit sinks**: best-effort chunk-traffic notifications
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Application Layer            │
//! ├────────────────────┬────────────────────┤
//! │     BlobEngine     │ RotationCoordinator│
//! ├──────────┬─────────┴─────────┬──────────┤
//! │  writer  │ reader / planner  │ provider │
//! ├──────────┴───────────────────┴──────────┤
//! │     LocalBlobStore (.blob + .meta)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sealstore_engine::{BlobEngine, ByteRange, StaticKeyProvider};
//! use sealstore_crypto::KeyMaterial;
//!
//! let provider = StaticKeyProvider::new(KeyMaterial::generate());
//! let engine = BlobEngine::new("/var/lib/sealstore", provider);
//!
//! engine.write("report", &b"payload"[..]).await?;
//! let handle = engine.open("report").await?;
//! let tail = handle.read_range(ByteRange::from(5)).await?;
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod provider;
pub mod reader;
pub mod rotation;
pub mod store;

mod writer;

pub use audit::{AuditSink, NoopAuditSink, TracingAuditSink};
pub use config::{EngineConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use error::{EngineError, Result};
pub use provider::{CachedKeyProvider, EnvKeyProvider, KeyProvider, StaticKeyProvider};
pub use reader::{BlobHandle, BlobStream, ByteRange};
pub use rotation::{RotationCoordinator, RotationReport, RotationState};
pub use store::{LocalBlobStore, Sidecar};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// The blob engine: one store, one key provider, one audit sink
///
/// Cheap to clone; clones share the store, provider, and audit sink. All
/// writes go through [`BlobEngine::write`] (single writer per blob id), all
/// reads through [`BlobEngine::open`].
#[derive(Clone)]
pub struct BlobEngine {
    pub(crate) store: Arc<LocalBlobStore>,
    pub(crate) provider: Arc<dyn KeyProvider>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) config: EngineConfig,
}

impl BlobEngine {
    /// Create an engine over a directory store with the default configuration
    pub fn new(root: impl Into<PathBuf>, provider: impl KeyProvider + 'static) -> Self {
        Self::with_config(root, provider, EngineConfig::default())
    }

    /// Create an engine with an explicit configuration
    pub fn with_config(
        root: impl Into<PathBuf>,
        provider: impl KeyProvider + 'static,
        config: EngineConfig,
    ) -> Self {
        Self {
            store: Arc::new(LocalBlobStore::new(root)),
            provider: Arc::new(provider),
            audit: Arc::new(NoopAuditSink),
            config,
        }
    }

    /// Replace the audit sink
    pub fn with_audit(mut self, audit: impl AuditSink + 'static) -> Self {
        self.audit = Arc::new(audit);
        self
    }

    /// The engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying blob store
    pub fn store(&self) -> &LocalBlobStore {
        &self.store
    }

    /// The key provider
    pub fn provider(&self) -> &dyn KeyProvider {
        self.provider.as_ref()
    }

    /// Write a blob from an async byte source using the configured chunk size
    ///
    /// Chunks are written strictly sequentially and the sidecar is the last
    /// observable effect. Fails with [`EngineError::WriteConflict`] when
    /// another writer already holds `blob_id`.
    pub async fn write<R: AsyncRead + Unpin>(&self, blob_id: &str, source: R) -> Result<Sidecar> {
        writer::write_blob(self, blob_id, source, self.config.chunk_size).await
    }

    /// Write a blob with an explicit chunk size
    pub async fn write_with_chunk_size<R: AsyncRead + Unpin>(
        &self,
        blob_id: &str,
        source: R,
        chunk_size: u32,
    ) -> Result<Sidecar> {
        writer::write_blob(self, blob_id, source, chunk_size).await
    }

    /// Open a blob for reading
    ///
    /// Resolves the sidecar when present; a sidecar-less blob triggers the
    /// O(N) decrypt-and-count recovery pass (see [`BlobHandle::recovered`]).
    pub async fn open(&self, blob_id: &str) -> Result<BlobHandle> {
        reader::open_blob(self, blob_id).await
    }

    /// True when a chunk stream exists for `blob_id`
    pub async fn exists(&self, blob_id: &str) -> Result<bool> {
        self.store.exists(blob_id).await
    }

    /// Delete a blob (chunk stream and sidecar) as a unit
    pub async fn delete(&self, blob_id: &str) -> Result<()> {
        self.store.delete(blob_id).await
    }

    /// List stored blob ids
    pub async fn list(&self) -> Result<Vec<String>> {
        self.store.list().await
    }

    /// Create a rotation coordinator over this engine
    pub fn rotation(&self) -> RotationCoordinator {
        RotationCoordinator::new(self.clone())
    }
}
