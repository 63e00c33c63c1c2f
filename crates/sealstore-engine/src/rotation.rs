//! Key rotation coordinator
//!
//! Rotation is a two-phase protocol over the blob population:
//!
//! 1. `rotate(new_key)` promotes the new primary. New writes use it
//!    immediately; existing blobs stay readable through the demoted key.
//! 2. `sweep()` re-encrypts each stale blob chunk-by-chunk under the new
//!    primary into a new physical file, then atomically swaps stream and
//!    sidecar. Partial failures leave the original blob untouched and are
//!    retried on the next sweep; readers are never blocked — a swapped-out
//!    stream stays readable through any handle already holding it.
//!
//! The sweep is a single low-priority background task; run it from one place.
//! Once `is_complete()` reports true, no blob references the demoted version
//! and the operator may drop it from the provider
//! (e.g. [`StaticKeyProvider::clear_previous`](crate::provider::StaticKeyProvider::clear_previous)).

use crate::error::{EngineError, Result};
use crate::provider;
use crate::store::Sidecar;
use crate::BlobEngine;
use parking_lot::RwLock;
use sealstore_crypto::{envelope, KeyMaterial, KeyVersion, Nonce};
use tokio::io::AsyncWriteExt;

/// Rotation protocol state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationState {
    /// No rewrap pending
    Stable,
    /// A rotation was initiated; blobs below `target_version` await rewrap
    RewrapInProgress {
        /// The promoted key version
        target_version: KeyVersion,
    },
}

/// Outcome of one sweep pass
#[derive(Debug, Default)]
pub struct RotationReport {
    /// Blobs re-encrypted under the new primary
    pub rewrapped: usize,
    /// Blobs already at the target version
    pub skipped: usize,
    /// Blobs whose rewrap failed (originals untouched; retried next sweep)
    pub failed: usize,
    /// Per-blob failure messages
    pub failures: Vec<(String, String)>,
}

/// Orchestrates re-wrapping of the blob population without blocking readers
pub struct RotationCoordinator {
    engine: BlobEngine,
    state: RwLock<RotationState>,
}

impl RotationCoordinator {
    /// Create a coordinator over `engine`'s store and provider
    pub fn new(engine: BlobEngine) -> Self {
        Self {
            engine,
            state: RwLock::new(RotationState::Stable),
        }
    }

    /// Current protocol state
    pub fn state(&self) -> RotationState {
        *self.state.read()
    }

    /// Promote `new_key` to primary and enter `RewrapInProgress`
    pub async fn rotate(&self, new_key: KeyMaterial) -> Result<KeyVersion> {
        let target_version = self.engine.provider.rotate(new_key).await?;
        *self.state.write() = RotationState::RewrapInProgress { target_version };
        tracing::info!(target_version, "key rotated; rewrap sweep pending");
        Ok(target_version)
    }

    /// Rewrap every stale blob under the current primary
    pub async fn sweep(&self) -> Result<RotationReport> {
        let (target_version, target_key) =
            provider::fetch_current(self.engine.provider.as_ref(), &self.engine.config).await?;

        let mut report = RotationReport::default();
        for blob_id in self.engine.store.list().await? {
            match self.rewrap_blob(&blob_id, target_version, &target_key).await {
                Ok(true) => report.rewrapped += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(blob_id, error = %e, "rewrap failed; original left untouched");
                    report.failed += 1;
                    report.failures.push((blob_id, e.to_string()));
                }
            }
        }

        if report.failed == 0 {
            *self.state.write() = RotationState::Stable;
            tracing::info!(
                rewrapped = report.rewrapped,
                skipped = report.skipped,
                "rewrap sweep complete"
            );
        }
        Ok(report)
    }

    /// True when every blob's sidecar references the current primary version.
    /// At that point the demoted key may be discarded from the provider.
    pub async fn is_complete(&self) -> Result<bool> {
        let (target_version, _) =
            provider::fetch_current(self.engine.provider.as_ref(), &self.engine.config).await?;
        for blob_id in self.engine.store.list().await? {
            match self.engine.store.read_sidecar(&blob_id).await? {
                Some(sidecar) if sidecar.key_version == target_version => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Re-encrypt one blob under the target key into a new physical file and
    /// swap it in. Returns false when the blob is already at the target.
    ///
    /// Recovered (sidecar-less) blobs are always rewrapped; the swap also
    /// gives them the sidecar they were missing.
    async fn rewrap_blob(
        &self,
        blob_id: &str,
        target_version: KeyVersion,
        target_key: &KeyMaterial,
    ) -> Result<bool> {
        let handle = self.engine.open(blob_id).await?;
        if handle.key_version() == target_version && !handle.recovered() {
            return Ok(false);
        }

        // Exclude concurrent writers for the swap; a held slot fails this
        // blob's rewrap and the next sweep retries it.
        let _guard = self.engine.store.acquire_writer(blob_id)?;

        // A full-range stream yields exactly the original chunk plaintexts,
        // so the rewrapped blob keeps its chunk size.
        let mut stream = handle.stream(None).await?;
        let (mut file, staged) = self
            .engine
            .store
            .create_staged_stream(blob_id, ".rewrap")
            .await?;

        let outcome: Result<u64> = async {
            let mut chunks = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                let nonce = Nonce::generate();
                let sealed = envelope::encrypt_chunk(target_key, &nonce, &chunk)
                    .map_err(|e| EngineError::Key(e.to_string()))?;
                file.write_all(&sealed).await?;
                chunks += 1;
            }
            file.sync_all().await?;
            Ok(chunks)
        }
        .await;

        let chunks = match outcome {
            Ok(chunks) => chunks,
            Err(e) => {
                self.engine.store.discard_staged(&staged).await;
                return Err(e);
            }
        };

        self.engine.store.publish_stream(blob_id, &staged).await?;
        self.engine
            .store
            .write_sidecar(
                blob_id,
                &Sidecar {
                    plaintext_size: handle.plaintext_size(),
                    chunk_size: handle.chunk_size(),
                    key_version: target_version,
                },
            )
            .await?;

        tracing::debug!(blob_id, chunks, target_version, "blob rewrapped");
        Ok(true)
    }
}
