//! Blob reader and range planner
//!
//! `open` resolves a blob's sidecar (or recounts a legacy stream), the range
//! planner maps a plaintext byte interval onto chunk indices with O(1)
//! arithmetic, and [`BlobStream`] decrypts chunks sequentially holding one
//! decrypted buffer at a time — peak memory is O(chunk_size) no matter how
//! large the blob is.
//!
//! The arithmetic is exact, not approximate: every chunk except the last
//! holds exactly `chunk_size` plaintext bytes, so chunk `i` of the stream
//! starts at ciphertext offset `i * (HEADER_SIZE + chunk_size + TAG_SIZE)`.

use crate::config::MAX_CHUNK_SIZE;
use crate::error::{EngineError, Result};
use crate::provider;
use crate::store::Sidecar;
use crate::BlobEngine;
use bytes::Bytes;
use sealstore_crypto::{envelope, CryptoError, KeyMaterial, KeyVersion};
use sealstore_crypto::{HEADER_SIZE, TAG_SIZE};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// A plaintext byte interval with an inclusive, optional end
///
/// `end: None` means "through the last byte". The HTTP layer resolves suffix
/// ranges (`bytes=-N`) into absolute offsets before reaching the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    /// First plaintext byte to emit
    pub start: u64,
    /// Last plaintext byte to emit (inclusive); `None` = open-ended
    pub end: Option<u64>,
}

impl ByteRange {
    /// Open-ended range from `start` through the end of the blob
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Closed range `[start, end]`, both inclusive
    pub fn closed(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }
}

/// Resolved chunk walk for one request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChunkPlan {
    /// First chunk to fetch
    pub first_chunk: u64,
    /// Last chunk to fetch (inclusive)
    pub last_chunk: u64,
    /// Bytes dropped from the front of the first chunk
    pub skip_front: u32,
    /// Total plaintext bytes to emit
    pub emit_total: u64,
}

/// Map a requested range onto chunk indices. `Ok(None)` is the empty walk
/// (full read of a zero-byte blob).
pub(crate) fn plan_range(
    plaintext_size: u64,
    chunk_size: u32,
    range: Option<ByteRange>,
) -> Result<Option<ChunkPlan>> {
    let (start, end) = match range {
        None => {
            if plaintext_size == 0 {
                return Ok(None);
            }
            (0, plaintext_size - 1)
        }
        Some(range) => {
            if range.start >= plaintext_size {
                return Err(EngineError::RangeNotSatisfiable {
                    start: range.start,
                    size: plaintext_size,
                });
            }
            let end = range
                .end
                .map(|end| end.min(plaintext_size - 1))
                .unwrap_or(plaintext_size - 1);
            if end < range.start {
                return Err(EngineError::RangeNotSatisfiable {
                    start: range.start,
                    size: plaintext_size,
                });
            }
            (range.start, end)
        }
    };

    let chunk_size = chunk_size as u64;
    Ok(Some(ChunkPlan {
        first_chunk: start / chunk_size,
        last_chunk: end / chunk_size,
        skip_front: (start % chunk_size) as u32,
        emit_total: end - start + 1,
    }))
}

/// Plaintext length chunk `index` must hold, given the fixed-chunk invariant
fn expected_chunk_len(plaintext_size: u64, chunk_size: u32, index: u64) -> u64 {
    (plaintext_size - index * chunk_size as u64).min(chunk_size as u64)
}

/// An opened blob: resolved metadata plus the pieces needed to stream it
pub struct BlobHandle {
    engine: BlobEngine,
    blob_id: String,
    sidecar: Sidecar,
    from_sidecar: bool,
}

impl BlobHandle {
    /// Total plaintext size in bytes
    pub fn plaintext_size(&self) -> u64 {
        self.sidecar.plaintext_size
    }

    /// Plaintext chunk size the blob was written with
    pub fn chunk_size(&self) -> u32 {
        self.sidecar.chunk_size
    }

    /// Key version the blob is recorded (or was recovered) under
    pub fn key_version(&self) -> KeyVersion {
        self.sidecar.key_version
    }

    /// True when the sidecar was missing and the metadata was recovered by a
    /// full decrypt-and-count pass
    pub fn recovered(&self) -> bool {
        !self.from_sidecar
    }

    /// Begin streaming the requested range (`None` = whole blob)
    pub async fn stream(&self, range: Option<ByteRange>) -> Result<BlobStream> {
        let plan = plan_range(self.sidecar.plaintext_size, self.sidecar.chunk_size, range)?;

        let mut stream = BlobStream {
            engine: self.engine.clone(),
            blob_id: self.blob_id.clone(),
            plaintext_size: self.sidecar.plaintext_size,
            chunk_size: self.sidecar.chunk_size,
            plan,
            file: None,
            keys: KeyRing::unresolved(),
            next_chunk: plan.map(|p| p.first_chunk).unwrap_or(0),
            emitted: 0,
        };

        if let Some(plan) = plan {
            let mut file = self.engine.store.open_stream(&self.blob_id).await?;
            let envelope_size = envelope::envelope_len(self.sidecar.chunk_size as usize) as u64;
            file.seek(SeekFrom::Start(plan.first_chunk * envelope_size))
                .await?;
            stream.file = Some(file);
            stream.keys =
                KeyRing::for_version(&self.engine, self.sidecar.key_version).await;
        }
        Ok(stream)
    }

    /// Read the whole blob into memory. Convenience for small blobs and
    /// tests; large payloads should consume [`BlobHandle::stream`].
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        self.collect(None).await
    }

    /// Read one range into memory
    pub async fn read_range(&self, range: ByteRange) -> Result<Vec<u8>> {
        self.collect(Some(range)).await
    }

    async fn collect(&self, range: Option<ByteRange>) -> Result<Vec<u8>> {
        let mut stream = self.stream(range).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

/// Open a blob, resolving its sidecar or recounting a legacy stream
pub(crate) async fn open_blob(engine: &BlobEngine, blob_id: &str) -> Result<BlobHandle> {
    if let Some(sidecar) = engine.store.read_sidecar(blob_id).await? {
        if !engine.store.exists(blob_id).await? {
            return Err(EngineError::BlobNotFound(blob_id.to_string()));
        }
        return Ok(BlobHandle {
            engine: engine.clone(),
            blob_id: blob_id.to_string(),
            sidecar,
            from_sidecar: true,
        });
    }

    let sidecar = recover_sidecar(engine, blob_id).await?;
    Ok(BlobHandle {
        engine: engine.clone(),
        blob_id: blob_id.to_string(),
        sidecar,
        from_sidecar: false,
    })
}

/// One-time full decrypt-and-count pass for blobs without a sidecar
///
/// O(N) in blob size and intentionally never persisted; the chunk size is
/// recovered from the first chunk's plaintext length (exact under the
/// fixed-chunk invariant). Slow by design — the read-only safety net for
/// incomplete or legacy blobs.
async fn recover_sidecar(engine: &BlobEngine, blob_id: &str) -> Result<Sidecar> {
    tracing::info!(blob_id, "sidecar missing; recounting blob stream");

    let mut file = engine.store.open_stream(blob_id).await?;
    let stream_len = file.metadata().await?.len();

    let mut keys = KeyRing::unresolved();
    let mut plaintext_size: u64 = 0;
    let mut chunk_size: Option<u32> = None;
    let mut index: u64 = 0;
    let mut offset: u64 = 0;
    let mut saw_short_chunk = false;

    while offset < stream_len {
        if saw_short_chunk {
            // A short chunk is only legal in final position.
            return Err(EngineError::IncompleteBlob {
                blob_id: blob_id.to_string(),
                reason: format!("short chunk {} followed by more data", index - 1),
            });
        }
        if stream_len - offset < HEADER_SIZE as u64 {
            return Err(EngineError::IncompleteBlob {
                blob_id: blob_id.to_string(),
                reason: format!("truncated header at chunk {index}"),
            });
        }

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf).await?;
        let header = match envelope::parse_header(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                return Err(EngineError::IncompleteBlob {
                    blob_id: blob_id.to_string(),
                    reason: format!("chunk {index}: {e}"),
                })
            }
        };

        let ct_len = header.ciphertext_len as u64;
        let bound = chunk_size.unwrap_or(MAX_CHUNK_SIZE) as u64 + TAG_SIZE as u64;
        if ct_len < TAG_SIZE as u64 || ct_len > bound {
            return Err(EngineError::IncompleteBlob {
                blob_id: blob_id.to_string(),
                reason: format!("chunk {index}: length field {ct_len} out of bounds"),
            });
        }
        if stream_len - offset - (HEADER_SIZE as u64) < ct_len {
            return Err(EngineError::IncompleteBlob {
                blob_id: blob_id.to_string(),
                reason: format!("truncated body at chunk {index}"),
            });
        }

        let mut body = vec![0u8; ct_len as usize];
        file.read_exact(&mut body).await?;

        let mut sealed = Vec::with_capacity(HEADER_SIZE + body.len());
        sealed.extend_from_slice(&header_buf);
        sealed.extend_from_slice(&body);

        let bound_plaintext = chunk_size.unwrap_or(MAX_CHUNK_SIZE) as usize;
        let plaintext = keys
            .decrypt(engine, blob_id, index, &sealed, bound_plaintext)
            .await?;

        match chunk_size {
            None => chunk_size = Some(plaintext.len() as u32),
            Some(size) => {
                if (plaintext.len() as u32) < size {
                    saw_short_chunk = true;
                }
            }
        }

        plaintext_size += plaintext.len() as u64;
        offset += HEADER_SIZE as u64 + ct_len;
        index += 1;
    }

    let key_version = match keys.active_version() {
        Some(version) => version,
        // Zero-chunk stream: nothing constrained the version; record current.
        None => {
            provider::fetch_current(engine.provider.as_ref(), &engine.config)
                .await?
                .0
        }
    };

    Ok(Sidecar {
        plaintext_size,
        chunk_size: chunk_size.unwrap_or(engine.config.chunk_size).max(1),
        key_version,
    })
}

/// Key selection state for one stream
///
/// Tries the blob's recorded version first; on an authentication failure (or
/// when that version is gone mid-rotation) performs one forced refresh,
/// gathering the provider's primary and previous keys and accepting whichever
/// authenticates. Versions are monotonic and rotation demotes the primary, so
/// `current - 1` addresses the previous key exactly.
struct KeyRing {
    active: Option<(KeyVersion, KeyMaterial)>,
    refreshed: bool,
}

impl KeyRing {
    fn unresolved() -> Self {
        Self {
            active: None,
            refreshed: false,
        }
    }

    async fn for_version(engine: &BlobEngine, version: KeyVersion) -> Self {
        let active = provider::timebox(&engine.config, engine.provider.by_version(version))
            .await
            .ok()
            .map(|key| (version, key));
        Self {
            active,
            refreshed: false,
        }
    }

    fn active_version(&self) -> Option<KeyVersion> {
        self.active.as_ref().map(|(version, _)| *version)
    }

    async fn decrypt(
        &mut self,
        engine: &BlobEngine,
        blob_id: &str,
        index: u64,
        sealed: &[u8],
        max_plaintext: usize,
    ) -> Result<Vec<u8>> {
        if let Some((_, key)) = &self.active {
            match envelope::decrypt_chunk(key, sealed, max_plaintext) {
                Ok(plaintext) => return Ok(plaintext),
                Err(CryptoError::Authentication) => {}
                Err(e) => return Err(map_codec_error(blob_id, index, e)),
            }
        }

        if !self.refreshed {
            self.refreshed = true;
            for (version, key) in gather_candidates(engine).await? {
                match envelope::decrypt_chunk(&key, sealed, max_plaintext) {
                    Ok(plaintext) => {
                        tracing::debug!(blob_id, version, "decryption key re-resolved");
                        self.active = Some((version, key));
                        return Ok(plaintext);
                    }
                    Err(CryptoError::Authentication) => continue,
                    Err(e) => return Err(map_codec_error(blob_id, index, e)),
                }
            }
        }

        engine.audit.on_auth_failure(blob_id, index);
        Err(EngineError::AuthenticationFailure {
            blob_id: blob_id.to_string(),
            index,
        })
    }
}

fn map_codec_error(blob_id: &str, index: u64, error: CryptoError) -> EngineError {
    match error {
        CryptoError::MalformedEnvelope(reason) => EngineError::MalformedEnvelope {
            blob_id: blob_id.to_string(),
            index,
            reason,
        },
        CryptoError::Authentication => EngineError::AuthenticationFailure {
            blob_id: blob_id.to_string(),
            index,
        },
        other => EngineError::Key(other.to_string()),
    }
}

async fn gather_candidates(engine: &BlobEngine) -> Result<Vec<(KeyVersion, KeyMaterial)>> {
    let (current_version, current_key) =
        provider::timebox(&engine.config, engine.provider.current()).await?;
    let mut candidates = vec![(current_version, current_key)];
    if current_version > 1 {
        if let Ok(previous) = provider::timebox(
            &engine.config,
            engine.provider.by_version(current_version - 1),
        )
        .await
        {
            candidates.push((current_version - 1, previous));
        }
    }
    Ok(candidates)
}

/// Lazy sequence of decrypted plaintext slices
///
/// Pull with [`BlobStream::next`]; drop at any point to abort — the file
/// handle and the held buffer are released immediately. A chunk is the atomic
/// unit of work: cancellation never interrupts a decryption in progress.
pub struct BlobStream {
    engine: BlobEngine,
    blob_id: String,
    plaintext_size: u64,
    chunk_size: u32,
    plan: Option<ChunkPlan>,
    file: Option<tokio::fs::File>,
    keys: KeyRing,
    next_chunk: u64,
    emitted: u64,
}

impl BlobStream {
    /// Emit the next plaintext slice, or `None` when the range is exhausted.
    /// After an error the stream is terminated; further calls return `None`.
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        let plan = self.plan?;
        if self.emitted >= plan.emit_total {
            self.file = None;
            return None;
        }
        if self.file.is_none() {
            return None;
        }

        match self.read_next_chunk(plan).await {
            Ok(bytes) => Some(Ok(bytes)),
            Err(e) => {
                // Terminate: a chunk-level failure aborts the whole stream.
                self.plan = None;
                self.file = None;
                Some(Err(e))
            }
        }
    }

    /// Adapt into a `futures::Stream` of plaintext slices
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<Bytes>> {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }

    async fn read_next_chunk(&mut self, plan: ChunkPlan) -> Result<Bytes> {
        let index = self.next_chunk;
        let blob_id = self.blob_id.clone();
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => {
                return Err(EngineError::BlobNotFound(blob_id));
            }
        };

        let truncated = |reason: &str| EngineError::MalformedEnvelope {
            blob_id: blob_id.clone(),
            index,
            reason: reason.to_string(),
        };

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)
            .await
            .map_err(|_| truncated("truncated header"))?;
        let header = match envelope::parse_header(&header_buf) {
            Ok(header) => header,
            Err(e) => return Err(map_codec_error(&blob_id, index, e)),
        };

        let ct_len = header.ciphertext_len as usize;
        if ct_len < TAG_SIZE || ct_len > self.chunk_size as usize + TAG_SIZE {
            return Err(EngineError::MalformedEnvelope {
                blob_id: blob_id.clone(),
                index,
                reason: format!("length field {ct_len} out of bounds"),
            });
        }

        let mut body = vec![0u8; ct_len];
        file.read_exact(&mut body)
            .await
            .map_err(|_| truncated("truncated body"))?;

        let mut sealed = Vec::with_capacity(HEADER_SIZE + ct_len);
        sealed.extend_from_slice(&header_buf);
        sealed.extend_from_slice(&body);

        let plaintext = self
            .keys
            .decrypt(
                &self.engine,
                &blob_id,
                index,
                &sealed,
                self.chunk_size as usize,
            )
            .await?;

        let expected = expected_chunk_len(self.plaintext_size, self.chunk_size, index);
        if plaintext.len() as u64 != expected {
            return Err(EngineError::MalformedEnvelope {
                blob_id: blob_id.clone(),
                index,
                reason: format!("chunk holds {} bytes, expected {expected}", plaintext.len()),
            });
        }

        let skip = if index == plan.first_chunk {
            plan.skip_front as usize
        } else {
            0
        };
        let remaining = plan.emit_total - self.emitted;
        let take = ((plaintext.len() - skip) as u64).min(remaining) as usize;
        let slice = Bytes::from(plaintext).slice(skip..skip + take);

        self.engine.audit.on_chunk_read(&blob_id, index, take);
        self.emitted += take as u64;
        self.next_chunk += 1;
        if self.emitted >= plan.emit_total {
            // Range exhausted: release the file handle eagerly.
            self.file = None;
        }
        Ok(slice)
    }
}
