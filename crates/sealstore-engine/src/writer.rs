//! Blob writer
//!
//! Consumes an async byte source in `chunk_size` increments, encrypts each
//! chunk under the current primary key with a fresh random nonce, and appends
//! envelopes sequentially. Memory usage is O(chunk_size) regardless of
//! payload size.
//!
//! Write ordering: chunks → fsync → publish stream → sidecar. The sidecar is
//! the last observable effect, so a crash can never leave a complete-looking
//! sidecar next to a partial stream.

use crate::config::MAX_CHUNK_SIZE;
use crate::error::{EngineError, Result};
use crate::provider;
use crate::store::Sidecar;
use crate::BlobEngine;
use sealstore_crypto::{envelope, Nonce};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

pub(crate) async fn write_blob<R: AsyncRead + Unpin>(
    engine: &BlobEngine,
    blob_id: &str,
    source: R,
    chunk_size: u32,
) -> Result<Sidecar> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(EngineError::InvalidChunkSize {
            requested: chunk_size as u64,
            max: MAX_CHUNK_SIZE as u64,
        });
    }

    engine.store.ensure_root().await?;
    let _guard = engine.store.acquire_writer(blob_id)?;

    let (key_version, key) =
        provider::fetch_current(engine.provider.as_ref(), &engine.config).await?;

    let (file, staged) = engine.store.create_staged_stream(blob_id, ".tmp").await?;
    let outcome = write_chunks(engine, blob_id, source, chunk_size, &key, file).await;
    let plaintext_size = match outcome {
        Ok(size) => size,
        Err(e) => {
            engine.store.discard_staged(&staged).await;
            return Err(e);
        }
    };

    engine.store.publish_stream(blob_id, &staged).await?;
    let sidecar = Sidecar {
        plaintext_size,
        chunk_size,
        key_version,
    };
    engine.store.write_sidecar(blob_id, &sidecar).await?;
    tracing::debug!(blob_id, plaintext_size, chunk_size, key_version, "blob written");
    Ok(sidecar)
}

async fn write_chunks<R: AsyncRead + Unpin>(
    engine: &BlobEngine,
    blob_id: &str,
    mut source: R,
    chunk_size: u32,
    key: &sealstore_crypto::KeyMaterial,
    mut file: tokio::fs::File,
) -> Result<u64> {
    let mut buffer = vec![0u8; chunk_size as usize];
    let mut plaintext_size: u64 = 0;
    let mut index: u64 = 0;

    loop {
        // Fill the buffer up to chunk_size; a short final read is a normal
        // partial last chunk, not an error.
        let mut filled = 0usize;
        while filled < buffer.len() {
            match source.read(&mut buffer[filled..]).await? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            break;
        }

        let nonce = Nonce::generate();
        let sealed = envelope::encrypt_chunk(key, &nonce, &buffer[..filled])
            .map_err(|e| EngineError::Key(e.to_string()))?;
        file.write_all(&sealed).await?;

        engine.audit.on_chunk_written(blob_id, index, filled);
        plaintext_size += filled as u64;
        index += 1;
    }

    file.sync_all().await?;
    Ok(plaintext_size)
}
