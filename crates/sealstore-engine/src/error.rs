//! Error types for the sealstore-engine crate
//!
//! Every failure class callers need to distinguish gets its own variant; in
//! particular a key-service outage ([`EngineError::KeyUnavailable`]) is never
//! conflated with data corruption ([`EngineError::AuthenticationFailure`]).
//! Crypto-level errors are mapped contextually at each call site rather than
//! through a blanket `From`, so an authentication failure can never ride
//! along in a generic wrapper.

use thiserror::Error;

/// Result type alias using `EngineError`
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during blob engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// No blob stream exists under this id
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Envelope header fields inconsistent: truncated, or a length field out
    /// of bounds. Fatal for the chunk; the blob read aborts.
    #[error("malformed envelope in blob {blob_id} at chunk {index}: {reason}")]
    MalformedEnvelope {
        blob_id: String,
        index: u64,
        reason: String,
    },

    /// Tag verification failed with every candidate key. Fatal; never retried
    /// with the same key.
    #[error("authentication failed for blob {blob_id} at chunk {index}")]
    AuthenticationFailure { blob_id: String, index: u64 },

    /// Key provider timeout or outage. Retryable with backoff; distinct from
    /// authentication failure.
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// Requested start lies at or beyond the plaintext size
    #[error("range not satisfiable: start {start} >= plaintext size {size}")]
    RangeNotSatisfiable { start: u64, size: u64 },

    /// Sidecar missing and the recovery recount failed as well
    #[error("incomplete blob {blob_id}: {reason}")]
    IncompleteBlob { blob_id: String, reason: String },

    /// Another writer already holds this blob id
    #[error("write conflict: blob {0} already has an active writer")]
    WriteConflict(String),

    /// Chunk size outside the accepted bounds
    #[error("invalid chunk size: {requested} (must be 1..={max})")]
    InvalidChunkSize { requested: u64, max: u64 },

    /// Sidecar could not be encoded
    #[error("sidecar error: {0}")]
    Sidecar(String),

    /// Key material malformation or a provider-side key error
    #[error("key error: {0}")]
    Key(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for failures that are environmental rather than data-integrity
    /// and may be transparently retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::KeyUnavailable(_))
    }
}
