//! Error types for the sealstore-crypto crate

use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key material has the wrong length or shape
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Nonce has the wrong length
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    /// Encryption failed (key-material malformation only; never input size)
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The authentication tag did not verify: tampering, wrong key, or a
    /// corrupted stream. Never passed through silently.
    #[error("authentication failed: ciphertext or tag rejected")]
    Authentication,

    /// Envelope header fields are inconsistent (truncated, or a length field
    /// out of bounds). Detected before any decryption is attempted.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}
