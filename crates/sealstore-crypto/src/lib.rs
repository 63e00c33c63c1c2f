//! # Sealstore Crypto
//!
//! Cryptographic core for the Sealstore encrypted blob engine.
//!
//! This crate provides:
//! - **Key material**: 128/192/256-bit AES-GCM keys, zeroized on drop
//! - **Chunk envelopes**: the on-disk record format for one encrypted chunk
//! - **Single-chunk encrypt/decrypt**: authenticated encryption with explicit
//!   failure classes
//!
//! ## Envelope format
//!
//! ```text
//! ┌──────────────┬─────────────────┬──────────────────────────┐
//! │ nonce (12 B) │ len (4 B, BE)   │ ciphertext ‖ tag (len B) │
//! └──────────────┴─────────────────┴──────────────────────────┘
//! ```
//!
//! Envelopes are self-describing and carry no inter-record delimiter; a blob
//! is simply a concatenation of envelopes. Higher layers (the engine crate)
//! own chunk sequencing, range arithmetic, and key-version selection.

pub mod envelope;
pub mod error;
pub mod keys;

pub use envelope::{
    decrypt_chunk, encrypt_chunk, envelope_len, parse_header, EnvelopeHeader, Nonce, HEADER_SIZE,
    LEN_SIZE, NONCE_SIZE, TAG_SIZE,
};
pub use error::{CryptoError, Result};
pub use keys::{KeyMaterial, KeyVersion};
