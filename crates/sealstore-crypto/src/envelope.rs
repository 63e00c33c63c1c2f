//! Chunk envelope codec
//!
//! One envelope holds one encrypted chunk:
//!
//! ```text
//! [12 bytes: nonce][4 bytes: big-endian ciphertext length][ciphertext || 16-byte tag]
//! ```
//!
//! The length field counts `ciphertext || tag`. Envelopes are validated
//! against a caller-supplied plaintext bound before any AEAD work, so a
//! corrupted length field can never trigger a huge read or allocation.
//!
//! Nonces are cryptographically random per chunk. Under AES-GCM a repeated
//! (key, nonce) pair is catastrophic; random 96-bit nonces keep the collision
//! probability negligible for realistic chunk counts per key version and need
//! no persisted counter state.

use crate::{CryptoError, KeyMaterial, Result};
use aes_gcm::{
    aead::{consts::U12, Aead as AeadTrait},
    Aes128Gcm, Aes256Gcm, AesGcm, KeyInit,
};
use rand::rngs::OsRng;

/// Size of a chunk nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the big-endian ciphertext length field in bytes
pub const LEN_SIZE: usize = 4;

/// Size of the envelope header (nonce + length field)
pub const HEADER_SIZE: usize = NONCE_SIZE + LEN_SIZE;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// AES-192-GCM (aes-gcm ships aliases only for 128 and 256)
type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, U12>;

/// A 96-bit AEAD nonce
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nonce {
    bytes: [u8; NONCE_SIZE],
}

impl Nonce {
    /// Generate a random nonce
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonce(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; NONCE_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the nonce bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.bytes
    }
}

/// Parsed envelope header
#[derive(Clone, Debug)]
pub struct EnvelopeHeader {
    /// The chunk nonce
    pub nonce: Nonce,
    /// Length of `ciphertext || tag` in bytes
    pub ciphertext_len: u32,
}

/// On-disk size of an envelope holding `plaintext_len` bytes of plaintext
pub fn envelope_len(plaintext_len: usize) -> usize {
    HEADER_SIZE + plaintext_len + TAG_SIZE
}

/// Parse the 16-byte envelope header from the front of `buf`
///
/// Fails with [`CryptoError::MalformedEnvelope`] when `buf` is too short.
/// The length field is not bounds-checked here; [`decrypt_chunk`] does that
/// against its caller-supplied plaintext bound.
pub fn parse_header(buf: &[u8]) -> Result<EnvelopeHeader> {
    if buf.len() < HEADER_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "truncated header: {} of {} bytes",
            buf.len(),
            HEADER_SIZE
        )));
    }
    let nonce = Nonce::from_bytes(&buf[..NONCE_SIZE])?;
    let mut len_bytes = [0u8; LEN_SIZE];
    len_bytes.copy_from_slice(&buf[NONCE_SIZE..HEADER_SIZE]);
    Ok(EnvelopeHeader {
        nonce,
        ciphertext_len: u32::from_be_bytes(len_bytes),
    })
}

/// Encrypt a single chunk into an envelope
///
/// Returns `nonce || len || ciphertext || tag`. Fails only on key-material
/// malformation, never on input size.
pub fn encrypt_chunk(key: &KeyMaterial, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
    let sealed = seal(key, nonce, plaintext)?;
    let mut envelope = Vec::with_capacity(HEADER_SIZE + sealed.len());
    envelope.extend_from_slice(nonce.as_bytes());
    envelope.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
    envelope.extend_from_slice(&sealed);
    Ok(envelope)
}

/// Decrypt a single envelope back to plaintext
///
/// `max_plaintext` bounds the acceptable chunk size: a length field above
/// `max_plaintext + TAG_SIZE` is rejected as [`CryptoError::MalformedEnvelope`]
/// before any decryption is attempted. Tag verification failure surfaces as
/// [`CryptoError::Authentication`].
pub fn decrypt_chunk(key: &KeyMaterial, envelope: &[u8], max_plaintext: usize) -> Result<Vec<u8>> {
    let header = parse_header(envelope)?;
    let ct_len = header.ciphertext_len as usize;

    if ct_len < TAG_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "length field {ct_len} smaller than the {TAG_SIZE}-byte tag"
        )));
    }
    if ct_len > max_plaintext + TAG_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "length field {} exceeds chunk bound {}",
            ct_len,
            max_plaintext + TAG_SIZE
        )));
    }

    let body = &envelope[HEADER_SIZE..];
    if body.len() < ct_len {
        return Err(CryptoError::MalformedEnvelope(format!(
            "truncated body: {} of {} ciphertext bytes",
            body.len(),
            ct_len
        )));
    }
    if body.len() > ct_len {
        return Err(CryptoError::MalformedEnvelope(format!(
            "{} trailing bytes after envelope",
            body.len() - ct_len
        )));
    }

    open(key, &header.nonce, &body[..ct_len])
}

fn seal(key: &KeyMaterial, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce_arr = aes_gcm::Nonce::from_slice(nonce.as_bytes());
    match key.len() {
        16 => Aes128Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .encrypt(nonce_arr, plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string())),
        24 => Aes192Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .encrypt(nonce_arr, plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string())),
        32 => Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .encrypt(nonce_arr, plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string())),
        other => Err(CryptoError::InvalidKey(format!(
            "unsupported key length {other}"
        ))),
    }
}

fn open(key: &KeyMaterial, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let nonce_arr = aes_gcm::Nonce::from_slice(nonce.as_bytes());
    match key.len() {
        16 => Aes128Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .decrypt(nonce_arr, ciphertext)
            .map_err(|_| CryptoError::Authentication),
        24 => Aes192Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .decrypt(nonce_arr, ciphertext)
            .map_err(|_| CryptoError::Authentication),
        32 => Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .decrypt(nonce_arr, ciphertext)
            .map_err(|_| CryptoError::Authentication),
        other => Err(CryptoError::InvalidKey(format!(
            "unsupported key length {other}"
        ))),
    }
}
