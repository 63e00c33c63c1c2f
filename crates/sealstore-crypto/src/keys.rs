//! Key material for blob encryption
//!
//! Keys are raw AES-GCM secrets of 16, 24, or 32 bytes. The engine never
//! persists key bytes; blobs record only the [`KeyVersion`] they were written
//! under, and a key provider resolves versions back to material.

use crate::{CryptoError, Result};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Accepted key lengths in bytes (AES-128/192/256)
pub const KEY_SIZES: [usize; 3] = [16, 24, 32];

/// Integer tag identifying which key a blob was encrypted under
pub type KeyVersion = u32;

/// A raw symmetric key for chunk encryption
///
/// Wiped from memory on drop. `Debug` never prints key bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Generate a fresh random 256-bit key
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; 32];
        rand::RngCore::fill_bytes(&mut OsRng, &mut bytes);
        Self { bytes }
    }

    /// Create key material from raw bytes (must be 16, 24, or 32 bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if !KEY_SIZES.contains(&bytes.len()) {
            return Err(CryptoError::InvalidKey(format!(
                "key must be 16, 24, or 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Create key material from a hex string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid key hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the key holds no bytes (never constructible via the public API)
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_random() {
        let k1 = KeyMaterial::generate();
        let k2 = KeyMaterial::generate();
        assert_eq!(k1.len(), 32);
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_accepted_lengths() {
        for size in KEY_SIZES {
            let key = KeyMaterial::from_bytes(&vec![7u8; size]).unwrap();
            assert_eq!(key.len(), size);
        }
    }

    #[test]
    fn test_rejected_lengths() {
        for size in [0, 1, 15, 17, 31, 33, 64] {
            assert!(matches!(
                KeyMaterial::from_bytes(&vec![0u8; size]),
                Err(CryptoError::InvalidKey(_))
            ));
        }
    }

    #[test]
    fn test_from_hex() {
        let key = KeyMaterial::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(key.as_bytes(), &[0xABu8; 32]);

        assert!(KeyMaterial::from_hex("not hex").is_err());
        assert!(KeyMaterial::from_hex("abcd").is_err()); // 2 bytes
    }

    #[test]
    fn test_debug_redacts() {
        let key = KeyMaterial::from_bytes(&[0x42u8; 16]).unwrap();
        let printed = format!("{key:?}");
        assert!(!printed.contains("42"));
        assert!(printed.contains("16 bytes"));
    }
}
