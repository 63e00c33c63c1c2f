//! Engine configuration

use std::time::Duration;

/// Default plaintext chunk size (256 KB)
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024;

/// Maximum accepted plaintext chunk size (16 MB)
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Plaintext chunk size for new blobs (bytes)
    pub chunk_size: u32,
    /// Upper bound on a single key-provider call
    pub key_timeout: Duration,
    /// Retry attempts after a failed key fetch (outages only)
    pub key_retries: u32,
    /// Base delay for exponential key-fetch backoff
    pub key_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            key_timeout: Duration::from_secs(5),
            key_retries: 2,
            key_backoff: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Set the chunk size for new blobs, clamped to `1..=MAX_CHUNK_SIZE`
    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Set the per-call key-provider timeout
    pub fn with_key_timeout(mut self, timeout: Duration) -> Self {
        self.key_timeout = timeout;
        self
    }

    /// Set the number of key-fetch retries
    pub fn with_key_retries(mut self, retries: u32) -> Self {
        self.key_retries = retries;
        self
    }

    /// Set the base backoff delay between key-fetch retries
    pub fn with_key_backoff(mut self, backoff: Duration) -> Self {
        self.key_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_clamped() {
        assert_eq!(EngineConfig::default().with_chunk_size(0).chunk_size, 1);
        assert_eq!(
            EngineConfig::default()
                .with_chunk_size(MAX_CHUNK_SIZE + 1)
                .chunk_size,
            MAX_CHUNK_SIZE
        );
        assert_eq!(
            EngineConfig::default().with_chunk_size(4096).chunk_size,
            4096
        );
    }
}
