//! Key provider abstraction
//!
//! The engine consumes key material through a single rotatable contract and
//! never persists key bytes; a blob records only the [`KeyVersion`] it was
//! written under. Versions are monotonically increasing integers; `rotate`
//! promotes the new key to primary and demotes the old primary to previous,
//! so at most two versions are live at once.
//!
//! DPAPI-sealed secrets and cloud KMS data keys are external collaborators
//! that satisfy the same trait; this crate ships the in-memory reference
//! provider, an environment-variable provider, and a TTL-caching wrapper.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sealstore_crypto::{KeyMaterial, KeyVersion};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Source of versioned symmetric key material
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// The primary key used for all new writes
    async fn current(&self) -> Result<(KeyVersion, KeyMaterial)>;

    /// Resolve a specific version. Fails with [`EngineError::KeyUnavailable`]
    /// when the version is no longer held (older than previous, or dropped).
    async fn by_version(&self, version: KeyVersion) -> Result<KeyMaterial>;

    /// Promote `new_key` to primary, demote the old primary to previous, and
    /// drop anything older. Returns the new version.
    async fn rotate(&self, new_key: KeyMaterial) -> Result<KeyVersion>;
}

#[async_trait]
impl<P: KeyProvider + ?Sized> KeyProvider for Arc<P> {
    async fn current(&self) -> Result<(KeyVersion, KeyMaterial)> {
        (**self).current().await
    }

    async fn by_version(&self, version: KeyVersion) -> Result<KeyMaterial> {
        (**self).by_version(version).await
    }

    async fn rotate(&self, new_key: KeyMaterial) -> Result<KeyVersion> {
        (**self).rotate(new_key).await
    }
}

struct Versions {
    current: (KeyVersion, KeyMaterial),
    previous: Option<(KeyVersion, KeyMaterial)>,
}

/// In-memory provider holding a primary and at most one previous key
///
/// The reference implementation, and the backing store the rotation
/// coordinator operates against in tests and single-node deployments.
pub struct StaticKeyProvider {
    versions: RwLock<Versions>,
}

impl StaticKeyProvider {
    /// Create a provider with `key` as version 1
    pub fn new(key: KeyMaterial) -> Self {
        Self::with_version(key, 1)
    }

    /// Create a provider with `key` at an explicit starting version
    pub fn with_version(key: KeyMaterial, version: KeyVersion) -> Self {
        Self {
            versions: RwLock::new(Versions {
                current: (version, key),
                previous: None,
            }),
        }
    }

    /// Drop the previous key once no blob references it (rotation terminal
    /// state). Blobs still written under it become unreadable.
    pub fn clear_previous(&self) {
        self.versions.write().previous = None;
    }

    /// True while a demoted key is still held
    pub fn has_previous(&self) -> bool {
        self.versions.read().previous.is_some()
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn current(&self) -> Result<(KeyVersion, KeyMaterial)> {
        let versions = self.versions.read();
        Ok(versions.current.clone())
    }

    async fn by_version(&self, version: KeyVersion) -> Result<KeyMaterial> {
        let versions = self.versions.read();
        if versions.current.0 == version {
            return Ok(versions.current.1.clone());
        }
        if let Some((v, key)) = &versions.previous {
            if *v == version {
                return Ok(key.clone());
            }
        }
        Err(EngineError::KeyUnavailable(format!(
            "key version {version} is not held"
        )))
    }

    async fn rotate(&self, new_key: KeyMaterial) -> Result<KeyVersion> {
        let mut versions = self.versions.write();
        let new_version = versions.current.0 + 1;
        let demoted = std::mem::replace(&mut versions.current, (new_version, new_key));
        versions.previous = Some(demoted);
        Ok(new_version)
    }
}

/// Provider reading a hex-encoded key from an environment variable
///
/// The original deployment's `BLOB_KEY` path. The variable is managed outside
/// the process, so `rotate` is unsupported here.
pub struct EnvKeyProvider {
    var: String,
    version: KeyVersion,
}

impl EnvKeyProvider {
    /// Read from `var`, reporting the key as version 1
    pub fn new(var: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            version: 1,
        }
    }

    /// Read from `var` at an explicit version
    pub fn with_version(var: impl Into<String>, version: KeyVersion) -> Self {
        Self {
            var: var.into(),
            version,
        }
    }

    fn load(&self) -> Result<KeyMaterial> {
        let hex_value = std::env::var(&self.var)
            .map_err(|_| EngineError::KeyUnavailable(format!("{} is not set", self.var)))?;
        KeyMaterial::from_hex(&hex_value).map_err(|e| EngineError::Key(e.to_string()))
    }
}

#[async_trait]
impl KeyProvider for EnvKeyProvider {
    async fn current(&self) -> Result<(KeyVersion, KeyMaterial)> {
        Ok((self.version, self.load()?))
    }

    async fn by_version(&self, version: KeyVersion) -> Result<KeyMaterial> {
        if version != self.version {
            return Err(EngineError::KeyUnavailable(format!(
                "key version {version} is not held"
            )));
        }
        self.load()
    }

    async fn rotate(&self, _new_key: KeyMaterial) -> Result<KeyVersion> {
        Err(EngineError::Key(
            "environment-backed keys rotate outside the process".to_string(),
        ))
    }
}

struct CacheState {
    current: Option<(Instant, KeyVersion, KeyMaterial)>,
    by_version: HashMap<KeyVersion, (Instant, KeyMaterial)>,
}

/// TTL cache over any provider, avoiding a backend round trip per chunk
///
/// `rotate` always reaches the inner provider and invalidates the cache.
pub struct CachedKeyProvider<P> {
    inner: P,
    ttl: std::time::Duration,
    state: Mutex<CacheState>,
}

impl<P: KeyProvider> CachedKeyProvider<P> {
    /// Wrap `inner`, caching resolved keys for `ttl`
    pub fn new(inner: P, ttl: std::time::Duration) -> Self {
        Self {
            inner,
            ttl,
            state: Mutex::new(CacheState {
                current: None,
                by_version: HashMap::new(),
            }),
        }
    }

    /// Drop all cached entries
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.current = None;
        state.by_version.clear();
    }

    /// Access the wrapped provider
    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: KeyProvider> KeyProvider for CachedKeyProvider<P> {
    async fn current(&self) -> Result<(KeyVersion, KeyMaterial)> {
        {
            let state = self.state.lock();
            if let Some((fetched_at, version, key)) = &state.current {
                if fetched_at.elapsed() < self.ttl {
                    return Ok((*version, key.clone()));
                }
            }
        }
        let (version, key) = self.inner.current().await?;
        let mut state = self.state.lock();
        state.current = Some((Instant::now(), version, key.clone()));
        state.by_version.insert(version, (Instant::now(), key.clone()));
        Ok((version, key))
    }

    async fn by_version(&self, version: KeyVersion) -> Result<KeyMaterial> {
        {
            let state = self.state.lock();
            if let Some((fetched_at, key)) = state.by_version.get(&version) {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(key.clone());
                }
            }
        }
        let key = self.inner.by_version(version).await?;
        self.state
            .lock()
            .by_version
            .insert(version, (Instant::now(), key.clone()));
        Ok(key)
    }

    async fn rotate(&self, new_key: KeyMaterial) -> Result<KeyVersion> {
        let new_version = self.inner.rotate(new_key).await?;
        self.invalidate();
        Ok(new_version)
    }
}

/// Bound a provider call by the configured timeout, mapping an elapsed timer
/// to [`EngineError::KeyUnavailable`]
pub(crate) async fn timebox<T>(
    config: &EngineConfig,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(config.key_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::KeyUnavailable(format!(
            "key fetch timed out after {:?}",
            config.key_timeout
        ))),
    }
}

/// Fetch the current primary with bounded retries and exponential backoff.
/// Outages are the only transparently retried failure class.
pub(crate) async fn fetch_current(
    provider: &dyn KeyProvider,
    config: &EngineConfig,
) -> Result<(KeyVersion, KeyMaterial)> {
    let mut attempt = 0u32;
    loop {
        let err = match timebox(config, provider.current()).await {
            Ok(found) => return Ok(found),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };
        if attempt >= config.key_retries {
            return Err(err);
        }
        let delay = config.key_backoff * (1u32 << attempt.min(16));
        tracing::debug!(attempt, error = %err, ?delay, "key fetch failed; backing off");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_static_provider_rotation() {
        let provider = StaticKeyProvider::new(KeyMaterial::generate());
        let (v1, k1) = provider.current().await.unwrap();
        assert_eq!(v1, 1);

        let v2 = provider.rotate(KeyMaterial::generate()).await.unwrap();
        assert_eq!(v2, 2);

        // Previous stays resolvable until cleared.
        let old = provider.by_version(v1).await.unwrap();
        assert_eq!(old.as_bytes(), k1.as_bytes());
        assert!(provider.has_previous());

        provider.clear_previous();
        assert!(provider.by_version(v1).await.is_err());
        assert!(provider.by_version(v2).await.is_ok());
    }

    #[tokio::test]
    async fn test_static_provider_holds_two_versions_at_most() {
        let provider = StaticKeyProvider::new(KeyMaterial::generate());
        provider.rotate(KeyMaterial::generate()).await.unwrap();
        provider.rotate(KeyMaterial::generate()).await.unwrap();

        assert!(provider.by_version(1).await.is_err());
        assert!(provider.by_version(2).await.is_ok());
        assert!(provider.by_version(3).await.is_ok());
    }

    #[tokio::test]
    async fn test_env_provider() {
        let var = "SEALSTORE_TEST_ENV_PROVIDER_KEY";
        std::env::set_var(var, "ab".repeat(32));

        let provider = EnvKeyProvider::new(var);
        let (version, key) = provider.current().await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(key.as_bytes(), &[0xABu8; 32]);

        assert!(provider.by_version(1).await.is_ok());
        assert!(matches!(
            provider.by_version(2).await,
            Err(EngineError::KeyUnavailable(_))
        ));
        assert!(matches!(
            provider.rotate(KeyMaterial::generate()).await,
            Err(EngineError::Key(_))
        ));

        std::env::remove_var(var);
        assert!(matches!(
            provider.current().await,
            Err(EngineError::KeyUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_env_provider_rejects_bad_hex() {
        let var = "SEALSTORE_TEST_ENV_PROVIDER_BAD";
        std::env::set_var(var, "zz-not-hex");
        let provider = EnvKeyProvider::new(var);
        assert!(matches!(provider.current().await, Err(EngineError::Key(_))));
        std::env::remove_var(var);
    }

    /// Provider counting backend hits, for cache behavior tests
    struct CountingProvider {
        inner: StaticKeyProvider,
        hits: AtomicUsize,
    }

    #[async_trait]
    impl KeyProvider for CountingProvider {
        async fn current(&self) -> Result<(KeyVersion, KeyMaterial)> {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.inner.current().await
        }
        async fn by_version(&self, version: KeyVersion) -> Result<KeyMaterial> {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.inner.by_version(version).await
        }
        async fn rotate(&self, new_key: KeyMaterial) -> Result<KeyVersion> {
            self.inner.rotate(new_key).await
        }
    }

    #[tokio::test]
    async fn test_cached_provider_hits_backend_once_within_ttl() {
        let counting = CountingProvider {
            inner: StaticKeyProvider::new(KeyMaterial::generate()),
            hits: AtomicUsize::new(0),
        };
        let cached = CachedKeyProvider::new(counting, Duration::from_secs(60));

        for _ in 0..5 {
            cached.current().await.unwrap();
            cached.by_version(1).await.unwrap();
        }
        // One backend call for current (which also primes version 1).
        assert_eq!(cached.inner().hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cached_provider_invalidated_on_rotate() {
        let counting = CountingProvider {
            inner: StaticKeyProvider::new(KeyMaterial::generate()),
            hits: AtomicUsize::new(0),
        };
        let cached = CachedKeyProvider::new(counting, Duration::from_secs(60));

        let (v1, _) = cached.current().await.unwrap();
        let v2 = cached.rotate(KeyMaterial::generate()).await.unwrap();
        assert_eq!(v2, v1 + 1);

        // The stale primary must not be served from cache.
        let (version, _) = cached.current().await.unwrap();
        assert_eq!(version, v2);
    }

    /// Provider that never answers, for timeout tests
    struct StalledProvider;

    #[async_trait]
    impl KeyProvider for StalledProvider {
        async fn current(&self) -> Result<(KeyVersion, KeyMaterial)> {
            std::future::pending().await
        }
        async fn by_version(&self, _version: KeyVersion) -> Result<KeyMaterial> {
            std::future::pending().await
        }
        async fn rotate(&self, _new_key: KeyMaterial) -> Result<KeyVersion> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_fetch_timeout_maps_to_key_unavailable() {
        let config = EngineConfig::default()
            .with_key_timeout(Duration::from_millis(20))
            .with_key_retries(1)
            .with_key_backoff(Duration::from_millis(1));

        let result = fetch_current(&StalledProvider, &config).await;
        assert!(matches!(result, Err(EngineError::KeyUnavailable(_))));
    }
}
