//! Revocation lookup backends
//!
//! The decision pipeline checks revocation through a single trait so the
//! deployment can choose between the in-process cache (bootstrap + event
//! fan-out) and the legacy mode that asks the key-value store on every
//! request. The cached backend cannot fail; the store-backed one can, and
//! the pipeline fails closed when it does.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::debug;

use crate::cache::RevocationCache;
use crate::error::{AuthzError, Result};

/// Revocation status lookup
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Check whether the identifier is currently revoked
    async fn is_revoked(&self, jti: &str) -> Result<bool>;
}

/// In-process lookup against the local revocation cache
pub struct CachedStore {
    cache: Arc<RevocationCache>,
}

impl CachedStore {
    /// Create a cached lookup backend
    pub fn new(cache: Arc<RevocationCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl RevocationStore for CachedStore {
    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        Ok(self.cache.is_revoked(jti))
    }
}

/// Per-request lookup against the key-value store (legacy mode)
pub struct RedisStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    read_timeout: Duration,
}

impl RedisStore {
    /// Connect to the store and verify it is responsive
    pub async fn connect(url: &str, key_prefix: &str, read_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!("revocation store connection established");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            read_timeout,
        })
    }

    /// The underlying multiplexed connection, for the bootstrap scan
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl RevocationStore for RedisStore {
    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = format!("{}{}", self.key_prefix, jti);

        let lookup = async move {
            let exists: bool = conn.exists(&key).await?;
            Ok::<_, AuthzError>(exists)
        };

        match tokio::time::timeout(self.read_timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(AuthzError::revocation(format!(
                "lookup timed out after {:?}",
                self.read_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[tokio::test]
    async fn test_cached_store_reflects_cache_state() {
        let cache = Arc::new(RevocationCache::new(Duration::from_secs(3600)));
        cache.insert("revoked-jti", SystemTime::now() + Duration::from_secs(3600));
        let store = CachedStore::new(cache.clone());

        assert!(store.is_revoked("revoked-jti").await.unwrap());
        assert!(!store.is_revoked("other-jti").await.unwrap());
        cache.stop();
    }

    #[tokio::test]
    async fn test_cached_store_never_fails() {
        let cache = Arc::new(RevocationCache::new(Duration::from_secs(3600)));
        let store = CachedStore::new(cache.clone());

        for jti in ["", "x", "very-long-identifier-that-was-never-inserted"] {
            assert!(store.is_revoked(jti).await.is_ok());
        }
        cache.stop();
    }
}
