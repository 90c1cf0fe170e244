//! One-shot revocation cache bootstrap
//!
//! Before the decision pipeline accepts traffic, the cache is seeded from
//! the authoritative key-value store: a cursor scan over `revoked:*` keys,
//! with each key's remaining TTL turned into an absolute expiry. A failed
//! scan is fatal to startup; individual keys without a usable TTL are
//! skipped.

use std::time::{Duration, SystemTime};

use redis::aio::MultiplexedConnection;
use tracing::{info, warn};

use crate::cache::RevocationCache;
use crate::error::{AuthzError, Result};

/// Bootstrap parameters
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Key prefix marking revocation entries, e.g. `revoked:`
    pub key_prefix: String,
    /// SCAN page size hint
    pub page_size: usize,
    /// Overall deadline for the bootstrap
    pub deadline: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            key_prefix: "revoked:".to_string(),
            page_size: 1000,
            deadline: Duration::from_secs(30),
        }
    }
}

/// Seed the cache from the store, bounded by the configured deadline.
/// Returns the number of entries loaded.
pub async fn seed_cache(
    conn: MultiplexedConnection,
    config: &BootstrapConfig,
    cache: &RevocationCache,
) -> Result<usize> {
    match tokio::time::timeout(config.deadline, scan_into_cache(conn, config, cache)).await {
        Ok(result) => result,
        Err(_) => Err(AuthzError::bootstrap(format!(
            "did not complete within {:?}",
            config.deadline
        ))),
    }
}

async fn scan_into_cache(
    mut conn: MultiplexedConnection,
    config: &BootstrapConfig,
    cache: &RevocationCache,
) -> Result<usize> {
    let pattern = format!("{}*", config.key_prefix);
    let mut cursor: u64 = 0;
    let mut loaded = 0usize;
    let mut skipped = 0usize;

    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(config.page_size)
            .query_async(&mut conn)
            .await?;

        let now = SystemTime::now();
        let mut batch = Vec::with_capacity(keys.len());
        for key in keys {
            let ttl: i64 = match redis::cmd("TTL").arg(&key).query_async(&mut conn).await {
                Ok(ttl) => ttl,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping key without readable ttl");
                    skipped += 1;
                    continue;
                }
            };
            match entry_from_key(&key, &config.key_prefix, ttl, now) {
                Some(entry) => batch.push(entry),
                None => skipped += 1,
            }
        }

        loaded += cache.bulk_insert(batch);

        cursor = next;
        if cursor == 0 {
            break;
        }
    }

    info!(loaded, skipped, "revocation cache bootstrap complete");
    Ok(loaded)
}

/// Turn a scanned key and its remaining TTL into a cache entry.
/// Returns `None` for keys that are already expired or carry no TTL
/// (TTL returns -1 for persistent keys, -2 for missing ones).
fn entry_from_key(
    key: &str,
    prefix: &str,
    remaining_ttl: i64,
    now: SystemTime,
) -> Option<(String, SystemTime)> {
    if remaining_ttl <= 0 {
        return None;
    }
    let jti = key.strip_prefix(prefix)?;
    if jti.is_empty() {
        return None;
    }
    Some((
        jti.to_string(),
        now + Duration::from_secs(remaining_ttl as u64),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_key_strips_prefix_and_computes_expiry() {
        let now = SystemTime::now();
        let (jti, expires_at) = entry_from_key("revoked:abc-123", "revoked:", 600, now)
            .expect("live key should yield an entry");

        assert_eq!(jti, "abc-123");
        assert_eq!(expires_at, now + Duration::from_secs(600));
    }

    #[test]
    fn test_entry_from_key_skips_dead_ttls() {
        let now = SystemTime::now();
        // -2: key vanished between SCAN and TTL; -1: no TTL set; 0: expiring now
        assert!(entry_from_key("revoked:a", "revoked:", -2, now).is_none());
        assert!(entry_from_key("revoked:a", "revoked:", -1, now).is_none());
        assert!(entry_from_key("revoked:a", "revoked:", 0, now).is_none());
    }

    #[test]
    fn test_entry_from_key_rejects_foreign_or_bare_keys() {
        let now = SystemTime::now();
        assert!(entry_from_key("session:abc", "revoked:", 600, now).is_none());
        assert!(entry_from_key("revoked:", "revoked:", 600, now).is_none());
    }

    #[test]
    fn test_default_config() {
        let config = BootstrapConfig::default();
        assert_eq!(config.key_prefix, "revoked:");
        assert_eq!(config.page_size, 1000);
    }
}
