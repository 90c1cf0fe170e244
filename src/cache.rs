//! In-memory revocation cache
//!
//! A concurrent set of revoked credential identifiers with per-entry
//! expiry. Seeded once at startup from the authoritative store and kept
//! current by the event consumer; entries disappear lazily on lookup and
//! in bulk through a periodic sweep. Lookups are authoritative on their
//! own; the sweeper only reclaims memory for identifiers nobody queries.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics;

/// Concurrent revocation set with per-entry expiry
///
/// Thread-safe using DashMap for concurrent access from request tasks,
/// the event consumer, and the sweeper. Re-inserting an identifier
/// overwrites its expiry (last writer wins).
pub struct RevocationCache {
    entries: Arc<DashMap<String, SystemTime>>,
    shutdown: CancellationToken,
}

/// An entry is live when its expiry is a plausible wall-clock instant in
/// the future. A zeroed or type-confused record decodes to the epoch;
/// treat it as absent so it can never deny traffic forever.
fn is_live(expires_at: SystemTime, now: SystemTime) -> bool {
    expires_at > UNIX_EPOCH && expires_at > now
}

impl RevocationCache {
    /// Create a cache and start its background sweeper
    pub fn new(cleanup_interval: Duration) -> Self {
        let entries: Arc<DashMap<String, SystemTime>> = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        spawn_sweeper(entries.clone(), cleanup_interval, shutdown.clone());

        Self { entries, shutdown }
    }

    /// Check whether an identifier is currently revoked
    ///
    /// Expired and malformed entries are removed on sight and reported as
    /// not revoked.
    pub fn is_revoked(&self, jti: &str) -> bool {
        let now = SystemTime::now();
        let live = match self.entries.get(jti) {
            None => return false,
            Some(entry) => is_live(*entry.value(), now),
        };
        if !live {
            // Re-check under the shard lock so a concurrent re-insert with
            // a fresh expiry is not evicted.
            self.entries
                .remove_if(jti, |_, expires_at| !is_live(*expires_at, SystemTime::now()));
            return false;
        }
        true
    }

    /// Insert or overwrite a revocation entry
    ///
    /// An already-expired expiry clears any existing entry instead of
    /// storing a dead one.
    pub fn insert(&self, jti: impl Into<String>, expires_at: SystemTime) {
        let jti = jti.into();
        if is_live(expires_at, SystemTime::now()) {
            self.entries.insert(jti, expires_at);
        } else {
            self.entries.remove(&jti);
        }
    }

    /// Insert a batch of entries, returning how many were stored
    pub fn bulk_insert(&self, entries: impl IntoIterator<Item = (String, SystemTime)>) -> usize {
        let now = SystemTime::now();
        let mut stored = 0;
        for (jti, expires_at) in entries {
            if is_live(expires_at, now) {
                self.entries.insert(jti, expires_at);
                stored += 1;
            }
        }
        stored
    }

    /// Best-effort count of current entries (may be racy under writes)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache currently holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop the background sweeper. Queries remain legal afterwards;
    /// expired entries are still evicted lazily on lookup.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RevocationCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Periodically remove entries whose expiry has passed
fn spawn_sweeper(
    entries: Arc<DashMap<String, SystemTime>>,
    cleanup_interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(cleanup_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("revocation cache sweeper stopped");
                    return;
                }
                _ = tick.tick() => {
                    let before = entries.len();
                    let now = SystemTime::now();
                    entries.retain(|_, expires_at| is_live(*expires_at, now));
                    let after = entries.len();
                    if before != after {
                        info!(removed = before - after, remaining = after, "swept expired revocations");
                    }
                    metrics::set_cache_entries(after);
                }
            }
        }
    });
}
