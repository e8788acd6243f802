//! Authentication result caching with LRU eviction and TTL
//!
//! Maps a raw token string to the result of a completed validation so that
//! repeated requests with the same token skip signature checks and remote
//! calls. Only fully validated results are ever inserted, and an entry never
//! outlives the `exp` of the token it was built from.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AuthCacheConfig;
use crate::gateway::context::AuthenticationResult;

/// Thread-safe, bounded authentication cache
pub struct AuthenticationCache {
    /// Entries keyed by raw token, least recently used evicted first
    entries: Mutex<LruCache<String, CacheEntry>>,
    /// Time-to-live per entry
    ttl: Duration,
    /// When false every lookup misses and nothing is stored
    enabled: bool,
    /// Cache statistics
    stats: CacheStats,
}

struct CacheEntry {
    result: AuthenticationResult,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Lookups served from the cache
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that found nothing usable
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries dropped for capacity or expiry
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit rate in `0.0..=1.0`
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Point-in-time copy of the statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Hits
    pub hits: u64,
    /// Misses
    pub misses: u64,
    /// Evictions
    pub evictions: u64,
    /// Current entry count
    pub size: usize,
    /// Hit rate
    pub hit_rate: f64,
}

impl AuthenticationCache {
    /// Create an enabled cache holding at most `capacity` entries for `ttl` each
    #[must_use]
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            enabled: true,
            stats: CacheStats::default(),
        }
    }

    /// Create a cache from configuration
    #[must_use]
    pub fn from_config(config: &AuthCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            enabled: config.enabled,
            ..Self::new(capacity, config.ttl)
        }
    }

    /// A cache that never stores anything
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(NonZeroUsize::MIN, Duration::ZERO)
        }
    }

    /// Look up a token. Expired entries are removed and reported as absent.
    pub fn get(&self, token: &str) -> Option<AuthenticationResult> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock();
        let lookup = entries
            .get(token)
            .map(|entry| (!entry.is_expired()).then(|| entry.result.clone()));
        match lookup {
            Some(Some(result)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            Some(None) => {
                entries.pop(token);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a validated result. A later put for the same token replaces it.
    ///
    /// The entry lives for the TTL or until the token's `exp`, whichever
    /// comes first. Already expired tokens are not stored.
    pub fn put(&self, token: &str, result: AuthenticationResult) {
        if !self.enabled {
            return;
        }
        let lifetime = result
            .principal
            .claims
            .remaining_lifetime()
            .map_or(self.ttl, |left| left.min(self.ttl));
        if lifetime.is_zero() {
            return;
        }
        let entry = CacheEntry {
            result,
            expires_at: Instant::now() + lifetime,
        };
        let displaced = self.entries.lock().push(token.to_string(), entry);
        if displaced.is_some_and(|(key, _)| key != token) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove a token. Returns whether an entry was present.
    pub fn invalidate(&self, token: &str) -> bool {
        self.entries.lock().pop(token).is_some()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, including ones not yet found expired
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the cache stores anything at all
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            size: self.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }
}

impl std::fmt::Debug for AuthenticationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationCache")
            .field("enabled", &self.enabled)
            .field("ttl", &self.ttl)
            .field("size", &self.len())
            .finish_non_exhaustive()
    }
}
