#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-cache** – Two-tier cache of validation results.
//!
//! The local tier is a bounded LRU keyed by request fingerprint with caps in
//! entries and bytes; entries accessed often enough within a sliding window
//! are promoted to a pinned "hot" set that eviction never touches. The remote
//! tier is any key/value service offering get, set-with-TTL, delete, and
//! pattern delete. Remote operations are wrapped in a short bounded timeout;
//! when the remote tier errors or times out the cache degrades to local-only
//! and keeps serving.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use tracing::{debug, warn};

use lighthouse_types::{CacheLayer, ValidationResult};

//─────────────────────────────
//  Local tier
//─────────────────────────────

/// Sizing and promotion knobs for the local tier.
#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    /// Maximum resident entries (hot set included).
    pub max_entries: usize,
    /// Maximum resident bytes across all entries.
    pub max_bytes: usize,
    /// Accesses within the window required to pin an entry.
    pub hot_entry_threshold: u32,
    /// Sliding window over which accesses are counted.
    pub hot_window: Duration,
    /// Maximum pinned entries.
    pub hot_quota: usize,
    /// Lifetime of a local entry.
    pub ttl: Duration,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            hot_entry_threshold: 3,
            hot_window: Duration::from_secs(60),
            hot_quota: 256,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    result: ValidationResult,
    expires_at: Instant,
    size_bytes: usize,
    window_start: Instant,
    window_hits: u32,
}

impl Entry {
    fn new(result: ValidationResult, ttl: Duration) -> Self {
        let size_bytes = serde_json::to_vec(&result).map(|v| v.len()).unwrap_or(0);
        Self {
            result,
            expires_at: Instant::now() + ttl,
            size_bytes,
            window_start: Instant::now(),
            window_hits: 0,
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug)]
struct LocalState {
    lru: LruCache<String, Entry>,
    hot: HashMap<String, Entry>,
    bytes: usize,
}

/// Bounded LRU map of fingerprint → result with hot-entry pinning.
#[derive(Debug)]
pub struct LocalCache {
    config: LocalCacheConfig,
    state: Mutex<LocalState>,
    evictions: AtomicU64,
}

impl LocalCache {
    /// Create an empty local tier.
    pub fn new(config: LocalCacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            config,
            state: Mutex::new(LocalState {
                lru: LruCache::new(cap),
                hot: HashMap::new(),
                bytes: 0,
            }),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fetch an entry, counting the access toward hot promotion.
    pub fn get(&self, key: &str) -> Option<ValidationResult> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let hot_outcome = state.hot.get(key).map(|entry| {
            if entry.expired() {
                None
            } else {
                Some(entry.result.clone())
            }
        });
        if let Some(outcome) = hot_outcome {
            if outcome.is_none() {
                if let Some(dropped) = state.hot.remove(key) {
                    state.bytes = state.bytes.saturating_sub(dropped.size_bytes);
                }
            }
            return outcome;
        }

        let promote = {
            let entry = state.lru.get_mut(key)?;
            if entry.expired() {
                None
            } else {
                let now = Instant::now();
                if now.duration_since(entry.window_start) > self.config.hot_window {
                    entry.window_start = now;
                    entry.window_hits = 0;
                }
                entry.window_hits += 1;
                Some(entry.window_hits >= self.config.hot_entry_threshold)
            }
        };

        match promote {
            None => {
                if let Some(dropped) = state.lru.pop(key) {
                    state.bytes = state.bytes.saturating_sub(dropped.size_bytes);
                }
                None
            }
            Some(promote) => {
                if promote && state.hot.len() < self.config.hot_quota {
                    if let Some(entry) = state.lru.pop(key) {
                        debug!(key, "cache entry pinned as hot");
                        let result = entry.result.clone();
                        state.hot.insert(key.to_string(), entry);
                        return Some(result);
                    }
                }
                state.lru.peek(key).map(|e| e.result.clone())
            }
        }
    }

    /// Insert (or replace) an entry.
    pub fn set(&self, key: &str, result: ValidationResult) {
        let entry = Entry::new(result, self.config.ttl);
        let entry_bytes = entry.size_bytes;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // A pinned entry is refreshed in place.
        if state.hot.contains_key(key) {
            if let Some(previous) = state.hot.insert(key.to_string(), entry) {
                state.bytes = state.bytes.saturating_sub(previous.size_bytes);
            }
            state.bytes += entry_bytes;
            return;
        }

        state.bytes += entry_bytes;
        if let Some((evicted_key, previous)) = state.lru.push(key.to_string(), entry) {
            state.bytes = state.bytes.saturating_sub(previous.size_bytes);
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Enforce both bounds; pinned entries are never evicted here.
        while state.bytes > self.config.max_bytes {
            match state.lru.pop_lru() {
                Some((_, dropped)) => {
                    state.bytes = state.bytes.saturating_sub(dropped.size_bytes);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    /// Drop entries whose key matches `pattern` (`prefix*` or exact).
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let matches = |key: &str| match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        };

        let hot_victims: Vec<String> =
            state.hot.keys().filter(|k| matches(k)).cloned().collect();
        let lru_victims: Vec<String> = state
            .lru
            .iter()
            .filter(|(k, _)| matches(k))
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = 0;
        for key in hot_victims {
            if let Some(entry) = state.hot.remove(&key) {
                state.bytes = state.bytes.saturating_sub(entry.size_bytes);
                removed += 1;
            }
        }
        for key in lru_victims {
            if let Some(entry) = state.lru.pop(&key) {
                state.bytes = state.bytes.saturating_sub(entry.size_bytes);
                removed += 1;
            }
        }
        removed
    }

    /// Number of resident entries, hot set included.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.lru.len() + state.hot.len()
    }

    /// Whether the tier is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pinned entries.
    pub fn hot_entries(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .hot
            .len()
    }

    /// Entries evicted so far.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

//─────────────────────────────
//  Remote tier
//─────────────────────────────

/// Contract for the network KV tier.
///
/// Any implementation offering these four operations suffices; results are
/// stored as JSON strings keyed by request fingerprint.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Fetch the value at `key`, if present and unexpired.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    /// Store `value` at `key` with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    /// Remove `key`.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Remove every key matching `pattern` (`prefix*` or exact).
    async fn delete_pattern(&self, pattern: &str) -> anyhow::Result<()>;
}

/// In-process [`RemoteCache`] for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryRemoteCache {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryRemoteCache {
    /// An empty remote tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, expired entries included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tier is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RemoteCache for InMemoryRemoteCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        match self.entries.get(key) {
            Some(entry) if Instant::now() < entry.1 => Ok(Some(entry.0.clone())),
            Some(_) => {
                drop(self.entries.remove(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> anyhow::Result<()> {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.entries.retain(|k, _| !k.starts_with(prefix)),
            None => {
                self.entries.remove(pattern);
            }
        }
        Ok(())
    }
}

//─────────────────────────────
//  Tiered cache
//─────────────────────────────

/// Hit/miss counters for the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Hits served by the local tier.
    pub local_hits: u64,
    /// Hits served by the remote tier.
    pub remote_hits: u64,
    /// Lookups that missed both tiers.
    pub misses: u64,
    /// Local evictions.
    pub evictions: u64,
    /// Currently pinned entries.
    pub hot_entries: u64,
    /// Remote operations that errored or timed out.
    pub remote_errors: u64,
}

impl CacheStats {
    /// Fraction of lookups served from either tier.
    pub fn hit_rate(&self) -> f64 {
        let total = self.local_hits + self.remote_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.local_hits + self.remote_hits) as f64 / total as f64
        }
    }
}

/// Local LRU in front of an optional remote KV tier.
pub struct TieredCache {
    local: LocalCache,
    remote: Option<std::sync::Arc<dyn RemoteCache>>,
    remote_ttl: Duration,
    op_timeout: Duration,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    remote_errors: AtomicU64,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("local_entries", &self.local.len())
            .field("has_remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

impl TieredCache {
    /// Build a cache; pass `None` for a local-only deployment.
    pub fn new(
        local_config: LocalCacheConfig,
        remote: Option<std::sync::Arc<dyn RemoteCache>>,
        remote_ttl: Duration,
        op_timeout: Duration,
    ) -> Self {
        Self {
            local: LocalCache::new(local_config),
            remote,
            remote_ttl,
            op_timeout,
            local_hits: AtomicU64::new(0),
            remote_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            remote_errors: AtomicU64::new(0),
        }
    }

    /// Look up `key`, checking local then remote. A remote hit populates the
    /// local tier. The returned result's `cache_layer` names the serving
    /// tier.
    pub async fn get(&self, key: &str) -> Option<ValidationResult> {
        if let Some(mut result) = self.local.get(key) {
            self.local_hits.fetch_add(1, Ordering::Relaxed);
            result.cache_hit = true;
            result.cache_layer = CacheLayer::Local;
            return Some(result);
        }

        if let Some(remote) = &self.remote {
            match tokio::time::timeout(self.op_timeout, remote.get(key)).await {
                Ok(Ok(Some(raw))) => match serde_json::from_str::<ValidationResult>(&raw) {
                    Ok(mut result) => {
                        self.remote_hits.fetch_add(1, Ordering::Relaxed);
                        self.local.set(key, result.clone());
                        result.cache_hit = true;
                        result.cache_layer = CacheLayer::Remote;
                        return Some(result);
                    }
                    Err(e) => {
                        self.remote_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(key, error = %e, "undecodable remote cache entry ignored");
                    }
                },
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    self.remote_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "remote cache get failed; serving local-only");
                }
                Err(_) => {
                    self.remote_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("remote cache get timed out; serving local-only");
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a result in the local tier and, best-effort, the remote tier.
    pub async fn set(&self, key: &str, result: &ValidationResult) {
        self.local.set(key, result.clone());

        if let Some(remote) = &self.remote {
            let Ok(raw) = serde_json::to_string(result) else {
                return;
            };
            match tokio::time::timeout(self.op_timeout, remote.set(key, &raw, self.remote_ttl))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.remote_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "remote cache set failed");
                }
                Err(_) => {
                    self.remote_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("remote cache set timed out");
                }
            }
        }
    }

    /// Invalidate matching entries in both tiers.
    pub async fn invalidate(&self, pattern: &str) {
        let removed = self.local.invalidate(pattern);
        debug!(pattern, removed, "local cache invalidated");

        if let Some(remote) = &self.remote {
            match tokio::time::timeout(self.op_timeout, remote.delete_pattern(pattern)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.remote_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "remote cache invalidation failed");
                }
                Err(_) => {
                    self.remote_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("remote cache invalidation timed out");
                }
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.local.evictions(),
            hot_entries: self.local.hot_entries() as u64,
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lighthouse_types::{Confidence, Decision};
    use std::sync::Arc;

    fn result(request_id: &str, decision: Decision) -> ValidationResult {
        ValidationResult::new(request_id, decision, Confidence::High, "test")
    }

    fn local_config() -> LocalCacheConfig {
        LocalCacheConfig {
            max_entries: 4,
            max_bytes: 1024 * 1024,
            hot_entry_threshold: 2,
            hot_window: Duration::from_secs(60),
            hot_quota: 2,
            ttl: Duration::from_secs(60),
        }
    }

    #[test]
    fn local_lru_evicts_oldest() {
        let cache = LocalCache::new(local_config());
        for n in 0..6 {
            cache.set(&format!("key-{n}"), result(&format!("r{n}"), Decision::Approved));
        }
        assert!(cache.len() <= 4);
        assert!(cache.get("key-0").is_none());
        assert!(cache.get("key-5").is_some());
    }

    #[test]
    fn hot_entries_survive_eviction_pressure() {
        let cache = LocalCache::new(local_config());
        cache.set("hot-key", result("r", Decision::Approved));
        // Two accesses within the window pin the entry.
        cache.get("hot-key");
        cache.get("hot-key");
        assert_eq!(cache.hot_entries(), 1);

        for n in 0..10 {
            cache.set(&format!("filler-{n}"), result("r", Decision::Approved));
        }
        assert!(cache.get("hot-key").is_some());
    }

    #[test]
    fn local_ttl_expires_entries() {
        let mut config = local_config();
        config.ttl = Duration::from_millis(0);
        let cache = LocalCache::new(config);
        cache.set("key", result("r", Decision::Approved));
        assert!(cache.get("key").is_none());
    }

    #[test]
    fn invalidate_by_prefix() {
        let cache = LocalCache::new(local_config());
        cache.set("bash:1", result("r", Decision::Approved));
        cache.set("bash:2", result("r", Decision::Approved));
        cache.set("read:1", result("r", Decision::Approved));
        assert_eq!(cache.invalidate("bash:*"), 2);
        assert!(cache.get("bash:1").is_none());
        assert!(cache.get("read:1").is_some());
    }

    #[tokio::test]
    async fn tiered_get_promotes_remote_hits() {
        let remote = Arc::new(InMemoryRemoteCache::new());
        let cache = TieredCache::new(
            local_config(),
            Some(remote.clone()),
            Duration::from_secs(60),
            Duration::from_millis(50),
        );

        let stored = result("r1", Decision::Blocked);
        remote
            .set("key", &serde_json::to_string(&stored).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        let first = cache.get("key").await.unwrap();
        assert_eq!(first.cache_layer, CacheLayer::Remote);
        assert_eq!(first.decision, Decision::Blocked);
        assert!(first.cache_hit);

        // Second lookup is served locally.
        let second = cache.get("key").await.unwrap();
        assert_eq!(second.cache_layer, CacheLayer::Local);

        let stats = cache.stats();
        assert_eq!(stats.remote_hits, 1);
        assert_eq!(stats.local_hits, 1);
    }

    #[tokio::test]
    async fn tiered_set_writes_both_tiers() {
        let remote = Arc::new(InMemoryRemoteCache::new());
        let cache = TieredCache::new(
            local_config(),
            Some(remote.clone()),
            Duration::from_secs(60),
            Duration::from_millis(50),
        );
        cache.set("key", &result("r1", Decision::Approved)).await;
        assert!(remote.get("key").await.unwrap().is_some());
        assert!(cache.get("key").await.is_some());
    }

    struct FailingRemote;

    #[async_trait]
    impl RemoteCache for FailingRemote {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("connection refused")
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn delete(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn delete_pattern(&self, _pattern: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn degrades_to_local_when_remote_fails() {
        let cache = TieredCache::new(
            local_config(),
            Some(Arc::new(FailingRemote)),
            Duration::from_secs(60),
            Duration::from_millis(50),
        );

        cache.set("key", &result("r1", Decision::Approved)).await;
        let hit = cache.get("key").await.unwrap();
        assert_eq!(hit.cache_layer, CacheLayer::Local);

        let stats = cache.stats();
        assert!(stats.remote_errors >= 1);
        assert_eq!(stats.local_hits, 1);
    }

    struct HangingRemote;

    #[async_trait]
    impl RemoteCache for HangingRemote {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
        async fn delete(&self, _key: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete_pattern(&self, _pattern: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn remote_ops_are_time_bounded() {
        let cache = TieredCache::new(
            local_config(),
            Some(Arc::new(HangingRemote)),
            Duration::from_secs(60),
            Duration::from_millis(100),
        );
        // The bounded timeout fires rather than hanging the caller.
        assert!(cache.get("key").await.is_none());
        assert!(cache.stats().remote_errors >= 1);
    }

    #[tokio::test]
    async fn stats_hit_rate() {
        let cache = TieredCache::new(
            local_config(),
            None,
            Duration::from_secs(60),
            Duration::from_millis(50),
        );
        cache.set("key", &result("r1", Decision::Approved)).await;
        cache.get("key").await;
        cache.get("absent").await;
        let stats = cache.stats();
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
