//! Size-bounded cache of compressed response bodies
//!
//! Entries are evicted in insertion order (oldest first) once the total
//! byte size exceeds the configured limit. A periodic sweep recomputes the
//! content fingerprint of every backing file and drops entries whose file
//! changed, vanished, or outlived the time-to-live.

use crate::compression::{self, Gzip};
use crate::negotiate;
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache shared by the request handler and the sweep task of one worker.
/// The lock is never held across an await point.
pub type SharedCache = Arc<Mutex<ObjectCache>>;

/// A compressed response ready to be written out. Immutable once built.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    pub headers: Vec<(String, String)>,
    pub compressed_body: Bytes,
    pub size: u64,
    pub fingerprint: String,
    /// File the body was read from; re-hashed by the sweep
    pub source: PathBuf,
    pub inserted_at: Instant,
}

impl CacheEntry {
    /// Compress `raw` and attach Content-Encoding and ETag to `headers`.
    pub fn build(
        key: &str,
        source: PathBuf,
        raw: &[u8],
        mut headers: Vec<(String, String)>,
        gzip: &Gzip,
    ) -> std::io::Result<Self> {
        let fingerprint = negotiate::fingerprint(raw);
        let compressed_body = gzip.compress(raw)?;

        headers.retain(|(name, _)| {
            !name.eq_ignore_ascii_case("content-encoding") && !name.eq_ignore_ascii_case("etag")
        });
        headers.push(("Content-Encoding".to_string(), compression::ENCODING.to_string()));
        headers.push(("ETag".to_string(), negotiate::etag(&fingerprint)));

        let header_bytes: usize = headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        let size = (compressed_body.len() + header_bytes) as u64;

        Ok(Self {
            key: key.to_string(),
            headers,
            compressed_body,
            size,
            fingerprint,
            source,
            inserted_at: Instant::now(),
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn etag(&self) -> String {
        negotiate::etag(&self.fingerprint)
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header("Last-Modified")
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub max_size: u64,
    pub ttl: Option<Duration>,
    pub gzip: Gzip,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_size: crate::config::DEFAULT_MAX_CACHE_SIZE,
            ttl: Some(Duration::from_secs(crate::config::DEFAULT_CACHE_TTL_SECS)),
            gzip: Gzip::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    entry: Arc<CacheEntry>,
}

#[derive(Debug)]
pub struct ObjectCache {
    entries: FxHashMap<String, Slot>,
    // insertion sequence -> key; the first element is the eviction victim
    order: BTreeMap<u64, String>,
    next_seq: u64,
    total_size: u64,
    options: CacheOptions,
    counters: Counters,
}

impl ObjectCache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            entries: FxHashMap::default(),
            order: BTreeMap::new(),
            next_seq: 0,
            total_size: 0,
            options,
            counters: Counters::default(),
        }
    }

    pub fn shared(options: CacheOptions) -> SharedCache {
        Arc::new(Mutex::new(Self::new(options)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn max_size(&self) -> u64 {
        self.options.max_size
    }

    pub fn gzip(&self) -> &Gzip {
        &self.options.gzip
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.options
            .ttl
            .map_or(false, |ttl| entry.inserted_at.elapsed() > ttl)
    }

    /// Look up `key`. Expired entries read as absent.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        match self.entries.get(key) {
            Some(slot) if !self.is_expired(&slot.entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for key: {}", key);
                Some(Arc::clone(&slot.entry))
            }
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache miss for key: {}", key);
                None
            }
        }
    }

    /// Compress `raw` and store it under `key`, replacing any previous
    /// entry. The built entry is returned even when it is too large to be
    /// kept.
    pub fn put(
        &mut self,
        key: &str,
        source: PathBuf,
        raw: &[u8],
        headers: Vec<(String, String)>,
    ) -> std::io::Result<Arc<CacheEntry>> {
        let entry = Arc::new(CacheEntry::build(key, source, raw, headers, &self.options.gzip)?);
        self.insert(Arc::clone(&entry));
        Ok(entry)
    }

    /// Store a prebuilt entry. A replacement counts as a fresh insertion
    /// and moves to the back of the eviction order.
    pub fn insert(&mut self, entry: Arc<CacheEntry>) {
        self.remove(&entry.key);

        if entry.size > self.options.max_size {
            debug!(
                "Entry for key {} ({} bytes) exceeds cache capacity, not cached",
                entry.key, entry.size
            );
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.total_size += entry.size;
        self.order.insert(seq, entry.key.clone());
        debug!("Cache set for key: {}", entry.key);
        self.entries.insert(entry.key.clone(), Slot { seq, entry });
        self.counters.insertions.fetch_add(1, Ordering::Relaxed);

        self.evict();
    }

    fn remove(&mut self, key: &str) -> Option<Arc<CacheEntry>> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        self.total_size -= slot.entry.size;
        Some(slot.entry)
    }

    /// Drop `key` if present. Absent keys are ignored.
    pub fn invalidate(&mut self, key: &str) {
        if self.remove(key).is_some() {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!("Cache invalidated for key: {}", key);
        }
    }

    /// Drop `key` only while it still carries `fingerprint`, so a sweep
    /// never removes an entry that was refreshed after it was inspected.
    pub fn invalidate_if(&mut self, key: &str, fingerprint: &str) -> bool {
        let current = self
            .entries
            .get(key)
            .map_or(false, |slot| slot.entry.fingerprint == fingerprint);
        if current {
            self.invalidate(key);
        }
        current
    }

    /// Remove the oldest entries until the total size fits the limit.
    /// Returns how many entries were evicted.
    pub fn evict(&mut self) -> usize {
        let mut evicted = 0;
        while self.total_size > self.options.max_size {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&key) {
                self.total_size -= slot.entry.size;
                evicted += 1;
                debug!("Cache evicted key: {}", key);
            }
        }
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Remove every expired entry.
    pub fn purge_expired(&mut self) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|slot| self.is_expired(&slot.entry))
            .map(|slot| slot.entry.key.clone())
            .collect();
        for key in &expired {
            self.invalidate(key);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        let removed = self.entries.len() as u64;
        self.entries.clear();
        self.order.clear();
        self.total_size = 0;
        self.counters
            .invalidations
            .fetch_add(removed, Ordering::Relaxed);
    }

    /// Keys and sizes, oldest first.
    pub fn list(&self) -> Vec<(String, u64)> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key))
            .map(|slot| (slot.entry.key.clone(), slot.entry.size))
            .collect()
    }

    /// Entries to re-check during a sweep: key, backing file, fingerprint.
    pub fn sweep_candidates(&self) -> Vec<(String, PathBuf, String)> {
        self.entries
            .values()
            .map(|slot| {
                (
                    slot.entry.key.clone(),
                    slot.entry.source.clone(),
                    slot.entry.fingerprint.clone(),
                )
            })
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            total_size: self.total_size,
            max_size: self.options.max_size,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one staleness sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub expired: usize,
    pub stale: usize,
}

/// Re-hash every cached file and invalidate entries whose content changed
/// or whose file can no longer be read. Runs as an ordinary task on the
/// worker's run-loop; the lock is released while files are hashed.
pub async fn sweep(cache: &SharedCache) -> SweepReport {
    let (expired, candidates) = {
        let mut cache = cache.lock();
        let expired = cache.purge_expired();
        (expired, cache.sweep_candidates())
    };

    let mut report = SweepReport {
        checked: candidates.len(),
        expired,
        stale: 0,
    };

    for (key, source, fingerprint) in candidates {
        let changed = match negotiate::fingerprint_file(&source).await {
            Ok(current) => current != fingerprint,
            Err(e) => {
                debug!("Error checking cache for key {}: {}", key, e);
                true
            }
        };
        if changed && cache.lock().invalidate_if(&key, &fingerprint) {
            report.stale += 1;
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_limit(max_size: u64) -> ObjectCache {
        ObjectCache::new(CacheOptions {
            max_size,
            ttl: None,
            gzip: Gzip::default(),
        })
    }

    fn put(cache: &mut ObjectCache, key: &str, body: &[u8]) -> Arc<CacheEntry> {
        cache
            .put(key, PathBuf::from(key), body, Vec::new())
            .unwrap()
    }

    fn sum_of_sizes(cache: &ObjectCache) -> u64 {
        cache.list().iter().map(|(_, size)| size).sum()
    }

    #[test]
    fn test_put_and_get() {
        let mut cache = cache_with_limit(1 << 20);
        let entry = put(&mut cache, "/a.txt", b"alpha");
        assert_eq!(entry.header("Content-Encoding"), Some("gzip"));
        assert_eq!(entry.header("etag"), Some(entry.etag().as_str()));

        let hit = cache.get("/a.txt").unwrap();
        assert_eq!(hit.fingerprint, negotiate::fingerprint(b"alpha"));
        assert!(cache.get("/b.txt").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_total_size_tracks_entries() {
        let mut cache = cache_with_limit(1 << 20);
        put(&mut cache, "/a", b"aaaa");
        put(&mut cache, "/b", b"bbbbbbbbbbbb");
        put(&mut cache, "/a", b"a replacement that is longer");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_size(), sum_of_sizes(&cache));

        cache.invalidate("/b");
        assert_eq!(cache.total_size(), sum_of_sizes(&cache));
    }

    #[test]
    fn test_fifo_eviction_removes_oldest() {
        let probe = CacheEntry::build("/x", PathBuf::new(), b"same", Vec::new(), &Gzip::default())
            .unwrap();
        // Room for exactly three entries of equal size.
        let mut cache = cache_with_limit(probe.size * 3);
        put(&mut cache, "/a", b"same");
        put(&mut cache, "/b", b"same");
        put(&mut cache, "/c", b"same");
        assert_eq!(cache.len(), 3);

        // Reading A does not protect it: eviction is by insertion order.
        assert!(cache.get("/a").is_some());
        put(&mut cache, "/d", b"same");

        assert!(cache.get("/a").is_none());
        assert!(cache.get("/b").is_some());
        assert!(cache.get("/c").is_some());
        assert!(cache.get("/d").is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.total_size() <= cache.max_size());
    }

    #[test]
    fn test_size_invariant_under_pressure() {
        let mut cache = cache_with_limit(400);
        for i in 0..50 {
            let body = vec![b'x'; i * 7];
            put(&mut cache, &format!("/f{}", i % 9), &body);
            assert!(cache.total_size() <= 400);
            assert_eq!(cache.total_size(), sum_of_sizes(&cache));
        }
    }

    #[test]
    fn test_oversized_entry_not_cached() {
        let mut cache = cache_with_limit(10);
        let entry = put(&mut cache, "/big", b"far more than ten bytes once headers count");
        assert!(entry.size > 10);
        assert!(cache.is_empty());
        assert_eq!(cache.total_size(), 0);
    }

    #[test]
    fn test_invalidate_absent_is_noop() {
        let mut cache = cache_with_limit(1 << 20);
        put(&mut cache, "/a", b"a");
        let before = cache.stats();
        cache.invalidate("/missing");
        assert_eq!(cache.stats(), before);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_if_respects_refresh() {
        let mut cache = cache_with_limit(1 << 20);
        let old = put(&mut cache, "/a", b"v1");
        put(&mut cache, "/a", b"v2");
        assert!(!cache.invalidate_if("/a", &old.fingerprint));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let mut cache = ObjectCache::new(CacheOptions {
            max_size: 1 << 20,
            ttl: Some(Duration::ZERO),
            gzip: Gzip::default(),
        });
        put(&mut cache, "/a", b"a");
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("/a").is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.total_size(), 0);
    }

    #[test]
    fn test_clear_and_list_order() {
        let mut cache = cache_with_limit(1 << 20);
        put(&mut cache, "/one", b"1");
        put(&mut cache, "/two", b"2");
        put(&mut cache, "/three", b"3");
        let keys: Vec<String> = cache.list().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["/one", "/two", "/three"]);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_size(), 0);
        assert!(cache.list().is_empty());
    }
}
