//! Stale-while-revalidate response cache.
//!
//! Entries live in an LRU map with a per-entry TTL. Once the TTL has passed,
//! an entry is still served for `stale_window` more, and the first stale read
//! schedules a background refresh through the configured [`Refresher`]. Only
//! one refresh runs per key at a time. A failed refresh leaves the stale value
//! in place and is reported on the refresh error channel.

use crate::error::SyncError;
use crate::providers::TranslateOptions;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Texts up to this many characters get a readable structural key; longer
/// ones are hashed.
pub const SHORT_KEY_CHARS: usize = 64;

/// Derive the cache key for a translation request.
///
/// The text is trimmed first, so surrounding whitespace never splits
/// entries.
pub fn cache_key(text: &str, target_lang: &str, category: &str) -> String {
    let normalized = text.trim();
    let length = normalized.chars().count();

    if length <= SHORT_KEY_CHARS {
        return format!("s:{}:{}:{}:{}", length, normalized, target_lang, category);
    }

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0u8]);
    hasher.update(target_lang.as_bytes());
    hasher.update([0u8]);
    hasher.update(category.as_bytes());
    format!(
        "h:{}:{}:{}:{}",
        hex_digest(&hasher.finalize()),
        target_lang,
        category,
        length
    )
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
    /// How long past its TTL an entry may still be served
    pub stale_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(3600),
            stale_window: Duration::from_secs(3600),
        }
    }
}

/// What a background refresh needs to re-run the original translation.
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub options: TranslateOptions,
}

/// Re-runs the translation behind a stale entry. An error keeps the stale
/// value.
#[async_trait]
pub trait Refresher: Send + Sync {
    async fn refresh(&self, request: &RefreshRequest) -> Result<String, SyncError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    stored_at: Instant,
    ttl: Duration,
    refreshing: bool,
    refreshed_at: Option<DateTime<Utc>>,
    request: Option<RefreshRequest>,
}

/// A cache hit. `stale` is set when the value outlived its TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub value: String,
    pub stale: bool,
}

/// A background refresh that failed; the stale entry was kept.
#[derive(Debug)]
pub struct RefreshFailure {
    pub key: String,
    pub error: SyncError,
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub stored: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub evictions: u64,
    pub size: usize,
    /// hits / (hits + misses); stale hits count as hits
    pub hit_rate: f64,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    stored: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.stale_hits,
            &self.stored,
            &self.refreshes,
            &self.refresh_failures,
            &self.evictions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

struct CacheInner {
    entries: Mutex<LruCache<String, CacheEntry>>,
    counters: CacheCounters,
}

impl CacheInner {
    fn lock_entries(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ResponseCache {
    config: CacheConfig,
    inner: Arc<CacheInner>,
    refresher: Option<Arc<dyn Refresher>>,
    refresh_tx: UnboundedSender<RefreshFailure>,
    refresh_rx: Mutex<Option<UnboundedReceiver<RefreshFailure>>>,
    refresh_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        Self {
            config,
            inner: Arc::new(CacheInner {
                entries: Mutex::new(LruCache::new(capacity)),
                counters: CacheCounters::default(),
            }),
            refresher: None,
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            refresh_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Enable background refresh of stale entries.
    pub fn with_refresher(mut self, refresher: Arc<dyn Refresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, key: &str) -> Option<CacheHit> {
        let counters = &self.inner.counters;
        let mut entries = self.inner.lock_entries();

        let Some(entry) = entries.get_mut(key) else {
            CacheCounters::bump(&counters.misses);
            return None;
        };

        let age = entry.stored_at.elapsed();
        if age <= entry.ttl {
            CacheCounters::bump(&counters.hits);
            return Some(CacheHit {
                value: entry.value.clone(),
                stale: false,
            });
        }

        if age > entry.ttl + self.config.stale_window {
            entries.pop(key);
            CacheCounters::bump(&counters.evictions);
            CacheCounters::bump(&counters.misses);
            return None;
        }

        CacheCounters::bump(&counters.hits);
        CacheCounters::bump(&counters.stale_hits);
        let hit = CacheHit {
            value: entry.value.clone(),
            stale: true,
        };

        if !entry.refreshing {
            if let Some(request) = entry.request.clone() {
                if self.spawn_refresh(key, request) {
                    entry.refreshing = true;
                }
            }
        }

        Some(hit)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key.into(), value.into(), None);
    }

    /// Store a value together with the request that produced it, so the
    /// entry can be refreshed in the background once stale.
    pub fn set_with_request(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        request: RefreshRequest,
    ) {
        self.insert(key.into(), value.into(), Some(request));
    }

    fn insert(&self, key: String, value: String, request: Option<RefreshRequest>) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl: self.config.ttl,
            refreshing: false,
            refreshed_at: None,
            request,
        };

        let counters = &self.inner.counters;
        let evicted = self.inner.lock_entries().push(key.clone(), entry);
        CacheCounters::bump(&counters.stored);
        if matches!(evicted, Some((old_key, _)) if old_key != key) {
            CacheCounters::bump(&counters.evictions);
        }
    }

    /// When the entry under `key` was last refreshed in the background.
    pub fn refreshed_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock_entries()
            .peek(key)
            .and_then(|entry| entry.refreshed_at)
    }

    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and zero the statistics. Refreshes still in flight
    /// finish but find nothing to update.
    pub fn clear(&self) {
        self.inner.lock_entries().clear();
        self.inner.counters.reset();
    }

    pub fn get_stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            stale_hits: counters.stale_hits.load(Ordering::Relaxed),
            stored: counters.stored.load(Ordering::Relaxed),
            refreshes: counters.refreshes.load(Ordering::Relaxed),
            refresh_failures: counters.refresh_failures.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            size: self.len(),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    /// Receiver for failed background refreshes. Can be taken once.
    pub fn take_refresh_errors(&self) -> Option<UnboundedReceiver<RefreshFailure>> {
        self.refresh_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait for every refresh spawned so far to finish.
    pub async fn wait_for_refreshes(&self) {
        let handles = std::mem::take(&mut *self.lock_tasks());
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.refresh_tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a detached refresh. Returns false when there is nothing to run
    /// it with (no refresher, or no Tokio runtime on this thread).
    fn spawn_refresh(&self, key: &str, request: RefreshRequest) -> bool {
        let Some(refresher) = self.refresher.clone() else {
            return false;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key = %key, "No runtime available, skipping cache refresh");
            return false;
        };

        let inner = Arc::clone(&self.inner);
        let errors = self.refresh_tx.clone();
        let key = key.to_string();

        debug!(key = %key, "Refreshing stale cache entry");
        let handle = runtime.spawn(async move {
            let result = refresher.refresh(&request).await;

            let mut entries = inner.lock_entries();
            // Only touch the entry this refresh was started for; a `set` or
            // `clear` in the meantime wins.
            let entry = entries.peek_mut(&key).filter(|entry| entry.refreshing);

            match result {
                Ok(value) => {
                    if let Some(entry) = entry {
                        entry.value = value;
                        entry.stored_at = Instant::now();
                        entry.refreshed_at = Some(Utc::now());
                        entry.refreshing = false;
                        CacheCounters::bump(&inner.counters.refreshes);
                    }
                }
                Err(error) => {
                    if let Some(entry) = entry {
                        entry.refreshing = false;
                    }
                    drop(entries);
                    CacheCounters::bump(&inner.counters.refresh_failures);
                    warn!(
                        key = %key,
                        error = %error,
                        code = "cache_refresh_failed",
                        "Cache refresh failed"
                    );
                    let _ = errors.send(RefreshFailure { key, error });
                }
            }
        });

        let mut tasks = self.lock_tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        true
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        for task in self
            .refresh_tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}
