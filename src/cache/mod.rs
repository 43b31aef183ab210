//! Search-result cache.
//!
//! Maps query fingerprints to result snapshots with a TTL and a bounded LRU.
//! Concurrent callers of the same fingerprint share one in-flight build
//! (single-flight); a build failure propagates to every waiter and is not
//! cached. Post-commit index events evict entries touching the mutated
//! partition.

use crate::core::error::{GrepWiseError, Result};
use crate::core::types::PartitionKey;
use crate::events::IndexEvent;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

type BuildOutcome<V> = std::result::Result<V, Arc<GrepWiseError>>;

struct CacheEntry<V> {
    value: V,
    partitions: Arc<Vec<PartitionKey>>,
    created_at: Instant,
}

struct CacheState<V> {
    map: LruCache<String, CacheEntry<V>>,
    inflight: HashMap<String, watch::Receiver<Option<BuildOutcome<V>>>>,
}

enum CacheLookup<V> {
    Hit(V),
    Wait(watch::Receiver<Option<BuildOutcome<V>>>),
    Lead(watch::Sender<Option<BuildOutcome<V>>>),
}

/// Cache statistics for the health endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct SearchCache<V> {
    state: Mutex<CacheState<V>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> SearchCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            state: Mutex::new(CacheState {
                map: LruCache::new(capacity),
                inflight: HashMap::new(),
            }),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Synchronous lookup/registration step, kept entirely lock-scoped so no
    /// `MutexGuard` is ever live across an `.await` point.
    fn lookup_or_register(&self, fingerprint: &str) -> CacheLookup<V> {
        let mut state = self.state.lock();
        if let Some(entry) = state.map.get(fingerprint) {
            if entry.created_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Hit(entry.value.clone());
            }
            state.map.pop(fingerprint);
        }
        if let Some(rx) = state.inflight.get(fingerprint) {
            CacheLookup::Wait(rx.clone())
        } else {
            let (tx, rx) = watch::channel(None);
            state.inflight.insert(fingerprint.to_string(), rx);
            CacheLookup::Lead(tx)
        }
    }

    /// Look up `fingerprint`, building the value at most once across
    /// concurrent callers. `partitions` is the set of partitions the value
    /// was computed from, used for event-driven eviction.
    pub async fn get_or_build<F, Fut>(
        &self,
        fingerprint: &str,
        partitions: Vec<PartitionKey>,
        build: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut rx = match self.lookup_or_register(fingerprint) {
            CacheLookup::Hit(value) => return Ok(value),
            CacheLookup::Lead(tx) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return self.lead_build(fingerprint, partitions, build, tx).await;
            }
            CacheLookup::Wait(rx) => rx,
        };

        // Another caller is building this fingerprint; share its outcome.
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return outcome.map_err(|e| share_error(&e));
            }
            if rx.changed().await.is_err() {
                // Leader dropped without publishing; rebuild from scratch.
                return Err(GrepWiseError::unexpected("cache build abandoned"));
            }
        }
    }

    async fn lead_build<F, Fut>(
        &self,
        fingerprint: &str,
        partitions: Vec<PartitionKey>,
        build: F,
        tx: watch::Sender<Option<BuildOutcome<V>>>,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let result = build().await;
        let outcome: BuildOutcome<V> = match &result {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err(Arc::new(share_error(e))),
        };

        let mut state = self.state.lock();
        state.inflight.remove(fingerprint);
        if let Ok(value) = &outcome {
            state.map.put(
                fingerprint.to_string(),
                CacheEntry {
                    value: value.clone(),
                    partitions: Arc::new(partitions),
                    created_at: Instant::now(),
                },
            );
        }
        drop(state);

        let _ = tx.send(Some(outcome));
        result
    }

    /// Drop every cached result computed over the given partition.
    pub fn invalidate_partition(&self, partition: &PartitionKey) {
        let mut state = self.state.lock();
        let stale: Vec<String> = state
            .map
            .iter()
            .filter(|(_, entry)| entry.partitions.contains(partition))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            state.map.pop(&key);
        }
    }

    pub fn clear(&self) {
        self.state.lock().map.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.state.lock().map.len(),
        }
    }

    /// Consume index events, evicting affected entries. Runs until the bus
    /// closes.
    pub async fn run_invalidation(
        self: Arc<Self>,
        mut events: broadcast::Receiver<IndexEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) => self.invalidate_partition(event.partition()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "cache invalidation lagged; clearing cache");
                    self.clear();
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Reconstruct an error for sharing across single-flight waiters, keeping
/// the kind where it matters.
fn share_error(err: &GrepWiseError) -> GrepWiseError {
    match err {
        GrepWiseError::QuerySyntax { message } => GrepWiseError::QuerySyntax {
            message: message.clone(),
        },
        GrepWiseError::QueryTimeout { timeout_ms } => GrepWiseError::QueryTimeout {
            timeout_ms: *timeout_ms,
        },
        GrepWiseError::PartitionUnavailable(k) => GrepWiseError::PartitionUnavailable(k.clone()),
        GrepWiseError::ArchiveUnavailable(k) => GrepWiseError::ArchiveUnavailable(k.clone()),
        GrepWiseError::IndexCorrupt(m) => GrepWiseError::IndexCorrupt(m.clone()),
        GrepWiseError::IndexIo(m) => GrepWiseError::IndexIo(m.clone()),
        other => GrepWiseError::unexpected(other.to_string()),
    }
}
