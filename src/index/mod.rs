//! Inverted-index engine with time-range partitions.
//!
//! The engine owns one [`PartitionHandle`] per hot partition and evaluates
//! compiled search plans across every partition intersecting the requested
//! time range. Writers are serialized per partition; readers run
//! concurrently against the committed snapshot and are never blocked by a
//! batch in flight.

pub mod partition;
pub mod plan;
pub mod tokenizer;

use crate::core::error::{GrepWiseError, Result};
use crate::core::types::{LogEntry, LogId, PartitionGranularity, PartitionKey, TimeRange};
use crate::events::{EventBus, IndexEvent};
use crate::index::partition::{DocKey, PartitionHandle};
use crate::index::plan::{Matcher, SearchPlan};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

const PARTITIONS_DIR: &str = "partitions";
const FETCH_CHUNK: usize = 256;

/// Result of a search: a lazy merged stream plus a total-count estimate and
/// per-partition warnings.
pub struct SearchHits {
    pub stream: SearchStream,
    pub total: usize,
    pub warnings: Vec<String>,
}

/// Engine statistics for one partition.
#[derive(Debug, Clone)]
pub struct PartitionStats {
    pub key: PartitionKey,
    pub entry_count: usize,
    pub byte_count: u64,
    pub quarantined: bool,
}

pub struct IndexEngine {
    root: PathBuf,
    granularity: PartitionGranularity,
    partitions: DashMap<PartitionKey, Arc<PartitionHandle>>,
    events: EventBus,
}

impl IndexEngine {
    pub fn new(index_root: PathBuf, granularity: PartitionGranularity, events: EventBus) -> Self {
        Self {
            root: index_root,
            granularity,
            partitions: DashMap::new(),
            events,
        }
    }

    pub fn granularity(&self) -> PartitionGranularity {
        self.granularity
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn partition_dir(&self, key: &PartitionKey) -> PathBuf {
        self.root.join(PARTITIONS_DIR).join(key.as_str())
    }

    /// Open (or load from disk) the partition for `key`, acquiring its write
    /// handle. Idempotent for already-open partitions.
    pub fn open(&self, key: &PartitionKey) -> Result<Arc<PartitionHandle>> {
        if let Some(handle) = self.partitions.get(key) {
            return Ok(handle.clone());
        }
        let handle = Arc::new(PartitionHandle::open(&self.partition_dir(key), key.clone())?);
        let entry = self.partitions.entry(key.clone()).or_insert(handle);
        Ok(entry.clone())
    }

    /// Load every partition directory found under the index root.
    /// Quarantined partitions are loaded (so metadata survives) but warn.
    pub fn load_existing(&self) -> Result<Vec<PartitionKey>> {
        let dir = self.root.join(PARTITIONS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .map_err(|e| GrepWiseError::index_io(format!("cannot read {:?}: {}", dir, e)))?
        {
            let entry =
                entry.map_err(|e| GrepWiseError::index_io(format!("cannot read dir: {}", e)))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let key = PartitionKey::new(&name);
            match self.open(&key) {
                Ok(handle) => {
                    if handle.is_quarantined() {
                        tracing::warn!(partition = %key, "partition loaded quarantined");
                    }
                    keys.push(key);
                },
                Err(e) => {
                    tracing::error!(partition = %key, "failed to load partition: {}", e);
                },
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn handle(&self, key: &PartitionKey) -> Option<Arc<PartitionHandle>> {
        self.partitions.get(key).map(|h| h.clone())
    }

    pub fn stats(&self) -> Vec<PartitionStats> {
        self.partitions
            .iter()
            .map(|kv| PartitionStats {
                key: kv.key().clone(),
                entry_count: kv.value().entry_count(),
                byte_count: kv.value().byte_count(),
                quarantined: kv.value().is_quarantined(),
            })
            .collect()
    }

    /// Append a batch to an open partition. Publishes a post-commit event on
    /// success.
    pub fn add_batch(&self, key: &PartitionKey, entries: Vec<LogEntry>) -> Result<Vec<LogId>> {
        let handle = self
            .handle(key)
            .ok_or_else(|| GrepWiseError::PartitionUnavailable(key.to_string()))?;
        let min_ts = entries.iter().map(|e| e.timestamp).min().unwrap_or(0);
        let max_ts = entries.iter().map(|e| e.timestamp).max().unwrap_or(0);
        let count = entries.len();
        let ids = handle.add_batch(entries)?;
        self.events.publish(IndexEvent::BatchCommitted {
            partition: key.clone(),
            range: TimeRange::new(min_ts, max_ts),
            count,
        });
        Ok(ids)
    }

    /// Partitions whose key bounds intersect a range, oldest first.
    fn partitions_for_range(&self, range: &TimeRange) -> Vec<Arc<PartitionHandle>> {
        let mut handles: Vec<Arc<PartitionHandle>> = self
            .partitions
            .iter()
            .filter(|kv| {
                self.granularity
                    .key_bounds(kv.key())
                    .map(|bounds| bounds.intersects(range))
                    .unwrap_or(false)
            })
            .map(|kv| kv.value().clone())
            .collect();
        handles.sort_by(|a, b| a.key().cmp(b.key()));
        handles
    }

    /// Keys of the hot partitions a range touches, for cache bookkeeping.
    pub fn partition_keys_for_range(&self, range: &TimeRange) -> Vec<PartitionKey> {
        self.partitions_for_range(range)
            .into_iter()
            .map(|h| h.key().clone())
            .collect()
    }

    /// Execute a compiled plan. Timestamp ordering (either direction) is
    /// honored by the merge; anything else is the caller's concern.
    pub fn search(&self, plan: &SearchPlan) -> Result<SearchHits> {
        let matcher = Matcher::compile(&plan.node)?;
        let descending = plan
            .sort
            .first()
            .map(|k| k.field != "timestamp" || k.descending)
            .unwrap_or(true);

        let mut warnings = Vec::new();
        let mut sources = Vec::new();
        let mut total = 0;
        for handle in self.partitions_for_range(&plan.range) {
            if handle.is_quarantined() {
                warnings.push(format!("partition {} is quarantined and was skipped", handle.key()));
                continue;
            }
            let mut keys = handle.collect_matches(&plan.node, &matcher, &plan.range);
            sort_keys(&mut keys, descending);
            total += keys.len();
            if !keys.is_empty() {
                sources.push(StreamSource::new(handle, keys));
            }
        }

        Ok(SearchHits {
            stream: SearchStream {
                sources,
                descending,
                remaining: plan.limit,
            },
            total,
            warnings,
        })
    }

    /// Total match count for a plan, ignoring any limit.
    pub fn count(&self, plan: &SearchPlan) -> Result<usize> {
        let matcher = Matcher::compile(&plan.node)?;
        let mut total = 0;
        for handle in self.partitions_for_range(&plan.range) {
            if handle.is_quarantined() {
                continue;
            }
            total += handle.collect_matches(&plan.node, &matcher, &plan.range).len();
        }
        Ok(total)
    }

    /// Timestamps of every match, for histogram buckets.
    pub fn match_timestamps(&self, plan: &SearchPlan) -> Result<Vec<i64>> {
        let matcher = Matcher::compile(&plan.node)?;
        let mut out = Vec::new();
        for handle in self.partitions_for_range(&plan.range) {
            if handle.is_quarantined() {
                continue;
            }
            out.extend(
                handle
                    .collect_matches(&plan.node, &matcher, &plan.range)
                    .into_iter()
                    .map(|k| k.timestamp),
            );
        }
        Ok(out)
    }

    /// Count matches grouped by the given fields, via the per-partition
    /// doc-value columns.
    pub fn aggregate(&self, plan: &SearchPlan, fields: &[String]) -> Result<BTreeMap<String, u64>> {
        let matcher = Matcher::compile(&plan.node)?;
        let mut counts = BTreeMap::new();
        for handle in self.partitions_for_range(&plan.range) {
            if handle.is_quarantined() {
                continue;
            }
            let docs: Vec<u32> = handle
                .collect_matches(&plan.node, &matcher, &plan.range)
                .into_iter()
                .map(|k| k.doc)
                .collect();
            handle.group_counts(&docs, fields, &mut counts);
        }
        Ok(counts)
    }

    /// Point lookup across all hot partitions.
    pub fn get_by_id(&self, id: &LogId) -> Option<LogEntry> {
        self.partitions
            .iter()
            .find_map(|kv| kv.value().get_by_id(id))
    }

    pub fn delete_by_range(&self, start_ms: i64, end_ms: i64) -> Result<usize> {
        let range = TimeRange::new(start_ms, end_ms);
        let mut removed = 0;
        for handle in self.partitions_for_range(&range) {
            if handle.is_quarantined() {
                continue;
            }
            let n = handle.delete_by_range(start_ms, end_ms)?;
            if n > 0 {
                self.events.publish(IndexEvent::EntriesDeleted {
                    partition: handle.key().clone(),
                });
            }
            removed += n;
        }
        Ok(removed)
    }

    pub fn delete_by_source(&self, source: &str) -> Result<usize> {
        let mut removed = 0;
        for kv in self.partitions.iter() {
            let handle = kv.value();
            if handle.is_quarantined() {
                continue;
            }
            let n = handle.delete_by_source(source)?;
            if n > 0 {
                self.events.publish(IndexEvent::EntriesDeleted {
                    partition: handle.key().clone(),
                });
            }
            removed += n;
        }
        Ok(removed)
    }

    /// Entries deleted from a single partition, by source and age cutoff.
    /// Used by source-scoped retention.
    pub fn delete_by_source_before(&self, source: &str, cutoff_ms: i64) -> Result<usize> {
        let mut removed = 0;
        for kv in self.partitions.iter() {
            let handle = kv.value();
            if handle.is_quarantined() {
                continue;
            }
            let n = handle.delete_by_range_and_source(0, cutoff_ms, source)?;
            if n > 0 {
                self.events.publish(IndexEvent::EntriesDeleted {
                    partition: handle.key().clone(),
                });
            }
            removed += n;
        }
        Ok(removed)
    }

    /// Flush and release the write handle; the partition stays readable.
    pub fn close_writes(&self, key: &PartitionKey) -> Result<()> {
        if let Some(handle) = self.handle(key) {
            handle.set_writable(false);
        }
        Ok(())
    }

    /// Re-enable writes, per the manager's re-open policy.
    pub fn reopen_writes(&self, key: &PartitionKey) -> Result<()> {
        let handle = self
            .handle(key)
            .ok_or_else(|| GrepWiseError::PartitionUnavailable(key.to_string()))?;
        if handle.is_quarantined() {
            return Err(GrepWiseError::corrupt(format!("partition {} is quarantined", key)));
        }
        handle.set_writable(true);
        Ok(())
    }

    /// All visible entries of a partition, for archival.
    pub fn export_partition(&self, key: &PartitionKey) -> Result<Vec<LogEntry>> {
        let handle = self
            .handle(key)
            .ok_or_else(|| GrepWiseError::PartitionUnavailable(key.to_string()))?;
        Ok(handle.export_entries())
    }

    /// Drop a partition from hot storage and delete its files.
    pub fn evict(&self, key: &PartitionKey) -> Result<()> {
        self.partitions.remove(key);
        let dir = self.partition_dir(key);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| {
                GrepWiseError::index_io(format!("cannot remove partition dir {:?}: {}", dir, e))
            })?;
        }
        self.events.publish(IndexEvent::PartitionRemoved {
            partition: key.clone(),
        });
        Ok(())
    }

    /// Rebuild a partition from restored entries. The result is readable but
    /// closed to writes.
    pub fn load_restored(&self, key: &PartitionKey, entries: Vec<LogEntry>) -> Result<()> {
        if self.partitions.contains_key(key) {
            return Ok(());
        }
        let handle = self.open(key)?;
        if handle.entry_count() == 0 && !entries.is_empty() {
            handle.add_batch(entries)?;
        }
        handle.set_writable(false);
        Ok(())
    }

    /// Version token covering every partition a range touches. Any write,
    /// delete, or removal in the range changes the token.
    pub fn range_version(&self, range: &TimeRange) -> u64 {
        let mut hasher = ahash::AHasher::default();
        let mut parts: Vec<(PartitionKey, u64)> = self
            .partitions
            .iter()
            .filter(|kv| {
                self.granularity
                    .key_bounds(kv.key())
                    .map(|bounds| bounds.intersects(range))
                    .unwrap_or(false)
            })
            .map(|kv| (kv.key().clone(), kv.value().version()))
            .collect();
        parts.sort();
        for (key, version) in parts {
            key.as_str().hash(&mut hasher);
            version.hash(&mut hasher);
        }
        hasher.finish()
    }
}

fn sort_keys(keys: &mut [DocKey], descending: bool) {
    if descending {
        keys.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
    } else {
        keys.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    }
}

struct StreamSource {
    handle: Arc<PartitionHandle>,
    keys: Vec<DocKey>,
    pos: usize,
    buf: VecDeque<Option<LogEntry>>,
}

impl StreamSource {
    fn new(handle: Arc<PartitionHandle>, keys: Vec<DocKey>) -> Self {
        Self {
            handle,
            keys,
            pos: 0,
            buf: VecDeque::new(),
        }
    }

    fn peek_key(&self) -> Option<&DocKey> {
        self.keys.get(self.pos)
    }

    fn pop(&mut self) -> Option<LogEntry> {
        if self.buf.is_empty() {
            let end = (self.pos + FETCH_CHUNK).min(self.keys.len());
            let docs: Vec<u32> = self.keys[self.pos..end].iter().map(|k| k.doc).collect();
            for entry in self.handle.fetch_aligned(&docs) {
                self.buf.push_back(entry);
            }
        }
        self.pos += 1;
        self.buf.pop_front().flatten()
    }
}

/// Lazy, finite, non-restartable merged result stream with bounded
/// per-partition look-ahead.
pub struct SearchStream {
    sources: Vec<StreamSource>,
    descending: bool,
    remaining: Option<usize>,
}

impl Iterator for SearchStream {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            let mut best: Option<usize> = None;
            for (i, source) in self.sources.iter().enumerate() {
                let Some(key) = source.peek_key() else { continue };
                let better = match best {
                    None => true,
                    Some(j) => {
                        let other = self.sources[j].peek_key().expect("best source has a head");
                        if self.descending {
                            key.timestamp > other.timestamp
                                || (key.timestamp == other.timestamp && key.id < other.id)
                        } else {
                            key.timestamp < other.timestamp
                                || (key.timestamp == other.timestamp && key.id < other.id)
                        }
                    },
                };
                if better {
                    best = Some(i);
                }
            }
            let i = best?;
            match self.sources[i].pop() {
                Some(entry) => {
                    if let Some(remaining) = &mut self.remaining {
                        *remaining -= 1;
                    }
                    return Some(entry);
                },
                // Entry vanished between match and fetch; take the next one.
                None => continue,
            }
        }
    }
}
