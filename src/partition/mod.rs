//! Partition lifecycle management.
//!
//! The manager exclusively owns partition state: it routes incoming entries
//! to partitions, enforces the active-set cap, runs retention and archival
//! on a periodic tick, and transparently restores archived partitions for
//! queries that reach back past hot storage. All mutations are serialized
//! behind a single mutex; the index engine's own locks cover reads.

use crate::archive::ArchiveStore;
use crate::core::config::{ArchiveConfig, RetentionPolicy, StorageConfig};
use crate::core::error::{GrepWiseError, Result};
use crate::core::types::{now_ms, LogEntry, LogId, PartitionKey, TimeRange};
use crate::index::IndexEngine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

const META_FILE: &str = "partitions-meta.json";

/// Lifecycle state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionState {
    Open,
    Active,
    Closed,
    Archived,
    Quarantined,
}

/// Metadata tracked per partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub key: PartitionKey,
    pub state: PartitionState,
    pub created_at: i64,
    pub last_written_at: i64,
    pub entry_count: usize,
    pub byte_count: u64,
}

#[derive(Default, Serialize, Deserialize)]
struct ManagerState {
    partitions: BTreeMap<PartitionKey, PartitionMeta>,
}

/// Outcome of routing one ingest batch.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub committed: Vec<LogId>,
    /// Entries dropped because their partition was unavailable.
    pub rejected: usize,
}

pub struct PartitionManager {
    engine: Arc<IndexEngine>,
    archive: Arc<ArchiveStore>,
    storage: StorageConfig,
    archive_config: ArchiveConfig,
    state: Mutex<ManagerState>,
    meta_path: PathBuf,
}

impl PartitionManager {
    pub fn new(
        engine: Arc<IndexEngine>,
        archive: Arc<ArchiveStore>,
        storage: StorageConfig,
        archive_config: ArchiveConfig,
    ) -> Self {
        let meta_path = storage.index_root.join(META_FILE);
        Self {
            engine,
            archive,
            storage,
            archive_config,
            state: Mutex::new(ManagerState::default()),
            meta_path,
        }
    }

    /// Load persisted metadata and reconcile it with what is actually on
    /// disk. Partitions found without metadata come up CLOSED.
    pub fn load(&self) -> Result<()> {
        let mut state = ManagerState::default();
        if self.meta_path.exists() {
            let content = std::fs::read(&self.meta_path)
                .map_err(|e| GrepWiseError::ConfigIo(format!("cannot read partition meta: {}", e)))?;
            state = serde_json::from_slice(&content)
                .map_err(|e| GrepWiseError::ConfigIo(format!("bad partition meta: {}", e)))?;
        }

        let loaded = self.engine.load_existing()?;
        let now = now_ms();
        for key in loaded {
            let handle = self.engine.handle(&key);
            let quarantined = handle.as_ref().map(|h| h.is_quarantined()).unwrap_or(false);
            let meta = state.partitions.entry(key.clone()).or_insert(PartitionMeta {
                key: key.clone(),
                state: PartitionState::Closed,
                created_at: now,
                last_written_at: now,
                entry_count: 0,
                byte_count: 0,
            });
            if quarantined {
                meta.state = PartitionState::Quarantined;
            }
            if let Some(handle) = handle {
                meta.entry_count = handle.entry_count();
                meta.byte_count = handle.byte_count();
                // Everything reloaded from disk starts closed to writes; the
                // re-open policy decides on the next write.
                if meta.state != PartitionState::Quarantined {
                    meta.state = PartitionState::Closed;
                    handle.set_writable(false);
                }
            }
        }
        // Metadata for partitions that no longer exist on disk and have no
        // archive blob is stale.
        state.partitions.retain(|key, meta| {
            meta.state == PartitionState::Archived && self.archive.contains(key)
                || self.engine.handle(key).is_some()
        });

        *self.state.lock() = state;
        self.persist_locked(&self.state.lock());
        Ok(())
    }

    fn persist_locked(&self, state: &ManagerState) {
        if let Some(parent) = self.meta_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.meta_path, bytes) {
                    tracing::warn!("failed to persist partition metadata: {}", e);
                }
            },
            Err(e) => tracing::warn!("failed to serialize partition metadata: {}", e),
        }
    }

    pub fn metas(&self) -> Vec<PartitionMeta> {
        self.state.lock().partitions.values().cloned().collect()
    }

    /// Route a batch of entries to their partitions and commit each group.
    /// Entries mapping to unavailable partitions are counted as rejected.
    pub fn ingest_batch(&self, entries: Vec<LogEntry>) -> Result<IngestOutcome> {
        let granularity = self.engine.granularity();
        let mut groups: BTreeMap<PartitionKey, Vec<LogEntry>> = BTreeMap::new();
        for entry in entries {
            groups
                .entry(granularity.key_for(entry.timestamp))
                .or_default()
                .push(entry);
        }

        let mut outcome = IngestOutcome::default();
        for (key, group) in groups {
            match self.prepare_writable(&key) {
                Ok(()) => {
                    let count = group.len();
                    match self.engine.add_batch(&key, group) {
                        Ok(ids) => {
                            let mut state = self.state.lock();
                            if let Some(meta) = state.partitions.get_mut(&key) {
                                meta.state = PartitionState::Active;
                                meta.last_written_at = now_ms();
                                if let Some(handle) = self.engine.handle(&key) {
                                    meta.entry_count = handle.entry_count();
                                    meta.byte_count = handle.byte_count();
                                }
                            }
                            self.persist_locked(&state);
                            drop(state);
                            outcome.committed.extend(ids);
                        },
                        Err(e) => {
                            tracing::error!(partition = %key, "batch commit failed: {}", e);
                            outcome.rejected += count;
                        },
                    }
                },
                Err(e) => {
                    tracing::warn!(partition = %key, "rejecting {} entries: {}", group.len(), e);
                    outcome.rejected += group.len();
                },
            }
        }
        Ok(outcome)
    }

    /// Make sure the partition for `key` accepts writes, applying the
    /// rotation and re-open policies.
    fn prepare_writable(&self, key: &PartitionKey) -> Result<()> {
        let mut state = self.state.lock();
        let current_key = self.engine.granularity().key_for(now_ms());

        match state.partitions.get(key).map(|m| m.state) {
            Some(PartitionState::Open) | Some(PartitionState::Active) => return Ok(()),
            Some(PartitionState::Quarantined) => {
                return Err(GrepWiseError::PartitionUnavailable(key.to_string()));
            },
            Some(PartitionState::Closed) => {
                // Re-open only for the current active window.
                if *key != current_key {
                    return Err(GrepWiseError::PartitionUnavailable(key.to_string()));
                }
                self.enforce_active_cap(&mut state, key);
                self.engine.reopen_writes(key)?;
                if let Some(meta) = state.partitions.get_mut(key) {
                    meta.state = PartitionState::Active;
                }
                self.persist_locked(&state);
                return Ok(());
            },
            Some(PartitionState::Archived) => {
                if *key != current_key {
                    return Err(GrepWiseError::PartitionUnavailable(key.to_string()));
                }
                let entries = self.archive.restore(key)?;
                self.engine.load_restored(key, entries)?;
                self.enforce_active_cap(&mut state, key);
                self.engine.reopen_writes(key)?;
                if let Some(meta) = state.partitions.get_mut(key) {
                    meta.state = PartitionState::Active;
                }
                self.persist_locked(&state);
                return Ok(());
            },
            None => {},
        }

        // New partition.
        self.enforce_active_cap(&mut state, key);
        let handle = self.engine.open(key)?;
        if handle.is_quarantined() {
            state.partitions.insert(
                key.clone(),
                PartitionMeta {
                    key: key.clone(),
                    state: PartitionState::Quarantined,
                    created_at: now_ms(),
                    last_written_at: now_ms(),
                    entry_count: handle.entry_count(),
                    byte_count: handle.byte_count(),
                },
            );
            self.persist_locked(&state);
            return Err(GrepWiseError::PartitionUnavailable(key.to_string()));
        }
        let now = now_ms();
        state.partitions.insert(
            key.clone(),
            PartitionMeta {
                key: key.clone(),
                state: PartitionState::Open,
                created_at: now,
                last_written_at: now,
                entry_count: handle.entry_count(),
                byte_count: handle.byte_count(),
            },
        );
        self.persist_locked(&state);
        Ok(())
    }

    /// Close the oldest active partitions until one slot is free for
    /// `incoming`.
    fn enforce_active_cap(&self, state: &mut ManagerState, incoming: &PartitionKey) {
        loop {
            let mut open: Vec<&PartitionMeta> = state
                .partitions
                .values()
                .filter(|m| {
                    m.key != *incoming
                        && matches!(m.state, PartitionState::Open | PartitionState::Active)
                })
                .collect();
            if open.len() < self.storage.max_active_partitions {
                return;
            }
            open.sort_by_key(|m| m.last_written_at);
            let oldest = open[0].key.clone();
            tracing::info!(partition = %oldest, "active cap reached, closing oldest partition");
            if let Err(e) = self.engine.close_writes(&oldest) {
                tracing::warn!(partition = %oldest, "failed to close writes: {}", e);
            }
            if let Some(meta) = state.partitions.get_mut(&oldest) {
                meta.state = PartitionState::Closed;
            }
        }
    }

    /// Restore any archived partitions whose bounds intersect the range so a
    /// query can read them. Returns warnings for archives that could not be
    /// brought back.
    pub fn ensure_range_available(&self, range: &TimeRange) -> Vec<String> {
        let granularity = self.engine.granularity();
        let archived: Vec<PartitionKey> = {
            let state = self.state.lock();
            state
                .partitions
                .values()
                .filter(|m| m.state == PartitionState::Archived)
                .filter(|m| {
                    granularity
                        .key_bounds(&m.key)
                        .map(|b| b.intersects(range))
                        .unwrap_or(false)
                })
                .map(|m| m.key.clone())
                .collect()
        };

        let mut warnings = Vec::new();
        for key in archived {
            match self.restore_partition(&key) {
                Ok(()) => {},
                Err(e) => {
                    warnings.push(format!("partition {}: {}", key, e));
                },
            }
        }
        warnings
    }

    /// Bring an archived partition back to hot storage in CLOSED state.
    pub fn restore_partition(&self, key: &PartitionKey) -> Result<()> {
        {
            let state = self.state.lock();
            match state.partitions.get(key) {
                Some(meta) if meta.state == PartitionState::Archived => {},
                Some(_) => return Ok(()),
                None => return Err(GrepWiseError::ArchiveUnavailable(key.to_string())),
            }
        }
        let entries = self.archive.restore(key)?;
        self.engine.load_restored(key, entries)?;
        let mut state = self.state.lock();
        if let Some(meta) = state.partitions.get_mut(key) {
            meta.state = PartitionState::Closed;
            if let Some(handle) = self.engine.handle(key) {
                meta.entry_count = handle.entry_count();
                meta.byte_count = handle.byte_count();
            }
        }
        self.persist_locked(&state);
        tracing::info!(partition = %key, "partition restored from archive");
        Ok(())
    }

    /// Periodic maintenance: retention, archival, and archive trimming.
    pub fn run_maintenance(&self) -> Result<()> {
        let now = now_ms();
        self.apply_retention(now)?;
        if self.archive_config.auto_archive_enabled {
            self.archive_closed_partitions(now)?;
        }
        self.archive.enforce_retention(now)?;
        Ok(())
    }

    fn apply_retention(&self, now: i64) -> Result<()> {
        let granularity = self.engine.granularity();
        for policy in self.storage.retention.clone() {
            if !policy.enabled {
                continue;
            }
            let cutoff = now - (policy.max_age_days as i64) * 86_400_000;
            match &policy.apply_to_sources {
                Some(sources) => {
                    for source in sources {
                        let removed = self.engine.delete_by_source_before(source, cutoff)?;
                        if removed > 0 {
                            tracing::info!(policy = %policy.name, source = %source, removed, "source retention applied");
                        }
                    }
                },
                None => {
                    let expired: Vec<PartitionKey> = {
                        let state = self.state.lock();
                        state
                            .partitions
                            .values()
                            .filter(|m| {
                                granularity
                                    .key_bounds(&m.key)
                                    .map(|b| b.end_ms < cutoff)
                                    .unwrap_or(false)
                            })
                            .map(|m| m.key.clone())
                            .collect()
                    };
                    for key in expired {
                        self.expire_partition(&key, &policy)?;
                    }
                },
            }
        }
        Ok(())
    }

    fn expire_partition(&self, key: &PartitionKey, policy: &RetentionPolicy) -> Result<()> {
        let current_state = self.state.lock().partitions.get(key).map(|m| m.state);
        match current_state {
            Some(PartitionState::Archived) => {
                // Hot copy already gone; archive retention owns the blob.
                Ok(())
            },
            Some(_) => {
                tracing::info!(partition = %key, policy = %policy.name, "retention expiring partition");
                if self.archive_config.auto_archive_enabled && !self.archive.contains(key) {
                    let entries = self.engine.export_partition(key)?;
                    self.archive.store(key, &entries)?;
                    self.engine.evict(key)?;
                    let mut state = self.state.lock();
                    if let Some(meta) = state.partitions.get_mut(key) {
                        meta.state = PartitionState::Archived;
                    }
                    self.persist_locked(&state);
                } else {
                    self.engine.evict(key)?;
                    let mut state = self.state.lock();
                    state.partitions.remove(key);
                    self.persist_locked(&state);
                }
                Ok(())
            },
            None => Ok(()),
        }
    }

    fn archive_closed_partitions(&self, now: i64) -> Result<()> {
        let threshold_ms = self.storage.auto_archive_threshold.as_millis() as i64;
        let candidates: Vec<PartitionKey> = {
            let state = self.state.lock();
            state
                .partitions
                .values()
                .filter(|m| m.state == PartitionState::Closed)
                .filter(|m| now - m.last_written_at > threshold_ms)
                .map(|m| m.key.clone())
                .collect()
        };
        for key in candidates {
            let entries = self.engine.export_partition(&key)?;
            self.archive.store(&key, &entries)?;
            self.engine.evict(&key)?;
            let mut state = self.state.lock();
            if let Some(meta) = state.partitions.get_mut(&key) {
                meta.state = PartitionState::Archived;
            }
            self.persist_locked(&state);
        }
        Ok(())
    }

    /// Number of OPEN/ACTIVE partitions, for the cap invariant and health.
    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .partitions
            .values()
            .filter(|m| matches!(m.state, PartitionState::Open | PartitionState::Active))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ArchiveConfig, StorageConfig};
    use crate::core::types::{LogLevel, PartitionGranularity};
    use crate::events::EventBus;
    use std::time::Duration;
    use tempfile::TempDir;

    // Three months of 2024.
    const M1: i64 = 1_704_103_200_000; // 2024-01-01T10:00:00Z
    const M2: i64 = 1_706_781_600_000; // 2024-02-01T10:00:00Z
    const M3: i64 = 1_709_287_200_000; // 2024-03-01T10:00:00Z

    struct Fixture {
        manager: PartitionManager,
        engine: Arc<IndexEngine>,
        _dir: TempDir,
    }

    fn fixture(max_active: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = StorageConfig {
            index_root: dir.path().join("index"),
            granularity: PartitionGranularity::Monthly,
            max_active_partitions: max_active,
            retention: vec![],
            cleanup_interval: Duration::from_secs(300),
            auto_archive_threshold: Duration::from_secs(3600),
        };
        let archive_config = ArchiveConfig {
            archive_dir: dir.path().join("archive"),
            compression_level: 1,
            max_archive_size_mb: 1024,
            archive_retention_days: 3650,
            auto_archive_enabled: true,
        };
        let engine = Arc::new(IndexEngine::new(
            storage.index_root.clone(),
            storage.granularity,
            EventBus::new(64),
        ));
        let archive = Arc::new(ArchiveStore::new(archive_config.clone()));
        let manager =
            PartitionManager::new(engine.clone(), archive, storage, archive_config);
        manager.load().unwrap();
        Fixture {
            manager,
            engine,
            _dir: dir,
        }
    }

    fn entry(ts: i64, message: &str) -> LogEntry {
        LogEntry::new(ts, LogLevel::Error, message, "app.log")
    }

    #[test]
    fn test_routing_same_bucket_same_partition() {
        let f = fixture(3);
        let outcome = f
            .manager
            .ingest_batch(vec![entry(M1, "a"), entry(M1 + 60_000, "b")])
            .unwrap();
        assert_eq!(outcome.committed.len(), 2);
        assert_eq!(f.manager.metas().len(), 1);
    }

    #[test]
    fn test_rotation_cap_closes_oldest() {
        let f = fixture(2);
        f.manager.ingest_batch(vec![entry(M1, "m1")]).unwrap();
        f.manager.ingest_batch(vec![entry(M2, "m2")]).unwrap();
        assert_eq!(f.manager.active_count(), 2);

        f.manager.ingest_batch(vec![entry(M3, "m3")]).unwrap();
        assert_eq!(f.manager.active_count(), 2);

        let metas = f.manager.metas();
        let m1_key = PartitionGranularity::Monthly.key_for(M1);
        let m1_meta = metas.iter().find(|m| m.key == m1_key).unwrap();
        assert_eq!(m1_meta.state, PartitionState::Closed);

        // All three months remain searchable.
        use crate::index::plan::{PlanNode, SearchPlan};
        let plan = SearchPlan::new(PlanNode::All, TimeRange::all());
        assert_eq!(f.engine.count(&plan).unwrap(), 3);
    }

    #[test]
    fn test_closed_noncurrent_partition_rejects() {
        let f = fixture(1);
        f.manager.ingest_batch(vec![entry(M1, "m1")]).unwrap();
        // Writing M2 closes M1 (cap 1).
        f.manager.ingest_batch(vec![entry(M2, "m2")]).unwrap();
        // M1 is closed and not the current wall-clock window: rejected.
        let outcome = f.manager.ingest_batch(vec![entry(M1, "late")]).unwrap();
        assert_eq!(outcome.committed.len(), 0);
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn test_current_window_reopens() {
        let f = fixture(2);
        let now = now_ms();
        f.manager.ingest_batch(vec![entry(now, "current")]).unwrap();
        let key = PartitionGranularity::Monthly.key_for(now);
        // Force-close it, as rotation would.
        f.engine.close_writes(&key).unwrap();
        {
            let mut state = f.manager.state.lock();
            state.partitions.get_mut(&key).unwrap().state = PartitionState::Closed;
        }
        let outcome = f.manager.ingest_batch(vec![entry(now, "again")]).unwrap();
        assert_eq!(outcome.committed.len(), 1);
        assert_eq!(outcome.rejected, 0);
    }

    #[test]
    fn test_archive_and_restore_flow() {
        let f = fixture(2);
        f.manager.ingest_batch(vec![entry(M1, "archived entry")]).unwrap();
        let key = PartitionGranularity::Monthly.key_for(M1);

        // Close it and force its last write far into the past.
        f.engine.close_writes(&key).unwrap();
        {
            let mut state = f.manager.state.lock();
            let meta = state.partitions.get_mut(&key).unwrap();
            meta.state = PartitionState::Closed;
            meta.last_written_at = 0;
        }
        f.manager.run_maintenance().unwrap();

        let metas = f.manager.metas();
        assert_eq!(
            metas.iter().find(|m| m.key == key).unwrap().state,
            PartitionState::Archived
        );
        assert!(f.engine.handle(&key).is_none());

        // A query over M1 transparently restores it.
        let range = PartitionGranularity::Monthly.key_bounds(&key).unwrap();
        let warnings = f.manager.ensure_range_available(&range);
        assert!(warnings.is_empty());
        use crate::index::plan::{PlanNode, SearchPlan};
        let plan = SearchPlan::new(PlanNode::Term("archived".to_string()), range);
        assert_eq!(f.engine.count(&plan).unwrap(), 1);
    }

    #[test]
    fn test_restore_missing_archive_warns() {
        let f = fixture(2);
        f.manager.ingest_batch(vec![entry(M1, "x")]).unwrap();
        let key = PartitionGranularity::Monthly.key_for(M1);
        {
            let mut state = f.manager.state.lock();
            state.partitions.get_mut(&key).unwrap().state = PartitionState::Archived;
        }
        // No blob was ever written.
        let range = PartitionGranularity::Monthly.key_bounds(&key).unwrap();
        let warnings = f.manager.ensure_range_available(&range);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("archive unavailable"));
    }

    #[test]
    fn test_retention_deletes_expired() {
        let mut f = fixture(3);
        f.manager.storage.retention = vec![RetentionPolicy {
            name: "test".to_string(),
            max_age_days: 30,
            enabled: true,
            apply_to_sources: None,
        }];
        f.manager.archive_config.auto_archive_enabled = false;
        f.manager.ingest_batch(vec![entry(M1, "old")]).unwrap();
        f.manager.run_maintenance().unwrap();
        // M1 is far more than 30 days old: gone entirely.
        let key = PartitionGranularity::Monthly.key_for(M1);
        assert!(f.manager.metas().iter().all(|m| m.key != key));
        assert!(f.engine.handle(&key).is_none());
    }
}
