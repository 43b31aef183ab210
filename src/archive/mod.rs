//! Compressed archive storage for closed partitions.
//!
//! Each archived partition becomes `<archive_dir>/<key>.archive` (lz4-framed
//! JSON lines) with a `<key>.meta.json` sidecar describing its contents.

use crate::core::config::ArchiveConfig;
use crate::core::error::{GrepWiseError, Result};
use crate::core::types::{now_ms, LogEntry, PartitionKey};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

/// Sidecar metadata for one archive blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub key: PartitionKey,
    pub entry_count: usize,
    pub start_ms: i64,
    pub end_ms: i64,
    pub created_at_ms: i64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub compression_level: u32,
}

pub struct ArchiveStore {
    config: ArchiveConfig,
}

impl ArchiveStore {
    pub fn new(config: ArchiveConfig) -> Self {
        Self { config }
    }

    fn blob_path(&self, key: &PartitionKey) -> PathBuf {
        self.config.archive_dir.join(format!("{}.archive", key))
    }

    fn meta_path(&self, key: &PartitionKey) -> PathBuf {
        self.config.archive_dir.join(format!("{}.meta.json", key))
    }

    pub fn contains(&self, key: &PartitionKey) -> bool {
        self.blob_path(key).exists()
    }

    /// Compress and store a partition's entries. Overwrites any existing
    /// blob for the key.
    pub fn store(&self, key: &PartitionKey, entries: &[LogEntry]) -> Result<ArchiveMeta> {
        std::fs::create_dir_all(&self.config.archive_dir).map_err(|e| {
            GrepWiseError::index_io(format!(
                "cannot create archive dir {:?}: {}",
                self.config.archive_dir, e
            ))
        })?;

        let blob_path = self.blob_path(key);
        let file = File::create(&blob_path)
            .map_err(|e| GrepWiseError::index_io(format!("cannot create archive blob: {}", e)))?;
        let mut encoder = lz4::EncoderBuilder::new()
            .level(self.config.compression_level)
            .build(BufWriter::new(file))
            .map_err(|e| GrepWiseError::index_io(format!("lz4 encoder init failed: {}", e)))?;

        let mut uncompressed: u64 = 0;
        for entry in entries {
            let line = serde_json::to_vec(entry)?;
            uncompressed += line.len() as u64 + 1;
            encoder
                .write_all(&line)
                .and_then(|_| encoder.write_all(b"\n"))
                .map_err(|e| GrepWiseError::index_io(format!("archive write failed: {}", e)))?;
        }
        let (mut writer, finish) = encoder.finish();
        finish.map_err(|e| GrepWiseError::index_io(format!("archive finish failed: {}", e)))?;
        writer
            .flush()
            .map_err(|e| GrepWiseError::index_io(format!("archive flush failed: {}", e)))?;

        let compressed = std::fs::metadata(&blob_path).map(|m| m.len()).unwrap_or(0);
        let meta = ArchiveMeta {
            key: key.clone(),
            entry_count: entries.len(),
            start_ms: entries.iter().map(|e| e.timestamp).min().unwrap_or(0),
            end_ms: entries.iter().map(|e| e.timestamp).max().unwrap_or(0),
            created_at_ms: now_ms(),
            compressed_bytes: compressed,
            uncompressed_bytes: uncompressed,
            compression_level: self.config.compression_level,
        };
        let meta_json = serde_json::to_vec_pretty(&meta)?;
        std::fs::write(self.meta_path(key), meta_json)
            .map_err(|e| GrepWiseError::index_io(format!("cannot write archive meta: {}", e)))?;

        tracing::info!(
            partition = %key,
            entries = meta.entry_count,
            compressed = meta.compressed_bytes,
            "partition archived"
        );
        Ok(meta)
    }

    /// Decompress an archive back into entries.
    pub fn restore(&self, key: &PartitionKey) -> Result<Vec<LogEntry>> {
        let blob_path = self.blob_path(key);
        let file = File::open(&blob_path)
            .map_err(|_| GrepWiseError::ArchiveUnavailable(key.to_string()))?;
        let decoder = lz4::Decoder::new(BufReader::new(file))
            .map_err(|_| GrepWiseError::ArchiveUnavailable(key.to_string()))?;
        let mut entries = Vec::new();
        for line in BufReader::new(decoder).lines() {
            let line = line.map_err(|_| GrepWiseError::ArchiveUnavailable(key.to_string()))?;
            if line.is_empty() {
                continue;
            }
            let entry: LogEntry = serde_json::from_str(&line)
                .map_err(|_| GrepWiseError::ArchiveUnavailable(key.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn meta(&self, key: &PartitionKey) -> Result<ArchiveMeta> {
        let content = std::fs::read(self.meta_path(key))
            .map_err(|_| GrepWiseError::ArchiveUnavailable(key.to_string()))?;
        serde_json::from_slice(&content)
            .map_err(|_| GrepWiseError::ArchiveUnavailable(key.to_string()))
    }

    /// All known archives, oldest first.
    pub fn list(&self) -> Vec<ArchiveMeta> {
        let Ok(read_dir) = std::fs::read_dir(&self.config.archive_dir) else {
            return Vec::new();
        };
        let mut metas: Vec<ArchiveMeta> = read_dir
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension()? != "json" {
                    return None;
                }
                let content = std::fs::read(&path).ok()?;
                serde_json::from_slice(&content).ok()
            })
            .collect();
        metas.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        metas
    }

    pub fn remove(&self, key: &PartitionKey) -> Result<()> {
        for path in [self.blob_path(key), self.meta_path(key)] {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    GrepWiseError::index_io(format!("cannot remove {:?}: {}", path, e))
                })?;
            }
        }
        Ok(())
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.list().iter().map(|m| m.compressed_bytes).sum()
    }

    /// Apply archive retention: drop blobs past the retention age, then trim
    /// oldest-first while the store exceeds its size cap.
    pub fn enforce_retention(&self, now: i64) -> Result<usize> {
        let mut removed = 0;
        let cutoff = now - (self.config.archive_retention_days as i64) * 86_400_000;
        for meta in self.list() {
            if meta.created_at_ms < cutoff {
                tracing::info!(partition = %meta.key, "removing expired archive");
                self.remove(&meta.key)?;
                removed += 1;
            }
        }
        let cap = self.config.max_archive_size_mb * 1024 * 1024;
        let mut metas = self.list();
        let mut total: u64 = metas.iter().map(|m| m.compressed_bytes).sum();
        metas.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        for meta in metas {
            if total <= cap {
                break;
            }
            tracing::warn!(partition = %meta.key, "archive store over size cap, dropping oldest");
            self.remove(&meta.key)?;
            total = total.saturating_sub(meta.compressed_bytes);
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LogLevel;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ArchiveStore {
        ArchiveStore::new(ArchiveConfig {
            archive_dir: dir.path().to_path_buf(),
            compression_level: 4,
            max_archive_size_mb: 1024,
            archive_retention_days: 90,
            auto_archive_enabled: true,
        })
    }

    fn entries(n: usize) -> Vec<LogEntry> {
        (0..n)
            .map(|i| LogEntry::new(1000 + i as i64, LogLevel::Info, format!("entry {}", i), "a.log"))
            .collect()
    }

    #[test]
    fn test_store_and_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = PartitionKey::new("2024-01-01");
        let original = entries(25);

        let meta = store.store(&key, &original).unwrap();
        assert_eq!(meta.entry_count, 25);
        assert!(store.contains(&key));

        let restored = store.restore(&key).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_restore_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = store.restore(&PartitionKey::new("2024-01-01")).unwrap_err();
        assert!(matches!(err, GrepWiseError::ArchiveUnavailable(_)));
    }

    #[test]
    fn test_restore_corrupt_blob() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = PartitionKey::new("2024-01-01");
        store.store(&key, &entries(5)).unwrap();
        std::fs::write(dir.path().join("2024-01-01.archive"), b"not lz4 data").unwrap();
        assert!(matches!(
            store.restore(&key),
            Err(GrepWiseError::ArchiveUnavailable(_))
        ));
    }

    #[test]
    fn test_age_retention() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = PartitionKey::new("2024-01-01");
        store.store(&key, &entries(5)).unwrap();

        // Nothing removed while young.
        assert_eq!(store.enforce_retention(now_ms()).unwrap(), 0);
        // Removed once past the retention horizon.
        let far_future = now_ms() + 91 * 86_400_000;
        assert_eq!(store.enforce_retention(far_future).unwrap(), 1);
        assert!(!store.contains(&key));
    }

    #[test]
    fn test_size_cap_drops_oldest() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(ArchiveConfig {
            archive_dir: dir.path().to_path_buf(),
            compression_level: 1,
            // Cap below any real blob size so the trim always triggers.
            max_archive_size_mb: 0,
            archive_retention_days: 3650,
            auto_archive_enabled: true,
        });
        store.store(&PartitionKey::new("2024-01-01"), &entries(50)).unwrap();
        store.store(&PartitionKey::new("2024-01-02"), &entries(50)).unwrap();
        let removed = store.enforce_retention(now_ms()).unwrap();
        assert!(removed >= 1);
    }
}
