//! Directory tailer.
//!
//! On each scan tick the tailer enumerates files matching the configured
//! pattern, reads bytes appended since the last scan, splits them into
//! lines, and emits entries to the buffer. Offsets are tracked per
//! path+inode and persisted so restarts resume where they left off; a
//! shrunken file or changed inode resets the offset (rotation).

use crate::core::config::LogDirectoryConfig;
use crate::core::error::{GrepWiseError, Result};
use crate::core::retry::{retry_with_config, RetryConfig};
use crate::core::types::{now_ms, LogEntry, LogLevel};
use crate::ingest::buffer::IngestBuffer;
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Tracked read position for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOffset {
    pub inode: u64,
    pub offset: u64,
}

/// Persistent offset map shared by every tailer, keyed by file path.
pub struct OffsetStore {
    path: PathBuf,
    map: Mutex<HashMap<String, FileOffset>>,
}

impl OffsetStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let content = std::fs::read(&self.path)
            .map_err(|e| GrepWiseError::ConfigIo(format!("cannot read offsets: {}", e)))?;
        let map: HashMap<String, FileOffset> = serde_json::from_slice(&content)
            .map_err(|e| GrepWiseError::ConfigIo(format!("bad offsets file: {}", e)))?;
        *self.map.lock() = map;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GrepWiseError::ConfigIo(format!("cannot create config dir: {}", e)))?;
        }
        let bytes = serde_json::to_vec_pretty(&*self.map.lock())?;
        std::fs::write(&self.path, bytes)
            .map_err(|e| GrepWiseError::ConfigIo(format!("cannot write offsets: {}", e)))
    }

    pub fn get(&self, key: &str) -> Option<FileOffset> {
        self.map.lock().get(key).cloned()
    }

    pub fn set(&self, key: String, offset: FileOffset) {
        self.map.lock().insert(key, offset);
    }
}

pub struct FileTailer {
    config: LogDirectoryConfig,
    pattern: Regex,
    buffer: IngestBuffer,
    offsets: Arc<OffsetStore>,
    shutdown: watch::Receiver<bool>,
}

impl FileTailer {
    pub fn new(
        config: LogDirectoryConfig,
        buffer: IngestBuffer,
        offsets: Arc<OffsetStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let pattern = glob_regex(&config.file_pattern)?;
        Ok(Self {
            config,
            pattern,
            buffer,
            offsets,
            shutdown,
        })
    }

    /// Scan on the configured interval until shutdown.
    pub async fn run(mut self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.scan_interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            directory = %self.config.directory.display(),
            pattern = %self.config.file_pattern,
            "file tailer started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scan().await {
                        tracing::warn!(directory = %self.config.directory.display(), "scan failed: {}", e);
                    }
                },
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        tracing::debug!(id = %self.config.id, "file tailer stopping");
                        return;
                    }
                },
            }
        }
    }

    /// One scan pass over the directory.
    pub async fn scan(&self) -> Result<usize> {
        let read_dir = std::fs::read_dir(&self.config.directory).map_err(|e| {
            GrepWiseError::ConfigIo(format!(
                "cannot read directory {}: {}",
                self.config.directory.display(),
                e
            ))
        })?;

        let mut emitted = 0;
        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !self.pattern.is_match(name) {
                continue;
            }
            match self.tail_file(&path).await {
                Ok(n) => emitted += n,
                Err(e) => {
                    tracing::warn!(file = %path.display(), "tail failed: {}", e);
                },
            }
        }
        self.offsets.save()?;
        Ok(emitted)
    }

    async fn tail_file(&self, path: &Path) -> Result<usize> {
        let metadata = std::fs::metadata(path)?;
        let size = metadata.len();
        let inode = file_inode(&metadata);
        let key = path.to_string_lossy().to_string();

        let mut offset = match self.offsets.get(&key) {
            // Rotation: the inode changed or the file shrank.
            Some(prev) if prev.inode == inode && prev.offset <= size => prev.offset,
            Some(_) => {
                tracing::info!(file = %path.display(), "rotation detected, resetting offset");
                0
            },
            None => 0,
        };

        if offset == size {
            self.offsets.set(key, FileOffset { inode, offset });
            return Ok(0);
        }

        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let mut emitted = 0;
        let mut consumed = 0usize;
        for line in content.split_inclusive('\n') {
            if !line.ends_with('\n') {
                // Partial trailing line; pick it up on the next scan.
                break;
            }
            consumed += line.len();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            let entry = self.entry_from_line(path, line);
            let buffer = self.buffer.clone();
            let push_entry = entry.clone();
            let result = retry_with_config(RetryConfig::with_max_attempts(3), move || {
                let buffer = buffer.clone();
                let entry = push_entry.clone();
                async move { buffer.push(entry).await }
            })
            .await;
            match result {
                Ok(()) => emitted += 1,
                Err(e) => {
                    tracing::warn!(file = %path.display(), "dropping line after retries: {}", e);
                },
            }
        }
        offset += consumed as u64;
        self.offsets.set(key, FileOffset { inode, offset });
        Ok(emitted)
    }

    fn entry_from_line(&self, path: &Path, line: &str) -> LogEntry {
        let ingest_time = now_ms();
        let parsed = parse_line_timestamp(line, ingest_time);
        let timestamp = parsed.unwrap_or(ingest_time);
        let level = LogLevel::detect(line);
        let mut entry = LogEntry::new(timestamp, level, line, path.to_string_lossy())
            .with_raw_content(line)
            .with_metadata("directory", &self.config.id);
        if let Some(record_time) = parsed {
            if record_time != ingest_time {
                entry.record_time = Some(record_time);
            }
        }
        entry
    }
}

#[cfg(unix)]
fn file_inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn file_inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}

/// Convert a `*`/`?` glob into an anchored regex.
fn glob_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
        .map_err(|e| GrepWiseError::config(format!("invalid file pattern {}: {}", pattern, e)))
}

/// Datetime-format cascade applied to the head of a line. Returns epoch
/// milliseconds when any format matches.
pub fn parse_line_timestamp(line: &str, now: i64) -> Option<i64> {
    let head: String = line.chars().take(40).collect();

    // ISO 8601 / RFC 3339 with offset or Z.
    for len in [35, 32, 29, 25, 24, 20] {
        if let Some(prefix) = head.get(..len) {
            if let Ok(dt) = DateTime::parse_from_rfc3339(prefix.trim_end()) {
                return Some(dt.timestamp_millis());
            }
        }
    }

    // Naive formats, interpreted as UTC.
    const NAIVE: &[(&str, usize)] = &[
        ("%Y-%m-%d %H:%M:%S%.3f", 23),
        ("%Y-%m-%dT%H:%M:%S%.3f", 23),
        ("%Y-%m-%d %H:%M:%S", 19),
        ("%Y-%m-%dT%H:%M:%S", 19),
        ("%Y/%m/%d %H:%M:%S", 19),
        ("%d/%b/%Y:%H:%M:%S", 20),
    ];
    for (format, len) in NAIVE {
        if let Some(prefix) = head.get(..*len) {
            if let Ok(dt) = NaiveDateTime::parse_from_str(prefix.trim_end(), format) {
                return Some(Utc.from_utc_datetime(&dt).timestamp_millis());
            }
        }
    }

    // Classic syslog "Mmm dd HH:MM:SS" carries no year; use the current one.
    if let Some(prefix) = head.get(..15) {
        let year = Utc
            .timestamp_millis_opt(now)
            .single()
            .map(|dt| dt.year())
            .unwrap_or(1970);
        let candidate = format!("{} {}", year, prefix);
        if let Ok(dt) = NaiveDateTime::parse_from_str(&candidate, "%Y %b %e %H:%M:%S") {
            return Some(Utc.from_utc_datetime(&dt).timestamp_millis());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveStore;
    use crate::core::config::{ArchiveConfig, BufferConfig, StorageConfig};
    use crate::core::fields::FieldRegistry;
    use crate::core::types::PartitionGranularity;
    use crate::events::EventBus;
    use crate::index::IndexEngine;
    use crate::partition::PartitionManager;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_timestamp_cascade_rfc3339() {
        let ts = parse_line_timestamp("2024-10-10T10:10:10Z something happened", 0).unwrap();
        assert_eq!(ts, 1_728_554_410_000);
        let ts =
            parse_line_timestamp("2024-10-10T10:10:10.500+00:00 with millis", 0).unwrap();
        assert_eq!(ts, 1_728_554_410_500);
    }

    #[test]
    fn test_timestamp_cascade_common_formats() {
        assert_eq!(
            parse_line_timestamp("2024-10-10 10:10:10 app started", 0).unwrap(),
            1_728_554_410_000
        );
        assert!(parse_line_timestamp("10/Oct/2024:10:10:10 GET /index", 0).is_some());
    }

    #[test]
    fn test_timestamp_cascade_syslog_no_year() {
        // Uses the year of `now` (2024 here).
        let now = 1_728_554_410_000;
        let ts = parse_line_timestamp("Oct 10 10:10:10 myhost sshd[12]: accepted", now).unwrap();
        assert_eq!(ts, 1_728_554_410_000);
    }

    #[test]
    fn test_timestamp_cascade_fallback() {
        assert!(parse_line_timestamp("no timestamp here at all", 0).is_none());
    }

    #[test]
    fn test_glob_regex() {
        let re = glob_regex("*.log").unwrap();
        assert!(re.is_match("app.log"));
        assert!(!re.is_match("app.log.gz"));
        let re = glob_regex("app-?.txt").unwrap();
        assert!(re.is_match("app-1.txt"));
        assert!(!re.is_match("app-10.txt"));
    }

    struct Fixture {
        tailer: FileTailer,
        engine: Arc<IndexEngine>,
        log_dir: PathBuf,
        _dir: TempDir,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");
        std::fs::create_dir_all(&log_dir).unwrap();

        let storage = StorageConfig {
            index_root: dir.path().join("index"),
            granularity: PartitionGranularity::Daily,
            max_active_partitions: 5,
            retention: vec![],
            cleanup_interval: Duration::from_secs(300),
            auto_archive_threshold: Duration::from_secs(3600),
        };
        let archive_config = ArchiveConfig {
            archive_dir: dir.path().join("archive"),
            compression_level: 1,
            max_archive_size_mb: 1024,
            archive_retention_days: 30,
            auto_archive_enabled: false,
        };
        let engine = Arc::new(IndexEngine::new(
            storage.index_root.clone(),
            storage.granularity,
            EventBus::new(64),
        ));
        let archive = Arc::new(ArchiveStore::new(archive_config.clone()));
        let manager = Arc::new(PartitionManager::new(
            engine.clone(),
            archive,
            storage,
            archive_config,
        ));
        manager.load().unwrap();

        let buffer_config = BufferConfig {
            capacity: 1000,
            batch_size: 100,
            flush_interval: Duration::from_millis(20),
            producer_timeout: Duration::from_millis(50),
        };
        let (buffer, worker) =
            IngestBuffer::new(&buffer_config, manager, Arc::new(FieldRegistry::empty()));
        tokio::spawn(worker.run());

        let offsets = Arc::new(OffsetStore::new(dir.path().join("offsets.json")));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tailer = FileTailer::new(
            LogDirectoryConfig {
                id: "test-dir".to_string(),
                directory: log_dir.clone(),
                file_pattern: "*.log".to_string(),
                scan_interval_seconds: 1,
                enabled: true,
            },
            buffer,
            offsets,
            shutdown_rx,
        )
        .unwrap();

        Fixture {
            tailer,
            engine,
            log_dir,
            _dir: dir,
            _shutdown: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn test_scan_reads_new_lines_incrementally() {
        let f = fixture();
        let file = f.log_dir.join("app.log");
        std::fs::write(&file, "2024-10-10T10:10:10Z ERROR first line\n").unwrap();

        assert_eq!(f.tailer.scan().await.unwrap(), 1);
        // Unchanged file: nothing new.
        assert_eq!(f.tailer.scan().await.unwrap(), 0);

        let mut handle = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
        handle.write_all(b"2024-10-10T10:10:11Z WARN second line\n").unwrap();
        drop(handle);
        assert_eq!(f.tailer.scan().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_partial_line_deferred() {
        let f = fixture();
        let file = f.log_dir.join("app.log");
        std::fs::write(&file, "complete line\npartial without newline").unwrap();

        assert_eq!(f.tailer.scan().await.unwrap(), 1);
        let mut handle = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
        handle.write_all(b" now complete\n").unwrap();
        drop(handle);
        assert_eq!(f.tailer.scan().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rotation_resets_offset() {
        let f = fixture();
        let file = f.log_dir.join("app.log");
        std::fs::write(&file, "line one\nline two\n").unwrap();
        assert_eq!(f.tailer.scan().await.unwrap(), 2);

        // Truncate-and-rewrite rotation: smaller file, fresh content.
        std::fs::write(&file, "fresh\n").unwrap();
        assert_eq!(f.tailer.scan().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_entries_carry_parsed_timestamp_and_level() {
        let f = fixture();
        let file = f.log_dir.join("app.log");
        std::fs::write(&file, "2024-10-10T10:10:10Z ERROR disk on fire\n").unwrap();
        f.tailer.scan().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        use crate::core::types::TimeRange;
        use crate::index::plan::{PlanNode, SearchPlan};
        let plan = SearchPlan::new(PlanNode::Term("disk".to_string()), TimeRange::all());
        let hits = f.engine.search(&plan).unwrap();
        let results: Vec<LogEntry> = hits.stream.collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].timestamp, 1_728_554_410_000);
        assert_eq!(results[0].level, LogLevel::Error);
        assert!(results[0].source.ends_with("app.log"));
        assert_eq!(results[0].metadata.get("directory"), Some("test-dir"));
    }

    #[tokio::test]
    async fn test_offsets_persist_across_tailers() {
        let f = fixture();
        let file = f.log_dir.join("app.log");
        std::fs::write(&file, "one\ntwo\n").unwrap();
        f.tailer.scan().await.unwrap();

        // A new store loading the same file sees the saved offsets.
        let offsets_path = f._dir.path().join("offsets.json");
        let fresh = OffsetStore::new(offsets_path);
        fresh.load().unwrap();
        let key = file.to_string_lossy().to_string();
        assert!(fresh.get(&key).unwrap().offset > 0);
    }
}
