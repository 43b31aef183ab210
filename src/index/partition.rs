//! Per-partition inverted index with a durable write-ahead log.
//!
//! Each partition directory holds a `wal.log` of JSON-line records. A batch
//! is appended and fsynced before it is applied in memory, so a batch is
//! either fully visible to readers or not at all. On open the log is
//! replayed; a torn final line is truncated away, anything worse quarantines
//! the partition.

use crate::core::error::{GrepWiseError, Result};
use crate::core::types::{LogEntry, LogId, PartitionKey, TimeRange};
use crate::index::plan::{Matcher, PlanNode};
use crate::index::tokenizer::{tokenize, tokens};
use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const WAL_FILE: &str = "wal.log";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WalRecord {
    Add { entries: Vec<LogEntry> },
    DeleteRange { start_ms: i64, end_ms: i64 },
    DeleteSource { source: String },
    DeleteRangeSource { start_ms: i64, end_ms: i64, source: String },
}

/// Append-only log writer tracking its own length so a failed write can be
/// rolled back with a truncate.
struct WalWriter {
    file: File,
    len: u64,
}

impl WalWriter {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    fn append(&mut self, record: &WalRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        if let Err(e) = self.file.write_all(&line).and_then(|_| self.file.sync_data()) {
            // Roll back a torn append so the log stays replayable.
            let _ = self.file.set_len(self.len);
            return Err(e);
        }
        self.len += line.len() as u64;
        Ok(())
    }
}

/// Mutable index state guarded by the partition's data lock.
#[derive(Default)]
struct PartitionData {
    entries: Vec<LogEntry>,
    /// Readers only see doc ids below this watermark.
    committed: usize,
    deleted: Vec<bool>,
    term_postings: AHashMap<String, Vec<u32>>,
    field_postings: AHashMap<String, AHashMap<String, Vec<u32>>>,
    id_index: AHashMap<LogId, u32>,
    live_count: usize,
    byte_count: u64,
}

impl PartitionData {
    fn apply_add(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            let doc = self.entries.len() as u32;
            let unique_tokens: AHashSet<String> = tokens(&entry.message).collect();
            for token in unique_tokens {
                self.term_postings.entry(token).or_default().push(doc);
            }
            self.index_field("level", entry.level.as_str(), doc);
            self.index_field("source", &entry.source, doc);
            for (k, v) in entry.metadata.iter() {
                self.index_field(k, v, doc);
            }
            self.id_index.insert(entry.id.clone(), doc);
            self.byte_count += (entry.message.len() + entry.raw_content.len()) as u64;
            self.entries.push(entry);
            self.deleted.push(false);
            self.live_count += 1;
        }
        self.committed = self.entries.len();
    }

    fn index_field(&mut self, field: &str, value: &str, doc: u32) {
        self.field_postings
            .entry(field.to_string())
            .or_default()
            .entry(value.to_lowercase())
            .or_default()
            .push(doc);
    }

    fn apply_delete<F: Fn(&LogEntry) -> bool>(&mut self, pred: F) -> usize {
        let mut removed = 0;
        for doc in 0..self.committed {
            if !self.deleted[doc] && pred(&self.entries[doc]) {
                self.deleted[doc] = true;
                self.live_count -= 1;
                removed += 1;
            }
        }
        removed
    }

    fn is_visible(&self, doc: u32) -> bool {
        (doc as usize) < self.committed && !self.deleted[doc as usize]
    }

    /// Postings-accelerated candidate set; `All` means the node cannot
    /// narrow the scan.
    fn candidates(&self, node: &PlanNode) -> Candidates {
        match node {
            PlanNode::All | PlanNode::Regex(_) | PlanNode::Not(_) => Candidates::All,
            PlanNode::Term(term) => Candidates::from_postings(
                self.term_postings.get(term.to_lowercase().as_str()),
            ),
            PlanNode::Phrase(phrase) => {
                let phrase_tokens = tokenize(phrase);
                if phrase_tokens.is_empty() {
                    return Candidates::All;
                }
                let mut sets = Vec::with_capacity(phrase_tokens.len());
                for token in phrase_tokens {
                    match self.term_postings.get(&token) {
                        Some(ids) => sets.push(Candidates::Ids(ids.clone())),
                        None => return Candidates::Ids(Vec::new()),
                    }
                }
                Candidates::intersect_all(sets)
            },
            PlanNode::Wildcard(pattern) => {
                // Walk the token dictionary; union matching postings.
                let regex = match crate::index::plan::wildcard_regex(pattern) {
                    Ok(r) => r,
                    Err(_) => return Candidates::Ids(Vec::new()),
                };
                let mut out: Vec<u32> = Vec::new();
                for (token, ids) in &self.term_postings {
                    if regex.is_match(token) {
                        out.extend_from_slice(ids);
                    }
                }
                out.sort_unstable();
                out.dedup();
                Candidates::Ids(out)
            },
            PlanNode::FieldEq { field, value } => match field.as_str() {
                "message" => self.candidates(&PlanNode::Phrase(value.clone())),
                "id" => Candidates::Ids(
                    self.id_index
                        .get(&LogId::new(value))
                        .map(|doc| vec![*doc])
                        .unwrap_or_default(),
                ),
                "timestamp" => Candidates::All,
                _ => Candidates::from_postings(
                    self.field_postings
                        .get(field.as_str())
                        .and_then(|values| values.get(value.to_lowercase().as_str())),
                ),
            },
            PlanNode::And(nodes) => {
                Candidates::intersect_all(nodes.iter().map(|n| self.candidates(n)).collect())
            },
            PlanNode::Or(nodes) => {
                let mut sets = Vec::with_capacity(nodes.len());
                for n in nodes {
                    match self.candidates(n) {
                        Candidates::All => return Candidates::All,
                        ids => sets.push(ids),
                    }
                }
                Candidates::union_all(sets)
            },
        }
    }
}

enum Candidates {
    All,
    Ids(Vec<u32>),
}

impl Candidates {
    fn from_postings(postings: Option<&Vec<u32>>) -> Self {
        Candidates::Ids(postings.cloned().unwrap_or_default())
    }

    fn intersect_all(sets: Vec<Candidates>) -> Candidates {
        let mut narrowed: Vec<Vec<u32>> = Vec::new();
        for set in sets {
            match set {
                Candidates::All => {},
                Candidates::Ids(ids) => narrowed.push(ids),
            }
        }
        if narrowed.is_empty() {
            return Candidates::All;
        }
        narrowed.sort_by_key(|s| s.len());
        let mut result: AHashSet<u32> = narrowed[0].iter().copied().collect();
        for set in &narrowed[1..] {
            let next: AHashSet<u32> = set.iter().copied().collect();
            result.retain(|id| next.contains(id));
            if result.is_empty() {
                break;
            }
        }
        let mut ids: Vec<u32> = result.into_iter().collect();
        ids.sort_unstable();
        Candidates::Ids(ids)
    }

    fn union_all(sets: Vec<Candidates>) -> Candidates {
        let mut out: Vec<u32> = Vec::new();
        for set in sets {
            if let Candidates::Ids(ids) = set {
                out.extend(ids);
            }
        }
        out.sort_unstable();
        out.dedup();
        Candidates::Ids(out)
    }
}

/// Sort key of one matching document, used for cross-partition merging.
#[derive(Debug, Clone)]
pub struct DocKey {
    pub timestamp: i64,
    pub id: LogId,
    pub doc: u32,
}

/// Handle to one partition's index resources.
pub struct PartitionHandle {
    key: PartitionKey,
    wal: Mutex<WalWriter>,
    data: RwLock<PartitionData>,
    version: AtomicU64,
    writable: AtomicBool,
    quarantined: AtomicBool,
}

impl PartitionHandle {
    /// Open (or create) the partition directory and replay its log.
    pub fn open(dir: &Path, key: PartitionKey) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            GrepWiseError::index_io(format!("cannot create partition dir {:?}: {}", dir, e))
        })?;
        let wal_path = dir.join(WAL_FILE);

        let mut data = PartitionData::default();
        let mut quarantined = false;
        if wal_path.exists() {
            match replay(&wal_path, &mut data) {
                Ok(()) => {},
                Err(e) => {
                    tracing::warn!(partition = %key, "unrecoverable index corruption: {}", e);
                    quarantined = true;
                    data = PartitionData::default();
                },
            }
        }

        let wal = WalWriter::open(&wal_path)
            .map_err(|e| GrepWiseError::index_io(format!("cannot open wal: {}", e)))?;

        Ok(Self {
            key,
            wal: Mutex::new(wal),
            data: RwLock::new(data),
            version: AtomicU64::new(1),
            writable: AtomicBool::new(true),
            quarantined: AtomicBool::new(quarantined),
        })
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire) && !self.is_quarantined()
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    /// Monotone counter bumped on every visible mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn entry_count(&self) -> usize {
        self.data.read().live_count
    }

    pub fn byte_count(&self) -> u64 {
        self.data.read().byte_count
    }

    /// Append a batch: WAL first, then in-memory apply, then watermark bump.
    /// On WAL failure nothing becomes visible.
    pub fn add_batch(&self, entries: Vec<LogEntry>) -> Result<Vec<LogId>> {
        if self.is_quarantined() {
            return Err(GrepWiseError::corrupt(format!("partition {} is quarantined", self.key)));
        }
        if !self.writable.load(Ordering::Acquire) {
            return Err(GrepWiseError::PartitionClosed(self.key.to_string()));
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<LogId> = entries.iter().map(|e| e.id.clone()).collect();

        let mut wal = self.wal.lock();
        wal.append(&WalRecord::Add {
            entries: entries.clone(),
        })
        .map_err(|e| GrepWiseError::index_io(format!("wal append failed: {}", e)))?;

        // Apply while still holding the writer lock so batches stay ordered.
        self.data.write().apply_add(entries);
        drop(wal);

        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(ids)
    }

    pub fn delete_by_range(&self, start_ms: i64, end_ms: i64) -> Result<usize> {
        self.delete_with(
            WalRecord::DeleteRange { start_ms, end_ms },
            move |e: &LogEntry| e.timestamp >= start_ms && e.timestamp <= end_ms,
        )
    }

    pub fn delete_by_source(&self, source: &str) -> Result<usize> {
        let source = source.to_string();
        self.delete_with(
            WalRecord::DeleteSource {
                source: source.clone(),
            },
            move |e: &LogEntry| e.source == source,
        )
    }

    /// Delete entries from one source within a time window. Used by
    /// source-scoped retention policies.
    pub fn delete_by_range_and_source(
        &self,
        start_ms: i64,
        end_ms: i64,
        source: &str,
    ) -> Result<usize> {
        let source = source.to_string();
        let pred_source = source.clone();
        self.delete_with(
            WalRecord::DeleteRangeSource {
                start_ms,
                end_ms,
                source,
            },
            move |e: &LogEntry| {
                e.timestamp >= start_ms && e.timestamp <= end_ms && e.source == pred_source
            },
        )
    }

    fn delete_with<F: Fn(&LogEntry) -> bool>(&self, record: WalRecord, pred: F) -> Result<usize> {
        if self.is_quarantined() {
            return Err(GrepWiseError::corrupt(format!("partition {} is quarantined", self.key)));
        }
        let mut wal = self.wal.lock();
        wal.append(&record)
            .map_err(|e| GrepWiseError::index_io(format!("wal append failed: {}", e)))?;
        let removed = self.data.write().apply_delete(pred);
        drop(wal);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(removed)
    }

    /// Matching doc keys within the range, in arbitrary order. The caller
    /// sorts/merges.
    pub fn collect_matches(
        &self,
        node: &PlanNode,
        matcher: &Matcher,
        range: &TimeRange,
    ) -> Vec<DocKey> {
        let data = self.data.read();
        let mut out = Vec::new();
        let mut push_if_match = |doc: u32, data: &PartitionData| {
            if !data.is_visible(doc) {
                return;
            }
            let entry = &data.entries[doc as usize];
            if range.contains(entry.timestamp) && matcher.matches(entry) {
                out.push(DocKey {
                    timestamp: entry.timestamp,
                    id: entry.id.clone(),
                    doc,
                });
            }
        };
        match data.candidates(node) {
            Candidates::All => {
                for doc in 0..data.committed as u32 {
                    push_if_match(doc, &data);
                }
            },
            Candidates::Ids(ids) => {
                for doc in ids {
                    push_if_match(doc, &data);
                }
            },
        }
        out
    }

    /// Fetch entries by doc id, position-aligned with the input; entries
    /// deleted since matching come back as `None`.
    pub fn fetch_aligned(&self, docs: &[u32]) -> Vec<Option<LogEntry>> {
        let data = self.data.read();
        docs.iter()
            .map(|&doc| {
                data.is_visible(doc)
                    .then(|| data.entries[doc as usize].clone())
            })
            .collect()
    }

    pub fn get_by_id(&self, id: &LogId) -> Option<LogEntry> {
        let data = self.data.read();
        data.id_index
            .get(id)
            .copied()
            .filter(|&doc| data.is_visible(doc))
            .map(|doc| data.entries[doc as usize].clone())
    }

    /// Group documents by the values of `fields`, counting each group.
    /// Values are read straight from the stored entries (the doc-value view).
    pub fn group_counts(
        &self,
        docs: &[u32],
        fields: &[String],
        counts: &mut std::collections::BTreeMap<String, u64>,
    ) {
        let data = self.data.read();
        for &doc in docs {
            if !data.is_visible(doc) {
                continue;
            }
            let entry = &data.entries[doc as usize];
            let key = fields
                .iter()
                .map(|f| entry.field_value(f).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(",");
            *counts.entry(key).or_insert(0) += 1;
        }
    }

    /// All visible entries, oldest first. Used for archival.
    pub fn export_entries(&self) -> Vec<LogEntry> {
        let data = self.data.read();
        let mut entries: Vec<LogEntry> = (0..data.committed as u32)
            .filter(|&doc| data.is_visible(doc))
            .map(|doc| data.entries[doc as usize].clone())
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        entries
    }
}

/// Replay a WAL into fresh partition data. A torn trailing line is truncated
/// away; corruption before the tail is unrecoverable.
fn replay(path: &Path, data: &mut PartitionData) -> Result<()> {
    let file = File::open(path)
        .map_err(|e| GrepWiseError::index_io(format!("cannot open wal for replay: {}", e)))?;
    let mut reader = BufReader::new(file);
    let mut offset: u64 = 0;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| GrepWiseError::index_io(format!("wal read failed: {}", e)))?;
        if read == 0 {
            break;
        }
        let line_start = offset;
        offset += read as u64;
        let trimmed = if buf.last() == Some(&b'\n') {
            &buf[..buf.len() - 1]
        } else {
            &buf[..]
        };
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_slice::<WalRecord>(trimmed) {
            Ok(WalRecord::Add { entries }) => data.apply_add(entries),
            Ok(WalRecord::DeleteRange { start_ms, end_ms }) => {
                data.apply_delete(|e| e.timestamp >= start_ms && e.timestamp <= end_ms);
            },
            Ok(WalRecord::DeleteSource { source }) => {
                data.apply_delete(|e| e.source == source);
            },
            Ok(WalRecord::DeleteRangeSource {
                start_ms,
                end_ms,
                source,
            }) => {
                data.apply_delete(|e| {
                    e.timestamp >= start_ms && e.timestamp <= end_ms && e.source == source
                });
            },
            Err(parse_err) => {
                // Only a torn final record is recoverable.
                let mut rest = Vec::new();
                std::io::Read::read_to_end(&mut reader, &mut rest)
                    .map_err(|e| GrepWiseError::index_io(format!("wal read failed: {}", e)))?;
                if rest.iter().all(|b| b.is_ascii_whitespace()) {
                    tracing::warn!(?path, "truncating torn wal record at byte {}", line_start);
                    let file = OpenOptions::new().write(true).open(path).map_err(|e| {
                        GrepWiseError::index_io(format!("wal truncate failed: {}", e))
                    })?;
                    file.set_len(line_start).map_err(|e| {
                        GrepWiseError::index_io(format!("wal truncate failed: {}", e))
                    })?;
                    return Ok(());
                }
                return Err(GrepWiseError::corrupt(format!(
                    "wal record at byte {} unreadable: {}",
                    line_start, parse_err
                )));
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LogLevel;
    use tempfile::TempDir;

    fn entry(ts: i64, message: &str) -> LogEntry {
        LogEntry::new(ts, LogLevel::Info, message, "test.log")
    }

    fn open(dir: &TempDir) -> PartitionHandle {
        PartitionHandle::open(dir.path(), PartitionKey::new("2024-01-01")).unwrap()
    }

    #[test]
    fn test_add_and_find() {
        let dir = TempDir::new().unwrap();
        let handle = open(&dir);
        let e = entry(1000, "connection timeout");
        let ids = handle.add_batch(vec![e.clone()]).unwrap();
        assert_eq!(ids, vec![e.id.clone()]);

        let node = PlanNode::Term("timeout".to_string());
        let matcher = Matcher::compile(&node).unwrap();
        let hits = handle.collect_matches(&node, &matcher, &TimeRange::all());
        assert_eq!(hits.len(), 1);
        assert_eq!(handle.get_by_id(&e.id).unwrap().message, "connection timeout");
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let handle = open(&dir);
            handle
                .add_batch(vec![entry(1000, "first"), entry(2000, "second")])
                .unwrap();
        }
        let handle = open(&dir);
        assert_eq!(handle.entry_count(), 2);
        let node = PlanNode::Term("second".to_string());
        let matcher = Matcher::compile(&node).unwrap();
        assert_eq!(handle.collect_matches(&node, &matcher, &TimeRange::all()).len(), 1);
    }

    #[test]
    fn test_torn_tail_is_recovered() {
        let dir = TempDir::new().unwrap();
        {
            let handle = open(&dir);
            handle.add_batch(vec![entry(1000, "kept")]).unwrap();
        }
        // Simulate a torn write at the tail.
        let wal = dir.path().join(WAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&wal).unwrap();
        file.write_all(b"{\"op\":\"add\",\"entr").unwrap();
        drop(file);

        let handle = open(&dir);
        assert!(!handle.is_quarantined());
        assert_eq!(handle.entry_count(), 1);
        // The partition accepts writes again after recovery.
        handle.add_batch(vec![entry(2000, "after recovery")]).unwrap();
    }

    #[test]
    fn test_mid_file_corruption_quarantines() {
        let dir = TempDir::new().unwrap();
        {
            let handle = open(&dir);
            handle.add_batch(vec![entry(1000, "kept")]).unwrap();
        }
        let wal = dir.path().join(WAL_FILE);
        let original = std::fs::read(&wal).unwrap();
        let mut mangled = b"garbage line\n".to_vec();
        mangled.extend_from_slice(&original);
        std::fs::write(&wal, mangled).unwrap();

        let handle = open(&dir);
        assert!(handle.is_quarantined());
        assert!(handle.add_batch(vec![entry(2000, "rejected")]).is_err());
    }

    #[test]
    fn test_closed_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let handle = open(&dir);
        handle.set_writable(false);
        let err = handle.add_batch(vec![entry(1000, "x")]).unwrap_err();
        assert!(matches!(err, GrepWiseError::PartitionClosed(_)));
    }

    #[test]
    fn test_delete_by_source() {
        let dir = TempDir::new().unwrap();
        let handle = open(&dir);
        let mut a = entry(1000, "from a");
        a.source = "a.log".to_string();
        let mut b = entry(2000, "from b");
        b.source = "b.log".to_string();
        handle.add_batch(vec![a, b]).unwrap();

        assert_eq!(handle.delete_by_source("a.log").unwrap(), 1);
        assert_eq!(handle.entry_count(), 1);

        let node = PlanNode::FieldEq {
            field: "source".to_string(),
            value: "a.log".to_string(),
        };
        let matcher = Matcher::compile(&node).unwrap();
        assert!(handle.collect_matches(&node, &matcher, &TimeRange::all()).is_empty());
    }

    #[test]
    fn test_delete_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let handle = open(&dir);
            handle
                .add_batch(vec![entry(1000, "old"), entry(5000, "new")])
                .unwrap();
            assert_eq!(handle.delete_by_range(0, 2000).unwrap(), 1);
        }
        let handle = open(&dir);
        assert_eq!(handle.entry_count(), 1);
    }

    #[test]
    fn test_version_bumps_on_mutation() {
        let dir = TempDir::new().unwrap();
        let handle = open(&dir);
        let v0 = handle.version();
        handle.add_batch(vec![entry(1000, "x")]).unwrap();
        assert!(handle.version() > v0);
    }

    #[test]
    fn test_group_counts() {
        let dir = TempDir::new().unwrap();
        let handle = open(&dir);
        let mut batch = Vec::new();
        for (level, n) in [(LogLevel::Error, 3), (LogLevel::Warn, 2), (LogLevel::Info, 5)] {
            for i in 0..n {
                batch.push(LogEntry::new(1000 + i, level, format!("msg {}", i), "app.log"));
            }
        }
        handle.add_batch(batch).unwrap();

        let node = PlanNode::All;
        let matcher = Matcher::compile(&node).unwrap();
        let hits = handle.collect_matches(&node, &matcher, &TimeRange::all());
        let docs: Vec<u32> = hits.iter().map(|h| h.doc).collect();
        let mut counts = std::collections::BTreeMap::new();
        handle.group_counts(&docs, &["level".to_string()], &mut counts);
        assert_eq!(counts.get("ERROR"), Some(&3));
        assert_eq!(counts.get("WARN"), Some(&2));
        assert_eq!(counts.get("INFO"), Some(&5));
    }
}
