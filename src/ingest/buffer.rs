//! Bounded ingestion buffer.
//!
//! Producers enqueue entries from every source; a single flusher drains the
//! queue and commits batches through the partition manager, which preserves
//! per-source ordering. Flushes trigger on batch size, on the flush
//! interval, or explicitly.

use crate::core::config::BufferConfig;
use crate::core::error::{GrepWiseError, Result};
use crate::core::fields::FieldRegistry;
use crate::core::types::LogEntry;
use crate::partition::PartitionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

enum BufferMsg {
    Entry(LogEntry),
    Flush(oneshot::Sender<()>),
}

/// Producer handle. Cheap to clone; every source keeps one.
#[derive(Clone)]
pub struct IngestBuffer {
    tx: mpsc::Sender<BufferMsg>,
    capacity: usize,
    producer_timeout: Duration,
}

impl IngestBuffer {
    /// Create the buffer and its flush worker. The caller spawns
    /// [`FlushWorker::run`].
    pub fn new(
        config: &BufferConfig,
        manager: Arc<PartitionManager>,
        registry: Arc<FieldRegistry>,
    ) -> (Self, FlushWorker) {
        let (tx, rx) = mpsc::channel(config.capacity);
        let buffer = Self {
            tx,
            capacity: config.capacity,
            producer_timeout: config.producer_timeout,
        };
        let worker = FlushWorker {
            rx,
            manager,
            registry,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
        };
        (buffer, worker)
    }

    /// Enqueue an entry, blocking up to the producer timeout.
    pub async fn push(&self, entry: LogEntry) -> Result<()> {
        match timeout(self.producer_timeout, self.tx.send(BufferMsg::Entry(entry))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GrepWiseError::ChannelSend),
            Err(_) => Err(GrepWiseError::BufferFull),
        }
    }

    /// Enqueue without waiting. Overloaded queues reject immediately; the
    /// UDP listener drops on this.
    pub fn try_push(&self, entry: LogEntry) -> Result<()> {
        self.tx.try_send(BufferMsg::Entry(entry)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GrepWiseError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => GrepWiseError::ChannelSend,
        })
    }

    /// Flush everything queued so far and wait for the commit.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(BufferMsg::Flush(ack_tx))
            .await
            .map_err(|_| GrepWiseError::ChannelSend)?;
        ack_rx.await.map_err(|_| GrepWiseError::ChannelSend)
    }

    /// Approximate number of queued entries.
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

/// Single consumer that batches entries and routes them to partitions.
pub struct FlushWorker {
    rx: mpsc::Receiver<BufferMsg>,
    manager: Arc<PartitionManager>,
    registry: Arc<FieldRegistry>,
    batch_size: usize,
    flush_interval: Duration,
}

impl FlushWorker {
    /// Drain the queue until every producer handle is dropped, then flush
    /// the tail batch.
    pub async fn run(mut self) {
        let mut batch: Vec<LogEntry> = Vec::with_capacity(self.batch_size);
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(BufferMsg::Entry(mut entry)) => {
                            self.registry.extract(&mut entry);
                            batch.push(entry);
                            if batch.len() >= self.batch_size {
                                self.commit(&mut batch);
                            }
                        },
                        Some(BufferMsg::Flush(ack)) => {
                            self.commit(&mut batch);
                            let _ = ack.send(());
                        },
                        None => {
                            self.commit(&mut batch);
                            tracing::debug!("ingest buffer closed, flusher exiting");
                            return;
                        },
                    }
                },
                _ = interval.tick() => {
                    if !batch.is_empty() {
                        self.commit(&mut batch);
                    }
                },
            }
        }
    }

    fn commit(&self, batch: &mut Vec<LogEntry>) {
        if batch.is_empty() {
            return;
        }
        let entries = std::mem::take(batch);
        let count = entries.len();
        match self.manager.ingest_batch(entries) {
            Ok(outcome) => {
                if outcome.rejected > 0 {
                    tracing::warn!(
                        rejected = outcome.rejected,
                        committed = outcome.committed.len(),
                        "batch partially rejected"
                    );
                }
            },
            Err(e) => {
                tracing::error!(count, "batch commit failed, entries dropped: {}", e);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveStore;
    use crate::core::config::{ArchiveConfig, StorageConfig};
    use crate::core::types::{now_ms, LogLevel, PartitionGranularity, TimeRange};
    use crate::events::EventBus;
    use crate::index::plan::{PlanNode, SearchPlan};
    use crate::index::IndexEngine;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> (Arc<PartitionManager>, Arc<IndexEngine>) {
        let storage = StorageConfig {
            index_root: dir.path().join("index"),
            granularity: PartitionGranularity::Daily,
            max_active_partitions: 3,
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
        (manager, engine)
    }

    fn config() -> BufferConfig {
        BufferConfig {
            capacity: 100,
            batch_size: 10,
            flush_interval: Duration::from_millis(50),
            producer_timeout: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_push_flush_commit() {
        let dir = TempDir::new().unwrap();
        let (manager, engine) = manager(&dir);
        let (buffer, worker) =
            IngestBuffer::new(&config(), manager, Arc::new(FieldRegistry::empty()));
        let worker_handle = tokio::spawn(worker.run());

        let ts = now_ms();
        for i in 0..5 {
            buffer
                .push(LogEntry::new(ts, LogLevel::Info, format!("msg {}", i), "test"))
                .await
                .unwrap();
        }
        buffer.flush().await.unwrap();

        let plan = SearchPlan::new(PlanNode::Term("msg".to_string()), TimeRange::all());
        assert_eq!(engine.count(&plan).unwrap(), 5);

        drop(buffer);
        worker_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_size_triggers_flush() {
        let dir = TempDir::new().unwrap();
        let (manager, engine) = manager(&dir);
        let mut cfg = config();
        cfg.batch_size = 3;
        cfg.flush_interval = Duration::from_secs(600);
        let (buffer, worker) =
            IngestBuffer::new(&cfg, manager, Arc::new(FieldRegistry::empty()));
        tokio::spawn(worker.run());

        let ts = now_ms();
        for i in 0..3 {
            buffer
                .push(LogEntry::new(ts, LogLevel::Info, format!("event {}", i), "test"))
                .await
                .unwrap();
        }
        // Batch size reached; the worker commits without an explicit flush.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let plan = SearchPlan::new(PlanNode::Term("event".to_string()), TimeRange::all());
        assert_eq!(engine.count(&plan).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_backpressure_returns_buffer_full() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = manager(&dir);
        let cfg = BufferConfig {
            capacity: 2,
            batch_size: 2,
            flush_interval: Duration::from_secs(600),
            producer_timeout: Duration::from_millis(10),
        };
        // Worker never spawned: the queue fills and stays full.
        let (buffer, _worker) =
            IngestBuffer::new(&cfg, manager, Arc::new(FieldRegistry::empty()));

        let ts = now_ms();
        buffer.push(LogEntry::new(ts, LogLevel::Info, "a", "t")).await.unwrap();
        buffer.push(LogEntry::new(ts, LogLevel::Info, "b", "t")).await.unwrap();
        let err = buffer
            .push(LogEntry::new(ts, LogLevel::Info, "c", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, GrepWiseError::BufferFull));
        assert!(matches!(
            buffer.try_push(LogEntry::new(ts, LogLevel::Info, "d", "t")),
            Err(GrepWiseError::BufferFull)
        ));
        assert_eq!(buffer.depth(), 2);
    }

    #[tokio::test]
    async fn test_per_source_order_preserved() {
        let dir = TempDir::new().unwrap();
        let (manager, engine) = manager(&dir);
        let (buffer, worker) =
            IngestBuffer::new(&config(), manager, Arc::new(FieldRegistry::empty()));
        tokio::spawn(worker.run());

        let ts = now_ms();
        let first = LogEntry::new(ts, LogLevel::Info, "first", "ordered.log");
        let second = LogEntry::new(ts, LogLevel::Info, "second", "ordered.log");
        buffer.push(first.clone()).await.unwrap();
        buffer.push(second.clone()).await.unwrap();
        buffer.flush().await.unwrap();

        let plan = SearchPlan::new(
            PlanNode::FieldEq {
                field: "source".to_string(),
                value: "ordered.log".to_string(),
            },
            TimeRange::all(),
        )
        .with_sort(vec![crate::index::plan::SortKey {
            field: "timestamp".to_string(),
            descending: false,
        }]);
        let hits = engine.search(&plan).unwrap();
        let results: Vec<LogEntry> = hits.stream.collect();
        assert_eq!(results.len(), 2);
        // Equal timestamps: id tiebreak must be consistent with ingest order.
        let first_pos = results.iter().position(|e| e.id == first.id).unwrap();
        let second_pos = results.iter().position(|e| e.id == second.id).unwrap();
        assert_eq!(
            first_pos < second_pos,
            first.id < second.id,
            "tiebreak is by id"
        );
    }
}
