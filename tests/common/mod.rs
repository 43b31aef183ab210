//! Shared wiring for integration tests: the full component graph on
//! temporary directories, with the flush worker running.

use grepwise::alarm::{AlarmScheduler, AlarmStore, Notifier};
use grepwise::api::{create_router, ApiState};
use grepwise::archive::ArchiveStore;
use grepwise::cache::SearchCache;
use grepwise::core::config::{ArchiveConfig, BufferConfig, QueryConfig, StorageConfig};
use grepwise::core::{FieldRegistry, PartitionGranularity};
use grepwise::events::EventBus;
use grepwise::index::IndexEngine;
use grepwise::ingest::{IngestBuffer, SyslogManager};
use grepwise::partition::PartitionManager;
use grepwise::query::{QueryExecutor, QueryResult};
use grepwise::redact::Redactor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestApp {
    pub engine: Arc<IndexEngine>,
    pub manager: Arc<PartitionManager>,
    pub buffer: IngestBuffer,
    pub executor: Arc<QueryExecutor>,
    pub redactor: Arc<Redactor>,
    pub alarms: Arc<AlarmStore>,
    pub scheduler: Arc<AlarmScheduler>,
    pub syslog: Arc<SyslogManager>,
    pub cache: Arc<SearchCache<Arc<QueryResult>>>,
    pub dir: TempDir,
}

pub async fn build(granularity: PartitionGranularity, max_active_partitions: usize) -> TestApp {
    let dir = TempDir::new().unwrap();
    let events = EventBus::new(256);
    let storage = StorageConfig {
        index_root: dir.path().join("index"),
        granularity,
        max_active_partitions,
        retention: vec![],
        cleanup_interval: Duration::from_secs(300),
        auto_archive_threshold: Duration::from_secs(3600),
    };
    let archive_config = ArchiveConfig {
        archive_dir: dir.path().join("archive"),
        compression_level: 1,
        max_archive_size_mb: 1024,
        archive_retention_days: 30,
        auto_archive_enabled: true,
    };
    let engine = Arc::new(IndexEngine::new(
        storage.index_root.clone(),
        granularity,
        events.clone(),
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
        capacity: 10_000,
        batch_size: 500,
        flush_interval: Duration::from_millis(50),
        producer_timeout: Duration::from_millis(100),
    };
    let (buffer, worker) = IngestBuffer::new(
        &buffer_config,
        manager.clone(),
        Arc::new(FieldRegistry::empty()),
    );
    tokio::spawn(worker.run());

    let cache = Arc::new(SearchCache::new(64, Duration::from_secs(30)));
    tokio::spawn(cache.clone().run_invalidation(events.subscribe()));

    let executor = Arc::new(QueryExecutor::new(
        engine.clone(),
        manager.clone(),
        cache.clone(),
        QueryConfig {
            timeout: Duration::from_secs(10),
            default_limit: 100,
        },
    ));

    let redactor = Arc::new(Redactor::load(dir.path().join("config/redaction.json")).unwrap());
    let alarms = Arc::new(AlarmStore::new(dir.path().join("config/alarms.json")));
    alarms.load().unwrap();
    let scheduler = Arc::new(AlarmScheduler::new(
        alarms.clone(),
        executor.clone(),
        redactor.clone(),
        Arc::new(Notifier::new()),
        Duration::from_secs(1),
        3,
    ));

    let syslog = Arc::new(SyslogManager::new(
        buffer.clone(),
        "127.0.0.1".parse().unwrap(),
        dir.path().join("config/log-sources.json"),
    ));

    TestApp {
        engine,
        manager,
        buffer,
        executor,
        redactor,
        alarms,
        scheduler,
        syslog,
        cache,
        dir,
    }
}

/// Serve the API router on an ephemeral port; returns the base URL.
pub async fn serve_http(app: &TestApp) -> String {
    let state = ApiState {
        buffer: app.buffer.clone(),
        executor: app.executor.clone(),
        redactor: app.redactor.clone(),
        alarms: app.alarms.clone(),
        scheduler: app.scheduler.clone(),
        syslog: app.syslog.clone(),
        manager: app.manager.clone(),
        cache: app.cache.clone(),
        default_limit: 100,
    };
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
