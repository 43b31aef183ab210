//! GrepWise core - log analysis platform.
//!
//! The ingest-to-query pipeline: directory tailers, syslog listeners, and an
//! HTTP intake feed a bounded buffer; batches land in a time-partitioned
//! inverted index; a piped query language executes over it with caching and
//! redaction; a scheduler evaluates threshold alarms and notifies.
//!
//! # Architecture
//!
//! - `core`: domain models, config, errors
//! - `index`: per-partition inverted index with WAL recovery
//! - `partition`: partition lifecycle (rotation, retention, archival)
//! - `ingest`: buffer, file tailer, syslog listeners
//! - `query`: SPL parser and executor
//! - `alarm`: scheduler and notification sinks
//! - `redact`: sensitive-data masking
//! - `api`: HTTP surface
//!
//! # Example
//!
//! ```no_run
//! use grepwise::core::Config;
//! use grepwise::Application;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let app = Application::new(config)?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod alarm;
pub mod api;
pub mod archive;
pub mod cache;
pub mod cli;
pub mod core;
pub mod events;
pub mod index;
pub mod ingest;
pub mod partition;
pub mod plugin;
pub mod query;
pub mod redact;

use crate::alarm::{AlarmScheduler, AlarmStore, Notifier};
use crate::api::{create_router, ApiState};
use crate::archive::ArchiveStore;
use crate::cache::SearchCache;
use crate::core::{Config, FieldRegistry, GrepWiseError, Result};
use crate::events::EventBus;
use crate::index::IndexEngine;
use crate::ingest::{FileTailer, FlushWorker, IngestBuffer, OffsetStore, SyslogManager};
use crate::partition::PartitionManager;
use crate::plugin::PluginHost;
use crate::query::QueryExecutor;
use crate::redact::Redactor;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Main application coordinator: builds the subsystem graph and runs every
/// task until shutdown.
pub struct Application {
    config: Config,
    events: EventBus,
    engine: Arc<IndexEngine>,
    manager: Arc<PartitionManager>,
    buffer: IngestBuffer,
    worker: Option<FlushWorker>,
    offsets: Arc<OffsetStore>,
    tailers: Vec<FileTailer>,
    syslog: Arc<SyslogManager>,
    redactor: Arc<Redactor>,
    alarms: Arc<AlarmStore>,
    executor: Arc<QueryExecutor>,
    scheduler: Arc<AlarmScheduler>,
    cache: Arc<SearchCache<Arc<crate::query::QueryResult>>>,
    plugins: Arc<PluginHost>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Application {
    /// Wire the full subsystem graph from configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(1024);
        let engine = Arc::new(IndexEngine::new(
            config.storage.index_root.clone(),
            config.storage.granularity,
            events.clone(),
        ));
        let archive = Arc::new(ArchiveStore::new(config.archive.clone()));
        let manager = Arc::new(PartitionManager::new(
            engine.clone(),
            archive,
            config.storage.clone(),
            config.archive.clone(),
        ));
        manager.load()?;

        let registry = Arc::new(FieldRegistry::from_specs(config.fields.clone())?);
        let (buffer, worker) = IngestBuffer::new(&config.buffer, manager.clone(), registry);

        let offsets = Arc::new(OffsetStore::new(config.config_dir.join("tailer-offsets.json")));
        if let Err(e) = offsets.load() {
            tracing::warn!("could not load tailer offsets, starting fresh: {}", e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tailers = Vec::new();
        for dir_config in config.directories.iter().filter(|d| d.enabled) {
            tailers.push(FileTailer::new(
                dir_config.clone(),
                buffer.clone(),
                offsets.clone(),
                shutdown_rx.clone(),
            )?);
        }

        let syslog = Arc::new(SyslogManager::new(
            buffer.clone(),
            config.server.host,
            config.config_dir.join("log-sources.json"),
        ));

        let redactor = Arc::new(Redactor::load(config.config_dir.join("redaction.json"))?);

        let cache = Arc::new(SearchCache::new(config.cache.capacity, config.cache.ttl));
        let executor = Arc::new(QueryExecutor::new(
            engine.clone(),
            manager.clone(),
            cache.clone(),
            config.query.clone(),
        ));

        let plugins = Arc::new(PluginHost::new());
        let registered = plugins.load_manifest(&config.config_dir.join("plugins.json"))?;
        if registered > 0 {
            tracing::info!(count = registered, "plugins registered from manifest");
        }

        let alarms = Arc::new(AlarmStore::new(config.config_dir.join("alarms.json")));
        alarms.load()?;
        let scheduler = Arc::new(AlarmScheduler::new(
            alarms.clone(),
            executor.clone(),
            redactor.clone(),
            Arc::new(Notifier::new()),
            config.alarm.tick_interval,
            config.alarm.notify_max_attempts,
        ));

        Ok(Self {
            config,
            events,
            engine,
            manager,
            buffer,
            worker: Some(worker),
            offsets,
            tailers,
            syslog,
            redactor,
            alarms,
            executor,
            scheduler,
            cache,
            plugins,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Shared state for the HTTP layer.
    fn api_state(&self) -> ApiState {
        ApiState {
            buffer: self.buffer.clone(),
            executor: self.executor.clone(),
            redactor: self.redactor.clone(),
            alarms: self.alarms.clone(),
            scheduler: self.scheduler.clone(),
            syslog: self.syslog.clone(),
            manager: self.manager.clone(),
            cache: self.cache.clone(),
            default_limit: self.config.query.default_limit,
        }
    }

    /// Run until ctrl-c, then drain and persist.
    pub async fn run(mut self) -> Result<()> {
        // Flusher.
        let worker = self.worker.take().expect("run is called once");
        let flusher_handle = tokio::spawn(worker.run());

        // Cache invalidation from post-commit events.
        tokio::spawn(self.cache.clone().run_invalidation(self.events.subscribe()));

        // Tailers.
        for tailer in std::mem::take(&mut self.tailers) {
            tokio::spawn(tailer.run());
        }

        // Syslog sources: persisted ones, then any from the config file.
        if let Err(e) = self.syslog.load().await {
            tracing::error!("failed to load syslog sources: {}", e);
        }
        for source in &self.config.syslog_sources {
            if let Err(e) = self.syslog.add_source(source.clone(), false).await {
                tracing::error!(source = %source.id, "failed to start syslog source: {}", e);
            }
        }

        // Plugins declared in the manifest.
        match self.plugins.start_enabled() {
            Ok(started) if started > 0 => tracing::info!(started, "plugins started"),
            Ok(_) => {},
            Err(e) => tracing::error!("plugin startup failed: {}", e),
        }

        // Alarm scheduler.
        tokio::spawn(self.scheduler.clone().run(self.shutdown_rx.clone()));

        // Retention/archival maintenance tick.
        let maintenance_manager = self.manager.clone();
        let cleanup_interval = self.config.storage.cleanup_interval;
        let mut maintenance_shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = maintenance_manager.run_maintenance() {
                            tracing::error!("maintenance tick failed: {}", e);
                        }
                    },
                    _ = maintenance_shutdown.changed() => {
                        if *maintenance_shutdown.borrow() {
                            return;
                        }
                    },
                }
            }
        });

        // HTTP server.
        let addr = SocketAddr::new(self.config.server.host, self.config.server.http_port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| GrepWiseError::config(format!("cannot bind {}: {}", addr, e)))?;
        tracing::info!(%addr, "HTTP server listening");
        let router = create_router(self.api_state());
        let mut server_shutdown = self.shutdown_rx.clone();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        });
        let server_handle = tokio::spawn(server.into_future());

        // Wait for a stop signal.
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).map_err(
                |e| GrepWiseError::unexpected(format!("cannot install SIGTERM handler: {}", e)),
            )?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            },
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received");
            },
            result = server_handle => {
                match result {
                    Ok(Ok(())) => tracing::info!("HTTP server exited"),
                    Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
                    Err(e) => tracing::error!("HTTP server task failed: {}", e),
                }
            },
        }

        self.shutdown().await;
        // The final flush already committed everything queued; the flusher
        // only exits once every producer handle is gone, so stop it here.
        flusher_handle.abort();
        Ok(())
    }

    /// Drain the buffer, stop listeners, persist state.
    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.buffer.flush().await {
            tracing::warn!("final flush failed: {}", e);
        }
        self.syslog.stop_all();
        self.plugins.stop_all();
        if let Err(e) = self.offsets.save() {
            tracing::warn!("failed to persist tailer offsets: {}", e);
        }
        // Close write handles so the next start replays a clean log.
        for stats in self.engine.stats() {
            let _ = self.engine.close_writes(&stats.key);
        }
        tracing::info!("shutdown complete");
    }
}
