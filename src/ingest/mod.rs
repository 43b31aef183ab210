//! Ingestion pipeline: sources feed the bounded buffer, the buffer flushes
//! batches into partitions.

pub mod buffer;
pub mod syslog;
pub mod tailer;

pub use buffer::{FlushWorker, IngestBuffer};
pub use syslog::SyslogManager;
pub use tailer::{FileTailer, OffsetStore};
