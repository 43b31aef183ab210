//! Domain models and shared infrastructure.

pub mod config;
pub mod error;
pub mod fields;
pub mod retry;
pub mod types;

pub use config::Config;
pub use error::{GrepWiseError, Result};
pub use fields::{FieldRegistry, FieldSource, FieldSpec, FieldType};
pub use types::{
    now_ms, LogEntry, LogId, LogLevel, MetadataMap, PartitionGranularity, PartitionKey, TimeRange,
};
