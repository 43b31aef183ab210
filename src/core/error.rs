use thiserror::Error;

#[derive(Error, Debug)]
pub enum GrepWiseError {
    #[error("query syntax error: {message}")]
    QuerySyntax { message: String },

    #[error("eval expression not supported: {0}")]
    EvalUnsupported(String),

    #[error("configuration error: {0}")]
    BadConfig(String),

    #[error("reveal not authorized for this request")]
    UnauthorizedReveal,

    #[error("ingestion buffer full: cannot accept more entries")]
    BufferFull,

    #[error("query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("partition {0} is not available for writes")]
    PartitionUnavailable(String),

    #[error("partition {0} is closed")]
    PartitionClosed(String),

    #[error("archive unavailable for partition {0}")]
    ArchiveUnavailable(String),

    #[error("notification channel down: {0}")]
    NotifyChannelDown(String),

    #[error("index corruption detected: {0}")]
    IndexCorrupt(String),

    #[error("index IO error: {0}")]
    IndexIo(String),

    #[error("config IO error: {0}")]
    ConfigIo(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("channel send error")]
    ChannelSend,

    #[error("unexpected internal error: {0}")]
    Unexpected(String),
}

/// Result type alias for GrepWise operations
pub type Result<T> = std::result::Result<T, GrepWiseError>;

impl GrepWiseError {
    /// Creates a new query syntax error
    pub fn syntax<S: Into<String>>(msg: S) -> Self {
        Self::QuerySyntax {
            message: msg.into(),
        }
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::BadConfig(msg.into())
    }

    /// Creates a new index IO error
    pub fn index_io<S: Into<String>>(msg: S) -> Self {
        Self::IndexIo(msg.into())
    }

    /// Creates a new index corruption error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Self::IndexCorrupt(msg.into())
    }

    /// Creates a new internal error
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if the operation may succeed when retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BufferFull
                | Self::QueryTimeout { .. }
                | Self::RateLimited(_)
                | Self::NotifyChannelDown(_)
                | Self::ChannelSend
                | Self::Io(_)
        )
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::QuerySyntax { .. } | Self::EvalUnsupported(_) => "query",
            Self::BadConfig(_) | Self::ConfigIo(_) => "config",
            Self::UnauthorizedReveal => "auth",
            Self::BufferFull | Self::RateLimited(_) => "capacity",
            Self::QueryTimeout { .. } => "timeout",
            Self::PartitionUnavailable(_)
            | Self::PartitionClosed(_)
            | Self::ArchiveUnavailable(_) => "availability",
            Self::NotifyChannelDown(_) => "notify",
            Self::IndexCorrupt(_) | Self::IndexIo(_) => "integrity",
            Self::NotFound(_) => "not_found",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Join(_) | Self::ChannelSend => "async",
            Self::Unexpected(_) => "internal",
        }
    }
}
