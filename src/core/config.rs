//! Configuration management.
//!
//! Handles the YAML config file, environment variable overrides, CLI
//! argument overrides, validation, and defaults. Precedence: CLI over env
//! over file over defaults.

use crate::core::error::{GrepWiseError, Result};
use crate::core::fields::FieldSpec;
use crate::core::types::PartitionGranularity;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration for the GrepWise core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub archive: ArchiveConfig,
    pub buffer: BufferConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub alarm: AlarmConfig,
    /// Tailed log directories.
    pub directories: Vec<LogDirectoryConfig>,
    /// Syslog listener sources.
    pub syslog_sources: Vec<SyslogSourceConfig>,
    /// Extracted-field definitions.
    pub fields: Vec<FieldSpec>,
    pub logging: LoggingConfig,
    /// Directory for mutable state files (redaction.json, log-sources.json,
    /// alarms.json, tailer-offsets.json). Defaults to ~/.GrepWise/config.
    pub config_dir: PathBuf,
    #[serde(skip)]
    pub debug: bool,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub http_port: u16,
}

/// Index storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub index_root: PathBuf,
    pub granularity: PartitionGranularity,
    /// Cap on simultaneously OPEN/ACTIVE partitions.
    pub max_active_partitions: usize,
    /// Retention policies applied on the cleanup tick.
    pub retention: Vec<RetentionPolicy>,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Age past which a CLOSED partition is archived (when archival is on).
    #[serde(with = "humantime_serde")]
    pub auto_archive_threshold: Duration,
}

/// Age-based retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,
    pub max_age_days: u32,
    pub enabled: bool,
    /// When set, the policy only removes entries from these sources instead
    /// of deleting whole partitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_to_sources: Option<Vec<String>>,
}

/// Archive storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub archive_dir: PathBuf,
    /// lz4 compression level, 1 (fastest) to 9 (smallest).
    pub compression_level: u32,
    pub max_archive_size_mb: u64,
    pub archive_retention_days: u32,
    pub auto_archive_enabled: bool,
}

/// Ingestion buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Queue capacity in entries.
    pub capacity: usize,
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// How long producers block before receiving BufferFull.
    #[serde(with = "humantime_serde")]
    pub producer_timeout: Duration,
}

/// Search cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

/// Query execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Deadline applied to each search and alarm evaluation.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Default page size for search responses.
    pub default_limit: usize,
}

/// Alarm scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// Scheduler wake-up resolution; each alarm still honors its own
    /// interval_ms.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Notification delivery retry attempts.
    pub notify_max_attempts: u32,
}

/// One tailed directory of log files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDirectoryConfig {
    pub id: String,
    pub directory: PathBuf,
    /// Glob-style pattern matched against file names, e.g. "*.log".
    pub file_pattern: String,
    pub scan_interval_seconds: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One syslog listener source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyslogSourceConfig {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub syslog_port: u16,
    pub syslog_protocol: SyslogProtocol,
    pub syslog_format: SyslogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyslogProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyslogFormat {
    Rfc3164,
    Rfc5424,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// JSON-formatted output for headless deployments.
    pub structured: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            http_port: 8080,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_root: PathBuf::from("./data/index"),
            granularity: PartitionGranularity::Daily,
            max_active_partitions: 3,
            retention: vec![RetentionPolicy {
                name: "default".to_string(),
                max_age_days: 30,
                enabled: true,
                apply_to_sources: None,
            }],
            cleanup_interval: Duration::from_secs(300),
            auto_archive_threshold: Duration::from_secs(24 * 3600),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("./data/archive"),
            compression_level: 4,
            max_archive_size_mb: 1024,
            archive_retention_days: 90,
            auto_archive_enabled: true,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            batch_size: 500,
            flush_interval: Duration::from_millis(1000),
            producer_timeout: Duration::from_millis(500),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl: Duration::from_secs(30),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            default_limit: 100,
        }
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            notify_max_attempts: 3,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            structured: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::home_dir()
            .map(|h| h.join(".GrepWise").join("config"))
            .unwrap_or_else(|| PathBuf::from(".GrepWise/config"));
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            archive: ArchiveConfig::default(),
            buffer: BufferConfig::default(),
            cache: CacheConfig::default(),
            query: QueryConfig::default(),
            alarm: AlarmConfig::default(),
            directories: Vec::new(),
            syslog_sources: Vec::new(),
            fields: Vec::new(),
            logging: LoggingConfig::default(),
            config_dir,
            debug: false,
        }
    }
}

impl Config {
    /// Validate the configuration, rejecting values the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 {
            return Err(GrepWiseError::config("http_port must be non-zero"));
        }
        if self.storage.max_active_partitions == 0 {
            return Err(GrepWiseError::config("max_active_partitions must be at least 1"));
        }
        if !(1..=9).contains(&self.archive.compression_level) {
            return Err(GrepWiseError::config(format!(
                "compression_level must be 1-9, got {}",
                self.archive.compression_level
            )));
        }
        if self.buffer.capacity == 0 || self.buffer.batch_size == 0 {
            return Err(GrepWiseError::config("buffer capacity and batch_size must be non-zero"));
        }
        if self.buffer.batch_size > self.buffer.capacity {
            return Err(GrepWiseError::config(format!(
                "batch_size {} exceeds buffer capacity {}",
                self.buffer.batch_size, self.buffer.capacity
            )));
        }
        if self.cache.capacity == 0 {
            return Err(GrepWiseError::config("cache capacity must be non-zero"));
        }
        for source in &self.syslog_sources {
            if source.syslog_port == 0 {
                return Err(GrepWiseError::config(format!(
                    "syslog source {} has port 0",
                    source.id
                )));
            }
        }
        for dir in &self.directories {
            if dir.scan_interval_seconds == 0 {
                return Err(GrepWiseError::config(format!(
                    "directory {} has scan_interval_seconds 0",
                    dir.id
                )));
            }
        }
        for policy in &self.storage.retention {
            if policy.enabled && policy.max_age_days == 0 {
                return Err(GrepWiseError::config(format!(
                    "retention policy {} has max_age_days 0",
                    policy.name
                )));
            }
        }
        Ok(())
    }
}

/// Builder applying file, env, and CLI layers in precedence order.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Load the base layer from YAML content.
    pub fn from_yaml(mut self, content: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(content)
            .map_err(|e| GrepWiseError::config(format!("failed to parse config: {}", e)))?;
        Ok(self)
    }

    /// Apply GW_* environment overrides.
    pub fn from_env(mut self) -> Result<Self> {
        if let Ok(host) = std::env::var("GW_HOST") {
            self.config.server.host = host
                .parse()
                .map_err(|_| GrepWiseError::config(format!("invalid GW_HOST: {}", host)))?;
        }
        if let Ok(port) = std::env::var("GW_HTTP_PORT") {
            self.config.server.http_port = port
                .parse()
                .map_err(|_| GrepWiseError::config(format!("invalid GW_HTTP_PORT: {}", port)))?;
        }
        if let Ok(port) = std::env::var("GW_SYSLOG_PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| GrepWiseError::config(format!("invalid GW_SYSLOG_PORT: {}", port)))?;
            for source in &mut self.config.syslog_sources {
                source.syslog_port = port;
            }
        }
        Ok(self)
    }

    pub fn host(mut self, host: IpAddr) -> Self {
        self.config.server.host = host;
        self
    }

    pub fn http_port(mut self, port: u16) -> Self {
        self.config.server.http_port = port;
        self
    }

    pub fn index_root(mut self, path: PathBuf) -> Self {
        self.config.storage.index_root = path;
        self
    }

    pub fn archive_dir(mut self, path: PathBuf) -> Self {
        self.config.archive.archive_dir = path;
        self
    }

    pub fn config_dir(mut self, path: PathBuf) -> Self {
        self.config.config_dir = path;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
