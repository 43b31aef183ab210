use crate::core::error::{GrepWiseError, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Upper bound on stored message length. Longer messages are truncated at
/// ingest; `raw_content` keeps the original line verbatim.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Unique identifier for a log entry, assigned at ingest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogId(Arc<str>);

impl LogId {
    /// Generate a new id: ingest timestamp in hex plus 8 random bytes.
    pub fn generate(timestamp_ms: i64) -> Self {
        let mut nonce = [0u8; 8];
        rand::Rng::fill(&mut rand::thread_rng(), &mut nonce);
        LogId(Arc::from(format!("{:012x}-{}", timestamp_ms.max(0), hex::encode(nonce)).as_str()))
    }

    pub fn new<S: AsRef<str>>(id: S) -> Self {
        LogId(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for LogId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for LogId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(LogId(Arc::from(s.as_str())))
    }
}

/// Normalized log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Map a syslog severity number (RFC5424 table) to a level.
    pub fn from_syslog_severity(severity: u8) -> Self {
        match severity {
            0..=3 => Self::Error,
            4 => Self::Warn,
            5 | 6 => Self::Info,
            7 => Self::Debug,
            _ => Self::Unknown,
        }
    }

    /// Scan a raw line for a recognizable level token.
    pub fn detect(line: &str) -> Self {
        for token in line.split(|c: char| !c.is_ascii_alphabetic()) {
            if token.len() < 3 || token.len() > 7 {
                continue;
            }
            match token.to_ascii_uppercase().as_str() {
                "TRACE" => return Self::Trace,
                "DEBUG" => return Self::Debug,
                "INFO" => return Self::Info,
                "WARN" | "WARNING" => return Self::Warn,
                "ERROR" | "ERR" | "SEVERE" => return Self::Error,
                "FATAL" => return Self::Fatal,
                _ => {},
            }
        }
        Self::Unknown
    }
}

impl FromStr for LogLevel {
    type Err = GrepWiseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Self::Trace),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" | "ERR" => Ok(Self::Error),
            "FATAL" => Ok(Self::Fatal),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(GrepWiseError::config(format!("unknown log level: {}", other))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Small string-to-string map for entry metadata.
/// Most entries carry fewer than 6 keys, avoiding heap allocation in the
/// common case.
#[derive(Debug, Clone, Default)]
pub struct MetadataMap(SmallVec<[(Arc<str>, Arc<str>); 6]>);

impl MetadataMap {
    pub fn new() -> Self {
        MetadataMap(SmallVec::new())
    }

    /// Insert or replace a key.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) {
        let key = key.as_ref();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| k.as_ref() == key) {
            slot.1 = Arc::from(value.as_ref());
        } else {
            self.0.push((Arc::from(key), Arc::from(value.as_ref())));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k.as_ref() == key)
    }

    /// Replace the value stored under `key` in place, if present.
    pub fn replace_value(&mut self, key: &str, value: impl AsRef<str>) -> bool {
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| k.as_ref() == key) {
            slot.1 = Arc::from(value.as_ref());
            true
        } else {
            false
        }
    }
}

impl PartialEq for MetadataMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl Serialize for MetadataMap {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k.as_ref(), v.as_ref())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MetadataMap {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = std::collections::BTreeMap::<String, String>::deserialize(deserializer)?;
        let mut out = MetadataMap::new();
        for (k, v) in map {
            out.insert(&k, &v);
        }
        Ok(out)
    }
}

/// Canonical log record. Immutable once committed to a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogId,
    /// Milliseconds since epoch; parsed from the record, falling back to
    /// ingest time.
    pub timestamp: i64,
    /// Internal record time when it differs from the assigned timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_time: Option<i64>,
    pub level: LogLevel,
    pub message: String,
    pub source: String,
    #[serde(default)]
    pub metadata: MetadataMap,
    /// Original line, preserved verbatim.
    pub raw_content: String,
}

impl LogEntry {
    /// Create a new entry with a freshly generated id. The message is
    /// length-bounded; `raw_content` defaults to the message.
    pub fn new(
        timestamp: i64,
        level: LogLevel,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let mut message: String = message.into();
        if message.len() > MAX_MESSAGE_LEN {
            let mut cut = MAX_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        let raw_content = message.clone();
        Self {
            id: LogId::generate(timestamp),
            timestamp,
            record_time: None,
            level,
            message,
            source: source.into(),
            metadata: MetadataMap::new(),
            raw_content,
        }
    }

    pub fn with_record_time(mut self, record_time: i64) -> Self {
        self.record_time = Some(record_time);
        self
    }

    pub fn with_raw_content(mut self, raw: impl Into<String>) -> Self {
        self.raw_content = raw.into();
        self
    }

    pub fn with_metadata(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Value of a named field as a string, for filtering and sorting.
    /// Unknown fields resolve through metadata; absent keys yield None.
    pub fn field_value(&self, field: &str) -> Option<String> {
        match field {
            "id" => Some(self.id.to_string()),
            "timestamp" => Some(self.timestamp.to_string()),
            "level" => Some(self.level.as_str().to_string()),
            "message" => Some(self.message.clone()),
            "source" => Some(self.source.clone()),
            _ => self.metadata.get(field).map(str::to_string),
        }
    }
}

/// Time-bucket granularity for partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionGranularity {
    Daily,
    Weekly,
    Monthly,
}

impl PartitionGranularity {
    /// Derive the partition key for a timestamp.
    pub fn key_for(&self, timestamp_ms: i64) -> PartitionKey {
        let dt = Utc
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
        let key = match self {
            Self::Daily => dt.format("%Y-%m-%d").to_string(),
            Self::Weekly => dt.format("%G-W%V").to_string(),
            Self::Monthly => dt.format("%Y-%m").to_string(),
        };
        PartitionKey(Arc::from(key.as_str()))
    }

    /// Inclusive time bounds `[start, end]` covered by a partition key.
    pub fn key_bounds(&self, key: &PartitionKey) -> Result<TimeRange> {
        let start: DateTime<Utc> = match self {
            Self::Daily => {
                let date = NaiveDate::parse_from_str(key.as_str(), "%Y-%m-%d").map_err(|e| {
                    GrepWiseError::config(format!("invalid daily partition key {}: {}", key, e))
                })?;
                Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is valid"))
            },
            Self::Weekly => {
                let (year, week) = key
                    .as_str()
                    .split_once("-W")
                    .ok_or_else(|| {
                        GrepWiseError::config(format!("invalid weekly partition key {}", key))
                    })
                    .and_then(|(y, w)| {
                        let year: i32 = y.parse().map_err(|_| {
                            GrepWiseError::config(format!("invalid year in key {}", key))
                        })?;
                        let week: u32 = w.parse().map_err(|_| {
                            GrepWiseError::config(format!("invalid week in key {}", key))
                        })?;
                        Ok((year, week))
                    })?;
                let date = NaiveDate::from_isoywd_opt(year, week, chrono::Weekday::Mon)
                    .ok_or_else(|| {
                        GrepWiseError::config(format!("invalid ISO week key {}", key))
                    })?;
                Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is valid"))
            },
            Self::Monthly => {
                let date =
                    NaiveDate::parse_from_str(&format!("{}-01", key.as_str()), "%Y-%m-%d")
                        .map_err(|e| {
                            GrepWiseError::config(format!(
                                "invalid monthly partition key {}: {}",
                                key, e
                            ))
                        })?;
                Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is valid"))
            },
        };
        let end = match self {
            Self::Daily => start + ChronoDuration::days(1),
            Self::Weekly => start + ChronoDuration::weeks(1),
            Self::Monthly => {
                let (y, m) = (start.year(), start.month());
                let (ny, nm) = if m == 12 { (y + 1, 1) } else { (y, m + 1) };
                Utc.from_utc_datetime(
                    &NaiveDate::from_ymd_opt(ny, nm, 1)
                        .expect("first of month is valid")
                        .and_hms_opt(0, 0, 0)
                        .expect("midnight is valid"),
                )
            },
        };
        Ok(TimeRange::new(start.timestamp_millis(), end.timestamp_millis() - 1))
    }
}

impl fmt::Display for PartitionGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => write!(f, "DAILY"),
            Self::Weekly => write!(f, "WEEKLY"),
            Self::Monthly => write!(f, "MONTHLY"),
        }
    }
}

/// Key identifying one time-bucketed partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(Arc<str>);

impl PartitionKey {
    pub fn new<S: AsRef<str>>(key: S) -> Self {
        PartitionKey(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for PartitionKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PartitionKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(PartitionKey(Arc::from(s.as_str())))
    }
}

/// Inclusive time range in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeRange {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    /// Range covering all representable time.
    pub fn all() -> Self {
        Self {
            start_ms: 0,
            end_ms: i64::MAX,
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start_ms && ts <= self.end_ms
    }

    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.start_ms <= other.end_ms && other.start_ms <= self.end_ms
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_ms - self.start_ms).max(0)
    }
}

/// Milliseconds since epoch, now.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
