//! Syslog listeners and wire parsing.
//!
//! Each configured source runs a UDP socket task or a TCP accept loop on its
//! own port, parsing RFC3164 (BSD) or RFC5424 (IETF) frames into entries.
//! UDP has no flow control and drops on overload; TCP is newline-framed with
//! a per-connection read timeout. Sources are persisted to
//! `log-sources.json` and restored at startup.

use crate::core::config::{SyslogFormat, SyslogProtocol, SyslogSourceConfig};
use crate::core::error::{GrepWiseError, Result};
use crate::core::types::{now_ms, LogEntry, LogLevel};
use crate::ingest::buffer::IngestBuffer;
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

const TCP_READ_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_DATAGRAM: usize = 64 * 1024;

/// Parse a syslog frame according to the configured format.
pub fn parse_message(raw: &str, format: SyslogFormat, now: i64) -> Result<LogEntry> {
    match format {
        SyslogFormat::Rfc3164 => parse_rfc3164(raw, now),
        SyslogFormat::Rfc5424 => parse_rfc5424(raw, now),
    }
}

/// `<PRI>` header: returns (facility, severity, rest).
fn parse_priority(raw: &str) -> Result<(u8, u8, &str)> {
    let rest = raw
        .strip_prefix('<')
        .ok_or_else(|| GrepWiseError::syntax("missing syslog priority"))?;
    let close = rest
        .find('>')
        .ok_or_else(|| GrepWiseError::syntax("unterminated syslog priority"))?;
    let pri: u16 = rest[..close]
        .parse()
        .map_err(|_| GrepWiseError::syntax("invalid syslog priority"))?;
    if pri > 191 {
        return Err(GrepWiseError::syntax("syslog priority out of range"));
    }
    Ok(((pri / 8) as u8, (pri % 8) as u8, &rest[close + 1..]))
}

/// RFC3164: `<PRI>Mmm dd HH:MM:SS HOST TAG: MSG`.
fn parse_rfc3164(raw: &str, now: i64) -> Result<LogEntry> {
    let (facility, severity, rest) = parse_priority(raw)?;

    let (timestamp, rest) = match rest.get(..15) {
        Some(ts_str) => {
            let year = Utc
                .timestamp_millis_opt(now)
                .single()
                .map(|dt| dt.year())
                .unwrap_or(1970);
            match NaiveDateTime::parse_from_str(
                &format!("{} {}", year, ts_str),
                "%Y %b %e %H:%M:%S",
            ) {
                Ok(dt) => (
                    Utc.from_utc_datetime(&dt).timestamp_millis(),
                    rest[15..].trim_start(),
                ),
                Err(_) => (now, rest),
            }
        },
        None => (now, rest),
    };

    let (host, rest) = match rest.split_once(' ') {
        Some((host, rest)) => (host, rest),
        None => ("", rest),
    };

    // TAG: MSG, where the tag may carry a [pid] suffix.
    let (tag, message) = match rest.split_once(':') {
        Some((tag, msg)) if !tag.contains(' ') => (tag, msg.trim_start()),
        _ => ("", rest),
    };
    let (app, pid) = match tag.split_once('[') {
        Some((app, pid)) => (app, pid.trim_end_matches(']')),
        None => (tag, ""),
    };

    let level = LogLevel::from_syslog_severity(severity);
    let source = if app.is_empty() {
        host.to_string()
    } else {
        format!("{}/{}", host, app)
    };
    let mut entry = LogEntry::new(timestamp, level, message, source).with_raw_content(raw);
    entry.record_time = Some(timestamp);
    entry.metadata.insert("host", host);
    if !app.is_empty() {
        entry.metadata.insert("app", app);
    }
    if !pid.is_empty() {
        entry.metadata.insert("procid", pid);
    }
    entry.metadata.insert("facility", facility.to_string());
    entry.metadata.insert("severity", severity.to_string());
    Ok(entry)
}

/// RFC5424: `<PRI>VERSION TIMESTAMP HOST APP PROCID MSGID STRUCTURED MSG`.
fn parse_rfc5424(raw: &str, now: i64) -> Result<LogEntry> {
    let (facility, severity, rest) = parse_priority(raw)?;

    let mut parts = rest.splitn(7, ' ');
    let version = parts
        .next()
        .ok_or_else(|| GrepWiseError::syntax("missing syslog version"))?;
    if version != "1" {
        return Err(GrepWiseError::syntax(format!("unsupported syslog version: {}", version)));
    }
    let ts_str = parts
        .next()
        .ok_or_else(|| GrepWiseError::syntax("missing syslog timestamp"))?;
    let host = parts.next().unwrap_or("-");
    let app = parts.next().unwrap_or("-");
    let procid = parts.next().unwrap_or("-");
    let msgid = parts.next().unwrap_or("-");
    let tail = parts.next().unwrap_or("");

    let timestamp = if ts_str == "-" {
        now
    } else {
        DateTime::parse_from_rfc3339(ts_str)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(now)
    };

    // Structured data is either nil or one or more bracketed groups.
    let message = skip_structured_data(tail);

    let nil = |s: &str| if s == "-" { String::new() } else { s.to_string() };
    let host = nil(host);
    let app = nil(app);
    let level = LogLevel::from_syslog_severity(severity);
    let source = match (host.is_empty(), app.is_empty()) {
        (false, false) => format!("{}/{}", host, app),
        (false, true) => host.clone(),
        (true, false) => app.clone(),
        (true, true) => "syslog".to_string(),
    };

    let mut entry = LogEntry::new(timestamp, level, message, source).with_raw_content(raw);
    entry.record_time = Some(timestamp);
    if !host.is_empty() {
        entry.metadata.insert("host", &host);
    }
    if !app.is_empty() {
        entry.metadata.insert("app", &app);
    }
    if procid != "-" {
        entry.metadata.insert("procid", procid);
    }
    if msgid != "-" {
        entry.metadata.insert("msgid", msgid);
    }
    entry.metadata.insert("facility", facility.to_string());
    entry.metadata.insert("severity", severity.to_string());
    Ok(entry)
}

/// Step over the STRUCTURED-DATA element(s) and return the free-form MSG.
fn skip_structured_data(tail: &str) -> String {
    let tail = tail.trim_start();
    if let Some(rest) = tail.strip_prefix('-') {
        return rest.trim_start().to_string();
    }
    if !tail.starts_with('[') {
        return tail.to_string();
    }
    let bytes = tail.as_bytes();
    let mut i = 0;
    let mut escaped = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if !escaped => escaped = true,
            b']' if !escaped => {
                // End of one SD element; another may follow immediately.
                if i + 1 < bytes.len() && bytes[i + 1] == b'[' {
                    i += 1;
                    continue;
                }
                return tail[i + 1..].trim_start().to_string();
            },
            _ => escaped = false,
        }
        i += 1;
    }
    String::new()
}

/// One running syslog source and its shutdown signal.
struct RunningSource {
    config: SyslogSourceConfig,
    shutdown: watch::Sender<bool>,
}

/// Owns the set of syslog sources: persistence, listener lifecycle.
pub struct SyslogManager {
    buffer: IngestBuffer,
    bind_host: IpAddr,
    store_path: PathBuf,
    sources: Mutex<HashMap<String, RunningSource>>,
}

impl SyslogManager {
    pub fn new(buffer: IngestBuffer, bind_host: IpAddr, store_path: PathBuf) -> Self {
        Self {
            buffer,
            bind_host,
            store_path,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted sources and start the enabled ones.
    pub async fn load(&self) -> Result<()> {
        if !self.store_path.exists() {
            return Ok(());
        }
        let content = std::fs::read(&self.store_path)
            .map_err(|e| GrepWiseError::ConfigIo(format!("cannot read log-sources: {}", e)))?;
        let configs: Vec<SyslogSourceConfig> = serde_json::from_slice(&content)
            .map_err(|e| GrepWiseError::ConfigIo(format!("bad log-sources file: {}", e)))?;
        for config in configs {
            if let Err(e) = self.add_source(config.clone(), false).await {
                tracing::error!(source = %config.id, "failed to start syslog source: {}", e);
            }
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let configs: Vec<SyslogSourceConfig> = self
            .sources
            .lock()
            .values()
            .map(|s| s.config.clone())
            .collect();
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GrepWiseError::ConfigIo(format!("cannot create config dir: {}", e)))?;
        }
        let bytes = serde_json::to_vec_pretty(&configs)?;
        std::fs::write(&self.store_path, bytes)
            .map_err(|e| GrepWiseError::ConfigIo(format!("cannot write log-sources: {}", e)))
    }

    /// Register a source and start its listener if enabled.
    pub async fn add_source(&self, config: SyslogSourceConfig, persist: bool) -> Result<()> {
        if self.sources.lock().contains_key(&config.id) {
            return Err(GrepWiseError::config(format!("source {} already exists", config.id)));
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if config.enabled {
            let listener = SyslogListener {
                config: config.clone(),
                buffer: self.buffer.clone(),
                bind_host: self.bind_host,
                shutdown: shutdown_rx,
            };
            // Bind now so configuration errors surface synchronously.
            listener.spawn().await?;
        }
        self.sources.lock().insert(
            config.id.clone(),
            RunningSource {
                config,
                shutdown: shutdown_tx,
            },
        );
        if persist {
            self.persist()?;
        }
        Ok(())
    }

    /// Stop and forget a source.
    pub fn remove_source(&self, id: &str) -> Result<()> {
        let removed = self.sources.lock().remove(id);
        match removed {
            Some(source) => {
                let _ = source.shutdown.send(true);
                self.persist()?;
                Ok(())
            },
            None => Err(GrepWiseError::NotFound(format!("source {}", id))),
        }
    }

    pub fn list_sources(&self) -> Vec<SyslogSourceConfig> {
        self.sources.lock().values().map(|s| s.config.clone()).collect()
    }

    pub fn stop_all(&self) {
        for source in self.sources.lock().values() {
            let _ = source.shutdown.send(true);
        }
    }
}

struct SyslogListener {
    config: SyslogSourceConfig,
    buffer: IngestBuffer,
    bind_host: IpAddr,
    shutdown: watch::Receiver<bool>,
}

impl SyslogListener {
    async fn spawn(self) -> Result<()> {
        match self.config.syslog_protocol {
            SyslogProtocol::Udp => {
                let socket = UdpSocket::bind((self.bind_host, self.config.syslog_port))
                    .await
                    .map_err(|e| {
                        GrepWiseError::config(format!(
                            "cannot bind UDP {}: {}",
                            self.config.syslog_port, e
                        ))
                    })?;
                tracing::info!(
                    source = %self.config.id,
                    port = self.config.syslog_port,
                    "syslog UDP listener started"
                );
                tokio::spawn(self.run_udp(socket));
            },
            SyslogProtocol::Tcp => {
                let listener = TcpListener::bind((self.bind_host, self.config.syslog_port))
                    .await
                    .map_err(|e| {
                        GrepWiseError::config(format!(
                            "cannot bind TCP {}: {}",
                            self.config.syslog_port, e
                        ))
                    })?;
                tracing::info!(
                    source = %self.config.id,
                    port = self.config.syslog_port,
                    "syslog TCP listener started"
                );
                tokio::spawn(self.run_tcp(listener));
            },
        }
        Ok(())
    }

    async fn run_udp(mut self, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, _peer)) => {
                            let raw = String::from_utf8_lossy(&buf[..len]);
                            self.handle_datagram(raw.trim_end());
                        },
                        Err(e) => {
                            tracing::warn!(source = %self.config.id, "UDP recv error: {}", e);
                        },
                    }
                },
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        tracing::debug!(source = %self.config.id, "UDP listener stopping");
                        return;
                    }
                },
            }
        }
    }

    async fn run_tcp(mut self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tracing::debug!(source = %self.config.id, %peer, "syslog TCP connection");
                            let config = self.config.clone();
                            let buffer = self.buffer.clone();
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(handle_tcp_connection(stream, config, buffer, shutdown));
                        },
                        Err(e) => {
                            tracing::warn!(source = %self.config.id, "accept failed: {}", e);
                        },
                    }
                },
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        tracing::debug!(source = %self.config.id, "TCP listener stopping");
                        return;
                    }
                },
            }
        }
    }

    /// Parse and enqueue one datagram, dropping on backpressure.
    fn handle_datagram(&self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        match parse_message(raw, self.config.syslog_format, now_ms()) {
            Ok(entry) => {
                if let Err(e) = self.buffer.try_push(entry) {
                    tracing::debug!(source = %self.config.id, "dropping datagram: {}", e);
                }
            },
            Err(e) => {
                tracing::debug!(source = %self.config.id, "unparseable frame: {}", e);
            },
        }
    }
}

async fn handle_tcp_connection(
    stream: tokio::net::TcpStream,
    config: SyslogSourceConfig,
    buffer: IngestBuffer,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = tokio::io::BufReader::new(stream).lines();
    loop {
        tokio::select! {
            result = tokio::time::timeout(TCP_READ_TIMEOUT, lines.next_line()) => {
                match result {
                    Ok(Ok(Some(line))) => {
                        let raw = line.trim_end();
                        if raw.is_empty() {
                            continue;
                        }
                        match parse_message(raw, config.syslog_format, now_ms()) {
                            Ok(entry) => {
                                if let Err(e) = buffer.push(entry).await {
                                    tracing::warn!(source = %config.id, "dropping TCP frame: {}", e);
                                }
                            },
                            Err(e) => {
                                tracing::debug!(source = %config.id, "unparseable frame: {}", e);
                            },
                        }
                    },
                    Ok(Ok(None)) => return,
                    Ok(Err(e)) => {
                        tracing::debug!(source = %config.id, "TCP read error: {}", e);
                        return;
                    },
                    Err(_) => {
                        tracing::debug!(source = %config.id, "TCP connection idle timeout");
                        return;
                    },
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            },
        }
    }
}
