//! Sensitive-data redaction.
//!
//! The config is a grouped map: each property key is a single keyword or a
//! JSON-encoded list of keywords, and the value carries the regex patterns
//! for that group. A flattened view exposes the keyword set (for key-based
//! metadata masking) and the ordered pattern list (for value masking).
//! Legacy flat `{keys, patterns}` files are migrated to the grouped format
//! on load and rewritten.

use crate::core::error::{GrepWiseError, Result};
use crate::core::types::LogEntry;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Mask for search results and exports.
pub const SEARCH_MASK: &str = "*****";
/// Mask for alarm payloads.
pub const ALARM_MASK: &str = "***";

const DEFAULT_GROUP_KEY: &str = r#"["password","passwd"]"#;
const DEFAULT_PATTERN: &str = r"(?i)\b(password|passwd)\s*[=:]\s*(\S+)";

/// One group's patterns as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedactionGroup {
    pub patterns: Vec<String>,
}

/// Grouped configuration plus the flattened convenience view.
#[derive(Debug, Clone, Serialize)]
pub struct RedactionView {
    pub groups: BTreeMap<String, RedactionGroup>,
    pub keys: Vec<String>,
    pub patterns: Vec<String>,
}

struct Inner {
    groups: BTreeMap<String, RedactionGroup>,
    keys: HashSet<String>,
    patterns: Vec<Regex>,
}

pub struct Redactor {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl Redactor {
    /// Load `redaction.json` from the config directory, creating the default
    /// config if the file does not exist.
    pub fn load(path: PathBuf) -> Result<Self> {
        let groups = if path.exists() {
            let content = std::fs::read(&path)
                .map_err(|e| GrepWiseError::ConfigIo(format!("cannot read redaction config: {}", e)))?;
            let (groups, migrated) = parse_config(&content)?;
            if migrated {
                write_config(&path, &groups)?;
                tracing::info!("migrated legacy flat redaction config to grouped format");
            }
            groups
        } else {
            let groups = default_groups();
            write_config(&path, &groups)?;
            groups
        };
        let inner = build_inner(groups)?;
        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }

    /// Replace the grouped config, validate, persist, and swap in.
    pub fn set_config(&self, mut groups: BTreeMap<String, RedactionGroup>) -> Result<()> {
        ensure_defaults(&mut groups);
        let inner = build_inner(groups.clone())?;
        write_config(&self.path, &groups)?;
        *self.inner.write() = inner;
        Ok(())
    }

    /// Re-read the config from disk.
    pub fn reload(&self) -> Result<()> {
        let content = std::fs::read(&self.path)
            .map_err(|e| GrepWiseError::ConfigIo(format!("cannot read redaction config: {}", e)))?;
        let (groups, _) = parse_config(&content)?;
        let inner = build_inner(groups)?;
        *self.inner.write() = inner;
        Ok(())
    }

    /// Current config with the flattened view.
    pub fn view(&self) -> RedactionView {
        let inner = self.inner.read();
        let mut keys: Vec<String> = inner.keys.iter().cloned().collect();
        keys.sort();
        RedactionView {
            groups: inner.groups.clone(),
            keys,
            patterns: inner.patterns.iter().map(|r| r.as_str().to_string()).collect(),
        }
    }

    /// Redact an outgoing entry with the given mask.
    pub fn redact(&self, entry: &LogEntry, mask: &str) -> LogEntry {
        let inner = self.inner.read();
        let mut out = entry.clone();
        out.message = apply_patterns(&entry.message, &inner.patterns, mask);
        out.raw_content = apply_patterns(&entry.raw_content, &inner.patterns, mask);
        for (key, value) in entry.metadata.iter() {
            if inner.keys.contains(&key.to_lowercase()) {
                out.metadata.replace_value(key, mask);
            } else {
                let redacted = apply_patterns(value, &inner.patterns, mask);
                if redacted != value {
                    out.metadata.replace_value(key, redacted);
                }
            }
        }
        out
    }
}

fn default_groups() -> BTreeMap<String, RedactionGroup> {
    let mut groups = BTreeMap::new();
    groups.insert(
        DEFAULT_GROUP_KEY.to_string(),
        RedactionGroup {
            patterns: vec![DEFAULT_PATTERN.to_string()],
        },
    );
    groups
}

fn ensure_defaults(groups: &mut BTreeMap<String, RedactionGroup>) {
    let has_defaults = groups
        .keys()
        .flat_map(|k| expand_group_key(k))
        .any(|k| k == "password");
    if !has_defaults {
        groups.insert(
            DEFAULT_GROUP_KEY.to_string(),
            RedactionGroup {
                patterns: vec![DEFAULT_PATTERN.to_string()],
            },
        );
    }
}

/// A group key is a plain keyword or a JSON-encoded keyword list.
fn expand_group_key(key: &str) -> Vec<String> {
    if key.trim_start().starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(key) {
            return list.into_iter().map(|k| k.to_lowercase()).collect();
        }
    }
    vec![key.to_lowercase()]
}

/// Parse either the grouped format or the legacy flat one. The bool marks a
/// migration.
fn parse_config(content: &[u8]) -> Result<(BTreeMap<String, RedactionGroup>, bool)> {
    #[derive(Deserialize)]
    struct LegacyFlat {
        keys: Vec<String>,
        patterns: Vec<String>,
    }

    let value: serde_json::Value = serde_json::from_slice(content)
        .map_err(|e| GrepWiseError::ConfigIo(format!("bad redaction config: {}", e)))?;

    // Legacy shape: exactly {keys: [...], patterns: [...]}.
    if let Some(object) = value.as_object() {
        if object.len() == 2 && object.contains_key("keys") && object.contains_key("patterns") {
            let flat: LegacyFlat = serde_json::from_value(value.clone())
                .map_err(|e| GrepWiseError::ConfigIo(format!("bad legacy redaction config: {}", e)))?;
            let mut groups = BTreeMap::new();
            let key = serde_json::to_string(&flat.keys)?;
            groups.insert(
                key,
                RedactionGroup {
                    patterns: flat.patterns,
                },
            );
            ensure_defaults(&mut groups);
            return Ok((groups, true));
        }
    }

    let mut groups: BTreeMap<String, RedactionGroup> = serde_json::from_value(value)
        .map_err(|e| GrepWiseError::ConfigIo(format!("bad redaction config: {}", e)))?;
    ensure_defaults(&mut groups);
    Ok((groups, false))
}

fn write_config(path: &PathBuf, groups: &BTreeMap<String, RedactionGroup>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GrepWiseError::ConfigIo(format!("cannot create config dir: {}", e)))?;
    }
    let bytes = serde_json::to_vec_pretty(groups)?;
    std::fs::write(path, bytes)
        .map_err(|e| GrepWiseError::ConfigIo(format!("cannot write redaction config: {}", e)))
}

fn build_inner(groups: BTreeMap<String, RedactionGroup>) -> Result<Inner> {
    let mut keys = HashSet::new();
    let mut patterns = Vec::new();
    for (group_key, group) in &groups {
        for key in expand_group_key(group_key) {
            keys.insert(key);
        }
        for pattern in &group.patterns {
            patterns.push(Regex::new(pattern).map_err(|e| {
                GrepWiseError::config(format!("invalid redaction pattern '{}': {}", pattern, e))
            })?);
        }
    }
    Ok(Inner {
        groups,
        keys,
        patterns,
    })
}

/// Apply every pattern in order. A pattern with two or more capture groups
/// keeps group 1 and masks group 2; otherwise the whole match is masked.
fn apply_patterns(text: &str, patterns: &[Regex], mask: &str) -> String {
    let mut current = text.to_string();
    for regex in patterns {
        if !regex.is_match(&current) {
            continue;
        }
        let mut out = String::with_capacity(current.len());
        let mut last = 0;
        for caps in regex.captures_iter(&current) {
            let whole = caps.get(0).expect("capture 0 always exists");
            out.push_str(&current[last..whole.start()]);
            match (caps.get(1), caps.get(2)) {
                (Some(_), Some(secret)) => {
                    out.push_str(&current[whole.start()..secret.start()]);
                    out.push_str(mask);
                    out.push_str(&current[secret.end()..whole.end()]);
                },
                _ => out.push_str(mask),
            }
            last = whole.end();
        }
        out.push_str(&current[last..]);
        current = out;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LogLevel;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn redactor(dir: &TempDir) -> Redactor {
        Redactor::load(dir.path().join("redaction.json")).unwrap()
    }

    #[test]
    fn test_default_password_redaction() {
        let dir = TempDir::new().unwrap();
        let r = redactor(&dir);
        let entry = LogEntry::new(0, LogLevel::Info, "user=admin password=hunter2", "app");
        let redacted = r.redact(&entry, SEARCH_MASK);
        assert_eq!(redacted.message, "user=admin password=*****");
        assert_eq!(redacted.raw_content, "user=admin password=*****");
        // The stored entry is untouched.
        assert_eq!(entry.message, "user=admin password=hunter2");
    }

    #[test]
    fn test_alarm_mask() {
        let dir = TempDir::new().unwrap();
        let r = redactor(&dir);
        let entry = LogEntry::new(0, LogLevel::Info, "passwd: s3cret", "app");
        assert_eq!(r.redact(&entry, ALARM_MASK).message, "passwd: ***");
    }

    #[test]
    fn test_redaction_idempotent() {
        let dir = TempDir::new().unwrap();
        let r = redactor(&dir);
        let entry = LogEntry::new(0, LogLevel::Info, "password=hunter2 token abc", "app");
        let once = r.redact(&entry, SEARCH_MASK);
        let twice = r.redact(&once, SEARCH_MASK);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_key_based_metadata_masking() {
        let dir = TempDir::new().unwrap();
        let r = redactor(&dir);
        let entry = LogEntry::new(0, LogLevel::Info, "login ok", "app")
            .with_metadata("Password", "hunter2")
            .with_metadata("user", "admin");
        let redacted = r.redact(&entry, SEARCH_MASK);
        assert_eq!(redacted.metadata.get("Password"), Some("*****"));
        assert_eq!(redacted.metadata.get("user"), Some("admin"));
    }

    #[test]
    fn test_whole_match_masking_without_groups() {
        let dir = TempDir::new().unwrap();
        let r = redactor(&dir);
        let mut groups = BTreeMap::new();
        groups.insert(
            "ssn".to_string(),
            RedactionGroup {
                patterns: vec![r"\d{3}-\d{2}-\d{4}".to_string()],
            },
        );
        r.set_config(groups).unwrap();
        let entry = LogEntry::new(0, LogLevel::Info, "ssn is 123-45-6789 ok", "app");
        assert_eq!(r.redact(&entry, SEARCH_MASK).message, "ssn is ***** ok");
    }

    #[test]
    fn test_defaults_always_present() {
        let dir = TempDir::new().unwrap();
        let r = redactor(&dir);
        let mut groups = BTreeMap::new();
        groups.insert(
            "token".to_string(),
            RedactionGroup {
                patterns: vec![r"(token)=(\S+)".to_string()],
            },
        );
        r.set_config(groups).unwrap();
        let view = r.view();
        assert!(view.keys.contains(&"password".to_string()));
        assert!(view.keys.contains(&"passwd".to_string()));
        assert!(view.keys.contains(&"token".to_string()));
    }

    #[test]
    fn test_legacy_flat_config_migrated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("redaction.json");
        std::fs::write(
            &path,
            r#"{"keys": ["apikey", "secret"], "patterns": ["(apikey)=(\\S+)"]}"#,
        )
        .unwrap();
        let r = Redactor::load(path.clone()).unwrap();
        let view = r.view();
        assert!(view.keys.contains(&"apikey".to_string()));
        assert!(view.keys.contains(&"secret".to_string()));
        assert!(view.keys.contains(&"password".to_string()));

        // The file was rewritten in grouped form.
        let rewritten: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let object = rewritten.as_object().unwrap();
        assert!(object.contains_key(r#"["apikey","secret"]"#));
        assert!(!object.contains_key("keys"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let dir = TempDir::new().unwrap();
        let r = redactor(&dir);
        let mut groups = BTreeMap::new();
        groups.insert(
            "bad".to_string(),
            RedactionGroup {
                patterns: vec!["(".to_string()],
            },
        );
        assert!(r.set_config(groups).is_err());
    }

    #[test]
    fn test_reload_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("redaction.json");
        let r = Redactor::load(path.clone()).unwrap();
        // Edit the file out-of-band.
        let mut groups = default_groups();
        groups.insert(
            "token".to_string(),
            RedactionGroup {
                patterns: vec![r"(token)=(\S+)".to_string()],
            },
        );
        std::fs::write(&path, serde_json::to_vec_pretty(&groups).unwrap()).unwrap();
        r.reload().unwrap();
        assert!(r.view().keys.contains(&"token".to_string()));
    }
}
