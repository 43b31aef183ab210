//! Configurable extracted-field registry.
//!
//! Fields declared here are pulled out of incoming entries at ingest time
//! and become first-class indexed fields: exact-match searchable, usable in
//! `where`/`sort`/`stats`, and aggregatable through typed doc-value columns.

use crate::core::error::{GrepWiseError, Result};
use crate::core::types::LogEntry;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Where an extraction pattern is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    Message,
    RawContent,
}

/// Declared value type of an extracted field, for typed aggregation and
/// numeric comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Long,
    Double,
}

/// Configuration for one extractable field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default = "FieldSpec::default_source")]
    pub source: FieldSource,
    /// Regex applied to the source text. The first capture group is the
    /// extracted value; with no groups the whole match is used. No pattern
    /// means the field is only populated from explicit metadata.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default = "FieldSpec::default_type")]
    pub value_type: FieldType,
}

impl FieldSpec {
    fn default_source() -> FieldSource {
        FieldSource::Message
    }

    fn default_type() -> FieldType {
        FieldType::String
    }
}

struct CompiledField {
    spec: FieldSpec,
    pattern: Option<Regex>,
}

/// Registry of extractable fields. Built once from configuration and shared
/// read-only with the ingest path.
pub struct FieldRegistry {
    fields: Vec<CompiledField>,
}

impl FieldRegistry {
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    /// Compile the configured specs, rejecting invalid regexes up front.
    pub fn from_specs(specs: Vec<FieldSpec>) -> Result<Self> {
        let mut fields = Vec::with_capacity(specs.len());
        for spec in specs {
            let pattern = match &spec.pattern {
                Some(p) => Some(Regex::new(p).map_err(|e| {
                    GrepWiseError::config(format!(
                        "invalid extraction pattern for field {}: {}",
                        spec.name, e
                    ))
                })?),
                None => None,
            };
            fields.push(CompiledField { spec, pattern });
        }
        Ok(Self { fields })
    }

    pub fn specs(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().map(|f| &f.spec)
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().map(|f| &f.spec).find(|s| s.name == name)
    }

    /// Apply extraction to an entry, writing extracted values into its
    /// metadata so they are indexed alongside the record.
    pub fn extract(&self, entry: &mut LogEntry) {
        for field in &self.fields {
            if entry.metadata.contains_key(&field.spec.name) {
                continue;
            }
            let Some(regex) = &field.pattern else { continue };
            let haystack = match field.spec.source {
                FieldSource::Message => entry.message.as_str(),
                FieldSource::RawContent => entry.raw_content.as_str(),
            };
            if let Some(caps) = regex.captures(haystack) {
                let value = caps
                    .get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string());
                if let Some(value) = value {
                    entry.metadata.insert(&field.spec.name, value);
                }
            }
        }
    }
}
