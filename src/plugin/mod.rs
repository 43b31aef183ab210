//! Plugin host with an explicit manifest.
//!
//! Plugins are enumerated by a JSON manifest (`plugins.json` in the config
//! directory) that names each plugin's binary and its declared capabilities.
//! Dispatch happens through the narrow capability set; the host owns the
//! initialize/start/stop lifecycle and rejects out-of-order transitions.

use crate::core::error::{GrepWiseError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Narrow capability set a plugin may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PluginCapability {
    LogSource,
    Visualization,
    DataSource,
    Theme,
    Utility,
}

/// One manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    pub id: String,
    pub name: String,
    /// Path to the plugin binary, relative to the manifest or absolute.
    pub binary: PathBuf,
    pub capabilities: Vec<PluginCapability>,
    #[serde(default)]
    pub enabled: bool,
}

/// The manifest file: a plain list of plugin specs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PluginManifest {
    pub plugins: Vec<PluginSpec>,
}

/// Host-enforced lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PluginState {
    Registered,
    Initialized,
    Started,
    Stopped,
}

struct PluginEntry {
    spec: PluginSpec,
    state: PluginState,
}

/// Owns every registered plugin and its lifecycle state.
pub struct PluginHost {
    plugins: RwLock<BTreeMap<String, PluginEntry>>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load a manifest file. Missing file means no plugins.
    pub fn load_manifest(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let content = std::fs::read(path)
            .map_err(|e| GrepWiseError::ConfigIo(format!("cannot read plugin manifest: {}", e)))?;
        let manifest: PluginManifest = serde_json::from_slice(&content)
            .map_err(|e| GrepWiseError::ConfigIo(format!("bad plugin manifest: {}", e)))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut plugins = self.plugins.write();
        let mut registered = 0;
        for mut spec in manifest.plugins {
            if spec.capabilities.is_empty() {
                return Err(GrepWiseError::config(format!(
                    "plugin {} declares no capabilities",
                    spec.id
                )));
            }
            if spec.binary.is_relative() {
                spec.binary = base.join(&spec.binary);
            }
            if plugins.contains_key(&spec.id) {
                return Err(GrepWiseError::config(format!("duplicate plugin id {}", spec.id)));
            }
            plugins.insert(
                spec.id.clone(),
                PluginEntry {
                    spec,
                    state: PluginState::Registered,
                },
            );
            registered += 1;
        }
        Ok(registered)
    }

    /// Plugins declaring a capability, for dispatch.
    pub fn with_capability(&self, capability: PluginCapability) -> Vec<PluginSpec> {
        self.plugins
            .read()
            .values()
            .filter(|e| e.spec.capabilities.contains(&capability))
            .map(|e| e.spec.clone())
            .collect()
    }

    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.plugins.read().get(id).map(|e| e.state)
    }

    pub fn initialize(&self, id: &str) -> Result<()> {
        self.transition(id, PluginState::Initialized, &[PluginState::Registered])
    }

    pub fn start(&self, id: &str) -> Result<()> {
        self.transition(
            id,
            PluginState::Started,
            &[PluginState::Initialized, PluginState::Stopped],
        )
    }

    pub fn stop(&self, id: &str) -> Result<()> {
        self.transition(id, PluginState::Stopped, &[PluginState::Started])
    }

    fn transition(&self, id: &str, to: PluginState, from: &[PluginState]) -> Result<()> {
        let mut plugins = self.plugins.write();
        let entry = plugins
            .get_mut(id)
            .ok_or_else(|| GrepWiseError::NotFound(format!("plugin {}", id)))?;
        if !from.contains(&entry.state) {
            return Err(GrepWiseError::config(format!(
                "plugin {} cannot go {:?} -> {:?}",
                id, entry.state, to
            )));
        }
        entry.state = to;
        tracing::info!(plugin = %id, state = ?to, "plugin lifecycle transition");
        Ok(())
    }

    /// Initialize and start every enabled plugin; disabled ones stay
    /// registered.
    pub fn start_enabled(&self) -> Result<usize> {
        let ids: Vec<(String, bool)> = self
            .plugins
            .read()
            .values()
            .map(|e| (e.spec.id.clone(), e.spec.enabled))
            .collect();
        let mut started = 0;
        for (id, enabled) in ids {
            if !enabled {
                continue;
            }
            self.initialize(&id)?;
            self.start(&id)?;
            started += 1;
        }
        Ok(started)
    }

    /// Stop every started plugin (shutdown path).
    pub fn stop_all(&self) {
        let ids: Vec<String> = self.plugins.read().keys().cloned().collect();
        for id in ids {
            if self.state(&id) == Some(PluginState::Started) {
                if let Err(e) = self.stop(&id) {
                    tracing::warn!(plugin = %id, "stop failed: {}", e);
                }
            }
        }
    }
}

impl Default for PluginHost {
    fn default() -> Self {
        Self::new()
    }
}
