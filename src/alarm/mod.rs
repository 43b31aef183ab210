//! Alarm model and persistent store.

pub mod notify;
pub mod scheduler;

pub use notify::{NotificationPayload, NotificationSink, Notifier};
pub use scheduler::AlarmScheduler;

use crate::core::error::{GrepWiseError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Threshold comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ThresholdOp {
    pub fn compare(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => observed > threshold,
            Self::Ge => observed >= threshold,
            Self::Lt => observed < threshold,
            Self::Le => observed <= threshold,
            Self::Eq => (observed - threshold).abs() < f64::EPSILON,
            Self::Ne => (observed - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// Evaluation state of an alarm or one of its groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmState {
    #[default]
    Ok,
    Firing,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelType {
    Email,
    Slack,
    Webhook,
}

/// One notification destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub destination: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Per-group evaluation state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupState {
    pub state: AlarmState,
    pub last_fired_ts: Option<i64>,
}

/// A scheduled threshold alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub name: String,
    /// Search pipeline evaluated over the window; the scheduler appends the
    /// count aggregation.
    pub query: String,
    pub window_ms: i64,
    pub threshold_op: ThresholdOp,
    pub threshold_value: f64,
    pub interval_ms: i64,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub throttle_ms: i64,
    pub channels: Vec<NotificationChannel>,
    pub enabled: bool,
    #[serde(default)]
    pub last_eval_ts: Option<i64>,
    #[serde(default)]
    pub last_fired_ts: Option<i64>,
    #[serde(default)]
    pub last_state: AlarmState,
    /// Sub-state per group key when `group_by` is set.
    #[serde(default)]
    pub group_states: BTreeMap<String, GroupState>,
}

impl Alarm {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GrepWiseError::config("alarm name must not be empty"));
        }
        if self.query.trim().is_empty() {
            return Err(GrepWiseError::config("alarm query must not be empty"));
        }
        if self.window_ms <= 0 || self.interval_ms <= 0 {
            return Err(GrepWiseError::config("alarm window and interval must be positive"));
        }
        if self.throttle_ms < 0 {
            return Err(GrepWiseError::config("alarm throttle must not be negative"));
        }
        Ok(())
    }

    /// Whether this alarm is due for evaluation at `now`.
    pub fn due(&self, now: i64) -> bool {
        match self.last_eval_ts {
            Some(last) => now - last >= self.interval_ms,
            None => true,
        }
    }
}

/// Persistent alarm store; the scheduler is its only writer at runtime.
pub struct AlarmStore {
    path: PathBuf,
    alarms: RwLock<BTreeMap<String, Alarm>>,
}

impl AlarmStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            alarms: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let content = std::fs::read(&self.path)
            .map_err(|e| GrepWiseError::ConfigIo(format!("cannot read alarms: {}", e)))?;
        let alarms: Vec<Alarm> = serde_json::from_slice(&content)
            .map_err(|e| GrepWiseError::ConfigIo(format!("bad alarms file: {}", e)))?;
        let mut map = BTreeMap::new();
        for alarm in alarms {
            map.insert(alarm.id.clone(), alarm);
        }
        *self.alarms.write() = map;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GrepWiseError::ConfigIo(format!("cannot create config dir: {}", e)))?;
        }
        let alarms: Vec<Alarm> = self.alarms.read().values().cloned().collect();
        let bytes = serde_json::to_vec_pretty(&alarms)?;
        std::fs::write(&self.path, bytes)
            .map_err(|e| GrepWiseError::ConfigIo(format!("cannot write alarms: {}", e)))
    }

    pub fn create(&self, mut alarm: Alarm) -> Result<Alarm> {
        if alarm.id.trim().is_empty() {
            alarm.id = format!("alarm-{:08x}", rand::random::<u32>());
        }
        alarm.validate()?;
        {
            let mut alarms = self.alarms.write();
            if alarms.contains_key(&alarm.id) {
                return Err(GrepWiseError::config(format!("alarm {} already exists", alarm.id)));
            }
            alarms.insert(alarm.id.clone(), alarm.clone());
        }
        self.persist()?;
        Ok(alarm)
    }

    pub fn update(&self, alarm: Alarm) -> Result<()> {
        alarm.validate()?;
        {
            let mut alarms = self.alarms.write();
            if !alarms.contains_key(&alarm.id) {
                return Err(GrepWiseError::NotFound(format!("alarm {}", alarm.id)));
            }
            alarms.insert(alarm.id.clone(), alarm);
        }
        self.persist()
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let removed = self.alarms.write().remove(id);
        if removed.is_none() {
            return Err(GrepWiseError::NotFound(format!("alarm {}", id)));
        }
        self.persist()
    }

    pub fn get(&self, id: &str) -> Option<Alarm> {
        self.alarms.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Alarm> {
        self.alarms.read().values().cloned().collect()
    }

    /// Alarms due for evaluation at `now`.
    pub fn due_alarms(&self, now: i64) -> Vec<Alarm> {
        self.alarms
            .read()
            .values()
            .filter(|a| a.enabled && a.due(now))
            .cloned()
            .collect()
    }

    /// Write back post-evaluation state.
    pub fn record_eval(&self, alarm: &Alarm) -> Result<()> {
        {
            let mut alarms = self.alarms.write();
            if let Some(stored) = alarms.get_mut(&alarm.id) {
                stored.last_eval_ts = alarm.last_eval_ts;
                stored.last_fired_ts = alarm.last_fired_ts;
                stored.last_state = alarm.last_state;
                stored.group_states = alarm.group_states.clone();
            }
        }
        self.persist()
    }
}

/// Convenience for tests and seeds.
impl Default for Alarm {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            query: String::new(),
            window_ms: 300_000,
            threshold_op: ThresholdOp::Gt,
            threshold_value: 0.0,
            interval_ms: 60_000,
            group_by: Vec::new(),
            throttle_ms: 600_000,
            channels: Vec::new(),
            enabled: true,
            last_eval_ts: None,
            last_fired_ts: None,
            last_state: AlarmState::Ok,
            group_states: BTreeMap::new(),
        }
    }
}
