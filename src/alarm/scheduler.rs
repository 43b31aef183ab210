//! Scheduled alarm evaluation.
//!
//! The scheduler wakes on a coarse tick, finds alarms whose interval has
//! elapsed, and evaluates each: run the alarm query over
//! `[now - window, now]`, compare the observed count(s) against the
//! threshold, apply the OK/FIRING/UNKNOWN transitions per group, and
//! dispatch throttled notifications. Notification delivery retries in the
//! background and never blocks the next evaluation.

use super::notify::{NotificationPayload, NotificationSink};
use super::{Alarm, AlarmState, AlarmStore, GroupState};
use crate::core::error::{GrepWiseError, Result};
use crate::core::retry::{retry_with_config, RetryConfig};
use crate::core::types::{now_ms, LogEntry, TimeRange};
use crate::query::{QueryExecutor, QueryOutput};
use crate::redact::{Redactor, ALARM_MASK};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Scalar alarms track their state under this group key.
const SCALAR_GROUP: &str = "";

/// Outcome of one evaluation, for the on-demand endpoint and tests.
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub alarm_id: String,
    pub state: AlarmState,
    pub observed: BTreeMap<String, u64>,
    /// Groups that produced a notification this evaluation.
    pub fired: Vec<String>,
}

pub struct AlarmScheduler {
    store: Arc<AlarmStore>,
    executor: Arc<QueryExecutor>,
    redactor: Arc<Redactor>,
    sink: Arc<dyn NotificationSink>,
    tick_interval: Duration,
    notify_retry: RetryConfig,
}

impl AlarmScheduler {
    pub fn new(
        store: Arc<AlarmStore>,
        executor: Arc<QueryExecutor>,
        redactor: Arc<Redactor>,
        sink: Arc<dyn NotificationSink>,
        tick_interval: Duration,
        notify_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            executor,
            redactor,
            sink,
            tick_interval,
            notify_retry: RetryConfig::with_max_attempts(notify_max_attempts),
        }
    }

    /// Evaluate due alarms until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = now_ms();
                    for alarm in self.store.due_alarms(now) {
                        if let Err(e) = self.evaluate_at(&alarm.id, now).await {
                            tracing::warn!(alarm = %alarm.id, "evaluation failed: {}", e);
                        }
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("alarm scheduler stopping");
                        return;
                    }
                },
            }
        }
    }

    /// Evaluate one alarm as of `now`. Pure given the alarm, its stored
    /// state, and the indexed history.
    pub async fn evaluate_at(&self, id: &str, now: i64) -> Result<EvalReport> {
        let mut alarm = self
            .store
            .get(id)
            .ok_or_else(|| GrepWiseError::NotFound(format!("alarm {}", id)))?;
        let range = TimeRange::new(now - alarm.window_ms, now);
        let spl = count_query(&alarm);

        let observed = match self.executor.execute(&spl, range).await {
            Ok(result) => match result.output {
                QueryOutput::Stats(stats) => {
                    if alarm.group_by.is_empty() {
                        let count = stats.get("count").copied().unwrap_or(0);
                        BTreeMap::from([(SCALAR_GROUP.to_string(), count)])
                    } else {
                        stats
                    }
                },
                QueryOutput::Entries(entries) => {
                    BTreeMap::from([(SCALAR_GROUP.to_string(), entries.len() as u64)])
                },
            },
            Err(e) => {
                // Evaluator error: the alarm goes UNKNOWN until the next
                // successful evaluation.
                alarm.last_eval_ts = Some(now);
                alarm.last_state = AlarmState::Unknown;
                for group in alarm.group_states.values_mut() {
                    group.state = AlarmState::Unknown;
                }
                self.store.record_eval(&alarm)?;
                return Err(e);
            },
        };

        // Transition every observed group plus previously tracked groups
        // whose count dropped to zero.
        let mut keys: Vec<String> = observed.keys().cloned().collect();
        for key in alarm.group_states.keys() {
            if !observed.contains_key(key) {
                keys.push(key.clone());
            }
        }

        let mut fired = Vec::new();
        for key in keys {
            let count = observed.get(&key).copied().unwrap_or(0);
            let breached = alarm
                .threshold_op
                .compare(count as f64, alarm.threshold_value);
            let group = alarm.group_states.entry(key.clone()).or_insert_with(GroupState::default);
            if breached {
                let throttled = group.state == AlarmState::Firing
                    && group
                        .last_fired_ts
                        .map(|last| now - last < alarm.throttle_ms)
                        .unwrap_or(false);
                group.state = AlarmState::Firing;
                if !throttled {
                    group.last_fired_ts = Some(now);
                    fired.push(key);
                }
            } else {
                group.state = AlarmState::Ok;
            }
        }

        let state = if alarm
            .group_states
            .values()
            .any(|g| g.state == AlarmState::Firing)
        {
            AlarmState::Firing
        } else {
            AlarmState::Ok
        };
        alarm.last_state = state;
        alarm.last_eval_ts = Some(now);
        if !fired.is_empty() {
            alarm.last_fired_ts = Some(now);
        }
        self.store.record_eval(&alarm)?;

        if !fired.is_empty() {
            let samples = self.sample_logs(&alarm, range).await;
            for group in &fired {
                let payload = NotificationPayload {
                    alarm_id: alarm.id.clone(),
                    name: alarm.name.clone(),
                    group_key: (!group.is_empty()).then(|| group.clone()),
                    observed_value: observed.get(group).copied().unwrap_or(0) as f64,
                    threshold: alarm.threshold_value,
                    timestamp: now,
                    sample_logs: samples.clone(),
                };
                self.dispatch(&alarm, payload);
            }
        }

        Ok(EvalReport {
            alarm_id: alarm.id,
            state,
            observed,
            fired,
        })
    }

    /// A few redacted matching entries to attach to the notification.
    async fn sample_logs(&self, alarm: &Alarm, range: TimeRange) -> Vec<LogEntry> {
        let spl = format!("{} | head 5", alarm.query.trim());
        match self.executor.execute(&spl, range).await {
            Ok(result) => match result.output {
                QueryOutput::Entries(entries) => entries
                    .iter()
                    .map(|e| self.redactor.redact(e, ALARM_MASK))
                    .collect(),
                QueryOutput::Stats(_) => Vec::new(),
            },
            Err(e) => {
                tracing::debug!(alarm = %alarm.id, "sample query failed: {}", e);
                Vec::new()
            },
        }
    }

    /// Fire-and-forget delivery with bounded backoff per channel.
    fn dispatch(&self, alarm: &Alarm, payload: NotificationPayload) {
        for channel in alarm.channels.clone() {
            let sink = self.sink.clone();
            let retry = self.notify_retry.clone();
            let payload = payload.clone();
            let alarm_id = alarm.id.clone();
            tokio::spawn(async move {
                let result = retry_with_config(retry, || {
                    let sink = sink.clone();
                    let channel = channel.clone();
                    let payload = payload.clone();
                    async move { sink.send(&channel, &payload).await }
                })
                .await;
                if let Err(e) = result {
                    tracing::error!(alarm = %alarm_id, "notification delivery failed: {}", e);
                }
            });
        }
    }
}

/// Append the count aggregation the evaluator compares against.
fn count_query(alarm: &Alarm) -> String {
    let base = alarm.query.trim();
    if alarm.group_by.is_empty() {
        format!("{} | stats count", base)
    } else {
        format!("{} | stats count by {}", base, alarm.group_by.join(", "))
    }
}
