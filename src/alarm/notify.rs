//! Notification dispatch.
//!
//! Channels are tagged variants dispatched through one narrow capability:
//! `send`. Email goes over SMTP, Slack and generic webhooks over HTTPS.
//! Delivery failures surface as `NotifyChannelDown` so the caller's retry
//! policy can treat them as transient.

use super::{ChannelType, NotificationChannel};
use crate::core::error::{GrepWiseError, Result};
use crate::core::types::LogEntry;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;

/// Payload delivered on FIRING transitions and allowed resends.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub alarm_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    pub observed_value: f64,
    pub threshold: f64,
    pub timestamp: i64,
    /// Already redacted with the alarm mask.
    pub sample_logs: Vec<LogEntry>,
}

impl NotificationPayload {
    /// Single-line summary for chat-style channels.
    pub fn summary(&self) -> String {
        match &self.group_key {
            Some(group) => format!(
                "[{}] {} (group {}): observed {} vs threshold {}",
                self.alarm_id, self.name, group, self.observed_value, self.threshold
            ),
            None => format!(
                "[{}] {}: observed {} vs threshold {}",
                self.alarm_id, self.name, self.observed_value, self.threshold
            ),
        }
    }
}

/// The one capability a channel implementation provides.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, channel: &NotificationChannel, payload: &NotificationPayload)
        -> Result<()>;
}

/// Production sink covering all channel types.
pub struct Notifier {
    http: reqwest::Client,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn send_slack(
        &self,
        channel: &NotificationChannel,
        payload: &NotificationPayload,
    ) -> Result<()> {
        let body = serde_json::json!({ "text": payload.summary() });
        let response = self
            .http
            .post(&channel.destination)
            .json(&body)
            .send()
            .await
            .map_err(|e| GrepWiseError::NotifyChannelDown(format!("slack: {}", e)))?;
        if !response.status().is_success() {
            return Err(GrepWiseError::NotifyChannelDown(format!(
                "slack returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn send_webhook(
        &self,
        channel: &NotificationChannel,
        payload: &NotificationPayload,
    ) -> Result<()> {
        let response = self
            .http
            .post(&channel.destination)
            .json(payload)
            .send()
            .await
            .map_err(|e| GrepWiseError::NotifyChannelDown(format!("webhook: {}", e)))?;
        if !response.status().is_success() {
            return Err(GrepWiseError::NotifyChannelDown(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn send_email(
        &self,
        channel: &NotificationChannel,
        payload: &NotificationPayload,
    ) -> Result<()> {
        let host = channel
            .config
            .get("smtp_host")
            .ok_or_else(|| GrepWiseError::config("email channel is missing smtp_host"))?;
        let from = channel
            .config
            .get("from")
            .ok_or_else(|| GrepWiseError::config("email channel is missing from"))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| GrepWiseError::NotifyChannelDown(format!("smtp relay: {}", e)))?;
        if let Some(port) = channel.config.get("smtp_port").and_then(|p| p.parse().ok()) {
            builder = builder.port(port);
        }
        if let (Some(user), Some(pass)) = (
            channel.config.get("username"),
            channel.config.get("password"),
        ) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let transport = builder.build();

        let body = serde_json::to_string_pretty(payload)?;
        let message = Message::builder()
            .from(
                from.parse()
                    .map_err(|e| GrepWiseError::config(format!("bad from address: {}", e)))?,
            )
            .to(channel
                .destination
                .parse()
                .map_err(|e| GrepWiseError::config(format!("bad to address: {}", e)))?)
            .subject(payload.summary())
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| GrepWiseError::unexpected(format!("cannot build email: {}", e)))?;

        transport
            .send(message)
            .await
            .map_err(|e| GrepWiseError::NotifyChannelDown(format!("smtp send: {}", e)))?;
        Ok(())
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn send(
        &self,
        channel: &NotificationChannel,
        payload: &NotificationPayload,
    ) -> Result<()> {
        match channel.channel_type {
            ChannelType::Slack => self.send_slack(channel, payload).await,
            ChannelType::Webhook => self.send_webhook(channel, payload).await,
            ChannelType::Email => self.send_email(channel, payload).await,
        }
    }
}
