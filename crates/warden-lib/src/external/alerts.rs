//! Alert delivery to chat webhooks
//!
//! Sends security and recovery alerts to a Slack incoming webhook and/or a
//! Telegram bot chat. Delivery is best-effort: failures are logged and
//! dropped, never surfaced to the component that raised the alert.

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use super::{async_trait, AlertSeverity, AlertSink};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

fn severity_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Critical => "#ef4444",
        AlertSeverity::Warning => "#f59e0b",
        AlertSeverity::Info => "#6b7280",
    }
}

/// Webhook-backed [`AlertSink`]. Channels are optional; with none
/// configured every alert is logged locally instead.
pub struct WebhookAlertSink {
    slack_webhook_url: Option<String>,
    telegram: Option<TelegramTarget>,
    client: reqwest::Client,
}

struct TelegramTarget {
    bot_token: String,
    chat_id: String,
}

impl WebhookAlertSink {
    pub fn new(
        slack_webhook_url: Option<String>,
        telegram_bot_token: Option<String>,
        telegram_chat_id: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        let telegram = match (telegram_bot_token, telegram_chat_id) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramTarget { bot_token, chat_id }),
            _ => None,
        };
        let slack_webhook_url = slack_webhook_url.filter(|u| !u.is_empty());

        if slack_webhook_url.is_some() {
            info!("Slack alerts enabled");
        }
        if telegram.is_some() {
            info!("Telegram alerts enabled");
        }
        if slack_webhook_url.is_none() && telegram.is_none() {
            warn!("No alert channels configured, alerts will only be logged");
        }

        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self {
            slack_webhook_url,
            telegram,
            client,
        })
    }

    async fn send_slack(&self, message: &str, severity: AlertSeverity) {
        let Some(url) = &self.slack_webhook_url else {
            return;
        };
        let payload = json!({
            "attachments": [{
                "color": severity_color(severity),
                "text": format!("[{}] {}", severity, message),
            }]
        });
        if let Err(e) = self.client.post(url).json(&payload).send().await {
            warn!(error = %e, "Slack alert delivery failed");
        }
    }

    async fn send_telegram(&self, message: &str, severity: AlertSeverity) {
        let Some(target) = &self.telegram else {
            return;
        };
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            target.bot_token
        );
        let payload = json!({
            "chat_id": target.chat_id,
            "text": format!("[{}] {}", severity, message),
        });
        if let Err(e) = self.client.post(&url).json(&payload).send().await {
            warn!(error = %e, "Telegram alert delivery failed");
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, message: &str, severity: AlertSeverity) {
        if self.slack_webhook_url.is_none() && self.telegram.is_none() {
            info!(severity = %severity, message, "Alert (no channel configured)");
            return;
        }
        self.send_slack(message, severity).await;
        self.send_telegram(message, severity).await;
    }
}

/// [`AlertSink`] that writes alerts to the local log only. Used as a
/// fallback and in tests.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, message: &str, severity: AlertSeverity) {
        match severity {
            AlertSeverity::Critical => warn!(severity = %severity, message, "Alert"),
            _ => info!(severity = %severity, message, "Alert"),
        }
    }
}
