//! User notifications.
//!
//! Delivery itself is someone else's job; the agent only hands a
//! [`Notification`] to whatever [`Notifier`] it was built with.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A slot opened on a notify-only target.
    Detected,
    Booked,
    BookingFailed,
    /// A booking was skipped because a weekly or monthly cap was reached.
    Quota,
    /// Login failed and the agent stopped trying until resumed.
    LoginHalted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub site_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(
        user_id: &str,
        site_id: &str,
        kind: NotificationKind,
        title: &str,
        body: &str,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            site_id: site_id.to_string(),
            kind,
            title: title.to_string(),
            body: body.to_string(),
        }
    }
}

/// Delivers notifications to users. Failures are logged by the caller, never fatal.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: Notification) -> anyhow::Result<()> {
        info!(
            "Notify[{}:{}] {:?}: {} - {}",
            n.user_id, n.site_id, n.kind, n.title, n.body
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to a webhook.
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&notification)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            warn!("Webhook notify to {} returned HTTP {}", self.url, status);
            anyhow::bail!("webhook returned HTTP {}", status);
        }
        Ok(())
    }
}

/// Send and log failures; notification problems never abort agent work.
pub async fn deliver(notifier: &dyn Notifier, notification: Notification) {
    let kind = notification.kind;
    if let Err(e) = notifier.notify(notification).await {
        warn!("Failed to deliver {:?} notification: {:#}", kind, e);
    }
}
