//! Alert notification delivery
//!
//! Notifications are fire-and-forget: the dispatcher spawns one task per
//! channel and delivery failures are only logged.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alert::Alert;
use crate::config::{EmailConfig, NotificationConfig, WebhookConfig};
use crate::error::{NotificationError, NotificationResult};
use crate::probe::MetricSample;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn notify(&self, alert: &Alert, sample: &MetricSample) -> NotificationResult<()>;
}

/// POSTs `{alert, health_data, timestamp}` to a URL
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> NotificationResult<Self> {
        if config.url.is_empty() {
            return Err(NotificationError::NotConfigured {
                channel: "webhook".to_string(),
                reason: "url is empty".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| NotificationError::Webhook { reason: e.to_string() })?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, alert: &Alert, sample: &MetricSample) -> NotificationResult<()> {
        let payload = json!({
            "alert": alert,
            "health_data": sample,
            "timestamp": Utc::now(),
        });

        let mut request = self.client.post(&self.config.url).json(&payload);
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotificationError::Webhook { reason: e.to_string() })?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Webhook { reason: format!("endpoint returned {status}") });
        }
        Ok(())
    }
}

/// Sends plain-text mail through SMTP using the `curl` binary
pub struct EmailNotifier {
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> NotificationResult<Self> {
        if config.recipients.is_empty() {
            return Err(NotificationError::NotConfigured {
                channel: "email".to_string(),
                reason: "no recipients configured".to_string(),
            });
        }
        if config.smtp_server.is_empty() {
            return Err(NotificationError::NotConfigured {
                channel: "email".to_string(),
                reason: "smtp_server is empty".to_string(),
            });
        }
        Ok(Self { config })
    }

    fn sender(&self) -> &str {
        if self.config.username.is_empty() {
            "agent-monitor@localhost"
        } else {
            &self.config.username
        }
    }

    fn smtp_url(&self) -> String {
        let scheme = if self.config.use_tls || self.config.smtp_port == 465 { "smtps" } else { "smtp" };
        format!("{}://{}:{}", scheme, self.config.smtp_server, self.config.smtp_port)
    }

    /// curl config body carrying the SMTP login, kept off the command line
    fn credentials_config(&self) -> Option<String> {
        if self.config.username.is_empty() {
            return None;
        }
        let quote = |value: &str| value.replace('\\', "\\\\").replace('"', "\\\"");
        Some(format!("user = \"{}:{}\"\n", quote(&self.config.username), quote(&self.config.password)))
    }

    fn curl_args(&self, credentials: Option<&Path>) -> Vec<String> {
        let mut args: Vec<String> = ["--silent", "--show-error", "--url"].map(String::from).to_vec();
        args.push(self.smtp_url());
        args.extend(["--mail-from".to_string(), self.sender().to_string()]);
        if !self.config.use_tls && self.config.smtp_port != 465 {
            args.push("--ssl-reqd".to_string());
        }
        if let Some(path) = credentials {
            args.extend(["--config".to_string(), path.display().to_string()]);
        }
        for recipient in &self.config.recipients {
            args.extend(["--mail-rcpt".to_string(), recipient.clone()]);
        }
        args.extend(["-T".to_string(), "-".to_string()]);
        args
    }

    /// RFC 5322 message text for an alert
    pub fn compose(&self, alert: &Alert, sample: &MetricSample) -> String {
        let reading = |value: Option<f64>| value.map_or_else(|| "N/A".to_string(), |v| format!("{v:.1}%"));
        let endpoint_health = sample
            .endpoint_health_percent()
            .map_or_else(|| "N/A".to_string(), |v| format!("{v:.0}%"));

        format!(
            "From: {from}\r\nTo: {to}\r\nSubject: Platform Alert - {level}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n\
             Platform Alert\r\n\r\n\
             Alert ID: {id}\r\nIncident: {incident}\r\nSeverity: {level}\r\nMessage: {description}\r\nTimestamp: {timestamp}\r\n\r\n\
             System Status:\r\n\
             - Endpoint Health: {endpoint_health}\r\n\
             - CPU Usage: {cpu}\r\n\
             - Memory Usage: {memory}\r\n\
             - Disk Usage: {disk}\r\n",
            from = self.sender(),
            to = self.config.recipients.join(", "),
            level = alert.level.as_str().to_uppercase(),
            id = alert.id,
            incident = alert.incident_type,
            description = alert.description,
            timestamp = alert.timestamp.to_rfc3339(),
            cpu = reading(sample.cpu_percent),
            memory = reading(sample.memory_percent),
            disk = reading(sample.disk_percent),
        )
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn channel(&self) -> &'static str {
        "email"
    }

    async fn notify(&self, alert: &Alert, sample: &MetricSample) -> NotificationResult<()> {
        let message = self.compose(alert, sample);

        // Owner-only temp file, removed when dropped after curl exits
        let credentials = match self.credentials_config() {
            Some(body) => {
                let mut file =
                    tempfile::NamedTempFile::new().map_err(|e| NotificationError::Email { reason: e.to_string() })?;
                file.write_all(body.as_bytes())
                    .and_then(|_| file.flush())
                    .map_err(|e| NotificationError::Email { reason: e.to_string() })?;
                Some(file)
            }
            None => None,
        };

        let mut command = Command::new("curl");
        command
            .args(self.curl_args(credentials.as_ref().map(|file| file.path())))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| NotificationError::Email { reason: e.to_string() })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .map_err(|e| NotificationError::Email { reason: e.to_string() })?;
        }

        let output = tokio::time::timeout(DELIVERY_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| NotificationError::Email { reason: "curl timed out".to_string() })?
            .map_err(|e| NotificationError::Email { reason: e.to_string() })?;

        if !output.status.success() {
            return Err(NotificationError::Email {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Fans an alert out to every configured channel
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotificationDispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Build the enabled channels; misconfigured ones are skipped with a warning
    pub fn from_config(config: &NotificationConfig) -> Self {
        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();

        if config.webhook.enabled {
            match WebhookNotifier::new(config.webhook.clone()) {
                Ok(notifier) => notifiers.push(Arc::new(notifier)),
                Err(e) => warn!(error = %e, "Webhook notifications disabled"),
            }
        }
        if config.email.enabled {
            match EmailNotifier::new(config.email.clone()) {
                Ok(notifier) => notifiers.push(Arc::new(notifier)),
                Err(e) => warn!(error = %e, "Email notifications disabled"),
            }
        }

        Self { notifiers }
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Spawn one delivery per channel without waiting for them
    pub fn dispatch(&self, alert: &Alert, sample: &MetricSample) -> Vec<JoinHandle<()>> {
        if self.notifiers.is_empty() {
            return Vec::new();
        }

        let alert = Arc::new(alert.clone());
        let sample = Arc::new(sample.clone());
        self.notifiers
            .iter()
            .map(|notifier| {
                let notifier = Arc::clone(notifier);
                let alert = Arc::clone(&alert);
                let sample = Arc::clone(&sample);
                tokio::spawn(async move {
                    match notifier.notify(&alert, &sample).await {
                        Ok(()) => info!(channel = notifier.channel(), alert_id = %alert.id, "Alert notification sent"),
                        Err(e) => warn!(channel = notifier.channel(), alert_id = %alert.id, error = %e, "Alert notification failed"),
                    }
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels: Vec<&str> = self.notifiers.iter().map(|notifier| notifier.channel()).collect();
        f.debug_struct("NotificationDispatcher").field("channels", &channels).finish()
    }
}
