//! Operator alerts for terminal job failures and compensations.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("failed to deliver alert: {0}")]
    Delivery(String),
    #[error("alert endpoint returned status {0}")]
    Status(u16),
}

/// Destination for operator alerts.
///
/// Delivery failures are reported to the caller, which only logs them:
/// an undeliverable alert never changes a job's outcome.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send_alert(
        &self,
        severity: AlertSeverity,
        message: &str,
        details: Value,
    ) -> Result<(), AlertError>;
}

/// Writes alerts to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertNotifier;

#[async_trait]
impl AlertNotifier for LogAlertNotifier {
    async fn send_alert(
        &self,
        severity: AlertSeverity,
        message: &str,
        details: Value,
    ) -> Result<(), AlertError> {
        match severity {
            AlertSeverity::Critical => error!(severity = %severity, details = %details, "{message}"),
            AlertSeverity::Warning => warn!(severity = %severity, details = %details, "{message}"),
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct AlertBody<'a> {
    severity: AlertSeverity,
    message: &'a str,
    details: Value,
}

/// POSTs alerts as JSON (`{severity, message, details}`) to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlertNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookAlertNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, AlertError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AlertError::Delivery(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertNotifier for WebhookAlertNotifier {
    async fn send_alert(
        &self,
        severity: AlertSeverity,
        message: &str,
        details: Value,
    ) -> Result<(), AlertError> {
        let res = self
            .http
            .post(&self.url)
            .json(&AlertBody {
                severity,
                message,
                details,
            })
            .send()
            .await
            .map_err(|e| AlertError::Delivery(e.to_string()))?;

        if !res.status().is_success() {
            return Err(AlertError::Status(res.status().as_u16()));
        }
        Ok(())
    }
}

/// A captured alert.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAlert {
    pub severity: AlertSeverity,
    pub message: String,
    pub details: Value,
}

/// In-memory notifier for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlertNotifier {
    inner: Mutex<Vec<RecordedAlert>>,
}

impl InMemoryAlertNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<RecordedAlert> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl AlertNotifier for InMemoryAlertNotifier {
    async fn send_alert(
        &self,
        severity: AlertSeverity,
        message: &str,
        details: Value,
    ) -> Result<(), AlertError> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecordedAlert {
                severity,
                message: message.to_string(),
                details,
            });
        Ok(())
    }
}
