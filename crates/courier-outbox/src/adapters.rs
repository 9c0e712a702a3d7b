//! Delivery capabilities supplied by the host system.
//!
//! [`AdapterSet`] maps each [`EventKind`]/[`ExportMode`] to a concrete adapter
//! once at startup. Every call it makes is bounded by the configured timeout
//! and reduced to a [`DeliveryOutcome`] so callers never see adapter errors
//! directly. Webhook targets are validated and resolved inside that bound.

use crate::payload::{decode_payload, DeliveryPayload, EmailPayload};
use crate::url_policy::UrlValidator;
use async_trait::async_trait;
use courier_database::{ExportEvent, OutboxEvent};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct AdapterError(pub String);

/// "Send email" capability. `Ok(false)` means the transport refused the message.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &EmailPayload) -> Result<bool, AdapterError>;
}

/// Result of one webhook call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookReceipt {
    pub ok: bool,
    /// HTTP requests the adapter made for this call.
    pub attempts: u32,
    pub error_code: Option<String>,
    pub error: Option<String>,
}

impl WebhookReceipt {
    pub fn delivered() -> Self {
        Self {
            ok: true,
            attempts: 1,
            ..Default::default()
        }
    }

    pub fn failed(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            attempts: 1,
            error_code: Some(code.into()),
            error: Some(error.into()),
        }
    }
}

/// "Call webhook" capability, also used for export pushes.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, url: &Url, payload: &serde_json::Value, timeout: Duration) -> WebhookReceipt;
}

/// What happened to one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient failure: counts as an attempt.
    Failed { code: String, error: String },
    /// Permanent or policy failure: no attempt is counted.
    Skipped { code: String, reason: String },
}

impl DeliveryOutcome {
    fn failed(code: &str, error: impl Into<String>) -> Self {
        Self::Failed {
            code: code.to_string(),
            error: error.into(),
        }
    }

    fn skipped(code: &str, reason: impl Into<String>) -> Self {
        Self::Skipped {
            code: code.to_string(),
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Adapters registered for this process.
#[derive(Clone)]
pub struct AdapterSet {
    email: Option<Arc<dyn EmailSender>>,
    webhook: Option<Arc<dyn WebhookSender>>,
    url_validator: Arc<dyn UrlValidator>,
    timeout: Duration,
}

impl AdapterSet {
    pub fn new(url_validator: Arc<dyn UrlValidator>, timeout: Duration) -> Self {
        Self {
            email: None,
            webhook: None,
            url_validator,
            timeout,
        }
    }

    pub fn with_email(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.email = Some(sender);
        self
    }

    pub fn with_webhook(mut self, sender: Arc<dyn WebhookSender>) -> Self {
        self.webhook = Some(sender);
        self
    }

    pub fn url_validator(&self) -> &Arc<dyn UrlValidator> {
        &self.url_validator
    }

    /// Deliver an outbox event through the adapter for its kind.
    pub async fn deliver_event(&self, event: &OutboxEvent) -> DeliveryOutcome {
        let payload = match decode_payload(event.kind, &event.payload) {
            Ok(payload) => payload,
            Err(e) => return DeliveryOutcome::skipped("payload_invalid", e.to_string()),
        };

        match payload {
            DeliveryPayload::Email(email) => self.send_email(&email).await,
            DeliveryPayload::Webhook(hook) => self.send_webhook(&hook.url, &hook.body).await,
        }
    }

    /// Push an export to its target. Both modes are HTTP pushes.
    pub async fn deliver_export(&self, export: &ExportEvent) -> DeliveryOutcome {
        self.send_webhook(&export.target_url, &export.payload).await
    }

    async fn send_email(&self, email: &EmailPayload) -> DeliveryOutcome {
        let Some(sender) = &self.email else {
            return DeliveryOutcome::skipped("adapter_missing", "no email adapter configured");
        };

        match tokio::time::timeout(self.timeout, sender.send(email)).await {
            Ok(Ok(true)) => DeliveryOutcome::Delivered,
            Ok(Ok(false)) => DeliveryOutcome::failed("email_rejected", "email not delivered"),
            Ok(Err(e)) => DeliveryOutcome::failed("adapter_error", e.to_string()),
            Err(_) => DeliveryOutcome::failed("timeout", timeout_message(self.timeout)),
        }
    }

    async fn send_webhook(&self, raw_url: &str, body: &serde_json::Value) -> DeliveryOutcome {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let checked = tokio::time::timeout_at(deadline, self.url_validator.validate_resolved(raw_url));
        let url = match checked.await {
            Ok(Ok(url)) => url,
            Ok(Err(rejection)) if rejection.is_transient() => {
                return DeliveryOutcome::failed(rejection.code(), rejection.to_string())
            }
            Ok(Err(rejection)) => return DeliveryOutcome::skipped(rejection.code(), rejection.to_string()),
            Err(_) => return DeliveryOutcome::failed("timeout", timeout_message(self.timeout)),
        };
        let Some(sender) = &self.webhook else {
            return DeliveryOutcome::skipped("adapter_missing", "no webhook adapter configured");
        };

        match tokio::time::timeout_at(deadline, sender.send(&url, body, self.timeout)).await {
            Ok(receipt) if receipt.ok => DeliveryOutcome::Delivered,
            Ok(receipt) => {
                if receipt.attempts > 1 {
                    tracing::debug!(attempts = receipt.attempts, url = %url, "webhook adapter retried internally");
                }
                DeliveryOutcome::Failed {
                    code: receipt.error_code.unwrap_or_else(|| "webhook_failed".into()),
                    error: receipt.error.unwrap_or_else(|| "webhook delivery failed".into()),
                }
            }
            Err(_) => DeliveryOutcome::failed("timeout", timeout_message(self.timeout)),
        }
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("adapter call timed out after {}ms", timeout.as_millis())
}
