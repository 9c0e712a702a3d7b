//! Typed payloads per event kind.
//!
//! Rows store payloads as opaque JSON. They are decoded here, once when the
//! event is enqueued (so malformed payloads never reach the table) and again
//! right before the adapter call.

use crate::{OutboxError, OutboxResult};
use courier_core::EventKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub url: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryPayload {
    Email(EmailPayload),
    Webhook(WebhookPayload),
}

pub fn decode_payload(kind: EventKind, raw: &serde_json::Value) -> OutboxResult<DeliveryPayload> {
    let invalid = |reason: String| OutboxError::InvalidPayload {
        kind: kind.as_str().to_string(),
        reason,
    };
    match kind {
        EventKind::Email => {
            let email: EmailPayload =
                serde_json::from_value(raw.clone()).map_err(|e| invalid(e.to_string()))?;
            if email.recipient.trim().is_empty() {
                return Err(invalid("recipient is empty".into()));
            }
            Ok(DeliveryPayload::Email(email))
        }
        EventKind::Webhook => {
            let hook: WebhookPayload =
                serde_json::from_value(raw.clone()).map_err(|e| invalid(e.to_string()))?;
            url::Url::parse(&hook.url).map_err(|e| invalid(format!("url: {e}")))?;
            Ok(DeliveryPayload::Webhook(hook))
        }
    }
}
