//! Row types for the courier tables.

use chrono::{DateTime, Utc};
use courier_core::{EventKind, ExportMode};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::DatabaseError;

/// Delivery state shared by outbox and export rows.
///
/// Legal transitions: pending→sent, pending→dead, dead→pending, dead→sent.
/// The schema enforces them with triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Sent,
    Dead,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Dead => "dead",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "dead" => Ok(Self::Dead),
            other => Err(DatabaseError::InvalidData(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// Outbox event. Never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxEvent {
    pub event_id: String,
    pub org_id: String,
    pub kind: EventKind,
    /// Interpreted only by the adapter registered for `kind`.
    pub payload: serde_json::Value,
    pub dedupe_key: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub claim_token: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant. Set when a delivery is skipped.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// New outbox event for insertion.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_id: String,
    pub org_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
}

/// Outbound export (webhook/CRM push) with replay bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct ExportEvent {
    pub export_id: String,
    pub org_id: String,
    pub mode: ExportMode,
    pub target_url: String,
    pub target_url_host: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    /// Incremented by auto-replay only.
    pub replay_count: u32,
    pub last_replayed_at: Option<DateTime<Utc>>,
    pub last_replayed_by: Option<String>,
    pub claim_token: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant. Set when a delivery is skipped.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewExportEvent {
    pub export_id: String,
    pub org_id: String,
    pub mode: ExportMode,
    pub target_url: String,
    pub target_url_host: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for IdempotencyStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            other => Err(DatabaseError::InvalidData(format!(
                "unknown idempotency status: {other}"
            ))),
        }
    }
}

/// One client write request, keyed by `(org_id, idempotency_key, endpoint)`.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub org_id: String,
    pub idempotency_key: String,
    pub endpoint: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    /// Identifies the current owner of a pending claim.
    pub claim_token: String,
    pub response_status: Option<u16>,
    pub response_body: Option<Vec<u8>>,
    pub response_content_type: Option<String>,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewIdempotencyClaim {
    pub org_id: String,
    pub idempotency_key: String,
    pub endpoint: String,
    pub request_hash: String,
    pub claim_token: String,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

/// Finalized response written by the claim owner.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub org_id: String,
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub outcome: String,
    pub before_json: Option<serde_json::Value>,
    pub after_json: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub org_id: String,
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub outcome: String,
    pub before_json: Option<serde_json::Value>,
    pub after_json: Option<serde_json::Value>,
}

/// Row counts per delivery status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub sent: u64,
    pub dead: u64,
}
