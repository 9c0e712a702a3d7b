//! Outbox store.
//!
//! Events are written inside the caller's [`UnitOfWork`] so they commit (or
//! roll back) together with the business rows that caused them. Nothing here
//! performs I/O beyond SQL.

use crate::payload::decode_payload;
use crate::url_policy::{host_of, UrlValidator};
use crate::{OutboxError, OutboxResult};
use chrono::Utc;
use courier_core::{EventKind, ExportMode};
use courier_database::{
    queries, AsyncDatabase, ExportEvent, NewAuditEntry, NewExportEvent, NewOutboxEvent,
    OutboxEvent, UnitOfWork,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Audit action written when an operator moves a dead event back to pending.
pub const MANUAL_REQUEUE_ACTION: &str = "dlq_manual_requeue";

/// A side effect to record.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub org_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
}

impl EnqueueRequest {
    /// Build a request from an untyped kind, rejecting kinds outside the closed set.
    pub fn from_raw(
        org_id: impl Into<String>,
        kind: &str,
        payload: serde_json::Value,
        dedupe_key: impl Into<String>,
    ) -> OutboxResult<Self> {
        Ok(Self {
            org_id: org_id.into(),
            kind: kind.parse()?,
            payload,
            dedupe_key: dedupe_key.into(),
        })
    }
}

/// An export push to record.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub org_id: String,
    pub mode: ExportMode,
    pub target_url: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
}

fn require(field: &str, value: &str) -> OutboxResult<()> {
    if value.trim().is_empty() {
        return Err(OutboxError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct OutboxStore {
    url_validator: Arc<dyn UrlValidator>,
}

impl OutboxStore {
    pub fn new(url_validator: Arc<dyn UrlValidator>) -> Self {
        Self { url_validator }
    }

    /// Record a side effect. Idempotent by `(org_id, dedupe_key)`: a repeat
    /// returns the existing event untouched.
    pub fn enqueue(&self, uow: &UnitOfWork<'_>, request: EnqueueRequest) -> OutboxResult<OutboxEvent> {
        require("org_id", &request.org_id)?;
        require("dedupe_key", &request.dedupe_key)?;
        decode_payload(request.kind, &request.payload)?;

        let event = NewOutboxEvent {
            event_id: Uuid::new_v4().to_string(),
            org_id: request.org_id,
            kind: request.kind,
            payload: request.payload,
            dedupe_key: request.dedupe_key,
        };

        let inserted = queries::insert_outbox_event(uow, &event, Utc::now())?;
        if inserted {
            debug!(
                org_id = %event.org_id,
                event_id = %event.event_id,
                kind = %event.kind,
                "Outbox event enqueued"
            );
        } else {
            debug!(
                org_id = %event.org_id,
                dedupe_key = %event.dedupe_key,
                "Outbox event already recorded"
            );
        }

        queries::get_outbox_event_by_dedupe_key(uow, &event.org_id, &event.dedupe_key)?
            .ok_or_else(|| OutboxError::NotFound(event.dedupe_key.clone()))
    }

    /// Record an export push. The target must pass the URL policy now; it is
    /// checked again before every send.
    pub fn create_export(&self, uow: &UnitOfWork<'_>, request: ExportRequest) -> OutboxResult<ExportEvent> {
        require("org_id", &request.org_id)?;
        require("dedupe_key", &request.dedupe_key)?;
        let url = self.url_validator.validate(&request.target_url)?;

        let export = NewExportEvent {
            export_id: Uuid::new_v4().to_string(),
            org_id: request.org_id,
            mode: request.mode,
            target_url_host: host_of(&url),
            target_url: url.to_string(),
            payload: request.payload,
            dedupe_key: request.dedupe_key,
        };

        if queries::insert_export_event(uow, &export, Utc::now())? {
            debug!(
                org_id = %export.org_id,
                export_id = %export.export_id,
                mode = %export.mode,
                host = %export.target_url_host,
                "Export enqueued"
            );
        }

        queries::get_export_event_by_dedupe_key(uow, &export.org_id, &export.dedupe_key)?
            .ok_or_else(|| OutboxError::NotFound(export.dedupe_key.clone()))
    }

    /// Operator action: move a dead event back to pending with its attempt
    /// count intact. The change is audited in the same transaction.
    pub async fn requeue_dead(
        &self,
        db: &AsyncDatabase,
        org_id: &str,
        event_id: &str,
        actor: &str,
    ) -> OutboxResult<OutboxEvent> {
        let org_id = org_id.to_string();
        let event_id = event_id.to_string();
        let actor = actor.to_string();

        let event = db
            .transaction(move |uow| -> OutboxResult<OutboxEvent> {
                let before = queries::get_outbox_event(uow, &event_id)?
                    .filter(|e| e.org_id == org_id)
                    .ok_or_else(|| OutboxError::NotFound(event_id.clone()))?;

                let now = Utc::now();
                if !queries::requeue_dead_outbox_event(uow, &org_id, &event_id, now)? {
                    return Err(OutboxError::InvalidRequest(format!(
                        "event {event_id} is {}, not dead",
                        before.status.as_str()
                    )));
                }
                let after = queries::get_outbox_event(uow, &event_id)?
                    .ok_or_else(|| OutboxError::NotFound(event_id.clone()))?;

                queries::insert_audit_entry(
                    uow,
                    &NewAuditEntry {
                        org_id: org_id.clone(),
                        actor,
                        action: MANUAL_REQUEUE_ACTION.to_string(),
                        resource_type: "outbox_event".to_string(),
                        resource_id: event_id.clone(),
                        outcome: "requeued".to_string(),
                        before_json: Some(serde_json::to_value(&before)?),
                        after_json: Some(serde_json::to_value(&after)?),
                    },
                    now,
                )?;
                Ok(after)
            })
            .await?;

        info!(
            org_id = %event.org_id,
            event_id = %event.event_id,
            attempts = event.attempts,
            "Dead event requeued"
        );
        Ok(event)
    }
}
