//! Audit side channel.
//!
//! Replay outcomes are already committed by the time they are audited. A
//! failed audit write is logged and dropped; it never undoes or fails the
//! replay it describes.

use chrono::{DateTime, Utc};
use courier_database::{queries, AsyncDatabase, NewAuditEntry};
use tracing::{debug, warn};

pub const SYSTEM_ACTOR: &str = "system";
pub const AUTO_REPLAY_ACTION: &str = "dlq_auto_replay";

#[derive(Clone)]
pub struct AuditTrail {
    db: AsyncDatabase,
}

impl AuditTrail {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    /// Write `entry`, logging instead of returning storage errors.
    pub async fn record_best_effort(&self, entry: NewAuditEntry, at: DateTime<Utc>) {
        let action = entry.action.clone();
        let resource_id = entry.resource_id.clone();
        let org_id = entry.org_id.clone();

        match self
            .db
            .call(move |conn| queries::insert_audit_entry(conn, &entry, at))
            .await
        {
            Ok(id) => debug!(audit_id = id, action = %action, resource_id = %resource_id, "Audit entry written"),
            Err(e) => warn!(
                org_id = %org_id,
                action = %action,
                resource_id = %resource_id,
                error = %e,
                "Failed to write audit entry"
            ),
        }
    }
}
