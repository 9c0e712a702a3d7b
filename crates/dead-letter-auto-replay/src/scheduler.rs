//! Auto-replay of dead outbox events and exports.
//!
//! A run for one org:
//!
//! 1. leases up to `max_per_org` eligible dead rows in one immediate
//!    transaction, outbox rows first unless the priority says otherwise.
//!    Leased rows move to `pending`, which keeps delivery sweeps off them
//!    while the lease is live.
//! 2. renews each row's lease and delivers it through the same
//!    [`AdapterSet`] the delivery processor uses (export targets are
//!    re-validated there),
//! 3. records each outcome under the lease token and audits it: sent, or
//!    back to dead with the failure recorded. Policy skips go back to dead
//!    under a `skip_cooldown_minutes` hold.
//! 4. stops once `failure_streak_limit` consecutive deliveries have failed,
//!    returning the rows it did not get to.
//!
//! Eligibility is evaluated in SQL against the caller's clock, so a second
//! run with nothing newly failed selects nothing.

use crate::audit::{AuditTrail, AUTO_REPLAY_ACTION, SYSTEM_ACTOR};
use crate::metrics::{record_breaker_trip, record_depth, record_outcome};
use crate::{ReplayError, ReplayResult};
use chrono::{DateTime, Duration, Utc};
use courier_core::{AutoReplayConfig, ReplayPriority};
use courier_database::queries::{self, ClaimLease, DeadExportFilter, DeadOutboxFilter};
use courier_database::{
    AsyncDatabase, DatabaseResult, DeliveryStatus, ExportEvent, NewAuditEntry, OutboxEvent,
};
use courier_outbox::{AdapterSet, DeliveryOutcome};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stamped into `last_replayed_by` on exports.
pub const REPLAYED_BY: &str = "system:dlq_auto_replay";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Rows whose outcome was recorded in this run: `sent + failed + skipped`.
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Leases lost before delivery, or outcomes that could not be recorded.
    pub lost: usize,
    pub depth_before: u64,
    pub depth_after: u64,
    pub breaker_tripped: bool,
}

/// A leased dead row.
#[derive(Debug, Clone)]
enum DeadRow {
    Outbox(OutboxEvent),
    Export(ExportEvent),
}

impl DeadRow {
    fn id(&self) -> &str {
        match self {
            DeadRow::Outbox(e) => &e.event_id,
            DeadRow::Export(e) => &e.export_id,
        }
    }

    fn resource_type(&self) -> &'static str {
        match self {
            DeadRow::Outbox(_) => "outbox_event",
            DeadRow::Export(_) => "export_event",
        }
    }

    /// The row as it stood before the replay claim.
    fn snapshot(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            DeadRow::Outbox(e) => {
                let mut before = e.clone();
                before.status = DeliveryStatus::Dead;
                before.claim_token = None;
                before.claimed_until = None;
                serde_json::to_value(before)
            }
            DeadRow::Export(e) => {
                let mut before = e.clone();
                before.status = DeliveryStatus::Dead;
                before.claim_token = None;
                before.claimed_until = None;
                serde_json::to_value(before)
            }
        }
    }
}

#[derive(Clone)]
pub struct AutoReplayScheduler {
    db: AsyncDatabase,
    adapters: AdapterSet,
    config: AutoReplayConfig,
    claim_ttl: Duration,
    audit: AuditTrail,
}

impl AutoReplayScheduler {
    pub fn new(db: AsyncDatabase, adapters: AdapterSet, config: AutoReplayConfig, claim_ttl: Duration) -> Self {
        let audit = AuditTrail::new(db.clone());
        Self {
            db,
            adapters,
            config,
            claim_ttl,
            audit,
        }
    }

    pub fn config(&self) -> &AutoReplayConfig {
        &self.config
    }

    pub async fn run_auto_replay(&self, org_id: &str) -> ReplayResult<ReplayReport> {
        self.run_auto_replay_at(org_id, Utc::now()).await
    }

    /// Run against an explicit clock. All age and cooldown checks use `now`.
    pub async fn run_auto_replay_at(&self, org_id: &str, now: DateTime<Utc>) -> ReplayResult<ReplayReport> {
        if !self.config.auto_replay_enabled {
            debug!(org_id = %org_id, "Auto-replay disabled");
            return Ok(ReplayReport::default());
        }
        if org_id.trim().is_empty() {
            return Err(ReplayError::InvalidOrg(org_id.to_string()));
        }

        let mut report = ReplayReport {
            depth_before: self.depth(org_id).await?,
            ..Default::default()
        };
        record_depth(org_id, "before", report.depth_before);

        let lease = ClaimLease::new(Uuid::new_v4().to_string(), now, self.claim_ttl);
        let rows = self.claim(org_id, &lease).await?;
        debug!(org_id = %org_id, count = rows.len(), "Claimed dead rows for replay");
        let skip_hold = now + Duration::minutes(self.config.skip_cooldown_minutes);

        let mut streak = 0u32;
        let mut remaining = rows.into_iter();
        for row in remaining.by_ref() {
            if !self.renew(&row, &lease.token).await {
                report.lost += 1;
                record_outcome("lost");
                continue;
            }
            let outcome = match &row {
                DeadRow::Outbox(event) => self.adapters.deliver_event(event).await,
                DeadRow::Export(export) => self.adapters.deliver_export(export).await,
            };

            let after = match self.record_outcome(&row, &lease.token, &outcome, skip_hold).await {
                Ok(after) => after,
                Err(e) => {
                    warn!(org_id = %org_id, id = %row.id(), error = %e, "Failed to record replay outcome");
                    None
                }
            };

            // the breaker follows the target, recorded or not
            match &outcome {
                DeliveryOutcome::Delivered => streak = 0,
                DeliveryOutcome::Failed { .. } => streak += 1,
                DeliveryOutcome::Skipped { .. } => {}
            }

            if after.is_some() {
                report.processed += 1;
                record_outcome(outcome.label());
                match &outcome {
                    DeliveryOutcome::Delivered => report.sent += 1,
                    DeliveryOutcome::Failed { .. } => report.failed += 1,
                    DeliveryOutcome::Skipped { .. } => report.skipped += 1,
                }
            } else {
                report.lost += 1;
                record_outcome("lost");
                warn!(org_id = %org_id, id = %row.id(), outcome = outcome.label(), "Replay outcome not recorded");
            }

            self.audit_outcome(org_id, &row, &outcome, after).await;

            if streak >= self.config.failure_streak_limit {
                report.breaker_tripped = true;
                record_breaker_trip(org_id);
                warn!(
                    org_id = %org_id,
                    streak,
                    limit = self.config.failure_streak_limit,
                    "Replay breaker tripped, stopping run"
                );
                break;
            }
        }

        let unattempted: Vec<DeadRow> = remaining.collect();
        if !unattempted.is_empty() {
            self.release(unattempted, &lease.token).await;
        }

        report.depth_after = self.depth(org_id).await?;
        record_depth(org_id, "after", report.depth_after);

        info!(
            org_id = %org_id,
            processed = report.processed,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            lost = report.lost,
            depth_before = report.depth_before,
            depth_after = report.depth_after,
            breaker_tripped = report.breaker_tripped,
            "Auto-replay run finished"
        );
        Ok(report)
    }

    async fn depth(&self, org_id: &str) -> ReplayResult<u64> {
        let org_id = org_id.to_string();
        Ok(self
            .db
            .call(move |conn| queries::count_dead_events(conn, &org_id))
            .await?)
    }

    /// Lease both queues within one per-org budget.
    async fn claim(&self, org_id: &str, lease: &ClaimLease) -> ReplayResult<Vec<DeadRow>> {
        let now = lease.now;
        let budget = self.config.max_per_org;
        let outbox_filter = DeadOutboxFilter {
            org_id: org_id.to_string(),
            kinds: self.config.allowed_outbox_kinds.clone(),
            created_before: now - Duration::minutes(self.config.min_age_minutes),
            attempt_ceiling: self.config.outbox_attempt_ceiling,
            limit: budget,
        };
        let export_filter = DeadExportFilter {
            org_id: org_id.to_string(),
            modes: self.config.allowed_export_modes.clone(),
            created_before: now - Duration::minutes(self.config.min_age_minutes),
            replay_limit: self.config.export_replay_limit,
            replayed_before: now - Duration::minutes(self.config.export_cooldown_minutes),
            limit: budget,
        };
        let priority = self.config.priority;
        let lease = lease.clone();

        let rows = self
            .db
            .transaction(move |uow| -> DatabaseResult<Vec<DeadRow>> {
                let mut rows = Vec::new();
                match priority {
                    ReplayPriority::OutboxFirst => {
                        let outbox = queries::claim_dead_outbox_events(uow, &outbox_filter, &lease)?;
                        let export_filter = DeadExportFilter {
                            limit: budget.saturating_sub(outbox.len() as u32),
                            ..export_filter
                        };
                        let exports = queries::claim_dead_export_events(uow, &export_filter, &lease)?;
                        rows.extend(outbox.into_iter().map(DeadRow::Outbox));
                        rows.extend(exports.into_iter().map(DeadRow::Export));
                    }
                    ReplayPriority::ExportFirst => {
                        let exports = queries::claim_dead_export_events(uow, &export_filter, &lease)?;
                        let outbox_filter = DeadOutboxFilter {
                            limit: budget.saturating_sub(exports.len() as u32),
                            ..outbox_filter
                        };
                        let outbox = queries::claim_dead_outbox_events(uow, &outbox_filter, &lease)?;
                        rows.extend(exports.into_iter().map(DeadRow::Export));
                        rows.extend(outbox.into_iter().map(DeadRow::Outbox));
                    }
                }
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Extend the row's lease to a full TTL from now. False once it has been taken over.
    async fn renew(&self, row: &DeadRow, token: &str) -> bool {
        let row_id = row.id().to_string();
        let is_export = matches!(row, DeadRow::Export(_));
        let token = token.to_string();
        let until = Utc::now() + self.claim_ttl;
        let renewed = self
            .db
            .call(move |conn| {
                if is_export {
                    queries::renew_export_claim(conn, &row_id, &token, until)
                } else {
                    queries::renew_outbox_claim(conn, &row_id, &token, until)
                }
            })
            .await;
        match renewed {
            Ok(true) => true,
            Ok(false) => {
                warn!(id = %row.id(), "Replay lease taken over before delivery, skipping row");
                false
            }
            Err(e) => {
                warn!(id = %row.id(), error = %e, "Failed to renew replay lease, skipping row");
                false
            }
        }
    }

    /// Apply the outcome under the lease and return the row as it now stands.
    /// `None` means the lease was lost and nothing was written.
    async fn record_outcome(
        &self,
        row: &DeadRow,
        token: &str,
        outcome: &DeliveryOutcome,
        skip_hold: DateTime<Utc>,
    ) -> ReplayResult<Option<serde_json::Value>> {
        let row = row.clone();
        let token = token.to_string();
        let outcome = outcome.clone();

        let after = self
            .db
            .transaction(move |uow| -> ReplayResult<Option<serde_json::Value>> {
                let now = Utc::now();
                match row {
                    DeadRow::Outbox(event) => {
                        let id = event.event_id.as_str();
                        let applied = match &outcome {
                            DeliveryOutcome::Delivered => queries::mark_outbox_sent(uow, id, &token, now)?,
                            DeliveryOutcome::Failed { error, .. } => {
                                queries::record_outbox_replay_failure(uow, id, &token, error, now)?
                            }
                            DeliveryOutcome::Skipped { code, reason } => {
                                let message = format!("{code}: {reason}");
                                queries::release_outbox_replay_claim(
                                    uow,
                                    id,
                                    &token,
                                    Some(message.as_str()),
                                    Some(skip_hold),
                                    now,
                                )?
                            }
                        };
                        if !applied {
                            return Ok(None);
                        }
                        queries::get_outbox_event(uow, id)?
                            .map(|e| serde_json::to_value(&e))
                            .transpose()
                            .map_err(ReplayError::from)
                    }
                    DeadRow::Export(export) => {
                        let id = export.export_id.as_str();
                        let applied = match &outcome {
                            DeliveryOutcome::Delivered => {
                                queries::mark_export_replay_sent(uow, id, &token, REPLAYED_BY, now)?
                            }
                            DeliveryOutcome::Failed { code, error } => queries::record_export_replay_failure(
                                uow,
                                id,
                                &token,
                                error,
                                code,
                                REPLAYED_BY,
                                now,
                            )?,
                            DeliveryOutcome::Skipped { code, reason } => queries::release_export_replay_claim(
                                uow,
                                id,
                                &token,
                                Some(reason.as_str()),
                                Some(code.as_str()),
                                Some(skip_hold),
                                now,
                            )?,
                        };
                        if !applied {
                            return Ok(None);
                        }
                        queries::get_export_event(uow, id)?
                            .map(|e| serde_json::to_value(&e))
                            .transpose()
                            .map_err(ReplayError::from)
                    }
                }
            })
            .await?;
        Ok(after)
    }

    async fn audit_outcome(
        &self,
        org_id: &str,
        row: &DeadRow,
        outcome: &DeliveryOutcome,
        after: Option<serde_json::Value>,
    ) {
        let before = match row.snapshot() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(id = %row.id(), error = %e, "Failed to snapshot row for audit");
                None
            }
        };
        let outcome = match outcome {
            _ if after.is_none() => format!("unrecorded:{}", outcome.label()),
            DeliveryOutcome::Delivered => "sent".to_string(),
            DeliveryOutcome::Failed { code, .. } => format!("failed:{code}"),
            DeliveryOutcome::Skipped { code, .. } => format!("skipped:{code}"),
        };

        self.audit
            .record_best_effort(
                NewAuditEntry {
                    org_id: org_id.to_string(),
                    actor: SYSTEM_ACTOR.to_string(),
                    action: AUTO_REPLAY_ACTION.to_string(),
                    resource_type: row.resource_type().to_string(),
                    resource_id: row.id().to_string(),
                    outcome,
                    before_json: before,
                    after_json: after,
                },
                Utc::now(),
            )
            .await;
    }

    /// Return rows the breaker stopped us from attempting to dead, uncounted.
    async fn release(&self, rows: Vec<DeadRow>, token: &str) {
        let count = rows.len();
        let token = token.to_string();
        let result = self
            .db
            .transaction(move |uow| -> DatabaseResult<()> {
                let now = Utc::now();
                for row in &rows {
                    match row {
                        DeadRow::Outbox(e) => {
                            queries::release_outbox_replay_claim(uow, &e.event_id, &token, None, None, now)?;
                        }
                        DeadRow::Export(e) => {
                            queries::release_export_replay_claim(uow, &e.export_id, &token, None, None, None, now)?;
                        }
                    }
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => debug!(count, "Released unattempted replay claims"),
            Err(e) => warn!(count, error = %e, "Failed to return replay claims, leases will expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_row_identity() {
        let now = Utc::now();
        let row = DeadRow::Outbox(OutboxEvent {
            event_id: "evt-9".into(),
            org_id: "org-a".into(),
            kind: courier_core::EventKind::Webhook,
            payload: serde_json::json!({}),
            dedupe_key: "k".into(),
            status: DeliveryStatus::Pending,
            attempts: 5,
            last_error: Some("HTTP 500".into()),
            claim_token: Some("lease-1".into()),
            claimed_until: Some(now),
            created_at: now,
            updated_at: now,
            sent_at: None,
            next_attempt_at: None,
        });
        assert_eq!(row.id(), "evt-9");
        assert_eq!(row.resource_type(), "outbox_event");

        let before = row.snapshot().unwrap();
        assert_eq!(before["attempts"], 5);
        assert_eq!(before["status"], "dead");
        assert!(before["claim_token"].is_null());
    }
}
