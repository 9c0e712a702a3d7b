//! Delivery processor.
//!
//! One sweep runs in three steps per batch:
//!
//! 1. claim a batch of pending rows under a lease (one immediate transaction),
//! 2. renew the lease on each row and call its adapter with no transaction open,
//! 3. record each outcome in its own transaction, guarded by the claim token.
//!
//! A second processor sweeping the same database skips leased rows. The lease
//! is renewed right before each adapter call and the call is bounded by a
//! timeout shorter than the lease, so a row is never sent by two sweeps. A
//! row whose lease ran out while earlier rows were being sent is counted as
//! lost and left to whoever took it over. If the process dies between steps
//! 1 and 3 the lease runs out and the row is picked up again.
//!
//! Skipped rows stay pending but are held back for `skip_backoff_seconds`,
//! so a kind with no adapter cannot crowd newer events out of the batch.

use crate::adapters::{AdapterSet, DeliveryOutcome};
use crate::metrics::record_delivery;
use crate::OutboxResult;
use chrono::Utc;
use courier_core::OutboxConfig;
use courier_database::{queries, AsyncDatabase, DatabaseResult, DeliveryStatus, ExportEvent, OutboxEvent};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub claimed: usize,
    pub delivered: usize,
    /// Failed but still pending.
    pub failed: usize,
    /// Failed and moved to dead by this sweep.
    pub dead: usize,
    pub skipped: usize,
    /// Claims taken over by another sweep, or whose outcome could not be recorded.
    pub lost: usize,
}

impl ProcessReport {
    pub fn merge(&mut self, other: ProcessReport) {
        self.claimed += other.claimed;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.dead += other.dead;
        self.skipped += other.skipped;
        self.lost += other.lost;
    }

    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }

    fn record_failure(&mut self, status: Option<DeliveryStatus>) {
        match status {
            Some(DeliveryStatus::Dead) => self.dead += 1,
            Some(_) => self.failed += 1,
            None => self.lost += 1,
        }
    }

    fn record(&mut self, outcome: &DeliveryOutcome, status: Option<DeliveryStatus>) {
        match (outcome, status) {
            (_, None) => self.lost += 1,
            (DeliveryOutcome::Delivered, Some(_)) => self.delivered += 1,
            (DeliveryOutcome::Failed { .. }, status) => self.record_failure(status),
            (DeliveryOutcome::Skipped { .. }, Some(_)) => self.skipped += 1,
        }
    }

    fn log(&self, message: &'static str) {
        info!(
            claimed = self.claimed,
            delivered = self.delivered,
            failed = self.failed,
            dead = self.dead,
            skipped = self.skipped,
            lost = self.lost,
            "{message}"
        );
    }
}

#[derive(Clone)]
pub struct DeliveryProcessor {
    db: AsyncDatabase,
    adapters: AdapterSet,
    config: OutboxConfig,
}

impl DeliveryProcessor {
    pub fn new(db: AsyncDatabase, adapters: AdapterSet, config: OutboxConfig) -> Self {
        Self { db, adapters, config }
    }

    fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.claim_ttl_seconds as i64)
    }

    fn lease(&self) -> queries::ClaimLease {
        queries::ClaimLease::new(Uuid::new_v4().to_string(), Utc::now(), self.claim_ttl())
    }

    fn skip_hold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.skip_backoff_seconds as i64)
    }

    /// Attempt one batch of pending outbox events, oldest first.
    pub async fn process_pending(&self) -> OutboxResult<ProcessReport> {
        let lease = self.lease();
        let limit = self.config.batch_size;
        let claim = lease.clone();
        let events = self
            .db
            .transaction(move |uow| queries::claim_pending_outbox_events(uow, limit, &claim))
            .await?;

        let mut report = ProcessReport {
            claimed: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            return Ok(report);
        }
        debug!(count = events.len(), token = %lease.token, "Claimed pending outbox events");

        for event in events {
            if !self.renew_event_claim(&event, &lease.token).await {
                report.lost += 1;
                continue;
            }
            let outcome = self.adapters.deliver_event(&event).await;
            record_delivery("outbox", outcome.label());

            match self.record_event_outcome(&event, &lease.token, &outcome).await {
                Ok(status) => report.record(&outcome, status),
                Err(e) => {
                    report.lost += 1;
                    warn!(
                        org_id = %event.org_id,
                        event_id = %event.event_id,
                        error = %e,
                        "Failed to record delivery outcome, lease will expire"
                    );
                }
            }
        }

        report.log("Outbox sweep finished");
        Ok(report)
    }

    /// Attempt one batch of pending exports. Initial attempts never count as replays.
    pub async fn process_pending_exports(&self) -> OutboxResult<ProcessReport> {
        let lease = self.lease();
        let limit = self.config.batch_size;
        let claim = lease.clone();
        let exports = self
            .db
            .transaction(move |uow| queries::claim_pending_export_events(uow, limit, &claim))
            .await?;

        let mut report = ProcessReport {
            claimed: exports.len(),
            ..Default::default()
        };
        if exports.is_empty() {
            return Ok(report);
        }

        for export in exports {
            if !self.renew_export_claim(&export, &lease.token).await {
                report.lost += 1;
                continue;
            }
            let outcome = self.adapters.deliver_export(&export).await;
            record_delivery("export", outcome.label());

            match self.record_export_outcome(&export, &lease.token, &outcome).await {
                Ok(status) => report.record(&outcome, status),
                Err(e) => {
                    report.lost += 1;
                    warn!(
                        org_id = %export.org_id,
                        export_id = %export.export_id,
                        error = %e,
                        "Failed to record export outcome, lease will expire"
                    );
                }
            }
        }

        report.log("Export sweep finished");
        Ok(report)
    }

    /// Outbox sweep followed by export sweep.
    pub async fn process_all(&self) -> OutboxResult<ProcessReport> {
        let mut report = self.process_pending().await?;
        report.merge(self.process_pending_exports().await?);
        Ok(report)
    }

    /// Extend the lease to a full TTL from now. False if the row is no longer ours.
    async fn renew_event_claim(&self, event: &OutboxEvent, token: &str) -> bool {
        let event_id = event.event_id.clone();
        let token = token.to_string();
        let until = Utc::now() + self.claim_ttl();
        let renewed = self
            .db
            .call(move |conn| queries::renew_outbox_claim(conn, &event_id, &token, until))
            .await;
        claim_still_held(&event.org_id, &event.event_id, renewed)
    }

    async fn renew_export_claim(&self, export: &ExportEvent, token: &str) -> bool {
        let export_id = export.export_id.clone();
        let token = token.to_string();
        let until = Utc::now() + self.claim_ttl();
        let renewed = self
            .db
            .call(move |conn| queries::renew_export_claim(conn, &export_id, &token, until))
            .await;
        claim_still_held(&export.org_id, &export.export_id, renewed)
    }

    /// Returns the row's new status, or `None` when the claim was lost.
    async fn record_event_outcome(
        &self,
        event: &OutboxEvent,
        token: &str,
        outcome: &DeliveryOutcome,
    ) -> DatabaseResult<Option<DeliveryStatus>> {
        let event_id = event.event_id.clone();
        let token = token.to_string();
        let recorded = outcome.clone();
        let max_attempts = self.config.max_attempts;
        let hold = self.skip_hold();

        let status = self
            .db
            .transaction(move |uow| -> DatabaseResult<Option<DeliveryStatus>> {
                let now = Utc::now();
                match &recorded {
                    DeliveryOutcome::Delivered => {
                        let sent = queries::mark_outbox_sent(uow, &event_id, &token, now)?;
                        Ok(sent.then_some(DeliveryStatus::Sent))
                    }
                    DeliveryOutcome::Failed { error, .. } => {
                        queries::record_outbox_failure(uow, &event_id, &token, error, max_attempts, now)
                    }
                    DeliveryOutcome::Skipped { code, reason } => {
                        let message = format!("{code}: {reason}");
                        let released = queries::release_outbox_claim(
                            uow,
                            &event_id,
                            &token,
                            Some(message.as_str()),
                            Some(now + hold),
                            now,
                        )?;
                        Ok(released.then_some(DeliveryStatus::Pending))
                    }
                }
            })
            .await?;

        log_outcome(&event.org_id, &event.event_id, event.attempts, outcome, status);
        Ok(status)
    }

    async fn record_export_outcome(
        &self,
        export: &ExportEvent,
        token: &str,
        outcome: &DeliveryOutcome,
    ) -> DatabaseResult<Option<DeliveryStatus>> {
        let export_id = export.export_id.clone();
        let token = token.to_string();
        let recorded = outcome.clone();
        let max_attempts = self.config.max_attempts;
        let hold = self.skip_hold();

        let status = self
            .db
            .transaction(move |uow| -> DatabaseResult<Option<DeliveryStatus>> {
                let now = Utc::now();
                match &recorded {
                    DeliveryOutcome::Delivered => {
                        let sent = queries::mark_export_sent(uow, &export_id, &token, now)?;
                        Ok(sent.then_some(DeliveryStatus::Sent))
                    }
                    DeliveryOutcome::Failed { code, error } => queries::record_export_failure(
                        uow,
                        &export_id,
                        &token,
                        error,
                        code,
                        max_attempts,
                        now,
                    ),
                    DeliveryOutcome::Skipped { code, reason } => {
                        let released = queries::release_export_claim(
                            uow,
                            &export_id,
                            &token,
                            Some(reason.as_str()),
                            Some(code.as_str()),
                            Some(now + hold),
                            now,
                        )?;
                        Ok(released.then_some(DeliveryStatus::Pending))
                    }
                }
            })
            .await?;

        log_outcome(&export.org_id, &export.export_id, export.attempts, outcome, status);
        Ok(status)
    }
}

fn claim_still_held(org_id: &str, id: &str, renewed: DatabaseResult<bool>) -> bool {
    match renewed {
        Ok(true) => true,
        Ok(false) => {
            warn!(org_id = %org_id, id = %id, "Lease taken over before delivery, skipping row");
            false
        }
        Err(e) => {
            warn!(org_id = %org_id, id = %id, error = %e, "Failed to renew lease, skipping row");
            false
        }
    }
}

fn log_outcome(
    org_id: &str,
    id: &str,
    attempts_before: u32,
    outcome: &DeliveryOutcome,
    status: Option<DeliveryStatus>,
) {
    let Some(status) = status else {
        warn!(org_id = %org_id, id = %id, "Claim lost before outcome was recorded");
        return;
    };
    match outcome {
        DeliveryOutcome::Delivered => {
            debug!(org_id = %org_id, id = %id, attempts = attempts_before + 1, "Delivered");
        }
        DeliveryOutcome::Failed { code, error } if status == DeliveryStatus::Dead => {
            warn!(
                org_id = %org_id,
                id = %id,
                attempts = attempts_before + 1,
                code = %code,
                error = %error,
                "Delivery failed, moved to dead"
            );
        }
        DeliveryOutcome::Failed { code, error } => {
            debug!(
                org_id = %org_id,
                id = %id,
                attempts = attempts_before + 1,
                code = %code,
                error = %error,
                "Delivery failed, will retry next sweep"
            );
        }
        DeliveryOutcome::Skipped { code, reason } => {
            warn!(org_id = %org_id, id = %id, code = %code, reason = %reason, "Delivery skipped, held back");
        }
    }
}
