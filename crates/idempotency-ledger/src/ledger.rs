//! Idempotency ledger.
//!
//! One row per `(org_id, idempotency_key, endpoint)`. The first request to
//! insert the row owns execution; everyone else either gets the stored
//! response, a conflict, or a "retry shortly" answer while the owner is still
//! running. Ownership is a lease: a claim abandoned by a crashed owner can be
//! taken over by the next identical request once the lease runs out.

use crate::{LedgerError, LedgerResult};
use chrono::{DateTime, Duration, Utc};
use courier_core::IdempotencyConfig;
use courier_database::{
    queries, AsyncDatabase, DatabaseError, IdempotencyRecord, IdempotencyStatus, NewIdempotencyClaim,
    StoredResponse, UnitOfWork,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest accepted idempotency key.
pub const MAX_KEY_LENGTH: usize = 255;

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller owns execution and must finish with
    /// [`IdempotencyLedger::save_response`] or [`IdempotencyLedger::mark_failed`].
    Claimed(IdempotencyRecord),
    /// A finalized response for the same request.
    CachedResponse(IdempotencyRecord),
    /// Another request with the same fingerprint holds a live claim.
    InProgress { retry_after: std::time::Duration },
    /// The key was used with a different request.
    Conflict(IdempotencyRecord),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_claims: usize,
    pub purged_records: usize,
}

/// Validate a client-supplied key.
pub fn validate_key(key: &str) -> LedgerResult<()> {
    if key.is_empty() {
        return Err(LedgerError::InvalidKey("key is empty".into()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(LedgerError::InvalidKey(format!(
            "key is longer than {MAX_KEY_LENGTH} characters"
        )));
    }
    if !key.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(LedgerError::InvalidKey("key must be visible ASCII".into()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    db: AsyncDatabase,
    config: IdempotencyConfig,
}

impl IdempotencyLedger {
    pub fn new(db: AsyncDatabase, config: IdempotencyConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub async fn claim_or_replay(
        &self,
        org_id: &str,
        key: &str,
        endpoint: &str,
        fingerprint: &str,
    ) -> LedgerResult<ClaimOutcome> {
        self.claim_or_replay_at(org_id, key, endpoint, fingerprint, Utc::now())
            .await
    }

    pub async fn claim_or_replay_at(
        &self,
        org_id: &str,
        key: &str,
        endpoint: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<ClaimOutcome> {
        if org_id.trim().is_empty() {
            return Err(LedgerError::MissingOrg);
        }
        validate_key(key)?;

        let claim = NewIdempotencyClaim {
            org_id: org_id.to_string(),
            idempotency_key: key.to_string(),
            endpoint: endpoint.to_string(),
            request_hash: fingerprint.to_string(),
            claim_token: Uuid::new_v4().to_string(),
            claimed_at: now,
            lease_expires_at: now + Duration::seconds(self.config.claim_ttl_seconds as i64),
        };
        let retry_after = std::time::Duration::from_secs(self.config.retry_after_seconds);

        let outcome = self
            .db
            .transaction(move |uow| -> LedgerResult<ClaimOutcome> {
                if queries::insert_idempotency_claim(uow, &claim)? {
                    return Ok(ClaimOutcome::Claimed(lookup(uow, &claim)?));
                }

                let existing = lookup(uow, &claim)?;
                if existing.request_hash != claim.request_hash {
                    return Ok(ClaimOutcome::Conflict(existing));
                }
                if existing.status == IdempotencyStatus::Completed {
                    return Ok(ClaimOutcome::CachedResponse(existing));
                }
                if existing.lease_expires_at <= claim.claimed_at && queries::take_over_expired_claim(uow, &claim)? {
                    return Ok(ClaimOutcome::Claimed(lookup(uow, &claim)?));
                }
                Ok(ClaimOutcome::InProgress { retry_after })
            })
            .await?;

        match &outcome {
            ClaimOutcome::Claimed(record) => debug!(
                org_id = %record.org_id,
                key = %record.idempotency_key,
                endpoint = %record.endpoint,
                "Idempotency key claimed"
            ),
            ClaimOutcome::CachedResponse(record) => debug!(
                org_id = %record.org_id,
                key = %record.idempotency_key,
                "Replaying stored response"
            ),
            ClaimOutcome::InProgress { .. } => debug!(org_id = %org_id, key = %key, "Request already in progress"),
            ClaimOutcome::Conflict(record) => warn!(
                org_id = %record.org_id,
                key = %record.idempotency_key,
                endpoint = %record.endpoint,
                "Idempotency key reused with a different request"
            ),
        }
        Ok(outcome)
    }

    /// Finalize a claim. Fails with [`LedgerError::ClaimLost`] if the claim
    /// was released, swept, or taken over since it was granted.
    pub async fn save_response(&self, claim: &IdempotencyRecord, response: StoredResponse) -> LedgerResult<()> {
        let (org_id, key, endpoint, token) = owner(claim);
        let lost_key = key.clone();
        let saved = self
            .db
            .call(move |conn| {
                queries::complete_idempotency_record(conn, &org_id, &key, &endpoint, &token, &response, Utc::now())
            })
            .await?;
        if !saved {
            return Err(LedgerError::ClaimLost(lost_key));
        }
        debug!(org_id = %claim.org_id, key = %claim.idempotency_key, "Response stored");
        Ok(())
    }

    /// Release a claim without storing a response so the client can retry.
    /// Returns false when the claim was already gone.
    pub async fn mark_failed(&self, claim: &IdempotencyRecord) -> LedgerResult<bool> {
        let (org_id, key, endpoint, token) = owner(claim);
        let released = self
            .db
            .call(move |conn| queries::release_idempotency_claim(conn, &org_id, &key, &endpoint, &token))
            .await?;
        debug!(org_id = %claim.org_id, key = %claim.idempotency_key, released, "Claim released");
        Ok(released)
    }

    /// Delete pending claims whose lease ran out at or before `now`.
    pub async fn sweep_expired_claims(&self, now: DateTime<Utc>) -> LedgerResult<usize> {
        Ok(self
            .db
            .call(move |conn| queries::delete_expired_idempotency_claims(conn, now))
            .await?)
    }

    /// Delete finalized records older than the retention window.
    pub async fn purge_completed(&self, now: DateTime<Utc>) -> LedgerResult<usize> {
        let before = now - Duration::hours(self.config.retention_hours as i64);
        Ok(self
            .db
            .call(move |conn| queries::purge_completed_idempotency_records(conn, before))
            .await?)
    }

    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> LedgerResult<SweepReport> {
        let report = SweepReport {
            expired_claims: self.sweep_expired_claims(now).await?,
            purged_records: self.purge_completed(now).await?,
        };
        if report != SweepReport::default() {
            info!(
                expired_claims = report.expired_claims,
                purged_records = report.purged_records,
                "Idempotency ledger swept"
            );
        }
        Ok(report)
    }
}

fn lookup(uow: &UnitOfWork<'_>, claim: &NewIdempotencyClaim) -> LedgerResult<IdempotencyRecord> {
    queries::get_idempotency_record(uow, &claim.org_id, &claim.idempotency_key, &claim.endpoint)?
        .ok_or_else(|| LedgerError::Database(DatabaseError::NotFound(claim.idempotency_key.clone())))
}

fn owner(claim: &IdempotencyRecord) -> (String, String, String, String) {
    (
        claim.org_id.clone(),
        claim.idempotency_key.clone(),
        claim.endpoint.clone(),
        claim.claim_token.clone(),
    )
}
