use super::{format_datetime, parse_column, parse_datetime, parse_opt_datetime};
use crate::{DatabaseResult, IdempotencyRecord, NewIdempotencyClaim, StoredResponse};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

// ============================================================================
// Idempotency records
// ============================================================================

const IDEMPOTENCY_COLUMNS: &str = "org_id, idempotency_key, endpoint, request_hash, status, \
     claim_token, response_status, response_body, response_content_type, claimed_at, \
     lease_expires_at, completed_at";

fn map_idempotency_row(row: &Row<'_>) -> rusqlite::Result<IdempotencyRecord> {
    Ok(IdempotencyRecord {
        org_id: row.get(0)?,
        idempotency_key: row.get(1)?,
        endpoint: row.get(2)?,
        request_hash: row.get(3)?,
        status: parse_column(4, row.get(4)?)?,
        claim_token: row.get(5)?,
        response_status: row.get(6)?,
        response_body: row.get(7)?,
        response_content_type: row.get(8)?,
        claimed_at: parse_datetime(9, row.get(9)?)?,
        lease_expires_at: parse_datetime(10, row.get(10)?)?,
        completed_at: parse_opt_datetime(11, row.get(11)?)?,
    })
}

/// Insert a pending claim unless the key is already recorded.
/// Returns whether this call created the row.
pub fn insert_idempotency_claim(
    conn: &Connection,
    claim: &NewIdempotencyClaim,
) -> DatabaseResult<bool> {
    let inserted = conn
        .prepare_cached(
            "INSERT OR IGNORE INTO idempotency_records
                (org_id, idempotency_key, endpoint, request_hash, status, claim_token,
                 claimed_at, lease_expires_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7)",
        )?
        .execute(params![
            claim.org_id,
            claim.idempotency_key,
            claim.endpoint,
            claim.request_hash,
            claim.claim_token,
            format_datetime(claim.claimed_at),
            format_datetime(claim.lease_expires_at),
        ])?;
    Ok(inserted == 1)
}

pub fn get_idempotency_record(
    conn: &Connection,
    org_id: &str,
    idempotency_key: &str,
    endpoint: &str,
) -> DatabaseResult<Option<IdempotencyRecord>> {
    let sql = format!(
        "SELECT {IDEMPOTENCY_COLUMNS} FROM idempotency_records
         WHERE org_id = ?1 AND idempotency_key = ?2 AND endpoint = ?3"
    );
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![org_id, idempotency_key, endpoint], map_idempotency_row)
        .optional()?)
}

/// Hand an expired pending claim with the same fingerprint to a new owner.
/// Returns whether the takeover happened.
pub fn take_over_expired_claim(conn: &Connection, claim: &NewIdempotencyClaim) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE idempotency_records
             SET claim_token = ?5, claimed_at = ?6, lease_expires_at = ?7
             WHERE org_id = ?1 AND idempotency_key = ?2 AND endpoint = ?3
               AND request_hash = ?4 AND status = 'pending' AND lease_expires_at <= ?6",
        )?
        .execute(params![
            claim.org_id,
            claim.idempotency_key,
            claim.endpoint,
            claim.request_hash,
            claim.claim_token,
            format_datetime(claim.claimed_at),
            format_datetime(claim.lease_expires_at),
        ])?;
    Ok(updated == 1)
}

/// Finalize the claim owned by `claim_token`. Returns false if ownership was lost.
pub fn complete_idempotency_record(
    conn: &Connection,
    org_id: &str,
    idempotency_key: &str,
    endpoint: &str,
    claim_token: &str,
    response: &StoredResponse,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE idempotency_records
             SET status = 'completed', response_status = ?5, response_body = ?6,
                 response_content_type = ?7, completed_at = ?8
             WHERE org_id = ?1 AND idempotency_key = ?2 AND endpoint = ?3
               AND claim_token = ?4 AND status = 'pending'",
        )?
        .execute(params![
            org_id,
            idempotency_key,
            endpoint,
            claim_token,
            response.status,
            response.body,
            response.content_type,
            format_datetime(now),
        ])?;
    Ok(updated == 1)
}

/// Delete the pending claim owned by `claim_token` so the client may retry.
pub fn release_idempotency_claim(
    conn: &Connection,
    org_id: &str,
    idempotency_key: &str,
    endpoint: &str,
    claim_token: &str,
) -> DatabaseResult<bool> {
    let deleted = conn
        .prepare_cached(
            "DELETE FROM idempotency_records
             WHERE org_id = ?1 AND idempotency_key = ?2 AND endpoint = ?3
               AND claim_token = ?4 AND status = 'pending'",
        )?
        .execute(params![org_id, idempotency_key, endpoint, claim_token])?;
    Ok(deleted == 1)
}

/// Remove pending claims whose lease ran out before `now`.
pub fn delete_expired_idempotency_claims(
    conn: &Connection,
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    Ok(conn
        .prepare_cached(
            "DELETE FROM idempotency_records
             WHERE status = 'pending' AND lease_expires_at <= ?1",
        )?
        .execute([format_datetime(now)])?)
}

/// Remove completed records finalized before `before`.
pub fn purge_completed_idempotency_records(
    conn: &Connection,
    before: DateTime<Utc>,
) -> DatabaseResult<usize> {
    Ok(conn
        .prepare_cached(
            "DELETE FROM idempotency_records
             WHERE status = 'completed' AND completed_at < ?1",
        )?
        .execute([format_datetime(before)])?)
}
