use super::{
    format_datetime, parse_column, parse_datetime, parse_json, parse_opt_datetime, ClaimLease,
};
use crate::{DatabaseResult, DeliveryStatus, NewOutboxEvent, OutboxEvent, StatusCounts};
use chrono::{DateTime, Utc};
use courier_core::EventKind;
use rusqlite::{params, Connection, OptionalExtension, Row};

// ============================================================================
// Outbox events
// ============================================================================

const OUTBOX_COLUMNS: &str = "event_id, org_id, kind, payload, dedupe_key, status, attempts, \
     last_error, claim_token, claimed_until, created_at, updated_at, sent_at, next_attempt_at";

fn map_outbox_row(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    Ok(OutboxEvent {
        event_id: row.get(0)?,
        org_id: row.get(1)?,
        kind: parse_column(2, row.get(2)?)?,
        payload: parse_json(3, row.get(3)?)?,
        dedupe_key: row.get(4)?,
        status: parse_column(5, row.get(5)?)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        claim_token: row.get(8)?,
        claimed_until: parse_opt_datetime(9, row.get(9)?)?,
        created_at: parse_datetime(10, row.get(10)?)?,
        updated_at: parse_datetime(11, row.get(11)?)?,
        sent_at: parse_opt_datetime(12, row.get(12)?)?,
        next_attempt_at: parse_opt_datetime(13, row.get(13)?)?,
    })
}

/// Insert unless `(org_id, dedupe_key)` already exists. Returns whether a row was written.
pub fn insert_outbox_event(
    conn: &Connection,
    event: &NewOutboxEvent,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let payload = serde_json::to_string(&event.payload)?;
    let now = format_datetime(now);
    let inserted = conn
        .prepare_cached(
            "INSERT INTO outbox_events
                (event_id, org_id, kind, payload, dedupe_key, status, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)
             ON CONFLICT (org_id, dedupe_key) DO NOTHING",
        )?
        .execute(params![
            event.event_id,
            event.org_id,
            event.kind.as_str(),
            payload,
            event.dedupe_key,
            now,
        ])?;
    Ok(inserted == 1)
}

pub fn get_outbox_event(conn: &Connection, event_id: &str) -> DatabaseResult<Option<OutboxEvent>> {
    let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE event_id = ?1");
    Ok(conn
        .prepare_cached(&sql)?
        .query_row([event_id], map_outbox_row)
        .optional()?)
}

pub fn get_outbox_event_by_dedupe_key(
    conn: &Connection,
    org_id: &str,
    dedupe_key: &str,
) -> DatabaseResult<Option<OutboxEvent>> {
    let sql =
        format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE org_id = ?1 AND dedupe_key = ?2");
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![org_id, dedupe_key], map_outbox_row)
        .optional()?)
}

fn outbox_events_with_token(conn: &Connection, token: &str) -> DatabaseResult<Vec<OutboxEvent>> {
    let sql = format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE claim_token = ?1 ORDER BY created_at, rowid"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map([token], map_outbox_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lease up to `limit` pending events, oldest first, skipping rows under a
/// live lease or a retry hold.
///
/// Run inside an immediate transaction so the select and the update see the
/// same rows.
pub fn claim_pending_outbox_events(
    conn: &Connection,
    limit: u32,
    lease: &ClaimLease,
) -> DatabaseResult<Vec<OutboxEvent>> {
    conn.prepare_cached(
        "UPDATE outbox_events
         SET claim_token = ?1, claimed_until = ?2, updated_at = ?3
         WHERE event_id IN (
             SELECT event_id FROM outbox_events
             WHERE status = 'pending'
               AND (claimed_until IS NULL OR claimed_until <= ?3)
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?3)
             ORDER BY created_at, rowid
             LIMIT ?4
         )",
    )?
    .execute(params![
        lease.token,
        format_datetime(lease.until),
        format_datetime(lease.now),
        limit,
    ])?;
    outbox_events_with_token(conn, &lease.token)
}

/// Push the lease on one claimed row out to `until`. Returns false once
/// another claimer has taken the row over.
pub fn renew_outbox_claim(
    conn: &Connection,
    event_id: &str,
    claim_token: &str,
    until: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE outbox_events SET claimed_until = ?3
             WHERE event_id = ?1 AND claim_token = ?2 AND status = 'pending'",
        )?
        .execute(params![event_id, claim_token, format_datetime(until)])?;
    Ok(updated == 1)
}

/// Successful delivery, first-line or replayed.
pub fn mark_outbox_sent(
    conn: &Connection,
    event_id: &str,
    claim_token: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE outbox_events
             SET status = 'sent', attempts = attempts + 1, last_error = NULL,
                 sent_at = ?3, updated_at = ?3, claim_token = NULL, claimed_until = NULL
             WHERE event_id = ?1 AND claim_token = ?2 AND status = 'pending'",
        )?
        .execute(params![event_id, claim_token, format_datetime(now)])?;
    Ok(updated == 1)
}

/// Failed first-line delivery. The row goes dead once `attempts` reaches
/// `max_attempts`. Returns the resulting status, or `None` if the claim was lost.
pub fn record_outbox_failure(
    conn: &Connection,
    event_id: &str,
    claim_token: &str,
    error: &str,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> DatabaseResult<Option<DeliveryStatus>> {
    let status: Option<String> = conn
        .prepare_cached(
            "UPDATE outbox_events
             SET attempts = attempts + 1, last_error = ?3,
                 status = CASE WHEN attempts + 1 >= ?4 THEN 'dead' ELSE 'pending' END,
                 updated_at = ?5, claim_token = NULL, claimed_until = NULL
             WHERE event_id = ?1 AND claim_token = ?2 AND status = 'pending'
             RETURNING status",
        )?
        .query_row(
            params![event_id, claim_token, error, max_attempts, format_datetime(now)],
            |row| row.get(0),
        )
        .optional()?;
    status.map(|s| s.parse()).transpose()
}

/// Drop a lease without counting an attempt. `error`, when given, replaces
/// `last_error`; `hold_until`, when given, keeps the row unclaimable until then.
pub fn release_outbox_claim(
    conn: &Connection,
    event_id: &str,
    claim_token: &str,
    error: Option<&str>,
    hold_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE outbox_events
             SET claim_token = NULL, claimed_until = NULL,
                 last_error = COALESCE(?3, last_error),
                 next_attempt_at = COALESCE(?4, next_attempt_at), updated_at = ?5
             WHERE event_id = ?1 AND claim_token = ?2",
        )?
        .execute(params![
            event_id,
            claim_token,
            error,
            hold_until.map(format_datetime),
            format_datetime(now)
        ])?;
    Ok(updated == 1)
}

// ============================================================================
// Dead outbox events
// ============================================================================

/// Eligibility rules for replaying dead outbox events of one org.
#[derive(Debug, Clone)]
pub struct DeadOutboxFilter {
    pub org_id: String,
    pub kinds: Vec<EventKind>,
    /// Only events created at or before this instant.
    pub created_before: DateTime<Utc>,
    /// Only events with fewer attempts than this.
    pub attempt_ceiling: u32,
    pub limit: u32,
}

/// Lease eligible dead events for replay, oldest first.
///
/// Claimed rows move to `pending` under the lease, so the outcome is
/// recorded like any other delivery. Rows on a skip hold are not eligible.
pub fn claim_dead_outbox_events(
    conn: &Connection,
    filter: &DeadOutboxFilter,
    lease: &ClaimLease,
) -> DatabaseResult<Vec<OutboxEvent>> {
    if filter.kinds.is_empty() || filter.limit == 0 {
        return Ok(Vec::new());
    }
    let kinds = serde_json::to_string(&filter.kinds)?;
    conn.prepare_cached(
        "UPDATE outbox_events
         SET status = 'pending', claim_token = ?1, claimed_until = ?2, updated_at = ?3
         WHERE event_id IN (
             SELECT event_id FROM outbox_events
             WHERE org_id = ?4
               AND status = 'dead'
               AND kind IN (SELECT value FROM json_each(?5))
               AND created_at <= ?6
               AND attempts < ?7
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?3)
             ORDER BY created_at, rowid
             LIMIT ?8
         )",
    )?
    .execute(params![
        lease.token,
        format_datetime(lease.until),
        format_datetime(lease.now),
        filter.org_id,
        kinds,
        format_datetime(filter.created_before),
        filter.attempt_ceiling,
        filter.limit,
    ])?;
    outbox_events_with_token(conn, &lease.token)
}

/// Failed replay: back to dead with one more attempt on record.
pub fn record_outbox_replay_failure(
    conn: &Connection,
    event_id: &str,
    claim_token: &str,
    error: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE outbox_events
             SET status = 'dead', attempts = attempts + 1, last_error = ?3, updated_at = ?4,
                 claim_token = NULL, claimed_until = NULL
             WHERE event_id = ?1 AND claim_token = ?2 AND status = 'pending'",
        )?
        .execute(params![event_id, claim_token, error, format_datetime(now)])?;
    Ok(updated == 1)
}

/// Return a replay claim to dead without counting an attempt.
pub fn release_outbox_replay_claim(
    conn: &Connection,
    event_id: &str,
    claim_token: &str,
    error: Option<&str>,
    hold_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE outbox_events
             SET status = 'dead', claim_token = NULL, claimed_until = NULL,
                 last_error = COALESCE(?3, last_error),
                 next_attempt_at = COALESCE(?4, next_attempt_at), updated_at = ?5
             WHERE event_id = ?1 AND claim_token = ?2 AND status = 'pending'",
        )?
        .execute(params![
            event_id,
            claim_token,
            error,
            hold_until.map(format_datetime),
            format_datetime(now)
        ])?;
    Ok(updated == 1)
}

/// Operator requeue: dead → pending, attempts kept, any skip hold cleared.
pub fn requeue_dead_outbox_event(
    conn: &Connection,
    org_id: &str,
    event_id: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let now = format_datetime(now);
    let updated = conn
        .prepare_cached(
            "UPDATE outbox_events
             SET status = 'pending', next_attempt_at = NULL, updated_at = ?3
             WHERE org_id = ?1 AND event_id = ?2 AND status = 'dead'",
        )?
        .execute(params![org_id, event_id, now])?;
    Ok(updated == 1)
}

pub fn count_outbox_by_status(
    conn: &Connection,
    org_id: Option<&str>,
) -> DatabaseResult<StatusCounts> {
    let mut stmt = conn.prepare_cached(
        "SELECT status, COUNT(*) FROM outbox_events
         WHERE (?1 IS NULL OR org_id = ?1)
         GROUP BY status",
    )?;
    let rows = stmt
        .query_map([org_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    tally(rows)
}

pub(super) fn tally(rows: Vec<(String, i64)>) -> DatabaseResult<StatusCounts> {
    let mut counts = StatusCounts::default();
    for (status, n) in rows {
        let n = n.max(0) as u64;
        match status.parse::<DeliveryStatus>()? {
            DeliveryStatus::Pending => counts.pending = n,
            DeliveryStatus::Sent => counts.sent = n,
            DeliveryStatus::Dead => counts.dead = n,
        }
    }
    Ok(counts)
}
