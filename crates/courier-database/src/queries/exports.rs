use super::{
    format_datetime, outbox::tally, parse_column, parse_datetime, parse_json, parse_opt_datetime,
    ClaimLease,
};
use crate::{DatabaseResult, DeliveryStatus, ExportEvent, NewExportEvent, StatusCounts};
use chrono::{DateTime, Utc};
use courier_core::ExportMode;
use rusqlite::{params, Connection, OptionalExtension, Row};

// ============================================================================
// Export events
// ============================================================================

const EXPORT_COLUMNS: &str = "export_id, org_id, mode, target_url, target_url_host, payload, \
     dedupe_key, status, attempts, last_error, last_error_code, replay_count, last_replayed_at, \
     last_replayed_by, claim_token, claimed_until, created_at, updated_at, sent_at, next_attempt_at";

fn map_export_row(row: &Row<'_>) -> rusqlite::Result<ExportEvent> {
    Ok(ExportEvent {
        export_id: row.get(0)?,
        org_id: row.get(1)?,
        mode: parse_column(2, row.get(2)?)?,
        target_url: row.get(3)?,
        target_url_host: row.get(4)?,
        payload: parse_json(5, row.get(5)?)?,
        dedupe_key: row.get(6)?,
        status: parse_column(7, row.get(7)?)?,
        attempts: row.get(8)?,
        last_error: row.get(9)?,
        last_error_code: row.get(10)?,
        replay_count: row.get(11)?,
        last_replayed_at: parse_opt_datetime(12, row.get(12)?)?,
        last_replayed_by: row.get(13)?,
        claim_token: row.get(14)?,
        claimed_until: parse_opt_datetime(15, row.get(15)?)?,
        created_at: parse_datetime(16, row.get(16)?)?,
        updated_at: parse_datetime(17, row.get(17)?)?,
        sent_at: parse_opt_datetime(18, row.get(18)?)?,
        next_attempt_at: parse_opt_datetime(19, row.get(19)?)?,
    })
}

/// Insert unless `(org_id, dedupe_key)` already exists. Returns whether a row was written.
pub fn insert_export_event(
    conn: &Connection,
    export: &NewExportEvent,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let payload = serde_json::to_string(&export.payload)?;
    let now = format_datetime(now);
    let inserted = conn
        .prepare_cached(
            "INSERT INTO export_events
                (export_id, org_id, mode, target_url, target_url_host, payload, dedupe_key,
                 status, attempts, replay_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, 0, ?8, ?8)
             ON CONFLICT (org_id, dedupe_key) DO NOTHING",
        )?
        .execute(params![
            export.export_id,
            export.org_id,
            export.mode.as_str(),
            export.target_url,
            export.target_url_host,
            payload,
            export.dedupe_key,
            now,
        ])?;
    Ok(inserted == 1)
}

pub fn get_export_event(conn: &Connection, export_id: &str) -> DatabaseResult<Option<ExportEvent>> {
    let sql = format!("SELECT {EXPORT_COLUMNS} FROM export_events WHERE export_id = ?1");
    Ok(conn
        .prepare_cached(&sql)?
        .query_row([export_id], map_export_row)
        .optional()?)
}

pub fn get_export_event_by_dedupe_key(
    conn: &Connection,
    org_id: &str,
    dedupe_key: &str,
) -> DatabaseResult<Option<ExportEvent>> {
    let sql =
        format!("SELECT {EXPORT_COLUMNS} FROM export_events WHERE org_id = ?1 AND dedupe_key = ?2");
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![org_id, dedupe_key], map_export_row)
        .optional()?)
}

fn export_events_with_token(conn: &Connection, token: &str) -> DatabaseResult<Vec<ExportEvent>> {
    let sql = format!(
        "SELECT {EXPORT_COLUMNS} FROM export_events WHERE claim_token = ?1 ORDER BY created_at, rowid"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map([token], map_export_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lease up to `limit` pending exports, oldest first, skipping live leases and retry holds.
pub fn claim_pending_export_events(
    conn: &Connection,
    limit: u32,
    lease: &ClaimLease,
) -> DatabaseResult<Vec<ExportEvent>> {
    conn.prepare_cached(
        "UPDATE export_events
         SET claim_token = ?1, claimed_until = ?2, updated_at = ?3
         WHERE export_id IN (
             SELECT export_id FROM export_events
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
    export_events_with_token(conn, &lease.token)
}

/// Push the lease on one claimed export out to `until`. Returns false once
/// another claimer has taken it over.
pub fn renew_export_claim(
    conn: &Connection,
    export_id: &str,
    claim_token: &str,
    until: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE export_events SET claimed_until = ?3
             WHERE export_id = ?1 AND claim_token = ?2 AND status = 'pending'",
        )?
        .execute(params![export_id, claim_token, format_datetime(until)])?;
    Ok(updated == 1)
}

/// Successful initial delivery. `replay_count` is untouched.
pub fn mark_export_sent(
    conn: &Connection,
    export_id: &str,
    claim_token: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE export_events
             SET status = 'sent', attempts = attempts + 1,
                 last_error = NULL, last_error_code = NULL,
                 sent_at = ?3, updated_at = ?3, claim_token = NULL, claimed_until = NULL
             WHERE export_id = ?1 AND claim_token = ?2 AND status = 'pending'",
        )?
        .execute(params![export_id, claim_token, format_datetime(now)])?;
    Ok(updated == 1)
}

/// Failed initial delivery; dead once `attempts` reaches `max_attempts`.
pub fn record_export_failure(
    conn: &Connection,
    export_id: &str,
    claim_token: &str,
    error: &str,
    error_code: &str,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> DatabaseResult<Option<DeliveryStatus>> {
    let status: Option<String> = conn
        .prepare_cached(
            "UPDATE export_events
             SET attempts = attempts + 1, last_error = ?3, last_error_code = ?4,
                 status = CASE WHEN attempts + 1 >= ?5 THEN 'dead' ELSE 'pending' END,
                 updated_at = ?6, claim_token = NULL, claimed_until = NULL
             WHERE export_id = ?1 AND claim_token = ?2 AND status = 'pending'
             RETURNING status",
        )?
        .query_row(
            params![
                export_id,
                claim_token,
                error,
                error_code,
                max_attempts,
                format_datetime(now)
            ],
            |row| row.get(0),
        )
        .optional()?;
    status.map(|s| s.parse()).transpose()
}

/// Drop a lease without counting an attempt or a replay. `hold_until`, when
/// given, keeps the export unclaimable until then.
pub fn release_export_claim(
    conn: &Connection,
    export_id: &str,
    claim_token: &str,
    error: Option<&str>,
    error_code: Option<&str>,
    hold_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE export_events
             SET claim_token = NULL, claimed_until = NULL,
                 last_error = COALESCE(?3, last_error),
                 last_error_code = COALESCE(?4, last_error_code),
                 next_attempt_at = COALESCE(?5, next_attempt_at),
                 updated_at = ?6
             WHERE export_id = ?1 AND claim_token = ?2",
        )?
        .execute(params![
            export_id,
            claim_token,
            error,
            error_code,
            hold_until.map(format_datetime),
            format_datetime(now)
        ])?;
    Ok(updated == 1)
}

// ============================================================================
// Dead export events
// ============================================================================

/// Eligibility rules for replaying dead exports of one org.
#[derive(Debug, Clone)]
pub struct DeadExportFilter {
    pub org_id: String,
    pub modes: Vec<ExportMode>,
    pub created_before: DateTime<Utc>,
    /// Only exports replayed fewer times than this.
    pub replay_limit: u32,
    /// Only exports never replayed, or last replayed at or before this instant.
    pub replayed_before: DateTime<Utc>,
    pub limit: u32,
}

/// Lease eligible dead exports for replay, oldest first. Claimed rows move
/// to `pending` under the lease.
pub fn claim_dead_export_events(
    conn: &Connection,
    filter: &DeadExportFilter,
    lease: &ClaimLease,
) -> DatabaseResult<Vec<ExportEvent>> {
    if filter.modes.is_empty() || filter.limit == 0 {
        return Ok(Vec::new());
    }
    let modes = serde_json::to_string(&filter.modes)?;
    conn.prepare_cached(
        "UPDATE export_events
         SET status = 'pending', claim_token = ?1, claimed_until = ?2, updated_at = ?3
         WHERE export_id IN (
             SELECT export_id FROM export_events
             WHERE org_id = ?4
               AND status = 'dead'
               AND mode IN (SELECT value FROM json_each(?5))
               AND created_at <= ?6
               AND replay_count < ?7
               AND (last_replayed_at IS NULL OR last_replayed_at <= ?8)
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?3)
             ORDER BY created_at, rowid
             LIMIT ?9
         )",
    )?
    .execute(params![
        lease.token,
        format_datetime(lease.until),
        format_datetime(lease.now),
        filter.org_id,
        modes,
        format_datetime(filter.created_before),
        filter.replay_limit,
        format_datetime(filter.replayed_before),
        filter.limit,
    ])?;
    export_events_with_token(conn, &lease.token)
}

/// Successful replay of a claimed export, error fields cleared.
pub fn mark_export_replay_sent(
    conn: &Connection,
    export_id: &str,
    claim_token: &str,
    replayed_by: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE export_events
             SET status = 'sent', attempts = attempts + 1, replay_count = replay_count + 1,
                 last_error = NULL, last_error_code = NULL,
                 last_replayed_at = ?4, last_replayed_by = ?3,
                 sent_at = ?4, updated_at = ?4, claim_token = NULL, claimed_until = NULL
             WHERE export_id = ?1 AND claim_token = ?2 AND status = 'pending'",
        )?
        .execute(params![
            export_id,
            claim_token,
            replayed_by,
            format_datetime(now)
        ])?;
    Ok(updated == 1)
}

/// Failed replay: back to dead, counters and error recorded.
pub fn record_export_replay_failure(
    conn: &Connection,
    export_id: &str,
    claim_token: &str,
    error: &str,
    error_code: &str,
    replayed_by: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE export_events
             SET status = 'dead', attempts = attempts + 1, replay_count = replay_count + 1,
                 last_error = ?3, last_error_code = ?4,
                 last_replayed_at = ?6, last_replayed_by = ?5,
                 updated_at = ?6, claim_token = NULL, claimed_until = NULL
             WHERE export_id = ?1 AND claim_token = ?2 AND status = 'pending'",
        )?
        .execute(params![
            export_id,
            claim_token,
            error,
            error_code,
            replayed_by,
            format_datetime(now)
        ])?;
    Ok(updated == 1)
}

/// Return a replay claim to dead without counting an attempt or a replay.
pub fn release_export_replay_claim(
    conn: &Connection,
    export_id: &str,
    claim_token: &str,
    error: Option<&str>,
    error_code: Option<&str>,
    hold_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let updated = conn
        .prepare_cached(
            "UPDATE export_events
             SET status = 'dead', claim_token = NULL, claimed_until = NULL,
                 last_error = COALESCE(?3, last_error),
                 last_error_code = COALESCE(?4, last_error_code),
                 next_attempt_at = COALESCE(?5, next_attempt_at),
                 updated_at = ?6
             WHERE export_id = ?1 AND claim_token = ?2 AND status = 'pending'",
        )?
        .execute(params![
            export_id,
            claim_token,
            error,
            error_code,
            hold_until.map(format_datetime),
            format_datetime(now)
        ])?;
    Ok(updated == 1)
}

pub fn count_exports_by_status(
    conn: &Connection,
    org_id: Option<&str>,
) -> DatabaseResult<StatusCounts> {
    let mut stmt = conn.prepare_cached(
        "SELECT status, COUNT(*) FROM export_events
         WHERE (?1 IS NULL OR org_id = ?1)
         GROUP BY status",
    )?;
    let rows = stmt
        .query_map([org_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    tally(rows)
}
