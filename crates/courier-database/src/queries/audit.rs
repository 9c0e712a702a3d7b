use super::{format_datetime, parse_datetime};
use crate::{AuditEntry, DatabaseResult, NewAuditEntry};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

// ============================================================================
// Audit log
// ============================================================================

fn parse_snapshot(idx: usize, s: Option<String>) -> rusqlite::Result<Option<serde_json::Value>> {
    s.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn map_audit_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        org_id: row.get(1)?,
        actor: row.get(2)?,
        action: row.get(3)?,
        resource_type: row.get(4)?,
        resource_id: row.get(5)?,
        outcome: row.get(6)?,
        before_json: parse_snapshot(7, row.get(7)?)?,
        after_json: parse_snapshot(8, row.get(8)?)?,
        created_at: parse_datetime(9, row.get(9)?)?,
    })
}

pub fn insert_audit_entry(
    conn: &Connection,
    entry: &NewAuditEntry,
    now: DateTime<Utc>,
) -> DatabaseResult<i64> {
    let before = entry.before_json.as_ref().map(serde_json::to_string).transpose()?;
    let after = entry.after_json.as_ref().map(serde_json::to_string).transpose()?;
    conn.prepare_cached(
        "INSERT INTO audit_log
            (org_id, actor, action, resource_type, resource_id, outcome, before_json, after_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?
    .execute(params![
        entry.org_id,
        entry.actor,
        entry.action,
        entry.resource_type,
        entry.resource_id,
        entry.outcome,
        before,
        after,
        format_datetime(now),
    ])?;
    Ok(conn.last_insert_rowid())
}

/// Audit entries for an org, oldest first, optionally narrowed to one action.
pub fn list_audit_entries(
    conn: &Connection,
    org_id: &str,
    action: Option<&str>,
) -> DatabaseResult<Vec<AuditEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, org_id, actor, action, resource_type, resource_id, outcome,
                before_json, after_json, created_at
         FROM audit_log
         WHERE org_id = ?1 AND (?2 IS NULL OR action = ?2)
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![org_id, action], map_audit_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
