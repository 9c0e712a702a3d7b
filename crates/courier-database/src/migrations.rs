//! Database migrations.
//!
//! Migrations run in order and are tracked in the `migrations` table.
//! Timestamps are RFC 3339 UTC strings with microseconds so they compare
//! correctly as text.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 5;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_export_events(conn)?;
    }
    if current_version < 3 {
        migrate_v3_idempotency_records(conn)?;
    }
    if current_version < 4 {
        migrate_v4_audit_log(conn)?;
    }
    if current_version < 5 {
        migrate_v5_delivery_holds(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: outbox events with dedupe, monotonic attempts and guarded status transitions.
fn migrate_v1_outbox_events(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE outbox_events (
            event_id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('email', 'webhook')),
            payload TEXT NOT NULL,
            dedupe_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'sent', 'dead')),
            attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
            last_error TEXT,
            claim_token TEXT,
            claimed_until TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sent_at TEXT,
            UNIQUE (org_id, dedupe_key)
        );

        CREATE INDEX idx_outbox_events_status_created
            ON outbox_events(status, created_at);
        CREATE INDEX idx_outbox_events_org_status
            ON outbox_events(org_id, status, created_at);
        CREATE INDEX idx_outbox_events_claim_token
            ON outbox_events(claim_token) WHERE claim_token IS NOT NULL;

        CREATE TRIGGER outbox_events_attempts_monotonic
        BEFORE UPDATE OF attempts ON outbox_events
        WHEN NEW.attempts < OLD.attempts
        BEGIN
            SELECT RAISE(ABORT, 'outbox_events.attempts must not decrease');
        END;

        CREATE TRIGGER outbox_events_status_transition
        BEFORE UPDATE OF status ON outbox_events
        WHEN NEW.status <> OLD.status AND NOT (
            (OLD.status = 'pending' AND NEW.status IN ('sent', 'dead'))
            OR (OLD.status = 'dead' AND NEW.status IN ('pending', 'sent'))
        )
        BEGIN
            SELECT RAISE(ABORT, 'illegal outbox_events status transition');
        END;

        CREATE TRIGGER outbox_events_retained
        BEFORE DELETE ON outbox_events
        BEGIN
            SELECT RAISE(ABORT, 'outbox_events rows are retained for audit');
        END;
        ",
    )?;

    record_migration(conn, 1, "outbox_events")?;
    Ok(())
}

/// V2: export events, the webhook/CRM specialization with replay bookkeeping.
fn migrate_v2_export_events(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE export_events (
            export_id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            mode TEXT NOT NULL CHECK (mode IN ('webhook', 'crm')),
            target_url TEXT NOT NULL,
            target_url_host TEXT NOT NULL,
            payload TEXT NOT NULL,
            dedupe_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'sent', 'dead')),
            attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
            last_error TEXT,
            last_error_code TEXT,
            replay_count INTEGER NOT NULL DEFAULT 0 CHECK (replay_count >= 0),
            last_replayed_at TEXT,
            last_replayed_by TEXT,
            claim_token TEXT,
            claimed_until TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sent_at TEXT,
            UNIQUE (org_id, dedupe_key)
        );

        CREATE INDEX idx_export_events_status_created
            ON export_events(status, created_at);
        CREATE INDEX idx_export_events_org_status
            ON export_events(org_id, status, created_at);

        CREATE TRIGGER export_events_counters_monotonic
        BEFORE UPDATE OF attempts, replay_count ON export_events
        WHEN NEW.attempts < OLD.attempts OR NEW.replay_count < OLD.replay_count
        BEGIN
            SELECT RAISE(ABORT, 'export_events counters must not decrease');
        END;

        CREATE TRIGGER export_events_status_transition
        BEFORE UPDATE OF status ON export_events
        WHEN NEW.status <> OLD.status AND NOT (
            (OLD.status = 'pending' AND NEW.status IN ('sent', 'dead'))
            OR (OLD.status = 'dead' AND NEW.status IN ('pending', 'sent'))
        )
        BEGIN
            SELECT RAISE(ABORT, 'illegal export_events status transition');
        END;

        CREATE TRIGGER export_events_retained
        BEFORE DELETE ON export_events
        BEGIN
            SELECT RAISE(ABORT, 'export_events rows are retained for audit');
        END;
        ",
    )?;

    record_migration(conn, 2, "export_events")?;
    Ok(())
}

/// V3: HTTP idempotency ledger.
fn migrate_v3_idempotency_records(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE idempotency_records (
            org_id TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            request_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'completed')),
            claim_token TEXT NOT NULL,
            response_status INTEGER,
            response_body BLOB,
            response_content_type TEXT,
            claimed_at TEXT NOT NULL,
            lease_expires_at TEXT NOT NULL,
            completed_at TEXT,
            PRIMARY KEY (org_id, idempotency_key, endpoint)
        );

        CREATE INDEX idx_idempotency_records_pending_lease
            ON idempotency_records(lease_expires_at) WHERE status = 'pending';
        CREATE INDEX idx_idempotency_records_completed_at
            ON idempotency_records(completed_at) WHERE status = 'completed';

        CREATE TRIGGER idempotency_records_hash_immutable
        BEFORE UPDATE OF request_hash ON idempotency_records
        WHEN NEW.request_hash <> OLD.request_hash
        BEGIN
            SELECT RAISE(ABORT, 'idempotency_records.request_hash is immutable');
        END;

        CREATE TRIGGER idempotency_records_completed_readonly
        BEFORE UPDATE ON idempotency_records
        WHEN OLD.status = 'completed'
        BEGIN
            SELECT RAISE(ABORT, 'completed idempotency records are read-only');
        END;
        ",
    )?;

    record_migration(conn, 3, "idempotency_records")?;
    Ok(())
}

/// V4: audit log for replay and operator actions.
fn migrate_v4_audit_log(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            outcome TEXT NOT NULL,
            before_json TEXT,
            after_json TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_audit_log_org_action
            ON audit_log(org_id, action, created_at);
        ",
    )?;

    record_migration(conn, 4, "audit_log")?;
    Ok(())
}

/// V5: per-row retry holds, and replay goes through pending.
///
/// `next_attempt_at` keeps a skipped row out of claims until it passes.
/// Status triggers drop `dead -> sent`: a replay claim moves the row to
/// `pending` first, so every send is recorded from `pending`.
fn migrate_v5_delivery_holds(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        ALTER TABLE outbox_events ADD COLUMN next_attempt_at TEXT;
        ALTER TABLE export_events ADD COLUMN next_attempt_at TEXT;

        DROP TRIGGER outbox_events_status_transition;
        CREATE TRIGGER outbox_events_status_transition
        BEFORE UPDATE OF status ON outbox_events
        WHEN NEW.status <> OLD.status AND NOT (
            (OLD.status = 'pending' AND NEW.status IN ('sent', 'dead'))
            OR (OLD.status = 'dead' AND NEW.status = 'pending')
        )
        BEGIN
            SELECT RAISE(ABORT, 'illegal outbox_events status transition');
        END;

        DROP TRIGGER export_events_status_transition;
        CREATE TRIGGER export_events_status_transition
        BEFORE UPDATE OF status ON export_events
        WHEN NEW.status <> OLD.status AND NOT (
            (OLD.status = 'pending' AND NEW.status IN ('sent', 'dead'))
            OR (OLD.status = 'dead' AND NEW.status = 'pending')
        )
        BEGIN
            SELECT RAISE(ABORT, 'illegal export_events status transition');
        END;
        ",
    )?;

    record_migration(conn, 5, "delivery_holds")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in [
            "outbox_events",
            "export_events",
            "idempotency_records",
            "audit_log",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_VERSION as i64);
    }

    fn insert_outbox_row(conn: &Connection, status: &str, attempts: i64) {
        conn.execute(
            "INSERT INTO outbox_events
                (event_id, org_id, kind, payload, dedupe_key, status, attempts, created_at, updated_at)
             VALUES ('e1', 'org', 'webhook', '{}', 'k1', ?1, ?2, '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
            rusqlite::params![status, attempts],
        )
        .unwrap();
    }

    #[test]
    fn test_outbox_attempts_cannot_decrease() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        insert_outbox_row(&conn, "pending", 3);

        let result = conn.execute("UPDATE outbox_events SET attempts = 2", []);
        assert!(result.is_err());
        conn.execute("UPDATE outbox_events SET attempts = 4", [])
            .unwrap();
    }

    #[test]
    fn test_outbox_sent_is_terminal() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        insert_outbox_row(&conn, "sent", 1);

        assert!(conn
            .execute("UPDATE outbox_events SET status = 'pending'", [])
            .is_err());
        assert!(conn
            .execute("UPDATE outbox_events SET status = 'dead'", [])
            .is_err());
    }

    #[test]
    fn test_dead_to_pending_is_allowed() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        insert_outbox_row(&conn, "dead", 5);

        conn.execute("UPDATE outbox_events SET status = 'pending'", [])
            .unwrap();
    }

    #[test]
    fn test_dead_to_sent_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        insert_outbox_row(&conn, "dead", 5);
        conn.execute(
            "INSERT INTO export_events
                (export_id, org_id, mode, target_url, target_url_host, payload, dedupe_key,
                 status, attempts, created_at, updated_at)
             VALUES ('x1', 'org', 'webhook', 'https://crm.example.com/in', 'crm.example.com', '{}',
                     'k1', 'dead', 5, '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();

        assert!(conn
            .execute("UPDATE outbox_events SET status = 'sent'", [])
            .is_err());
        assert!(conn
            .execute("UPDATE export_events SET status = 'sent'", [])
            .is_err());

        conn.execute("UPDATE export_events SET status = 'pending'", [])
            .unwrap();
        conn.execute("UPDATE export_events SET status = 'sent'", [])
            .unwrap();
    }

    #[test]
    fn test_outbox_rows_cannot_be_deleted() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        insert_outbox_row(&conn, "sent", 1);

        assert!(conn.execute("DELETE FROM outbox_events", []).is_err());
    }

    #[test]
    fn test_completed_idempotency_record_is_read_only() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO idempotency_records
                (org_id, idempotency_key, endpoint, request_hash, status, claim_token,
                 response_status, response_body, claimed_at, lease_expires_at, completed_at)
             VALUES ('org', 'key', 'POST /x', 'h1', 'completed', 't', 201, x'7B7D',
                     '2026-01-01T00:00:00.000000Z', '2026-01-01T00:10:00.000000Z',
                     '2026-01-01T00:00:01.000000Z')",
            [],
        )
        .unwrap();

        assert!(conn
            .execute("UPDATE idempotency_records SET response_status = 500", [])
            .is_err());
        assert!(conn
            .execute("UPDATE idempotency_records SET request_hash = 'h2'", [])
            .is_err());
    }
}
