use crate::DatabaseResult;
use rusqlite::Connection;

// ============================================================================
// Dead-letter depth
// ============================================================================

/// Dead rows for one org across both queues.
pub fn count_dead_events(conn: &Connection, org_id: &str) -> DatabaseResult<u64> {
    let count: i64 = conn.prepare_cached(
        "SELECT
            (SELECT COUNT(*) FROM outbox_events WHERE org_id = ?1 AND status = 'dead')
          + (SELECT COUNT(*) FROM export_events WHERE org_id = ?1 AND status = 'dead')",
    )?
    .query_row([org_id], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// Orgs that currently have at least one dead row, sorted.
pub fn list_orgs_with_dead_events(conn: &Connection) -> DatabaseResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT org_id FROM outbox_events WHERE status = 'dead'
         UNION
         SELECT org_id FROM export_events WHERE status = 'dead'
         ORDER BY 1",
    )?;
    let orgs = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(orgs)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::conn;
    use super::*;

    #[test]
    fn test_depth_and_org_listing() {
        let conn = conn();
        conn.execute_batch(
            "INSERT INTO outbox_events (event_id, org_id, kind, payload, dedupe_key, status, attempts, created_at, updated_at)
             VALUES ('e1', 'org-b', 'webhook', '{}', 'k1', 'dead', 5, '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z'),
                    ('e2', 'org-a', 'email', '{}', 'k2', 'pending', 0, '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z');
             INSERT INTO export_events (export_id, org_id, mode, target_url, target_url_host, payload, dedupe_key, status, attempts, created_at, updated_at)
             VALUES ('x1', 'org-b', 'webhook', 'https://a.example.com', 'a.example.com', '{}', 'k1', 'dead', 5, '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z'),
                    ('x2', 'org-c', 'crm', 'https://b.example.com', 'b.example.com', '{}', 'k1', 'dead', 5, '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z');",
        )
        .unwrap();

        assert_eq!(count_dead_events(&conn, "org-b").unwrap(), 2);
        assert_eq!(count_dead_events(&conn, "org-a").unwrap(), 0);
        assert_eq!(
            list_orgs_with_dead_events(&conn).unwrap(),
            vec!["org-b".to_string(), "org-c".to_string()]
        );
    }
}
