//! Database migrations

use crate::error::Result;
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::{debug, info};

/// Applied in order; names are recorded in the `migrations` table
const MIGRATIONS: &[(&str, &str)] = &[
    ("001_sessions", MIGRATION_001_SESSIONS),
    ("002_session_parent_index", MIGRATION_002_SESSION_PARENT_INDEX),
];

/// Bring the schema up to date. Each pending migration runs in its own
/// transaction together with its bookkeeping row.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );",
    )?;

    let applied = applied_migrations(conn)?;
    let pending: Vec<_> = MIGRATIONS
        .iter()
        .filter(|(name, _)| !applied.contains(*name))
        .collect();
    if pending.is_empty() {
        debug!("Session schema up to date");
        return Ok(());
    }

    for (name, sql) in pending {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute("INSERT INTO migrations (name) VALUES (?1)", [name])?;
        tx.commit()?;
        info!("Applied migration {}", name);
    }
    Ok(())
}

fn applied_migrations(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM migrations")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(names)
}

const MIGRATION_001_SESSIONS: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT,
    provider TEXT NOT NULL,
    provider_session_id TEXT,
    cwd TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'PLAIN',
    mode_id TEXT,
    model TEXT,
    parent_session_id TEXT,
    created_at DATETIME NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_workspace ON sessions(workspace_id, created_at DESC);
"#;

const MIGRATION_002_SESSION_PARENT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let applied: i32 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
    }
}
