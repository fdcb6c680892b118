//! Session record queries

use crate::error::{Result, StorageError};
use crate::types::{AgentRole, SessionRecord};
use rusqlite::{params, Connection, OptionalExtension, Row};

const SESSION_COLUMNS: &str = "id, name, provider, provider_session_id, cwd, workspace_id, role, \
                               mode_id, model, parent_session_id, created_at";

/// Insert or replace a session record
pub fn upsert_session(conn: &Connection, record: &SessionRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO sessions (id, name, provider, provider_session_id, cwd, workspace_id, role,
                              mode_id, model, parent_session_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            provider = excluded.provider,
            provider_session_id = excluded.provider_session_id,
            cwd = excluded.cwd,
            workspace_id = excluded.workspace_id,
            role = excluded.role,
            mode_id = excluded.mode_id,
            model = excluded.model,
            parent_session_id = excluded.parent_session_id
        "#,
        params![
            record.id,
            record.name,
            record.provider,
            record.provider_session_id,
            record.cwd,
            record.workspace_id,
            record.role.as_str(),
            record.mode_id,
            record.model,
            record.parent_session_id,
            record.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn rename_session(conn: &Connection, session_id: &str, name: &str) -> Result<()> {
    let updated = conn.execute(
        "UPDATE sessions SET name = ? WHERE id = ?",
        params![name, session_id],
    )?;
    if updated == 0 {
        return Err(StorageError::NotFound(format!("session {}", session_id)).into());
    }
    Ok(())
}

pub fn get_session(conn: &Connection, session_id: &str) -> Result<Option<SessionRecord>> {
    let sql = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
    let record = conn
        .query_row(&sql, params![session_id], row_to_session)
        .optional()?;
    Ok(record)
}

/// Newest first, optionally scoped to one workspace
pub fn list_sessions(conn: &Connection, workspace_id: Option<&str>) -> Result<Vec<SessionRecord>> {
    let records = match workspace_id {
        Some(workspace) => {
            let sql = format!(
                "SELECT {} FROM sessions WHERE workspace_id = ? ORDER BY created_at DESC",
                SESSION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![workspace], row_to_session)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
        None => {
            let sql = format!("SELECT {} FROM sessions ORDER BY created_at DESC", SESSION_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_session)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
    };
    Ok(records)
}

pub fn delete_session(conn: &Connection, session_id: &str) -> Result<()> {
    conn.execute("DELETE FROM sessions WHERE id = ?", params![session_id])?;
    Ok(())
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let role: String = row.get(6)?;
    let created_at: String = row.get(10)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        provider: row.get(2)?,
        provider_session_id: row.get(3)?,
        cwd: row.get(4)?,
        workspace_id: row.get(5)?,
        role: role.parse().unwrap_or(AgentRole::Plain),
        mode_id: row.get(7)?,
        model: row.get(8)?,
        parent_session_id: row.get(9)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&chrono::Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    10,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
    })
}
