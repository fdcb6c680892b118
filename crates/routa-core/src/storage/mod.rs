//! SQLite-based persistence for session metadata
//!
//! The core only needs a narrow read/write contract, [`SessionStore`];
//! [`Storage`] implements it on a pooled SQLite database.

mod migrations;
mod queries;

pub use migrations::run_migrations;

use crate::error::{Error, Result, StorageError};
use crate::types::SessionRecord;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::{Path, PathBuf};
use tracing::info;

/// Database connection pool type
pub type DbPool = Pool<SqliteConnectionManager>;

/// Persistence collaborator for session records
#[cfg_attr(test, mockall::automock)]
pub trait SessionStore: Send + Sync {
    fn upsert_session_record(&self, record: &SessionRecord) -> Result<()>;

    fn rename_session(&self, session_id: &str, name: &str) -> Result<()>;

    fn get_session_record(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Newest first; all workspaces when `workspace_id` is `None`
    fn list_session_records(&self, workspace_id: Option<String>) -> Result<Vec<SessionRecord>>;

    fn delete_session_record(&self, session_id: &str) -> Result<()>;
}

/// Storage manager for database operations
pub struct Storage {
    pool: DbPool,
    db_path: PathBuf,
}

impl Storage {
    /// Create a new storage instance with a directory path
    pub fn new_with_path(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();

        std::fs::create_dir_all(data_dir).map_err(|e| {
            Error::Storage(StorageError::Database(format!(
                "Failed to create data directory: {}",
                e
            )))
        })?;

        let db_path = data_dir.join("routa.db");
        info!("Database path: {:?}", db_path);

        Self::from_path(db_path)
    }

    /// Create storage from a specific path
    pub fn from_path(db_path: PathBuf) -> Result<Self> {
        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| Error::Storage(StorageError::Pool(e.to_string())))?;

        let storage = Self { pool, db_path };
        storage.initialize()?;
        Ok(storage)
    }

    /// Create in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::Storage(StorageError::Pool(e.to_string())))?;

        let storage = Self {
            pool,
            db_path: PathBuf::from(":memory:"),
        };
        storage.initialize()?;
        Ok(storage)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.connection()?;
        run_migrations(&conn).map_err(|e| {
            Error::Storage(StorageError::MigrationFailed(e.to_string()))
        })?;
        info!("Database initialized successfully");
        Ok(())
    }

    /// Get a connection from the pool
    pub fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| Error::Storage(StorageError::Pool(e.to_string())))
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }
}

impl SessionStore for Storage {
    fn upsert_session_record(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.connection()?;
        queries::upsert_session(&conn, record)
    }

    fn rename_session(&self, session_id: &str, name: &str) -> Result<()> {
        let conn = self.connection()?;
        queries::rename_session(&conn, session_id, name)
    }

    fn get_session_record(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.connection()?;
        queries::get_session(&conn, session_id)
    }

    fn list_session_records(&self, workspace_id: Option<String>) -> Result<Vec<SessionRecord>> {
        let conn = self.connection()?;
        queries::list_sessions(&conn, workspace_id.as_deref())
    }

    fn delete_session_record(&self, session_id: &str) -> Result<()> {
        let conn = self.connection()?;
        queries::delete_session(&conn, session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentRole;

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            name: None,
            provider: "openai".to_string(),
            provider_session_id: None,
            cwd: "/repo".to_string(),
            workspace_id: "default".to_string(),
            role: AgentRole::Coordinator,
            mode_id: None,
            model: Some("gpt-4o-mini".to_string()),
            parent_session_id: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_in_memory_storage() {
        let storage = Storage::in_memory().unwrap();
        storage.upsert_session_record(&record("s1")).unwrap();
        let stored = storage.get_session_record("s1").unwrap().unwrap();
        assert_eq!(stored.role, AgentRole::Coordinator);
        assert_eq!(stored.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::new_with_path(dir.path()).unwrap();
            storage.upsert_session_record(&record("persisted")).unwrap();
        }
        let reopened = Storage::new_with_path(dir.path()).unwrap();
        assert!(reopened.db_path().ends_with("routa.db"));
        assert_eq!(reopened.list_session_records(None).unwrap().len(), 1);
    }

    #[test]
    fn test_store_round_trip_through_pool() {
        let storage = Storage::in_memory().unwrap();
        storage.upsert_session_record(&record("s1")).unwrap();
        storage.upsert_session_record(&record("s2")).unwrap();

        storage.rename_session("s1", "Planner").unwrap();
        assert_eq!(
            storage.get_session_record("s1").unwrap().unwrap().name.as_deref(),
            Some("Planner")
        );

        storage.delete_session_record("s2").unwrap();
        assert!(storage.get_session_record("s2").unwrap().is_none());
        assert_eq!(storage.list_session_records(None).unwrap().len(), 1);
    }
}
