use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use switchyard_types::{Run, RunPatch, RunStatus, RunStore, StoreError, StoreResult};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

const SELECT_RUN: &str = "SELECT id, project_id, workflow_id, status, state, context, error, created_at, updated_at
     FROM runs WHERE id = ?1";

/// Run store on a SQLite database.
///
/// State and context are stored as JSON text. Thread-safe via an internal
/// mutex around the connection.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRunStore").finish_non_exhaustive()
    }
}

impl SqliteRunStore {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(db_error)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(db_error)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_error)?)
    }

    fn with_connection(mut conn: Connection) -> StoreResult<Self> {
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn db_error(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Raw column values; decoded outside the rusqlite callback so decoding
/// errors can name the run.
struct RunRow {
    id: String,
    project_id: String,
    workflow_id: String,
    status: String,
    state: String,
    context: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            workflow_id: row.get(2)?,
            status: row.get(3)?,
            state: row.get(4)?,
            context: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn decode(self) -> StoreResult<Run> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let state = serde_json::from_str(&self.state)
            .map_err(|e| corrupt(format!("state: {e}")))?;
        let context = serde_json::from_str(&self.context)
            .map_err(|e| corrupt(format!("context: {e}")))?;
        let created_at = parse_time(&self.created_at).ok_or_else(|| corrupt("created_at".into()))?;
        let updated_at = parse_time(&self.updated_at).ok_or_else(|| corrupt("updated_at".into()))?;

        Ok(Run {
            id: self.id,
            project_id: self.project_id,
            workflow_id: self.workflow_id,
            status,
            state,
            context,
            error: self.error,
            created_at,
            updated_at,
        })
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn load(conn: &Connection, id: &str) -> StoreResult<Option<Run>> {
    conn.query_row(SELECT_RUN, params![id], RunRow::from_row)
        .optional()
        .map_err(db_error)?
        .map(RunRow::decode)
        .transpose()
}

impl RunStore for SqliteRunStore {
    fn create_run(&self, run: &Run) -> StoreResult<()> {
        let state = serde_json::to_string(&run.state)?;
        let context = serde_json::to_string(&run.context)?;
        let result = self.conn.lock().execute(
            "INSERT INTO runs (id, project_id, workflow_id, status, state, context, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id,
                run.project_id,
                run.workflow_id,
                run.status.as_str(),
                state,
                context,
                run.error,
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(format!(
                "run '{}' already exists",
                run.id
            ))),
            Err(e) => Err(db_error(e)),
        }
    }

    fn get_run(&self, id: &str) -> StoreResult<Option<Run>> {
        load(&self.conn.lock(), id)
    }

    fn update_run(&self, id: &str, patch: RunPatch) -> StoreResult<Run> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_error)?;

        let mut run = load(&tx, id)?.ok_or_else(|| StoreError::Missing(id.to_string()))?;
        patch.apply(&mut run, Utc::now());

        tx.execute(
            "UPDATE runs SET status = ?2, state = ?3, error = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                run.id,
                run.status.as_str(),
                serde_json::to_string(&run.state)?,
                run.error,
                run.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_error)?;
        tx.commit().map_err(db_error)?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use serde_json::json;
    use switchyard_types::{PendingKind, Usd};

    #[test]
    fn test_roundtrip() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let run = Run::new(testing::context(json!({"message": "hi"})));
        store.create_run(&run).unwrap();

        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Pending);
        assert_eq!(loaded.context, run.context);
        assert!(store.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn test_update_persists_state() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let mut run = Run::new(testing::context(json!({})));
        store.create_run(&run).unwrap();

        run.status = RunStatus::WaitingApproval;
        run.state
            .record_success("label", json!("billing"), 10, Usd::from_dollars(0.05));
        run.state.suspend(1, PendingKind::Approval);
        run.error = Some("note".into());
        store.update_run(&run.id, RunPatch::from_run(&run)).unwrap();

        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::WaitingApproval);
        assert_eq!(loaded.state, run.state);
        assert_eq!(loaded.error.as_deref(), Some("note"));
    }

    #[test]
    fn test_duplicate_conflicts() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let run = Run::new(testing::context(json!({})));
        store.create_run(&run).unwrap();
        assert!(matches!(store.create_run(&run), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_update_missing() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        assert!(matches!(
            store.update_run("nope", RunPatch::status(RunStatus::Running)),
            Err(StoreError::Missing(_))
        ));
    }

    #[test]
    fn test_corrupt_status_reported() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let run = Run::new(testing::context(json!({})));
        store.create_run(&run).unwrap();
        store
            .conn
            .lock()
            .execute("UPDATE runs SET status = 'BOGUS' WHERE id = ?1", params![run.id])
            .unwrap();
        assert!(matches!(
            store.get_run(&run.id),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_reopen_file_keeps_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");
        let run = Run::new(testing::context(json!({})));
        {
            let store = SqliteRunStore::open(&path).unwrap();
            store.create_run(&run).unwrap();
        }
        let store = SqliteRunStore::open(&path).unwrap();
        assert_eq!(store.get_run(&run.id).unwrap().unwrap().id, run.id);
    }
}
