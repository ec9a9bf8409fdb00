//! Durable persistence for projects, active pipelines, and completed
//! pipeline history, backed by SQLite (WAL, foreign keys on).
//!
//! `StateStore` owns a single connection; `DbHandle` shares it between the
//! HTTP layer and the scheduler loops and moves each call off the async
//! runtime via `spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{
    HistoryStats, NewProject, Pipeline, PipelineHistory, PipelineState, PipelineUpdate, Project,
    ProjectUpdate,
};

pub struct StateStore {
    conn: Connection,
}

type StoreResult<T> = Result<T, StoreError>;

impl StateStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> StoreResult<()> {
        let _mode: String =
            self.conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                repo TEXT NOT NULL UNIQUE,
                base_branch TEXT NOT NULL DEFAULT 'main',
                kanban_board_id INTEGER,
                max_retries_ci INTEGER NOT NULL DEFAULT 3,
                max_retries_review INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS pipelines (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                ticket_id TEXT NOT NULL,
                ticket_title TEXT NOT NULL,
                ticket_body TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'queued',
                branch_name TEXT NOT NULL,
                pr_id INTEGER,
                pr_url TEXT,
                retry_count_ci INTEGER NOT NULL DEFAULT 0,
                retry_count_review INTEGER NOT NULL DEFAULT 0,
                feedback TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(project_id, ticket_id)
            );

            CREATE TABLE IF NOT EXISTS pipeline_history (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL UNIQUE,
                project_id TEXT NOT NULL,
                ticket_id TEXT NOT NULL,
                ticket_title TEXT NOT NULL,
                final_state TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                pr_id INTEGER,
                pr_url TEXT,
                total_retries_ci INTEGER NOT NULL DEFAULT 0,
                total_retries_review INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT NOT NULL DEFAULT (datetime('now')),
                duration_seconds INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_pipelines_project ON pipelines(project_id);
            CREATE INDEX IF NOT EXISTS idx_pipelines_state ON pipelines(project_id, state);
            CREATE INDEX IF NOT EXISTS idx_history_project ON pipeline_history(project_id);
            ",
        )?;
        Ok(())
    }

    // ── Project operations ────────────────────────────────────────────

    pub fn create_project(&self, new: &NewProject) -> StoreResult<Project> {
        let id = Uuid::new_v4().to_string();
        let result = self.conn.execute(
            "INSERT INTO projects (id, name, repo, base_branch, kanban_board_id, max_retries_ci, max_retries_review)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                new.name,
                new.repo,
                new.base_branch,
                new.kanban_board_id,
                new.max_retries_ci,
                new.max_retries_review,
            ],
        );
        match result {
            Ok(_) => self.get_project(&id),
            Err(e) if is_unique_violation(&e, "projects.repo") => Err(StoreError::ProjectExists {
                repo: new.repo.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_project(&self, id: &str) -> StoreResult<Project> {
        self.conn
            .query_row(
                &format!("{PROJECT_SELECT} WHERE id = ?1"),
                params![id],
                read_project,
            )
            .optional()?
            .ok_or_else(|| StoreError::ProjectNotFound { id: id.to_string() })
    }

    pub fn get_project_by_repo(&self, repo: &str) -> StoreResult<Project> {
        self.conn
            .query_row(
                &format!("{PROJECT_SELECT} WHERE repo = ?1"),
                params![repo],
                read_project,
            )
            .optional()?
            .ok_or_else(|| StoreError::ProjectNotFound {
                id: repo.to_string(),
            })
    }

    pub fn list_projects(&self) -> StoreResult<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{PROJECT_SELECT} ORDER BY name"))?;
        let rows = stmt.query_map([], read_project)?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }

    pub fn update_project(&self, id: &str, update: &ProjectUpdate) -> StoreResult<Project> {
        let changed = self.conn.execute(
            "UPDATE projects SET
                name = COALESCE(?2, name),
                base_branch = COALESCE(?3, base_branch),
                kanban_board_id = COALESCE(?4, kanban_board_id),
                max_retries_ci = COALESCE(?5, max_retries_ci),
                max_retries_review = COALESCE(?6, max_retries_review),
                updated_at = datetime('now')
             WHERE id = ?1",
            params![
                id,
                update.name,
                update.base_branch,
                update.kanban_board_id,
                update.max_retries_ci,
                update.max_retries_review,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::ProjectNotFound { id: id.to_string() });
        }
        self.get_project(id)
    }

    /// Delete a project. Refused while any pipeline for it is still active;
    /// archived history rows are kept.
    pub fn delete_project(&self, id: &str) -> StoreResult<()> {
        self.get_project(id)?;
        let active: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pipelines
             WHERE project_id = ?1 AND state IN ('queued', 'coding', 'testing', 'review')",
            params![id],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Err(StoreError::ProjectHasActivePipelines { id: id.to_string() });
        }
        self.conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Pipeline operations ───────────────────────────────────────────

    pub fn create_pipeline(
        &self,
        project_id: &str,
        ticket_id: &str,
        ticket_title: &str,
        branch_name: &str,
        ticket_body: &str,
    ) -> StoreResult<Pipeline> {
        self.get_project(project_id)?;
        let id = Uuid::new_v4().to_string();
        let result = self.conn.execute(
            "INSERT INTO pipelines (id, project_id, ticket_id, ticket_title, ticket_body, branch_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, project_id, ticket_id, ticket_title, ticket_body, branch_name],
        );
        match result {
            Ok(_) => self.get_pipeline(&id),
            Err(e) if is_unique_violation(&e, "pipelines.project_id") => {
                Err(StoreError::PipelineExists {
                    project_id: project_id.to_string(),
                    ticket_id: ticket_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_pipeline(&self, id: &str) -> StoreResult<Pipeline> {
        let row = self
            .conn
            .query_row(
                &format!("{PIPELINE_SELECT} WHERE id = ?1"),
                params![id],
                read_pipeline_row,
            )
            .optional()?;
        match row {
            Some(r) => r.into_pipeline(),
            None => Err(StoreError::PipelineNotFound { id: id.to_string() }),
        }
    }

    pub fn get_pipeline_by_ticket(
        &self,
        project_id: &str,
        ticket_id: &str,
    ) -> StoreResult<Option<Pipeline>> {
        let row = self
            .conn
            .query_row(
                &format!("{PIPELINE_SELECT} WHERE project_id = ?1 AND ticket_id = ?2"),
                params![project_id, ticket_id],
                read_pipeline_row,
            )
            .optional()?;
        row.map(|r| r.into_pipeline()).transpose()
    }

    /// List active pipelines, most recent first, optionally filtered by
    /// project and/or state.
    pub fn list_pipelines(
        &self,
        project_id: Option<&str>,
        state: Option<PipelineState>,
    ) -> StoreResult<Vec<Pipeline>> {
        let mut stmt = self.conn.prepare(&format!(
            "{PIPELINE_SELECT}
             WHERE (?1 IS NULL OR project_id = ?1)
               AND (?2 IS NULL OR state = ?2)
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(
            params![project_id, state.map(|s| s.as_str())],
            read_pipeline_row,
        )?;
        let mut pipelines = Vec::new();
        for row in rows {
            pipelines.push(row?.into_pipeline()?);
        }
        Ok(pipelines)
    }

    /// Count pipelines for a project in the working set (coding, testing,
    /// review).
    pub fn count_working(&self, project_id: &str) -> StoreResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM pipelines
             WHERE project_id = ?1 AND state IN ('coding', 'testing', 'review')",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_queued(&self, project_id: &str) -> StoreResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM pipelines WHERE project_id = ?1 AND state = 'queued'",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Apply a partial update in one statement so concurrent readers never
    /// observe a half-written row. Always bumps `updated_at`.
    pub fn update_pipeline(&self, id: &str, update: &PipelineUpdate) -> StoreResult<Pipeline> {
        let set_feedback = update.feedback.is_some();
        let feedback = update.feedback.clone().flatten();
        let changed = self.conn.execute(
            "UPDATE pipelines SET
                state = COALESCE(?2, state),
                pr_id = COALESCE(?3, pr_id),
                pr_url = COALESCE(?4, pr_url),
                retry_count_ci = COALESCE(?5, retry_count_ci),
                retry_count_review = COALESCE(?6, retry_count_review),
                feedback = CASE WHEN ?7 THEN ?8 ELSE feedback END,
                updated_at = datetime('now')
             WHERE id = ?1",
            params![
                id,
                update.state.map(|s| s.as_str()),
                update.pr_id,
                update.pr_url,
                update.retry_count_ci,
                update.retry_count_review,
                set_feedback,
                feedback,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::PipelineNotFound { id: id.to_string() });
        }
        self.get_pipeline(id)
    }

    /// Hard-delete an active pipeline row. Returns false when the row is
    /// already gone, which a crash-recovery re-archive treats as done.
    pub fn delete_pipeline(&self, id: &str) -> StoreResult<bool> {
        let count = self
            .conn
            .execute("DELETE FROM pipelines WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    // ── History operations ────────────────────────────────────────────

    /// Copy a terminal pipeline into the history table. The history row is
    /// keyed by the original pipeline id, so saving the same pipeline twice
    /// returns the existing record instead of duplicating it.
    pub fn save_to_history(&self, pipeline: &Pipeline) -> StoreResult<PipelineHistory> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO pipeline_history
                (id, pipeline_id, project_id, ticket_id, ticket_title, final_state, branch_name,
                 pr_id, pr_url, total_retries_ci, total_retries_review, started_at, completed_at,
                 duration_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, datetime('now'),
                     CAST(MAX(0, ROUND((julianday('now') - julianday(?12)) * 86400.0)) AS INTEGER))
             ON CONFLICT(pipeline_id) DO NOTHING",
            params![
                id,
                pipeline.id,
                pipeline.project_id,
                pipeline.ticket_id,
                pipeline.ticket_title,
                pipeline.state.as_str(),
                pipeline.branch_name,
                pipeline.pr_id,
                pipeline.pr_url,
                pipeline.retry_count_ci,
                pipeline.retry_count_review,
                pipeline.created_at,
            ],
        )?;
        let row = self
            .conn
            .query_row(
                &format!("{HISTORY_SELECT} WHERE pipeline_id = ?1"),
                params![pipeline.id],
                read_history_row,
            )
            .optional()?;
        match row {
            Some(r) => r.into_history(),
            None => Err(StoreError::Internal(format!(
                "history row missing after save for pipeline {}",
                pipeline.id
            ))),
        }
    }

    /// List history records, most recently completed first.
    pub fn list_history(
        &self,
        project_id: Option<&str>,
        final_state: Option<PipelineState>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> StoreResult<Vec<PipelineHistory>> {
        let mut stmt = self.conn.prepare(&format!(
            "{HISTORY_SELECT}
             WHERE (?1 IS NULL OR project_id = ?1)
               AND (?2 IS NULL OR final_state = ?2)
             ORDER BY completed_at DESC, rowid DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![
                project_id,
                final_state.map(|s| s.as_str()),
                limit.unwrap_or(-1),
                offset.unwrap_or(0),
            ],
            read_history_row,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_history()?);
        }
        Ok(records)
    }

    /// Aggregate statistics over history. Empty sets yield zeros.
    pub fn history_stats(
        &self,
        project_id: Option<&str>,
        final_state: Option<PipelineState>,
    ) -> StoreResult<HistoryStats> {
        let stats = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN final_state = 'merged' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN final_state = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(AVG(duration_seconds), 0.0),
                    COALESCE(AVG(total_retries_ci), 0.0),
                    COALESCE(AVG(total_retries_review), 0.0)
             FROM pipeline_history
             WHERE (?1 IS NULL OR project_id = ?1)
               AND (?2 IS NULL OR final_state = ?2)",
            params![project_id, final_state.map(|s| s.as_str())],
            |row| {
                Ok(HistoryStats {
                    total_completed: row.get(0)?,
                    total_merged: row.get(1)?,
                    total_failed: row.get(2)?,
                    avg_duration_seconds: row.get(3)?,
                    avg_retries_ci: row.get(4)?,
                    avg_retries_review: row.get(5)?,
                })
            },
        )?;
        Ok(stats)
    }
}

// ── Shared SELECT fragments and row readers ───────────────────────────

const PROJECT_SELECT: &str = "SELECT id, name, repo, base_branch, kanban_board_id, max_retries_ci,
     max_retries_review, created_at, updated_at FROM projects";

const PIPELINE_SELECT: &str = "SELECT id, project_id, ticket_id, ticket_title, ticket_body, state,
     branch_name, pr_id, pr_url, retry_count_ci, retry_count_review, feedback, created_at,
     updated_at FROM pipelines";

const HISTORY_SELECT: &str = "SELECT id, pipeline_id, project_id, ticket_id, ticket_title,
     final_state, branch_name, pr_id, pr_url, total_retries_ci, total_retries_review, started_at,
     completed_at, duration_seconds FROM pipeline_history";

fn read_project(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        repo: row.get(2)?,
        base_branch: row.get(3)?,
        kanban_board_id: row.get(4)?,
        max_retries_ci: row.get(5)?,
        max_retries_review: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Intermediate row for pipelines, read before parsing the state string.
struct PipelineRow {
    id: String,
    project_id: String,
    ticket_id: String,
    ticket_title: String,
    ticket_body: String,
    state: String,
    branch_name: String,
    pr_id: Option<i64>,
    pr_url: Option<String>,
    retry_count_ci: u32,
    retry_count_review: u32,
    feedback: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_pipeline_row(row: &Row) -> rusqlite::Result<PipelineRow> {
    Ok(PipelineRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        ticket_id: row.get(2)?,
        ticket_title: row.get(3)?,
        ticket_body: row.get(4)?,
        state: row.get(5)?,
        branch_name: row.get(6)?,
        pr_id: row.get(7)?,
        pr_url: row.get(8)?,
        retry_count_ci: row.get(9)?,
        retry_count_review: row.get(10)?,
        feedback: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl PipelineRow {
    fn into_pipeline(self) -> StoreResult<Pipeline> {
        let state = PipelineState::from_str(&self.state).map_err(StoreError::Internal)?;
        Ok(Pipeline {
            id: self.id,
            project_id: self.project_id,
            ticket_id: self.ticket_id,
            ticket_title: self.ticket_title,
            ticket_body: self.ticket_body,
            state,
            branch_name: self.branch_name,
            pr_id: self.pr_id,
            pr_url: self.pr_url,
            retry_count_ci: self.retry_count_ci,
            retry_count_review: self.retry_count_review,
            feedback: self.feedback,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct HistoryRow {
    id: String,
    pipeline_id: String,
    project_id: String,
    ticket_id: String,
    ticket_title: String,
    final_state: String,
    branch_name: String,
    pr_id: Option<i64>,
    pr_url: Option<String>,
    total_retries_ci: u32,
    total_retries_review: u32,
    started_at: String,
    completed_at: String,
    duration_seconds: i64,
}

fn read_history_row(row: &Row) -> rusqlite::Result<HistoryRow> {
    Ok(HistoryRow {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        project_id: row.get(2)?,
        ticket_id: row.get(3)?,
        ticket_title: row.get(4)?,
        final_state: row.get(5)?,
        branch_name: row.get(6)?,
        pr_id: row.get(7)?,
        pr_url: row.get(8)?,
        total_retries_ci: row.get(9)?,
        total_retries_review: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
        duration_seconds: row.get(13)?,
    })
}

impl HistoryRow {
    fn into_history(self) -> StoreResult<PipelineHistory> {
        let final_state = PipelineState::from_str(&self.final_state).map_err(StoreError::Internal)?;
        Ok(PipelineHistory {
            id: self.id,
            pipeline_id: self.pipeline_id,
            project_id: self.project_id,
            ticket_id: self.ticket_id,
            ticket_title: self.ticket_title,
            final_state,
            branch_name: self.branch_name,
            pr_id: self.pr_id,
            pr_url: self.pr_url,
            total_retries_ci: self.total_retries_ci,
            total_retries_review: self.total_retries_review,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_seconds: self.duration_seconds,
        })
    }
}

fn is_unique_violation(err: &rusqlite::Error, column_prefix: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg)) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation && msg.contains(column_prefix)
        }
        _ => false,
    }
}

// ── DbHandle ──────────────────────────────────────────────────────────

/// Shared handle to the state store. Clones are cheap; each `call` runs the
/// closure on the blocking pool while holding the store lock, so writes are
/// serialized and a loop iteration reads its own writes.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<StateStore>>,
}

impl DbHandle {
    pub fn new(store: StateStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn call<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&StateStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let store = inner.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&store)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("store task failed: {e}")))?
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
