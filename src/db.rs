//! SQLite persistence for tasks, events, and checkpoints.
//!
//! Three stores share one connection:
//! - `tasks` — keyed task records with their per-phase state JSON
//! - `events` — append-only log, never updated or deleted
//! - `checkpoints` — one opaque JSON snapshot per task, replaced on save
//! - `task_branches` — flat branch registrations, the legacy recovery source
//!
//! All access goes through [`DbHandle`], which runs closures on tokio's
//! blocking pool so synchronous SQLite I/O never ties up async workers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::model::task::{Task, TaskStatus};

/// Async-safe handle to the conductor database.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Synchronous access for startup, CLI one-shots, and tests. Must not be
    /// called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Db>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// In-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    repositories TEXT NOT NULL DEFAULT '[]',
                    phase_states TEXT NOT NULL DEFAULT '{}',
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    cost_usd REAL NOT NULL DEFAULT 0,
                    continuations TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'queued',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id TEXT NOT NULL,
                    task_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    agent TEXT NOT NULL DEFAULT '',
                    payload TEXT NOT NULL DEFAULT '{}',
                    metadata TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    task_id TEXT PRIMARY KEY,
                    snapshot TEXT NOT NULL,
                    saved_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS task_branches (
                    task_id TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    owner_id TEXT NOT NULL,
                    repository TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(task_id, branch)
                );

                CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id, seq);
                CREATE INDEX IF NOT EXISTS idx_branches_task ON task_branches(task_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tasks (id, title, description, priority, repositories,
                 phase_states, input_tokens, output_tokens, cost_usd, continuations,
                 status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    task.id,
                    task.title,
                    task.description,
                    task.priority.as_str(),
                    serde_json::to_string(&task.repositories)?,
                    serde_json::to_string(&task.phase_states)?,
                    task.total_usage.input_tokens as i64,
                    task.total_usage.output_tokens as i64,
                    task.total_cost_usd,
                    serde_json::to_string(&task.continuations)?,
                    task.status.as_str(),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert task")?;
        Ok(())
    }

    pub fn update_task(&self, task: &Task) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET title = ?2, description = ?3, priority = ?4,
                 repositories = ?5, phase_states = ?6, input_tokens = ?7,
                 output_tokens = ?8, cost_usd = ?9, continuations = ?10,
                 status = ?11, updated_at = ?12
                 WHERE id = ?1",
                params![
                    task.id,
                    task.title,
                    task.description,
                    task.priority.as_str(),
                    serde_json::to_string(&task.repositories)?,
                    serde_json::to_string(&task.phase_states)?,
                    task.total_usage.input_tokens as i64,
                    task.total_usage.output_tokens as i64,
                    task.total_cost_usd,
                    serde_json::to_string(&task.continuations)?,
                    task.status.as_str(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to update task")?;
        anyhow::ensure!(changed == 1, "Task {} not found for update", task.id);
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, description, priority, repositories, phase_states,
                 input_tokens, output_tokens, cost_usd, continuations, status,
                 created_at, updated_at
                 FROM tasks WHERE id = ?1",
            )
            .context("Failed to prepare get_task")?;
        let mut rows = stmt
            .query_map(params![id], Self::row_to_task)
            .context("Failed to query task")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read task row")??)),
            None => Ok(None),
        }
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, description, priority, repositories, phase_states,
                 input_tokens, output_tokens, cost_usd, continuations, status,
                 created_at, updated_at
                 FROM tasks ORDER BY created_at",
            )
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map([], Self::row_to_task)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")??);
        }
        Ok(tasks)
    }

    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    chrono::Utc::now().to_rfc3339()
                ],
            )
            .context("Failed to update task status")?;
        anyhow::ensure!(changed == 1, "Task {} not found for status update", id);
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Task>> {
        // Column decoding that can fail on JSON is deferred into the inner
        // Result so rusqlite's row mapping stays infallible.
        let repositories: String = row.get(4)?;
        let phase_states: String = row.get(5)?;
        let continuations: String = row.get(9)?;
        let priority: String = row.get(3)?;
        let status: String = row.get(10)?;
        let created_at: String = row.get(11)?;
        let updated_at: String = row.get(12)?;
        let id: String = row.get(0)?;
        let title: String = row.get(1)?;
        let description: String = row.get(2)?;
        let input_tokens: i64 = row.get(6)?;
        let output_tokens: i64 = row.get(7)?;
        let cost_usd: f64 = row.get(8)?;

        Ok((|| {
            Ok(Task {
                id,
                title,
                description,
                priority: priority
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?,
                repositories: serde_json::from_str(&repositories)?,
                phase_states: serde_json::from_str(&phase_states)?,
                total_usage: crate::model::task::Usage {
                    input_tokens: input_tokens as u64,
                    output_tokens: output_tokens as u64,
                },
                total_cost_usd: cost_usd,
                continuations: serde_json::from_str(&continuations)?,
                status: status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)?
                    .with_timezone(&chrono::Utc),
                updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)?
                    .with_timezone(&chrono::Utc),
            })
        })())
    }

    // ── Events ────────────────────────────────────────────────────────

    pub fn append_event(
        &self,
        event_id: &str,
        task_id: &str,
        kind: &str,
        agent: &str,
        payload: &str,
        metadata: Option<&str>,
        created_at: &str,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO events (event_id, task_id, kind, agent, payload, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![event_id, task_id, kind, agent, payload, metadata, created_at],
            )
            .context("Failed to append event")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All events for a task in append order.
    pub fn events_for_task(&self, task_id: &str) -> Result<Vec<EventRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, event_id, kind, agent, payload, metadata, created_at
                 FROM events WHERE task_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare events_for_task")?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(EventRow {
                    seq: row.get(0)?,
                    event_id: row.get(1)?,
                    kind: row.get(2)?,
                    agent: row.get(3)?,
                    payload: row.get(4)?,
                    metadata: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?);
        }
        Ok(events)
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    pub fn save_checkpoint(&self, task_id: &str, snapshot: &str, saved_at: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO checkpoints (task_id, snapshot, saved_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(task_id) DO UPDATE SET snapshot = ?2, saved_at = ?3",
                params![task_id, snapshot, saved_at],
            )
            .context("Failed to save checkpoint")?;
        Ok(())
    }

    pub fn load_checkpoint(&self, task_id: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT snapshot FROM checkpoints WHERE task_id = ?1")
            .context("Failed to prepare load_checkpoint")?;
        let mut rows = stmt
            .query_map(params![task_id], |row| row.get::<_, String>(0))
            .context("Failed to query checkpoint")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read checkpoint row")?)),
            None => Ok(None),
        }
    }

    /// Remove the snapshot. Events are never touched here.
    pub fn clear_checkpoint(&self, task_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM checkpoints WHERE task_id = ?1", params![task_id])
            .context("Failed to clear checkpoint")?;
        Ok(())
    }

    // ── Branch registrations (legacy recovery source) ─────────────────

    pub fn upsert_branch(
        &self,
        task_id: &str,
        branch: &str,
        kind: &str,
        owner_id: &str,
        repository: &str,
        created_at: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO task_branches (task_id, branch, kind, owner_id, repository, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(task_id, branch) DO NOTHING",
                params![task_id, branch, kind, owner_id, repository, created_at],
            )
            .context("Failed to upsert branch")?;
        Ok(())
    }

    pub fn branches_for_task(&self, task_id: &str) -> Result<Vec<BranchRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT branch, kind, owner_id, repository, created_at
                 FROM task_branches WHERE task_id = ?1 ORDER BY branch",
            )
            .context("Failed to prepare branches_for_task")?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(BranchRow {
                    branch: row.get(0)?,
                    kind: row.get(1)?,
                    owner_id: row.get(2)?,
                    repository: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query branches")?;
        let mut branches = Vec::new();
        for row in rows {
            branches.push(row.context("Failed to read branch row")?);
        }
        Ok(branches)
    }
}

/// Raw event row, decoded by the event store.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub seq: i64,
    pub event_id: String,
    pub kind: String,
    pub agent: String,
    pub payload: String,
    pub metadata: Option<String>,
    pub created_at: String,
}

/// Raw branch registration row.
#[derive(Debug, Clone)]
pub struct BranchRow {
    pub branch: String,
    pub kind: String,
    pub owner_id: String,
    pub repository: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::Priority;

    #[test]
    fn test_task_insert_get_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        let mut task = Task::new("Add login", "desc", Priority::High, vec!["backend".into()]);
        task.add_continuation("also SSO");
        db.insert_task(&task).unwrap();

        let loaded = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Add login");
        assert_eq!(loaded.priority, Priority::High);
        assert_eq!(loaded.repositories, vec!["backend".to_string()]);
        assert_eq!(loaded.continuations.len(), 1);
        assert!(loaded.has_unprocessed_continuations());
    }

    #[test]
    fn test_task_update_persists_phase_states() {
        let db = Db::open_in_memory().unwrap();
        let mut task = Task::new("t", "d", Priority::Medium, vec![]);
        db.insert_task(&task).unwrap();

        task.set_phase_state(
            "planning",
            crate::model::task::PhaseState::InProgress {
                started_at: chrono::Utc::now(),
            },
        );
        db.update_task(&task).unwrap();

        let loaded = db.get_task(&task.id).unwrap().unwrap();
        assert!(matches!(
            loaded.phase_state("planning"),
            crate::model::task::PhaseState::InProgress { .. }
        ));
    }

    #[test]
    fn test_update_missing_task_errors() {
        let db = Db::open_in_memory().unwrap();
        let task = Task::new("t", "d", Priority::Medium, vec![]);
        assert!(db.update_task(&task).is_err());
    }

    #[test]
    fn test_events_append_in_order() {
        let db = Db::open_in_memory().unwrap();
        for i in 0..3 {
            db.append_event(
                &format!("ev-{i}"),
                "task-1",
                "phase_started",
                "planner",
                "{}",
                None,
                "2026-01-01T00:00:00Z",
            )
            .unwrap();
        }
        // A different task's events must not leak in.
        db.append_event("ev-x", "task-2", "phase_started", "", "{}", None, "2026-01-01T00:00:00Z")
            .unwrap();

        let events = db.events_for_task("task-1").unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(events[0].event_id, "ev-0");
        assert_eq!(events[2].event_id, "ev-2");
    }

    #[test]
    fn test_checkpoint_save_load_clear() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.load_checkpoint("task-1").unwrap().is_none());

        db.save_checkpoint("task-1", r#"{"v":1}"#, "2026-01-01T00:00:00Z").unwrap();
        db.save_checkpoint("task-1", r#"{"v":2}"#, "2026-01-01T00:01:00Z").unwrap();
        assert_eq!(db.load_checkpoint("task-1").unwrap().unwrap(), r#"{"v":2}"#);

        db.clear_checkpoint("task-1").unwrap();
        assert!(db.load_checkpoint("task-1").unwrap().is_none());
    }

    #[test]
    fn test_clear_checkpoint_leaves_events() {
        let db = Db::open_in_memory().unwrap();
        db.append_event("ev-1", "task-1", "epics_planned", "", "{}", None, "2026-01-01T00:00:00Z")
            .unwrap();
        db.save_checkpoint("task-1", "{}", "2026-01-01T00:00:00Z").unwrap();

        db.clear_checkpoint("task-1").unwrap();
        assert_eq!(db.events_for_task("task-1").unwrap().len(), 1);
    }

    #[test]
    fn test_branch_upsert_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        for _ in 0..2 {
            db.upsert_branch("task-1", "conductor/epic-1", "epic", "epic-1", "backend", "2026-01-01T00:00:00Z")
                .unwrap();
        }
        let branches = db.branches_for_task("task-1").unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].owner_id, "epic-1");
    }

    #[tokio::test]
    async fn test_db_handle_call() {
        let handle = DbHandle::new(Db::open_in_memory().unwrap());
        let task = Task::new("t", "d", Priority::Medium, vec![]);
        let id = task.id.clone();
        handle.call(move |db| db.insert_task(&task)).await.unwrap();
        let loaded = handle.call(move |db| db.get_task(&id)).await.unwrap();
        assert!(loaded.is_some());
    }
}
