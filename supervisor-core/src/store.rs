//! SQLite-backed state store.
//!
//! The single shared mutable resource between pulse invocations. Concurrency
//! contract: WAL journal mode, a 5-second busy timeout per connection, and
//! foreign keys enforced. Serialisation across pulses is primarily the pulse
//! lock; the busy timeout is the backup when that fails.
//!
//! Migrations are idempotent and forward-only: `CREATE TABLE IF NOT EXISTS`
//! plus column-guarded `ALTER TABLE ADD COLUMN`.

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use crate::task::{utc_now, Batch, BatchStatus, ReleaseType, StateLogEntry, Task, TaskState};

/// Busy timeout applied to every connection.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Filter for [`Store::list_tasks`]. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to these states (OR-combined). Empty = any state.
    pub statuses: Vec<TaskState>,
    /// Restrict to members of this batch (by name).
    pub batch: Option<String>,
    /// Restrict to tasks touched at or after this timestamp.
    pub updated_since: Option<String>,
}

impl TaskFilter {
    pub fn by_status(states: &[TaskState]) -> Self {
        Self {
            statuses: states.to_vec(),
            ..Self::default()
        }
    }
}

/// Handle on the supervisor database.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating and migrating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("store unavailable: cannot create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("store unavailable: cannot open {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        verify_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Run `f` inside a single transaction; rolls back on error.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────

    /// Insert a new queued task. Writes the initial state-log entry
    /// (`"" → queued`).
    pub fn insert_task(
        &self,
        id: &str,
        repo: &str,
        description: &str,
        model: &str,
        max_retries: u32,
    ) -> Result<Task> {
        let now = utc_now();
        self.with_transaction(|s| {
            s.conn
                .execute(
                    "INSERT INTO tasks (id, repo, description, status, model, retries, max_retries, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'queued', ?4, 0, ?5, ?6, ?6)",
                    params![id, repo, description, model, max_retries, now],
                )
                .with_context(|| format!("task {id} already exists or insert failed"))?;
            s.append_state_log(id, "", "queued", "created")?;
            Ok(())
        })?;
        self.find_task(id)?
            .ok_or_else(|| anyhow!("task {id} vanished after insert"))
    }

    pub fn find_task(&self, id: &str) -> Result<Option<Task>> {
        self.conn
            .query_row(
                &format!("SELECT {TASK_COLS} FROM tasks t WHERE t.id = ?1"),
                params![id],
                task_from_row,
            )
            .optional()
            .context("find_task")
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLS} FROM tasks t WHERE 1=1");
        let mut args: Vec<String> = Vec::new();

        if !filter.statuses.is_empty() {
            let marks = vec!["?"; filter.statuses.len()].join(",");
            sql.push_str(&format!(" AND t.status IN ({marks})"));
            for s in &filter.statuses {
                args.push(s.as_str().to_string());
            }
        }
        if let Some(batch) = &filter.batch {
            sql.push_str(
                " AND t.id IN (SELECT bt.task_id FROM batch_tasks bt
                               JOIN batches b ON b.id = bt.batch_id WHERE b.name = ?)",
            );
            args.push(batch.clone());
        }
        if let Some(since) = &filter.updated_since {
            sql.push_str(" AND t.updated_at >= ?");
            args.push(since.clone());
        }
        sql.push_str(" ORDER BY t.id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Write the full mutable field set of a task back to the store.
    /// Used by the state machine inside its transaction — not by callers
    /// directly (status changes must go through `machine::transition`).
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE tasks SET repo=?2, description=?3, status=?4, model=?5, retries=?6,
                 max_retries=?7, session_id=?8, worktree=?9, branch=?10, log_file=?11,
                 error=?12, pr_url=?13, started_at=?14, completed_at=?15, updated_at=?16
             WHERE id=?1",
            params![
                task.id,
                task.repo,
                task.description,
                task.status.as_str(),
                task.model,
                task.retries,
                task.max_retries,
                task.session_id,
                task.worktree,
                task.branch,
                task.log_file,
                task.error,
                task.pr_url,
                task.started_at,
                task.completed_at,
                task.updated_at,
            ],
        )?;
        if n != 1 {
            bail!("task {} not found on update", task.id);
        }
        Ok(())
    }

    // ── Batches ───────────────────────────────────────────────────────────────

    pub fn insert_batch(
        &self,
        name: &str,
        concurrency: u32,
        max_load_factor: u32,
        release_on_complete: bool,
        release_type: ReleaseType,
    ) -> Result<Batch> {
        let now = utc_now();
        self.conn
            .execute(
                "INSERT INTO batches (name, concurrency, max_load_factor, status, release_on_complete, release_type, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?6)",
                params![name, concurrency, max_load_factor, release_on_complete, release_type.as_str(), now],
            )
            .with_context(|| format!("batch {name} already exists or insert failed"))?;
        self.find_batch(name)?
            .ok_or_else(|| anyhow!("batch {name} vanished after insert"))
    }

    /// Find a batch by name, or by numeric id when `name_or_id` parses.
    pub fn find_batch(&self, name_or_id: &str) -> Result<Option<Batch>> {
        if let Ok(id) = name_or_id.parse::<i64>() {
            if let Some(b) = self
                .conn
                .query_row(
                    &format!("SELECT {BATCH_COLS} FROM batches b WHERE b.id = ?1"),
                    params![id],
                    batch_from_row,
                )
                .optional()?
            {
                return Ok(Some(b));
            }
        }
        self.conn
            .query_row(
                &format!("SELECT {BATCH_COLS} FROM batches b WHERE b.name = ?1"),
                params![name_or_id],
                batch_from_row,
            )
            .optional()
            .context("find_batch")
    }

    pub fn list_batches(&self, status: Option<BatchStatus>) -> Result<Vec<Batch>> {
        let mut sql = format!("SELECT {BATCH_COLS} FROM batches b");
        if status.is_some() {
            sql.push_str(" WHERE b.status = ?1");
        }
        sql.push_str(" ORDER BY b.id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match status {
            Some(st) => stmt.query_map(params![st.as_str()], batch_from_row)?,
            None => stmt.query_map([], batch_from_row)?,
        };
        let mut batches = Vec::new();
        for row in rows {
            batches.push(row?);
        }
        Ok(batches)
    }

    pub fn set_batch_status(&self, batch_id: i64, status: BatchStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE batches SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![batch_id, status.as_str(), utc_now()],
        )?;
        Ok(())
    }

    /// Enrol a task at the end of a batch.
    pub fn add_task_to_batch(&self, batch_id: i64, task_id: &str) -> Result<()> {
        let position: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM batch_tasks WHERE batch_id = ?1",
            params![batch_id],
            |r| r.get(0),
        )?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO batch_tasks (batch_id, task_id, position) VALUES (?1, ?2, ?3)",
                params![batch_id, task_id, position],
            )
            .context("add_task_to_batch")?;
        Ok(())
    }

    /// Member tasks of a batch in position order.
    pub fn batch_tasks(&self, batch_id: i64) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM tasks t
             JOIN batch_tasks bt ON bt.task_id = t.id
             WHERE bt.batch_id = ?1 ORDER BY bt.position"
        ))?;
        let rows = stmt.query_map(params![batch_id], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Batches this task belongs to.
    pub fn batches_for_task(&self, task_id: &str) -> Result<Vec<Batch>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BATCH_COLS} FROM batches b
             JOIN batch_tasks bt ON bt.batch_id = b.id
             WHERE bt.task_id = ?1 ORDER BY b.id"
        ))?;
        let rows = stmt.query_map(params![task_id], batch_from_row)?;
        let mut batches = Vec::new();
        for row in rows {
            batches.push(row?);
        }
        Ok(batches)
    }

    /// Count of tasks currently occupying a worker slot (`dispatched` or
    /// `running`), globally or within one batch.
    pub fn active_count(&self, batch_id: Option<i64>) -> Result<u32> {
        let n: u32 = match batch_id {
            Some(id) => self.conn.query_row(
                "SELECT COUNT(*) FROM tasks t
                 JOIN batch_tasks bt ON bt.task_id = t.id
                 WHERE bt.batch_id = ?1 AND t.status IN ('dispatched','running')",
                params![id],
                |r| r.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE status IN ('dispatched','running')",
                [],
                |r| r.get(0),
            )?,
        };
        Ok(n)
    }

    // ── State log ─────────────────────────────────────────────────────────────

    pub fn append_state_log(&self, task_id: &str, from: &str, to: &str, reason: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO state_log (task_id, from_state, to_state, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, from, to, reason, utc_now()],
        )?;
        Ok(())
    }

    /// Audit trail for one task, oldest first.
    pub fn state_log(&self, task_id: &str) -> Result<Vec<StateLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, from_state, to_state, reason, created_at
             FROM state_log WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(StateLogEntry {
                task_id: row.get(0)?,
                from_state: row.get(1)?,
                to_state: row.get(2)?,
                reason: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // ── Admin ─────────────────────────────────────────────────────────────────

    /// Run arbitrary SQL for the `db` verb. SELECTs print rows; other
    /// statements report the affected-row count.
    pub fn exec_sql(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        let trimmed = sql.trim_start().to_lowercase();
        if trimmed.starts_with("select") || trimmed.starts_with("pragma") {
            let mut stmt = self.conn.prepare(sql)?;
            let ncols = stmt.column_count();
            let mut out = Vec::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut cols = Vec::with_capacity(ncols);
                for i in 0..ncols {
                    let v: rusqlite::types::Value = row.get(i)?;
                    cols.push(match v {
                        rusqlite::types::Value::Null => "NULL".to_string(),
                        rusqlite::types::Value::Integer(n) => n.to_string(),
                        rusqlite::types::Value::Real(f) => f.to_string(),
                        rusqlite::types::Value::Text(s) => s,
                        rusqlite::types::Value::Blob(b) => format!("<{} bytes>", b.len()),
                    });
                }
                out.push(cols);
            }
            Ok(out)
        } else {
            let n = self.conn.execute(sql, [])?;
            Ok(vec![vec![format!("{n} row(s) affected")]])
        }
    }
}

const TASK_COLS: &str = "t.id, t.repo, t.description, t.status, t.model, t.retries, t.max_retries,
     t.session_id, t.worktree, t.branch, t.log_file, t.error, t.pr_url,
     t.created_at, t.started_at, t.completed_at, t.updated_at";

const BATCH_COLS: &str = "b.id, b.name, b.concurrency, b.max_load_factor, b.status,
     b.release_on_complete, b.release_type, b.created_at, b.updated_at";

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let status_str: String = row.get(3)?;
    let status = TaskState::parse(&status_str).unwrap_or(TaskState::Failed);
    Ok(Task {
        id: row.get(0)?,
        repo: row.get(1)?,
        description: row.get(2)?,
        status,
        model: row.get(4)?,
        retries: row.get(5)?,
        max_retries: row.get(6)?,
        session_id: row.get(7)?,
        worktree: row.get(8)?,
        branch: row.get(9)?,
        log_file: row.get(10)?,
        error: row.get(11)?,
        pr_url: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        completed_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn batch_from_row(row: &Row) -> rusqlite::Result<Batch> {
    let status_str: String = row.get(4)?;
    let release_str: String = row.get(6)?;
    Ok(Batch {
        id: row.get(0)?,
        name: row.get(1)?,
        concurrency: row.get(2)?,
        max_load_factor: row.get(3)?,
        status: BatchStatus::parse(&status_str).unwrap_or(BatchStatus::Active),
        release_on_complete: row.get(5)?,
        release_type: ReleaseType::parse(&release_str).unwrap_or(ReleaseType::Patch),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Idempotent, forward-only schema setup.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
             id           TEXT PRIMARY KEY,
             repo         TEXT NOT NULL,
             description  TEXT NOT NULL DEFAULT '',
             status       TEXT NOT NULL,
             model        TEXT NOT NULL DEFAULT 'coding',
             retries      INTEGER NOT NULL DEFAULT 0,
             max_retries  INTEGER NOT NULL DEFAULT 3,
             session_id   TEXT,
             worktree     TEXT,
             branch       TEXT,
             log_file     TEXT,
             error        TEXT,
             pr_url       TEXT,
             created_at   TEXT NOT NULL,
             started_at   TEXT,
             completed_at TEXT,
             updated_at   TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS batches (
             id                  INTEGER PRIMARY KEY AUTOINCREMENT,
             name                TEXT NOT NULL UNIQUE,
             concurrency         INTEGER NOT NULL DEFAULT 4,
             max_load_factor     INTEGER NOT NULL DEFAULT 2,
             status              TEXT NOT NULL DEFAULT 'active',
             release_on_complete INTEGER NOT NULL DEFAULT 0,
             release_type        TEXT NOT NULL DEFAULT 'patch',
             created_at          TEXT NOT NULL,
             updated_at          TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS batch_tasks (
             batch_id INTEGER NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
             task_id  TEXT NOT NULL REFERENCES tasks(id),
             position INTEGER NOT NULL DEFAULT 0,
             PRIMARY KEY (batch_id, task_id)
         );
         CREATE TABLE IF NOT EXISTS state_log (
             id         INTEGER PRIMARY KEY AUTOINCREMENT,
             task_id    TEXT NOT NULL,
             from_state TEXT NOT NULL,
             to_state   TEXT NOT NULL,
             reason     TEXT NOT NULL,
             created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
         CREATE INDEX IF NOT EXISTS idx_state_log_task ON state_log(task_id);",
    )?;

    // Forward-only column additions land here, guarded by has_column().
    // (None yet beyond the v1 schema.)
    Ok(())
}

/// Post-migration sanity check: every column the code reads must exist.
fn verify_schema(conn: &Connection) -> Result<()> {
    for (table, col) in [
        ("tasks", "pr_url"),
        ("tasks", "session_id"),
        ("batches", "release_type"),
        ("batch_tasks", "position"),
        ("state_log", "reason"),
    ] {
        if !has_column(conn, table, col)? {
            bail!("schema mismatch: {table}.{col} missing after migration");
        }
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, col: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == col {
            return Ok(true);
        }
    }
    Ok(false)
}
