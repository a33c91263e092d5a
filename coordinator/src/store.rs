//! SQLite-backed session store: durable tasks, messages, agents, and locks
//!
//! One database file per coordination run. The connection is shared behind a
//! mutex; every agent holds an `Arc<SessionDb>` handle and nothing else, so
//! any agent can crash and restart without corrupting another agent's state.
//!
//! # Database Schema
//!
//! 1. **tasks** - work items with status, assignee, dependency list, result
//! 2. **tasks_archive** - terminal tasks copied here at session end
//! 3. **messages** - point-to-point and broadcast mail between agents
//! 4. **agents** - agent registry with heartbeats (ephemeral, per run)
//! 5. **locks** - named-resource locks for external shared resources
//! 6. **schema_version** - schema version for migrations

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use coordinator_sdk::{
    CoordinationError, RunId, TaskRecord, TaskSnapshot, TaskSpec, TaskStatus,
};

use crate::resolver;

/// Shared handle to the session database
pub struct SessionDb {
    conn: Mutex<Connection>,
}

impl SessionDb {
    /// Open (or create) a session database at the specified path
    pub fn open(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open session db at {}", path.display()))?;

        // Enable WAL mode for better concurrent access
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Create an in-memory session database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Initialize database schema with all tables and indexes
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                description TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                assigned_to TEXT,
                dependencies TEXT NOT NULL DEFAULT '[]',
                result TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS tasks_archive (
                task_id INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                assigned_to TEXT,
                dependencies TEXT NOT NULL,
                result TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_agent TEXT NOT NULL,
                to_agent TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                read_status INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_messages_unread
                ON messages(to_agent, read_status, message_id);

            CREATE TABLE IF NOT EXISTS agents (
                agent_id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                last_heartbeat INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS locks (
                resource_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }
}

/// Current unix time in milliseconds (heartbeats, lock timestamps)
pub(crate) fn now_ms() -> i64 {
    Local::now().timestamp_millis()
}

fn parse_task_row(row: &Row) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get("status")?;
    let dependencies_json: String = row.get("dependencies")?;
    let result_json: Option<String> = row.get("result")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(TaskRecord {
        task_id: row.get("task_id")?,
        description: row.get("description")?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        assigned_to: row.get("assigned_to")?,
        dependencies: serde_json::from_str(&dependencies_json).unwrap_or_default(),
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Local> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Local))
        .unwrap_or_else(|_| Local::now())
}

/// Durable task table with claim/complete/fail semantics
///
/// All mutations run under the shared connection mutex, so a claim's
/// eligibility check and its status flip happen in one critical section:
/// exactly one concurrent claimer wins any given task.
pub struct TaskStore {
    db: std::sync::Arc<SessionDb>,
}

impl TaskStore {
    pub fn new(db: std::sync::Arc<SessionDb>) -> Self {
        Self { db }
    }

    /// Create a single task whose dependencies are existing task ids
    ///
    /// Fails with `InvalidDependency` if any referenced task does not exist.
    pub fn create_task(&self, description: &str, dependencies: &[i64]) -> Result<i64> {
        let conn = self.db.conn();

        for dep in dependencies {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT task_id FROM tasks WHERE task_id = ?1",
                    params![dep],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(CoordinationError::InvalidDependency {
                    reason: format!("dependency {} does not exist", dep),
                }
                .into());
            }
        }

        let now = Local::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tasks (description, status, dependencies, created_at, updated_at)
             VALUES (?1, 'pending', ?2, ?3, ?3)",
            params![description, serde_json::to_string(dependencies)?, now],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Create a whole task graph in one transaction (all-or-nothing)
    ///
    /// Dependencies in each spec are zero-based indices into the batch.
    /// The graph is validated (in-range, backward-only references, acyclic)
    /// before any row is written; a malformed graph leaves the store
    /// untouched. Returns the assigned task ids in batch order.
    pub fn create_tasks(&self, specs: &[TaskSpec]) -> Result<Vec<i64>> {
        resolver::validate_graph(specs)?;

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let now = Local::now().to_rfc3339();

        let mut ids: Vec<i64> = Vec::with_capacity(specs.len());
        for spec in specs {
            // Translate batch indices to the ids assigned so far; validation
            // guarantees every index points at an earlier batch entry.
            let dep_ids: Vec<i64> = spec
                .dependencies
                .iter()
                .map(|&idx| ids[idx as usize])
                .collect();

            tx.execute(
                "INSERT INTO tasks (description, status, dependencies, created_at, updated_at)
                 VALUES (?1, 'pending', ?2, ?3, ?3)",
                params![&spec.description, serde_json::to_string(&dep_ids)?, now],
            )?;
            ids.push(tx.last_insert_rowid());
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Claim the first eligible task for `agent_id`
    ///
    /// Scans pending tasks in creation order and atomically flips the first
    /// one whose dependencies are all complete to running. Tasks depending
    /// on a failed task (directly or transitively) are cascaded to failed
    /// as part of the same scan, so they can never be claimed. Returns
    /// `None` when no task is currently eligible (wait, or done).
    pub fn claim_task(&self, agent_id: &str) -> Result<Option<TaskRecord>> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let snapshot = snapshot_tx(&tx)?;

        // Cascade failures first so a dependent of a failed task is settled
        // before eligibility is decided.
        let cascaded = resolver::cascade_failures(&snapshot);
        if !cascaded.is_empty() {
            let now = Local::now().to_rfc3339();
            for (task_id, failed_dep) in &cascaded {
                // Record which dependency doomed the task so a cascaded
                // branch can be traced back to its root failure.
                let payload = serde_json::json!({
                    "error_kind": "dependency_failed",
                    "error": format!("dependency {} failed", failed_dep),
                    "failed_dependency": failed_dep,
                })
                .to_string();
                tx.execute(
                    "UPDATE tasks SET status = 'failed', result = ?1, updated_at = ?2
                     WHERE task_id = ?3 AND status = 'pending'",
                    params![payload, now, task_id],
                )?;
            }
        }

        let snapshot = if cascaded.is_empty() {
            snapshot
        } else {
            snapshot_tx(&tx)?
        };

        for task_id in resolver::eligible_tasks(&snapshot) {
            let now = Local::now().to_rfc3339();
            // Status guard keeps this a compare-and-swap even if the scan
            // above went stale.
            let changed = tx.execute(
                "UPDATE tasks SET status = 'running', assigned_to = ?1, updated_at = ?2
                 WHERE task_id = ?3 AND status = 'pending'",
                params![agent_id, now, task_id],
            )?;
            if changed == 1 {
                let task = tx.query_row(
                    "SELECT * FROM tasks WHERE task_id = ?1",
                    params![task_id],
                    parse_task_row,
                )?;
                tx.commit()?;
                return Ok(Some(task));
            }
        }

        tx.commit()?;
        Ok(None)
    }

    /// Mark a running task complete, storing the executor's result
    pub fn complete_task(
        &self,
        task_id: i64,
        agent_id: &str,
        result: &serde_json::Value,
    ) -> Result<()> {
        self.finish_task(task_id, agent_id, TaskStatus::Complete, result)
    }

    /// Mark a running task failed, storing the error payload
    pub fn fail_task(&self, task_id: i64, agent_id: &str, error: &serde_json::Value) -> Result<()> {
        self.finish_task(task_id, agent_id, TaskStatus::Failed, error)
    }

    fn finish_task(
        &self,
        task_id: i64,
        agent_id: &str,
        status: TaskStatus,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.db.conn();

        let current: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT status, assigned_to FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (current_status, assigned_to) = match current {
            Some(pair) => pair,
            None => {
                return Err(CoordinationError::InvalidTransition {
                    task_id,
                    reason: "task does not exist".to_string(),
                }
                .into());
            }
        };

        if current_status != "running" {
            return Err(CoordinationError::InvalidTransition {
                task_id,
                reason: format!("expected running, found {}", current_status),
            }
            .into());
        }
        if assigned_to.as_deref() != Some(agent_id) {
            return Err(CoordinationError::InvalidTransition {
                task_id,
                reason: format!(
                    "owned by {}, not {}",
                    assigned_to.unwrap_or_else(|| "nobody".to_string()),
                    agent_id
                ),
            }
            .into());
        }

        conn.execute(
            "UPDATE tasks SET status = ?1, result = ?2, updated_at = ?3 WHERE task_id = ?4",
            params![
                status.as_str(),
                serde_json::to_string(payload)?,
                Local::now().to_rfc3339(),
                task_id
            ],
        )?;

        Ok(())
    }

    /// Reset a running task back to pending, clearing its assignee
    ///
    /// Used by the supervisor to reclaim tasks from crashed workers and by
    /// workers returning an unexecuted claim on graceful shutdown. A no-op
    /// for tasks that are not running.
    pub fn reclaim_task(&self, task_id: i64) -> Result<bool> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'pending', assigned_to = NULL, updated_at = ?1
             WHERE task_id = ?2 AND status = 'running'",
            params![Local::now().to_rfc3339(), task_id],
        )?;
        Ok(changed == 1)
    }

    /// True iff no task is pending or running
    pub fn all_done(&self) -> Result<bool> {
        let conn = self.db.conn();
        let outstanding: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status IN ('pending', 'running')",
            [],
            |row| row.get(0),
        )?;
        Ok(outstanding == 0)
    }

    /// Read-only consistent view of the full task graph, in creation order
    pub fn snapshot(&self) -> Result<TaskSnapshot> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY task_id")?;
        let tasks = stmt
            .query_map([], parse_task_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(TaskSnapshot { tasks })
    }

    /// Tasks currently running, as (task_id, assigned_to) pairs
    pub fn running_tasks(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, assigned_to FROM tasks WHERE status = 'running' ORDER BY task_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let assigned: Option<String> = row.get(1)?;
                Ok((row.get(0)?, assigned.unwrap_or_default()))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Results of a task's dependencies, in dependency-list order
    ///
    /// Only meaningful for a claimed task: eligibility guarantees every
    /// dependency is complete with a stored result.
    pub fn dependency_results(&self, task: &TaskRecord) -> Result<Vec<serde_json::Value>> {
        let conn = self.db.conn();
        let mut results = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            let result_json: Option<String> = conn.query_row(
                "SELECT result FROM tasks WHERE task_id = ?1",
                params![dep],
                |row| row.get(0),
            )?;
            let value = result_json
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null);
            results.push(value);
        }
        Ok(results)
    }

    /// Copy every task into the archive table under the given run id
    ///
    /// Tasks are never deleted mid-run; this runs once at session end so a
    /// later `inspect` still sees the full history.
    pub fn archive_session(&self, run_id: RunId) -> Result<usize> {
        let conn = self.db.conn();
        let archived = conn.execute(
            "INSERT INTO tasks_archive
                (task_id, run_id, description, status, assigned_to,
                 dependencies, result, created_at, updated_at, archived_at)
             SELECT task_id, ?1, description, status, assigned_to,
                 dependencies, result, created_at, updated_at, ?2
             FROM tasks",
            params![run_id.to_string(), Local::now().to_rfc3339()],
        )?;
        Ok(archived)
    }

    /// Number of archived rows (for inspection and tests)
    pub fn archived_count(&self) -> Result<usize> {
        let conn = self.db.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM tasks_archive", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn snapshot_tx(tx: &rusqlite::Transaction<'_>) -> Result<TaskSnapshot> {
    let mut stmt = tx.prepare("SELECT * FROM tasks ORDER BY task_id")?;
    let tasks = stmt
        .query_map([], parse_task_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(TaskSnapshot { tasks })
}
