//! SQLite store
//!
//! ## Schema
//!
//! - Version 1: `tasks`, `subtasks`, reclaim index
//!
//! Timestamps are stored as RFC 3339 with fixed microsecond precision and a
//! `Z` suffix so that string comparison orders them chronologically.
//! `status_doc` and `result` are JSON columns.

use super::{ReclaimCandidate, ReclaimFilter, TaskStore};
use crate::state::Status;
use crate::task::{
    ExecutionTarget, ExecutorHandle, Subtask, SubtaskId, SubtaskResult, SubtaskRole, Task, TaskId,
};
use chrono::{DateTime, SecondsFormat, Utc};
use relay_foundation::{Error, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 1;

const TASK_COLUMNS: &str = "id, user_id, status, progress, status_doc, error_message, \
     created_at, updated_at, completed_at, deleted, version";

const SUBTASK_COLUMNS: &str = "id, task_id, role, message_id, prompt, target_kind, \
     executor_name, executor_namespace, status, progress, result, error_message, \
     created_at, updated_at, completed_at, executor_deleted_at, deleted, version";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        // WAL for concurrent readers alongside the single writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        info!(path = %path.display(), "Opened task database");
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(storage_err("Failed to get schema version"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                status_doc TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS subtasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('user', 'assistant')),
                message_id INTEGER NOT NULL,
                prompt TEXT NOT NULL DEFAULT '',
                target_kind TEXT NOT NULL CHECK(target_kind IN ('local', 'remote')),
                executor_name TEXT NOT NULL DEFAULT '',
                executor_namespace TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                result TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT,
                executor_deleted_at TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (task_id) REFERENCES tasks(id)
            );

            CREATE INDEX IF NOT EXISTS idx_subtasks_task
                ON subtasks(task_id, message_id);
            CREATE INDEX IF NOT EXISTS idx_subtasks_reclaim
                ON subtasks(status, updated_at)
                WHERE executor_name != '' AND executor_deleted_at IS NULL;

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(storage_err("Failed to initialize schema"))?;

        debug!(version = CURRENT_SCHEMA_VERSION, "Task schema ready");
        Ok(())
    }
}

fn storage_err(context: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| Error::Storage(format!("{}: {}", context, e))
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Invalid timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn role_str(role: SubtaskRole) -> &'static str {
    match role {
        SubtaskRole::User => "user",
        SubtaskRole::Assistant => "assistant",
    }
}

fn target_columns(target: &ExecutionTarget) -> (&'static str, &str, &str) {
    match target {
        ExecutionTarget::Local => ("local", "", ""),
        ExecutionTarget::Remote {
            executor_name,
            executor_namespace,
        } => ("remote", executor_name.as_str(), executor_namespace.as_str()),
    }
}

// ============================================================================
// Row mapping
// ============================================================================

struct TaskRow {
    id: i64,
    user_id: i64,
    status: String,
    progress: i64,
    status_doc: String,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    deleted: bool,
    version: i64,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            status: row.get(2)?,
            progress: row.get(3)?,
            status_doc: row.get(4)?,
            error_message: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            completed_at: row.get(8)?,
            deleted: row.get(9)?,
            version: row.get(10)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            user_id: self.user_id,
            status: self.status.parse::<Status>()?,
            progress: self.progress.clamp(0, 100) as u8,
            status_doc: serde_json::from_str(&self.status_doc)?,
            error_message: self.error_message,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            deleted: self.deleted,
            version: self.version as u64,
        })
    }
}

struct SubtaskRow {
    id: i64,
    task_id: i64,
    role: String,
    message_id: i64,
    prompt: String,
    target_kind: String,
    executor_name: String,
    executor_namespace: String,
    status: String,
    progress: i64,
    result: String,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    executor_deleted_at: Option<String>,
    deleted: bool,
    version: i64,
}

impl SubtaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            role: row.get(2)?,
            message_id: row.get(3)?,
            prompt: row.get(4)?,
            target_kind: row.get(5)?,
            executor_name: row.get(6)?,
            executor_namespace: row.get(7)?,
            status: row.get(8)?,
            progress: row.get(9)?,
            result: row.get(10)?,
            error_message: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            completed_at: row.get(14)?,
            executor_deleted_at: row.get(15)?,
            deleted: row.get(16)?,
            version: row.get(17)?,
        })
    }

    fn into_subtask(self) -> Result<Subtask> {
        let role = match self.role.as_str() {
            "user" => SubtaskRole::User,
            "assistant" => SubtaskRole::Assistant,
            other => return Err(Error::Storage(format!("Unknown role '{}'", other))),
        };
        let target = match self.target_kind.as_str() {
            "remote" => ExecutionTarget::Remote {
                executor_name: self.executor_name,
                executor_namespace: self.executor_namespace,
            },
            _ => ExecutionTarget::Local,
        };
        let result: SubtaskResult = serde_json::from_str(&self.result)?;

        Ok(Subtask {
            id: SubtaskId(self.id),
            task_id: TaskId(self.task_id),
            role,
            message_id: self.message_id,
            prompt: self.prompt,
            target,
            status: self.status.parse::<Status>()?,
            progress: self.progress.clamp(0, 100) as u8,
            result,
            error_message: self.error_message,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            executor_deleted_at: parse_opt_ts(self.executor_deleted_at)?,
            deleted: self.deleted,
            version: self.version as u64,
        })
    }
}

fn load_task(conn: &Connection, id: TaskId) -> Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id.0],
        TaskRow::from_row,
    )
    .optional()
    .map_err(storage_err("Failed to load task"))?
    .map(TaskRow::into_task)
    .transpose()
}

fn load_subtask(conn: &Connection, id: SubtaskId) -> Result<Option<Subtask>> {
    conn.query_row(
        &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = ?1"),
        params![id.0],
        SubtaskRow::from_row,
    )
    .optional()
    .map_err(storage_err("Failed to load subtask"))?
    .map(SubtaskRow::into_subtask)
    .transpose()
}

fn version_mismatch(what: &str, id: i64, stored: Option<i64>, expected: u64) -> Error {
    match stored {
        Some(stored) => Error::Conflict(format!(
            "{} {} at version {}, write based on {}",
            what, id, stored, expected
        )),
        None => Error::NotFound(format!("{} {}", what, id)),
    }
}

// ============================================================================
// TaskStore
// ============================================================================

impl TaskStore for SqliteStore {
    fn insert_task(&self, mut task: Task) -> Result<Task> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (user_id, status, progress, status_doc, error_message, \
             created_at, updated_at, completed_at, deleted, version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)",
            params![
                task.user_id,
                task.status.as_str(),
                task.progress,
                serde_json::to_string(&task.status_doc)?,
                task.error_message,
                ts(task.created_at),
                ts(task.updated_at),
                task.completed_at.map(ts),
                task.deleted,
            ],
        )
        .map_err(storage_err("Failed to insert task"))?;

        task.id = TaskId(conn.last_insert_rowid());
        task.version = 1;
        Ok(task)
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let conn = self.lock()?;
        load_task(&conn, id)
    }

    fn update_task(&self, task: &Task) -> Result<Task> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET user_id = ?1, status = ?2, progress = ?3, status_doc = ?4, \
                 error_message = ?5, created_at = ?6, updated_at = ?7, completed_at = ?8, \
                 deleted = ?9, version = version + 1 \
                 WHERE id = ?10 AND version = ?11",
                params![
                    task.user_id,
                    task.status.as_str(),
                    task.progress,
                    serde_json::to_string(&task.status_doc)?,
                    task.error_message,
                    ts(task.created_at),
                    ts(task.updated_at),
                    task.completed_at.map(ts),
                    task.deleted,
                    task.id.0,
                    task.version as i64,
                ],
            )
            .map_err(storage_err("Failed to update task"))?;

        if changed == 0 {
            let stored: Option<i64> = conn
                .query_row(
                    "SELECT version FROM tasks WHERE id = ?1",
                    params![task.id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err("Failed to read task version"))?;
            return Err(version_mismatch("task", task.id.0, stored, task.version));
        }

        let mut stored = task.clone();
        stored.version += 1;
        Ok(stored)
    }

    fn insert_subtask(&self, mut subtask: Subtask) -> Result<Subtask> {
        let conn = self.lock()?;
        let (kind, name, namespace) = target_columns(&subtask.target);
        conn.execute(
            "INSERT INTO subtasks (task_id, role, message_id, prompt, target_kind, \
             executor_name, executor_namespace, status, progress, result, error_message, \
             created_at, updated_at, completed_at, executor_deleted_at, deleted, version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 1)",
            params![
                subtask.task_id.0,
                role_str(subtask.role),
                subtask.message_id,
                subtask.prompt,
                kind,
                name,
                namespace,
                subtask.status.as_str(),
                subtask.progress,
                serde_json::to_string(&subtask.result)?,
                subtask.error_message,
                ts(subtask.created_at),
                ts(subtask.updated_at),
                subtask.completed_at.map(ts),
                subtask.executor_deleted_at.map(ts),
                subtask.deleted,
            ],
        )
        .map_err(storage_err("Failed to insert subtask"))?;

        subtask.id = SubtaskId(conn.last_insert_rowid());
        subtask.version = 1;
        Ok(subtask)
    }

    fn get_subtask(&self, id: SubtaskId) -> Result<Option<Subtask>> {
        let conn = self.lock()?;
        load_subtask(&conn, id)
    }

    fn update_subtask(&self, subtask: &Subtask) -> Result<Subtask> {
        let conn = self.lock()?;
        let (kind, name, namespace) = target_columns(&subtask.target);
        let changed = conn
            .execute(
                "UPDATE subtasks SET task_id = ?1, role = ?2, message_id = ?3, prompt = ?4, \
                 target_kind = ?5, executor_name = ?6, executor_namespace = ?7, status = ?8, \
                 progress = ?9, result = ?10, error_message = ?11, created_at = ?12, \
                 updated_at = ?13, completed_at = ?14, executor_deleted_at = ?15, deleted = ?16, \
                 version = version + 1 \
                 WHERE id = ?17 AND version = ?18",
                params![
                    subtask.task_id.0,
                    role_str(subtask.role),
                    subtask.message_id,
                    subtask.prompt,
                    kind,
                    name,
                    namespace,
                    subtask.status.as_str(),
                    subtask.progress,
                    serde_json::to_string(&subtask.result)?,
                    subtask.error_message,
                    ts(subtask.created_at),
                    ts(subtask.updated_at),
                    subtask.completed_at.map(ts),
                    subtask.executor_deleted_at.map(ts),
                    subtask.deleted,
                    subtask.id.0,
                    subtask.version as i64,
                ],
            )
            .map_err(storage_err("Failed to update subtask"))?;

        if changed == 0 {
            let stored: Option<i64> = conn
                .query_row(
                    "SELECT version FROM subtasks WHERE id = ?1",
                    params![subtask.id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err("Failed to read subtask version"))?;
            return Err(version_mismatch(
                "subtask",
                subtask.id.0,
                stored,
                subtask.version,
            ));
        }

        let mut stored = subtask.clone();
        stored.version += 1;
        Ok(stored)
    }

    fn list_subtasks(&self, task_id: TaskId) -> Result<Vec<Subtask>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = ?1 ORDER BY message_id, id"
            ))
            .map_err(storage_err("Failed to prepare subtask listing"))?;

        let rows = stmt
            .query_map(params![task_id.0], SubtaskRow::from_row)
            .map_err(storage_err("Failed to list subtasks"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err("Failed to read subtask row"))?;

        rows.into_iter().map(SubtaskRow::into_subtask).collect()
    }

    fn scan_reclaimable(&self, filter: &ReclaimFilter) -> Result<Vec<ReclaimCandidate>> {
        if filter.statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: Vec<String> = (0..filter.statuses.len())
            .map(|i| format!("?{}", i + 2))
            .collect();
        let sql = format!(
            "SELECT s.id, s.task_id, s.executor_namespace, s.executor_name, s.updated_at, \
             t.updated_at, t.status_doc \
             FROM subtasks s JOIN tasks t ON t.id = s.task_id \
             WHERE s.status IN ({}) \
             AND t.status IN ('COMPLETED', 'FAILED', 'CANCELLED') \
             AND s.updated_at < ?1 AND t.updated_at < ?1 \
             AND s.target_kind = 'remote' AND s.executor_name != '' \
             AND s.executor_deleted_at IS NULL AND s.deleted = 0 \
             ORDER BY s.id",
            placeholders.join(", ")
        );

        let mut values: Vec<String> = vec![ts(filter.updated_before)];
        values.extend(filter.statuses.iter().map(|s| s.as_str().to_string()));

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(storage_err("Failed to prepare reclaim scan"))?;

        #[allow(clippy::type_complexity)]
        let rows: Vec<(i64, i64, String, String, String, String, String)> = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })
            .map_err(storage_err("Failed to scan reclaimable subtasks"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err("Failed to read reclaim row"))?;

        rows.into_iter()
            .map(
                |(subtask_id, task_id, namespace, name, s_updated, t_updated, status_doc)| {
                    let doc: serde_json::Value = serde_json::from_str(&status_doc)?;
                    let namespace = if namespace.is_empty() {
                        ExecutorHandle::DEFAULT_NAMESPACE.to_string()
                    } else {
                        namespace
                    };
                    Ok(ReclaimCandidate {
                        subtask_id: SubtaskId(subtask_id),
                        task_id: TaskId(task_id),
                        executor: ExecutorHandle::new(namespace, name),
                        subtask_updated_at: parse_ts(&s_updated)?,
                        task_updated_at: parse_ts(&t_updated)?,
                        task_type: doc
                            .get("task_type")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                    })
                },
            )
            .collect()
    }

    fn mark_executor_reclaimed(
        &self,
        executor: &ExecutorHandle,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.lock()?;
        let namespaces: Vec<&str> = if executor.namespace == ExecutorHandle::DEFAULT_NAMESPACE {
            vec![ExecutorHandle::DEFAULT_NAMESPACE, ""]
        } else {
            vec![executor.namespace.as_str(), executor.namespace.as_str()]
        };

        conn.execute(
            "UPDATE subtasks SET executor_deleted_at = ?1, version = version + 1 \
             WHERE target_kind = 'remote' AND executor_name = ?2 \
             AND executor_namespace IN (?3, ?4) AND executor_deleted_at IS NULL",
            params![ts(at), executor.name, namespaces[0], namespaces[1]],
        )
        .map_err(storage_err("Failed to mark executor reclaimed"))
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    #[test]
    fn test_schema_version() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_insert_assigns_ids() {
        contract::insert_assigns_ids(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_stale_update_conflicts() {
        contract::stale_update_conflicts(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_result_round_trips() {
        contract::result_round_trips(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_scan_and_mark() {
        contract::scan_and_mark(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_running_task_is_not_scanned() {
        contract::running_task_is_not_scanned(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_list_is_ordered() {
        contract::list_is_ordered(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_update_missing_row_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let mut task = Task::new(1);
        task.id = TaskId(77);
        task.version = 1;
        assert!(matches!(store.update_task(&task), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_timestamps_survive_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let task = store.insert_task(Task::new(1)).unwrap();
        let loaded = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(
            ts(loaded.created_at),
            ts(task.created_at),
        );
    }
}
