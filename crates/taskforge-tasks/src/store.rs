use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, instrument};

use crate::db::init_db;
use crate::error::Result;
use crate::types::{NewTask, Task, TaskKind, TaskStatus};

const TASK_COLUMNS: &str = "id, kind, status, script_path, params, prompt, chat_id, workspace, \
     claimed_by, started_at, completed_at, error, result, created_at";

/// Task queue backed by the shared database.
///
/// The queue IS the database: workers in any process coordinate purely
/// through `claim`, which performs the pending -> running transition and
/// the candidate selection in one statement under the write lock, so a
/// task is handed to exactly one claimant.
pub struct TaskStore {
    db: Mutex<Connection>,
}

impl TaskStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    /// Enqueue a task. Returns the new task id.
    #[instrument(skip(self, task))]
    pub fn create(&self, task: NewTask) -> Result<i64> {
        let kind = task.kind.unwrap_or(TaskKind::Script);
        let params = task
            .params
            .as_ref()
            .map(|p| serde_json::to_string(p).unwrap_or_else(|_| "null".into()));
        let now = Utc::now().to_rfc3339();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tasks (kind, status, script_path, params, prompt, chat_id, workspace, created_at)
             VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                kind.as_str(),
                task.script_path,
                params,
                task.prompt,
                task.chat_id,
                task.workspace,
                now
            ],
        )?;
        let id = db.last_insert_rowid();
        info!(task_id = id, kind = kind.as_str(), "task created");
        Ok(id)
    }

    /// Claim the oldest pending task for `worker_id`.
    ///
    /// Candidate selection and the status transition happen in a single
    /// UPDATE, so concurrent claimers (threads or separate worker
    /// processes) can never both observe the same task as claimable.
    /// Returns `None` when the queue is empty.
    #[instrument(skip(self))]
    pub fn claim(&self, worker_id: &str) -> Result<Option<Task>> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let claimed = match db.query_row(
            &format!(
                "UPDATE tasks
                 SET status = 'running', claimed_by = ?1, started_at = ?2
                 WHERE id = (SELECT id FROM tasks WHERE status = 'pending'
                             ORDER BY created_at ASC, id ASC LIMIT 1)
                 RETURNING {TASK_COLUMNS}"
            ),
            rusqlite::params![worker_id, now],
            row_to_task,
        ) {
            Ok(task) => Some(task),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(ref task) = claimed {
            debug!(task_id = task.id, worker_id, "task claimed");
        }
        Ok(claimed)
    }

    /// Mark a running task completed. Re-application to a terminal task
    /// is a no-op: status and the first-written result stay untouched.
    #[instrument(skip(self, result))]
    pub fn complete(&self, id: i64, result: Option<serde_json::Value>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let encoded = result
            .as_ref()
            .map(|r| serde_json::to_string(r).unwrap_or_else(|_| "null".into()));
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE tasks
             SET status = 'completed', completed_at = ?1, result = ?2, error = NULL
             WHERE id = ?3 AND status = 'running'",
            rusqlite::params![now, encoded, id],
        )?;
        Ok(())
    }

    /// Mark a running task failed. Idempotent like [`complete`].
    #[instrument(skip(self))]
    pub fn fail(&self, id: i64, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE tasks
             SET status = 'failed', completed_at = ?1, error = ?2
             WHERE id = ?3 AND status = 'running'",
            rusqlite::params![now, error, id],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<Task>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [id],
            row_to_task,
        ) {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List tasks, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![status.map(|s| s.as_str()), limit as i64],
            row_to_task,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Reset a failed task to pending, clearing execution bookkeeping.
    /// Returns false when the task is missing or not failed.
    #[instrument(skip(self))]
    pub fn retry(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE tasks
             SET status = 'pending', claimed_by = NULL, started_at = NULL,
                 completed_at = NULL, error = NULL
             WHERE id = ?1 AND status = 'failed'",
            [id],
        )?;
        if n > 0 {
            info!(task_id = id, "task re-queued");
        }
        Ok(n > 0)
    }

    /// Delete a pending task. Returns false when the task is missing or
    /// already claimed.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM tasks WHERE id = ?1 AND status = 'pending'",
            [id],
        )?;
        Ok(n > 0)
    }

    /// Any non-terminal task bound to the chat. Enforces the one
    /// in-flight turn per chat rule at message-submit time.
    pub fn active_for_chat(&self, chat_id: i64) -> Result<Option<Task>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE chat_id = ?1 AND status IN ('pending', 'running')
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1"
            ),
            [chat_id],
            row_to_task,
        ) {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let kind_str: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let params_str: Option<String> = row.get(4)?;
    let result_str: Option<String> = row.get(12)?;

    Ok(Task {
        id: row.get(0)?,
        kind: kind_str.parse().unwrap_or(TaskKind::Script),
        status: status_str.parse().unwrap_or(TaskStatus::Failed),
        script_path: row.get(3)?,
        params: params_str.and_then(|s| serde_json::from_str(&s).ok()),
        prompt: row.get(5)?,
        chat_id: row.get(6)?,
        workspace: row.get(7)?,
        claimed_by: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        error: row.get(11)?,
        result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(13)?,
    })
}
