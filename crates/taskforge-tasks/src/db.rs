use rusqlite::Connection;

use crate::error::Result;

/// Initialise the tasks table.
///
/// Safe to call on every startup, uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            kind         TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'pending',
            script_path  TEXT,
            params       TEXT,
            prompt       TEXT,
            chat_id      INTEGER,
            workspace    TEXT,
            claimed_by   TEXT,
            started_at   TEXT,
            completed_at TEXT,
            error        TEXT,
            result       TEXT,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status_created
            ON tasks(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_chat
            ON tasks(chat_id);",
    )?;
    Ok(())
}
