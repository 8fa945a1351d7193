use rusqlite::Connection;

use crate::error::Result;

/// Initialise the task_events table.
///
/// Safe to call on every startup, uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS task_events (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id    INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            event_data TEXT,
            sequence   INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_task_events_task
            ON task_events(task_id, sequence);",
    )?;
    Ok(())
}
