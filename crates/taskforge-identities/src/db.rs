use rusqlite::Connection;

use crate::error::Result;

/// Initialise the identities and rate_limits tables.
///
/// Safe to call on every startup, uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS identities (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            platform         TEXT NOT NULL,
            name             TEXT NOT NULL,
            account_type     TEXT NOT NULL DEFAULT 'free',
            status           TEXT NOT NULL DEFAULT 'active',
            cookie_encrypted TEXT,
            user_agent       TEXT,
            last_used_at     TEXT,
            blocked_at       TEXT,
            blocked_reason   TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_identities_platform
            ON identities(platform, status);

        CREATE TABLE IF NOT EXISTS rate_limits (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id       INTEGER NOT NULL,
            action_type       TEXT NOT NULL,
            date              TEXT NOT NULL,
            hourly_timestamps TEXT NOT NULL DEFAULT '[]',
            daily_count       INTEGER NOT NULL DEFAULT 0,
            last_request_at   TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_rate_limits_identity_action_date
            ON rate_limits(identity_id, action_type, date);",
    )?;
    Ok(())
}
