use rusqlite::Connection;

use crate::error::Result;

/// Initialise the secrets table.
///
/// Safe to call on every startup, uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS secrets (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            key             TEXT NOT NULL,
            scope           TEXT NOT NULL DEFAULT 'platform',
            user_id         INTEGER,
            encrypted_value TEXT NOT NULL,
            description     TEXT,
            expires_at      TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_secrets_key_scope_user
            ON secrets(key, scope, IFNULL(user_id, -1));",
    )?;
    Ok(())
}
