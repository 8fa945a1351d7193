use rusqlite::Connection;

use crate::error::Result;

/// Initialise the chats and messages tables.
///
/// Safe to call on every startup, uses `IF NOT EXISTS` throughout.
/// The UNIQUE(chat_id, sequence) index backs the gapless per-chat
/// sequence guarantee.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chats (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant        TEXT NOT NULL,
            system_prompt TEXT NOT NULL,
            workspace     TEXT,
            allowed_tools TEXT NOT NULL DEFAULT '[]',
            max_turns     INTEGER NOT NULL DEFAULT 50,
            metadata      TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chats_tenant
            ON chats(tenant, created_at);

        CREATE TABLE IF NOT EXISTS messages (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id       INTEGER NOT NULL,
            role          TEXT NOT NULL,
            content       TEXT NOT NULL,
            sequence      INTEGER NOT NULL,
            tokens_input  INTEGER NOT NULL DEFAULT 0,
            tokens_output INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            UNIQUE(chat_id, sequence)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, sequence);",
    )?;
    Ok(())
}
