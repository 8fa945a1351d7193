use rusqlite::Connection;

use crate::error::Result;

/// Open a SQLite connection with the pragmas every store relies on.
///
/// WAL keeps readers from blocking the worker's claim updates; the busy
/// timeout lets concurrent worker processes queue on the write lock
/// instead of failing with SQLITE_BUSY.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    // WAL is a no-op for in-memory databases.
    if path != ":memory:" {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory() {
        let conn = open(":memory:").expect("open failed");
        let one: i64 = conn.query_row("SELECT 1", [], |r| r.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn open_file_sets_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.db");
        let conn = open(path.to_str().unwrap()).expect("open failed");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }
}
