use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use taskforge_secrets::MasterCipher;
use tracing::{info, instrument};

use crate::db::init_db;
use crate::error::{IdentityError, Result};
use crate::rate_limiter::RateLimiter;
use crate::types::{Identity, IdentityStatus};

/// Registry of platform accounts with encrypted credentials.
///
/// Shares its connection handle with the [`RateLimiter`] so both operate
/// on the same database.
pub struct IdentityRegistry {
    conn: Arc<Mutex<Connection>>,
    cipher: MasterCipher,
    limiter: RateLimiter,
}

impl IdentityRegistry {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        cipher: MasterCipher,
        limiter: RateLimiter,
    ) -> Result<Self> {
        init_db(&conn.lock().unwrap())?;
        Ok(Self {
            conn,
            cipher,
            limiter,
        })
    }

    /// Create a new identity. The cookie is encrypted before storage.
    pub fn create(
        &self,
        platform: &str,
        name: &str,
        cookie: Option<&str>,
        user_agent: Option<&str>,
        account_type: &str,
        status: IdentityStatus,
    ) -> Result<i64> {
        let encrypted = match cookie {
            Some(c) => Some(self.cipher.encrypt(c)?),
            None => None,
        };
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO identities
             (platform, name, account_type, status, cookie_encrypted, user_agent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                platform,
                name,
                account_type,
                status.as_str(),
                encrypted,
                user_agent,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(identity_id = id, platform, name, "identity created");
        Ok(id)
    }

    /// Pick the least-recently-used active identity for `platform` that
    /// can still make requests for `action`.
    ///
    /// Never-used identities sort first. Without an action the first
    /// active identity wins regardless of rate limits.
    #[instrument(skip(self))]
    pub fn available(&self, platform: &str, action: Option<&str>) -> Result<Option<i64>> {
        let candidates: Vec<i64> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                // SQLite sorts NULLs first in ASC order, which is exactly
                // the never-used-first policy.
                "SELECT id FROM identities
                 WHERE platform = ?1 AND status = 'active'
                 ORDER BY last_used_at ASC",
            )?;
            let rows = stmt.query_map([platform], |row| row.get(0))?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let Some(action) = action else {
            return Ok(candidates.first().copied());
        };

        for id in candidates {
            let (ok, _) = self.limiter.can_request(id, action)?;
            if ok {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    pub fn get(&self, id: i64) -> Result<Option<Identity>> {
        let conn = self.conn.lock().unwrap();
        query_identity(
            &conn,
            "SELECT id, platform, name, account_type, status, user_agent,
                    last_used_at, blocked_at, blocked_reason, created_at
             FROM identities WHERE id = ?1",
            rusqlite::params![id],
        )
    }

    pub fn get_by_name(&self, platform: &str, name: &str) -> Result<Option<Identity>> {
        let conn = self.conn.lock().unwrap();
        query_identity(
            &conn,
            "SELECT id, platform, name, account_type, status, user_agent,
                    last_used_at, blocked_at, blocked_reason, created_at
             FROM identities WHERE platform = ?1 AND name = ?2",
            rusqlite::params![platform, name],
        )
    }

    pub fn list(
        &self,
        platform: Option<&str>,
        status: Option<IdentityStatus>,
    ) -> Result<Vec<Identity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, platform, name, account_type, status, user_agent,
                    last_used_at, blocked_at, blocked_reason, created_at
             FROM identities
             WHERE (?1 IS NULL OR platform = ?1)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY platform, name",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![platform, status.map(|s| s.as_str())],
            row_to_identity,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM identities WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    /// Stamp `last_used_at` so LRU selection rotates.
    pub fn mark_used(&self, id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE identities SET last_used_at = ?1 WHERE id = ?2",
            rusqlite::params![now, id],
        )?;
        if n == 0 {
            return Err(IdentityError::NotFound { id });
        }
        Ok(())
    }

    pub fn mark_blocked(&self, id: i64, reason: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE identities
             SET status = 'blocked', blocked_at = ?1, blocked_reason = ?2
             WHERE id = ?3",
            rusqlite::params![now, reason, id],
        )?;
        if n == 0 {
            return Err(IdentityError::NotFound { id });
        }
        info!(identity_id = id, reason, "identity blocked");
        Ok(())
    }

    pub fn mark_active(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE identities
             SET status = 'active', blocked_at = NULL, blocked_reason = NULL
             WHERE id = ?1",
            [id],
        )?;
        if n == 0 {
            return Err(IdentityError::NotFound { id });
        }
        Ok(())
    }

    /// Decrypt and return the stored cookie, `None` when unset.
    pub fn get_cookie(&self, id: i64) -> Result<Option<String>> {
        let encrypted: Option<String> = {
            let conn = self.conn.lock().unwrap();
            match conn.query_row(
                "SELECT cookie_encrypted FROM identities WHERE id = ?1",
                [id],
                |row| row.get(0),
            ) {
                Ok(v) => v,
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    return Err(IdentityError::NotFound { id })
                }
                Err(e) => return Err(e.into()),
            }
        };
        match encrypted {
            Some(ct) => Ok(Some(self.cipher.decrypt(&ct)?)),
            None => Ok(None),
        }
    }

    pub fn set_cookie(&self, id: i64, cookie: &str) -> Result<()> {
        let encrypted = self.cipher.encrypt(cookie)?;
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE identities SET cookie_encrypted = ?1 WHERE id = ?2",
            rusqlite::params![encrypted, id],
        )?;
        if n == 0 {
            return Err(IdentityError::NotFound { id });
        }
        Ok(())
    }
}

fn query_identity(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<Identity>> {
    match conn.query_row(sql, params, row_to_identity) {
        Ok(identity) => Ok(Some(identity)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    let status_str: String = row.get(4)?;
    Ok(Identity {
        id: row.get(0)?,
        platform: row.get(1)?,
        name: row.get(2)?,
        account_type: row.get(3)?,
        status: status_str.parse().unwrap_or(IdentityStatus::Blocked),
        user_agent: row.get(5)?,
        last_used_at: row.get(6)?,
        blocked_at: row.get(7)?,
        blocked_reason: row.get(8)?,
        created_at: row.get(9)?,
    })
}
