use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::instrument;

use crate::cipher::MasterCipher;
use crate::db::init_db;
use crate::error::Result;
use crate::types::{SecretMeta, SecretScope};

/// Encrypted secrets store.
///
/// Values are encrypted with the process-wide [`MasterCipher`] before they
/// touch the database and decrypted on read. Listings only ever expose
/// metadata.
pub struct SecretsVault {
    db: Mutex<Connection>,
    cipher: MasterCipher,
}

impl SecretsVault {
    pub fn new(conn: Connection, cipher: MasterCipher) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            cipher,
        })
    }

    /// Decrypt and return a secret value.
    ///
    /// When `user_id` is given the user-scoped value is consulted first;
    /// an expired match returns `None` without falling back (the row is
    /// kept for inspection).
    #[instrument(skip(self))]
    pub fn get(&self, key: &str, user_id: Option<i64>) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();

        if let Some(uid) = user_id {
            if let Some((value, expires)) = fetch_one(
                &db,
                "SELECT encrypted_value, expires_at FROM secrets
                 WHERE key = ?1 AND scope = 'user' AND user_id = ?2",
                rusqlite::params![key, uid],
            )? {
                if is_expired(expires.as_deref()) {
                    return Ok(None);
                }
                return Ok(Some(self.cipher.decrypt(&value)?));
            }
        }

        if let Some((value, expires)) = fetch_one(
            &db,
            "SELECT encrypted_value, expires_at FROM secrets
             WHERE key = ?1 AND scope = 'platform'",
            rusqlite::params![key],
        )? {
            if is_expired(expires.as_deref()) {
                return Ok(None);
            }
            return Ok(Some(self.cipher.decrypt(&value)?));
        }

        Ok(None)
    }

    /// Encrypt and store a secret, upserting on (key, scope, user_id).
    #[instrument(skip(self, value, description, expires_at))]
    pub fn set(
        &self,
        key: &str,
        value: &str,
        scope: SecretScope,
        user_id: Option<i64>,
        description: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let encrypted = self.cipher.encrypt(value)?;
        let now = Utc::now().to_rfc3339();
        let expires = expires_at.map(|dt| dt.to_rfc3339());
        // user_id only applies to user scope
        let uid = match scope {
            SecretScope::User => user_id,
            SecretScope::Platform => None,
        };

        let db = self.db.lock().unwrap();
        let updated = db.execute(
            "UPDATE secrets
             SET encrypted_value = ?1, description = ?2, expires_at = ?3, updated_at = ?4
             WHERE key = ?5 AND scope = ?6 AND IFNULL(user_id, -1) = IFNULL(?7, -1)",
            rusqlite::params![encrypted, description, expires, now, key, scope.as_str(), uid],
        )?;
        if updated == 0 {
            db.execute(
                "INSERT INTO secrets
                 (key, scope, user_id, encrypted_value, description, expires_at,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                rusqlite::params![key, scope.as_str(), uid, encrypted, description, expires, now],
            )?;
        }
        Ok(())
    }

    /// Delete a secret. Returns true when a row was removed.
    pub fn delete(&self, key: &str, scope: SecretScope, user_id: Option<i64>) -> Result<bool> {
        let uid = match scope {
            SecretScope::User => user_id,
            SecretScope::Platform => None,
        };
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM secrets
             WHERE key = ?1 AND scope = ?2 AND IFNULL(user_id, -1) = IFNULL(?3, -1)",
            rusqlite::params![key, scope.as_str(), uid],
        )?;
        Ok(n > 0)
    }

    /// List secret metadata, optionally filtered by scope and user.
    pub fn list(
        &self,
        scope: Option<SecretScope>,
        user_id: Option<i64>,
    ) -> Result<Vec<SecretMeta>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, key, scope, user_id, description, expires_at, created_at, updated_at
             FROM secrets
             WHERE (?1 IS NULL OR scope = ?1)
               AND (?2 IS NULL OR user_id = ?2 OR scope = 'platform')
             ORDER BY key",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![scope.map(|s| s.as_str()), user_id],
            |row| {
                let scope_str: String = row.get(2)?;
                Ok(SecretMeta {
                    id: row.get(0)?,
                    key: row.get(1)?,
                    scope: scope_str.parse().unwrap_or(SecretScope::Platform),
                    user_id: row.get(3)?,
                    description: row.get(4)?,
                    expires_at: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            },
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Resolve multiple secrets for task execution.
    ///
    /// Missing or expired keys are silently omitted; decryption failures
    /// propagate so corruption is never mistaken for absence.
    pub fn bulk_get(
        &self,
        keys: &[String],
        user_id: Option<i64>,
    ) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::new();
        for key in keys {
            if let Some(value) = self.get(key, user_id)? {
                resolved.insert(key.clone(), value);
            }
        }
        Ok(resolved)
    }

    /// The cipher, for callers that encrypt values stored outside this
    /// table (identity cookies).
    pub fn cipher(&self) -> &MasterCipher {
        &self.cipher
    }
}

fn fetch_one(
    db: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<(String, Option<String>)>> {
    match db.query_row(sql, params, |row| Ok((row.get(0)?, row.get(1)?))) {
        Ok(pair) => Ok(Some(pair)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_expired(expires_at: Option<&str>) -> bool {
    match expires_at {
        Some(ts) => DateTime::parse_from_rfc3339(ts)
            .map(|dt| dt.with_timezone(&Utc) < Utc::now())
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::test_cipher;
    use crate::error::SecretsError;
    use base64::Engine;
    use chrono::Duration;

    fn vault() -> SecretsVault {
        let conn = Connection::open_in_memory().unwrap();
        SecretsVault::new(conn, test_cipher()).unwrap()
    }

    #[test]
    fn set_get_roundtrip() {
        let v = vault();
        v.set("API_TOKEN", "tok-123", SecretScope::Platform, None, None, None)
            .unwrap();
        assert_eq!(v.get("API_TOKEN", None).unwrap().as_deref(), Some("tok-123"));
        assert_eq!(v.get("MISSING", None).unwrap(), None);
    }

    #[test]
    fn set_upserts_existing_row() {
        let v = vault();
        v.set("K", "v1", SecretScope::Platform, None, None, None)
            .unwrap();
        v.set("K", "v2", SecretScope::Platform, None, Some("rotated"), None)
            .unwrap();
        assert_eq!(v.get("K", None).unwrap().as_deref(), Some("v2"));
        assert_eq!(v.list(None, None).unwrap().len(), 1);
    }

    #[test]
    fn user_scope_takes_precedence() {
        let v = vault();
        v.set("K", "platform", SecretScope::Platform, None, None, None)
            .unwrap();
        v.set("K", "mine", SecretScope::User, Some(7), None, None)
            .unwrap();

        assert_eq!(v.get("K", Some(7)).unwrap().as_deref(), Some("mine"));
        assert_eq!(v.get("K", Some(8)).unwrap().as_deref(), Some("platform"));
        assert_eq!(v.get("K", None).unwrap().as_deref(), Some("platform"));
    }

    #[test]
    fn expired_secret_returns_none_but_row_remains() {
        let v = vault();
        let past = Utc::now() - Duration::hours(1);
        v.set("K", "v", SecretScope::Platform, None, None, Some(past))
            .unwrap();

        assert_eq!(v.get("K", None).unwrap(), None);
        assert_eq!(v.list(None, None).unwrap().len(), 1);
    }

    #[test]
    fn corrupted_value_raises_tamper_error() {
        let v = vault();
        v.set("K", "v", SecretScope::Platform, None, None, None)
            .unwrap();

        // Flip a byte of the stored ciphertext directly in the table.
        {
            let db = v.db.lock().unwrap();
            let stored: String = db
                .query_row(
                    "SELECT encrypted_value FROM secrets WHERE key = 'K'",
                    [],
                    |r| r.get(0),
                )
                .unwrap();
            let mut packed = base64::engine::general_purpose::STANDARD
                .decode(&stored)
                .unwrap();
            packed[14] ^= 0xff;
            let corrupted = base64::engine::general_purpose::STANDARD.encode(packed);
            db.execute(
                "UPDATE secrets SET encrypted_value = ?1 WHERE key = 'K'",
                [corrupted],
            )
            .unwrap();
        }

        assert!(matches!(v.get("K", None), Err(SecretsError::InvalidKey)));
    }

    #[test]
    fn delete_and_report() {
        let v = vault();
        v.set("K", "v", SecretScope::Platform, None, None, None)
            .unwrap();
        assert!(v.delete("K", SecretScope::Platform, None).unwrap());
        assert!(!v.delete("K", SecretScope::Platform, None).unwrap());
    }

    #[test]
    fn list_never_exposes_plaintext() {
        let v = vault();
        v.set("K", "hunter2", SecretScope::User, Some(1), Some("pw"), None)
            .unwrap();
        let listed = v.list(Some(SecretScope::User), Some(1)).unwrap();
        assert_eq!(listed.len(), 1);
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn bulk_get_omits_missing_keys() {
        let v = vault();
        v.set("A", "1", SecretScope::Platform, None, None, None)
            .unwrap();
        v.set("B", "2", SecretScope::Platform, None, None, None)
            .unwrap();

        let resolved = v
            .bulk_get(
                &["A".to_string(), "B".to_string(), "MISSING".to_string()],
                None,
            )
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["A"], "1");
        assert_eq!(resolved["B"], "2");
        assert!(!resolved.contains_key("MISSING"));
    }
}
