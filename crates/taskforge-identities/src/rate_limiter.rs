use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveTime, Utc};
use rusqlite::Connection;
use tracing::instrument;

use crate::db::init_db;
use crate::error::Result;
use crate::types::ActionStats;

/// Hourly and daily ceilings for one action type.
#[derive(Debug, Clone, Copy)]
pub struct Limit {
    pub hourly: u32,
    pub daily: u32,
}

/// Static action -> limit mapping with a `default` fallback.
#[derive(Debug, Clone)]
pub struct LimitTable {
    map: HashMap<String, Limit>,
}

impl Default for LimitTable {
    fn default() -> Self {
        let mut map = HashMap::new();
        map.insert("profile_visit".into(), Limit { hourly: 30, daily: 150 });
        map.insert("search".into(), Limit { hourly: 20, daily: 100 });
        map.insert("connection_request".into(), Limit { hourly: 10, daily: 50 });
        map.insert("message".into(), Limit { hourly: 15, daily: 75 });
        map.insert("lookup".into(), Limit { hourly: 50, daily: 500 });
        map.insert("default".into(), Limit { hourly: 60, daily: 300 });
        Self { map }
    }
}

impl LimitTable {
    pub fn new(map: HashMap<String, Limit>) -> Self {
        Self { map }
    }

    pub fn for_action(&self, action: &str) -> Limit {
        self.map
            .get(action)
            .or_else(|| self.map.get("default"))
            .copied()
            .unwrap_or(Limit { hourly: 60, daily: 300 })
    }
}

/// Database-backed rate limiter shared by all workers.
///
/// One row per (identity, action, UTC calendar day). Hourly timestamps
/// are pruned on every read and write, so the stored list never exceeds
/// the hourly limit plus the entry being recorded.
///
/// `can_request` followed by `record_request` is not atomic; under
/// contention one extra request per identity can slip through at the
/// limit boundary.
#[derive(Clone)]
pub struct RateLimiter {
    conn: Arc<Mutex<Connection>>,
    limits: Arc<LimitTable>,
}

impl RateLimiter {
    pub fn new(conn: Arc<Mutex<Connection>>, limits: Option<LimitTable>) -> Result<Self> {
        init_db(&conn.lock().unwrap())?;
        Ok(Self {
            conn,
            limits: Arc::new(limits.unwrap_or_default()),
        })
    }

    /// Check whether a request may be made now.
    ///
    /// Returns `(true, 0)` when admitted. When denied, the second element
    /// is the number of seconds until the request would be admitted:
    /// time to UTC midnight for a daily denial, time until the oldest
    /// hourly timestamp ages out for an hourly denial.
    #[instrument(skip(self))]
    pub fn can_request(&self, identity_id: i64, action: &str) -> Result<(bool, u64)> {
        let limit = self.limits.for_action(action);
        let now = Utc::now();

        let conn = self.conn.lock().unwrap();
        let record = get_or_create_record(&conn, identity_id, action, now)?;

        let timestamps = prune(&record.hourly_timestamps, now);

        if record.daily_count >= limit.daily {
            let midnight = (now + Duration::days(1))
                .date_naive()
                .and_time(NaiveTime::MIN)
                .and_utc();
            let wait = (midnight - now).num_seconds().max(0) as u64;
            return Ok((false, wait));
        }

        if timestamps.len() >= limit.hourly as usize {
            let oldest = timestamps[0];
            let wait = (oldest + Duration::hours(1) - now).num_seconds().max(0) as u64;
            return Ok((false, wait));
        }

        Ok((true, 0))
    }

    /// Record that a request was made: prune, append now, bump the daily
    /// counter.
    #[instrument(skip(self))]
    pub fn record_request(&self, identity_id: i64, action: &str) -> Result<()> {
        let now = Utc::now();

        let conn = self.conn.lock().unwrap();
        let record = get_or_create_record(&conn, identity_id, action, now)?;

        let mut timestamps = prune(&record.hourly_timestamps, now);
        timestamps.push(now);
        let encoded = encode_timestamps(&timestamps);

        conn.execute(
            "UPDATE rate_limits
             SET hourly_timestamps = ?1,
                 daily_count = daily_count + 1,
                 last_request_at = ?2
             WHERE id = ?3",
            rusqlite::params![encoded, now.to_rfc3339(), record.id],
        )?;
        Ok(())
    }

    /// Post-pruning usage per action for today's rows.
    pub fn stats(
        &self,
        identity_id: i64,
        action: Option<&str>,
    ) -> Result<HashMap<String, ActionStats>> {
        let now = Utc::now();
        let today = now.date_naive().to_string();

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT action_type, hourly_timestamps, daily_count, last_request_at
             FROM rate_limits
             WHERE identity_id = ?1 AND date = ?2
               AND (?3 IS NULL OR action_type = ?3)",
        )?;
        let rows = stmt.query_map(rusqlite::params![identity_id, today, action], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut stats = HashMap::new();
        for row in rows.filter_map(|r| r.ok()) {
            let (action_type, raw_timestamps, daily_count, last_request) = row;
            let limit = self.limits.for_action(&action_type);
            let pruned = prune(&decode_timestamps(&raw_timestamps), now);
            stats.insert(
                action_type,
                ActionStats {
                    hourly_used: pruned.len(),
                    hourly_limit: limit.hourly,
                    daily_used: daily_count,
                    daily_limit: limit.daily,
                    last_request,
                },
            );
        }
        Ok(stats)
    }

    /// Delete rate limit rows for an identity (all actions or one).
    pub fn reset_daily(&self, identity_id: i64, action: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM rate_limits
             WHERE identity_id = ?1 AND (?2 IS NULL OR action_type = ?2)",
            rusqlite::params![identity_id, action],
        )?;
        Ok(())
    }
}

struct LimitRecord {
    id: i64,
    hourly_timestamps: Vec<DateTime<Utc>>,
    daily_count: u32,
}

fn get_or_create_record(
    conn: &Connection,
    identity_id: i64,
    action: &str,
    now: DateTime<Utc>,
) -> Result<LimitRecord> {
    let today = now.date_naive().to_string();

    // INSERT OR IGNORE + read back covers the concurrent-create race
    // across worker processes.
    conn.execute(
        "INSERT OR IGNORE INTO rate_limits
         (identity_id, action_type, date, hourly_timestamps, daily_count)
         VALUES (?1, ?2, ?3, '[]', 0)",
        rusqlite::params![identity_id, action, today],
    )?;

    let (id, raw, daily_count) = conn.query_row(
        "SELECT id, hourly_timestamps, daily_count FROM rate_limits
         WHERE identity_id = ?1 AND action_type = ?2 AND date = ?3",
        rusqlite::params![identity_id, action, today],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
            ))
        },
    )?;

    Ok(LimitRecord {
        id,
        hourly_timestamps: decode_timestamps(&raw),
        daily_count,
    })
}

/// Drop timestamps older than one hour.
fn prune(timestamps: &[DateTime<Utc>], now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let cutoff = now - Duration::hours(1);
    timestamps.iter().filter(|ts| **ts > cutoff).copied().collect()
}

fn decode_timestamps(raw: &str) -> Vec<DateTime<Utc>> {
    let strings: Vec<String> = serde_json::from_str(raw).unwrap_or_default();
    strings
        .iter()
        .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .collect()
}

fn encode_timestamps(timestamps: &[DateTime<Utc>]) -> String {
    let strings: Vec<String> = timestamps.iter().map(|ts| ts.to_rfc3339()).collect();
    serde_json::to_string(&strings).unwrap_or_else(|_| "[]".to_string())
}
