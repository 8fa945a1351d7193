use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::warn;

use crate::db::init_db;
use crate::error::Result;

/// Per-task ordered event log bridging the executor to SSE subscribers.
///
/// Each task owns an in-memory tail (a prefix-growing `Vec` of JSON
/// events) plus a watch channel whose version bumps on every emit,
/// releasing all concurrent waiters at once. Events are also persisted
/// to the task_events table best-effort; a failed durable write is
/// logged, never raised, so streaming keeps working through database
/// hiccups.
///
/// The tail is process-local: subscribers only see events produced in
/// the same process. Tail indices equal the durable `sequence - 1` for
/// the lifetime of the tail; `cleanup` resets them.
pub struct EventBus {
    db: Mutex<Connection>,
    tails: Mutex<HashMap<i64, TaskTail>>,
}

struct TaskTail {
    events: Vec<serde_json::Value>,
    version: watch::Sender<u64>,
}

impl TaskTail {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            events: Vec::new(),
            version,
        }
    }
}

impl EventBus {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            tails: Mutex::new(HashMap::new()),
        })
    }

    /// Append an event to the task's tail, persist it, and wake every
    /// waiter.
    ///
    /// The stored object is `{type, timestamp, ...data}` with the payload
    /// fields flattened in.
    pub fn emit(&self, task_id: i64, event_type: &str, data: serde_json::Value) {
        let mut event = serde_json::Map::new();
        event.insert("type".into(), serde_json::Value::String(event_type.into()));
        event.insert(
            "timestamp".into(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );
        if let serde_json::Value::Object(fields) = data.clone() {
            for (k, v) in fields {
                event.insert(k, v);
            }
        }
        let event = serde_json::Value::Object(event);

        {
            let mut tails = self.tails.lock().unwrap();
            let tail = tails.entry(task_id).or_insert_with(TaskTail::new);
            tail.events.push(event);
            tail.version.send_modify(|v| *v += 1);
        }

        if let Err(e) = self.persist(task_id, event_type, &data) {
            warn!(task_id, event_type, error = %e, "durable event write failed");
        }
    }

    /// Events at tail indices `[after_index, ..)`.
    pub fn snapshot(&self, task_id: i64, after_index: usize) -> Vec<serde_json::Value> {
        let tails = self.tails.lock().unwrap();
        match tails.get(&task_id) {
            Some(tail) if after_index < tail.events.len() => {
                tail.events[after_index..].to_vec()
            }
            _ => Vec::new(),
        }
    }

    /// Block until the next emit on this task or the timeout.
    ///
    /// Returns true on new data, false on timeout (or when the tail was
    /// cleaned up mid-wait). All concurrent waiters are released by a
    /// single emit; callers must drain `snapshot` before waiting again.
    pub async fn wait(&self, task_id: i64, timeout: Duration) -> bool {
        let mut rx = {
            let mut tails = self.tails.lock().unwrap();
            let tail = tails.entry(task_id).or_insert_with(TaskTail::new);
            tail.version.subscribe()
        };

        matches!(
            tokio::time::timeout(timeout, rx.changed()).await,
            Ok(Ok(()))
        )
    }

    /// Drop the in-memory tail and its waiters for a terminated task.
    /// Durable rows remain in the task_events table.
    pub fn cleanup(&self, task_id: i64) {
        self.tails.lock().unwrap().remove(&task_id);
    }

    fn persist(&self, task_id: i64, event_type: &str, data: &serde_json::Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let encoded = serde_json::to_string(data).unwrap_or_else(|_| "null".into());
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO task_events (task_id, event_type, event_data, sequence, created_at)
             VALUES (?1, ?2, ?3,
                     (SELECT IFNULL(MAX(sequence), 0) + 1 FROM task_events WHERE task_id = ?1),
                     ?4)",
            rusqlite::params![task_id, event_type, encoded, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bus() -> EventBus {
        EventBus::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn durable_rows(bus: &EventBus, task_id: i64) -> Vec<(String, i64)> {
        let db = bus.db.lock().unwrap();
        let mut stmt = db
            .prepare(
                "SELECT event_type, sequence FROM task_events
                 WHERE task_id = ?1 ORDER BY sequence",
            )
            .unwrap();
        let rows = stmt
            .query_map([task_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        rows.filter_map(|r| r.ok()).collect()
    }

    #[test]
    fn snapshot_returns_suffix_from_index() {
        let b = bus();
        b.emit(1, "start", serde_json::json!({"model": "m"}));
        b.emit(1, "text", serde_json::json!({"content": "hi", "turn": 1}));
        b.emit(1, "complete", serde_json::json!({}));

        assert_eq!(b.snapshot(1, 0).len(), 3);
        assert_eq!(b.snapshot(1, 2).len(), 1);
        assert_eq!(b.snapshot(1, 3).len(), 0);
        assert_eq!(b.snapshot(2, 0).len(), 0);

        let first = &b.snapshot(1, 0)[0];
        assert_eq!(first["type"], "start");
        assert_eq!(first["model"], "m");
        assert!(first["timestamp"].is_string());
    }

    #[test]
    fn tail_index_matches_durable_sequence_minus_one() {
        let b = bus();
        b.emit(7, "start", serde_json::json!({}));
        b.emit(7, "text", serde_json::json!({"content": "x"}));

        let rows = durable_rows(&b, 7);
        assert_eq!(rows.len(), 2);
        for (index, (event_type, sequence)) in rows.iter().enumerate() {
            assert_eq!(*sequence, index as i64 + 1);
            assert_eq!(b.snapshot(7, index)[0]["type"], *event_type);
        }
    }

    #[test]
    fn sequences_are_per_task() {
        let b = bus();
        b.emit(1, "start", serde_json::json!({}));
        b.emit(2, "start", serde_json::json!({}));
        b.emit(1, "complete", serde_json::json!({}));

        assert_eq!(durable_rows(&b, 1).last().unwrap().1, 2);
        assert_eq!(durable_rows(&b, 2).last().unwrap().1, 1);
    }

    #[tokio::test]
    async fn wait_wakes_on_emit() {
        let b = Arc::new(bus());

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.wait(1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.emit(1, "text", serde_json::json!({"content": "hi"}));

        assert!(waiter.await.unwrap());
        assert_eq!(b.snapshot(1, 0).len(), 1);
    }

    #[tokio::test]
    async fn wait_times_out_without_emit() {
        let b = bus();
        assert!(!b.wait(1, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn one_emit_releases_all_waiters() {
        let b = Arc::new(bus());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let b = b.clone();
                tokio::spawn(async move { b.wait(1, Duration::from_secs(5)).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.emit(1, "text", serde_json::json!({}));

        for w in waiters {
            assert!(w.await.unwrap());
        }
    }

    #[test]
    fn cleanup_resets_tail_but_keeps_durable_log() {
        let b = bus();
        b.emit(1, "start", serde_json::json!({}));
        b.emit(1, "complete", serde_json::json!({}));

        b.cleanup(1);
        assert_eq!(b.snapshot(1, 0).len(), 0);

        // New tail indices restart at zero, durable sequence continues.
        b.emit(1, "start", serde_json::json!({}));
        assert_eq!(b.snapshot(1, 0).len(), 1);
        assert_eq!(durable_rows(&b, 1).last().unwrap().1, 3);
    }
}
