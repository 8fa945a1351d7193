use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, instrument};

use crate::db::init_db;
use crate::error::Result;
use crate::projection;
use crate::types::{
    Chat, ChatUpdate, HistoryEntry, Message, MessageRole, NewChat, TranscriptItem, Usage,
};

const CHAT_COLUMNS: &str =
    "id, tenant, system_prompt, workspace, allowed_tools, max_turns, metadata, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, chat_id, role, content, sequence, tokens_input, tokens_output, created_at";

/// Store for chats and their ordered message logs.
pub struct ChatStore {
    db: Mutex<Connection>,
}

impl ChatStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    #[instrument(skip(self, chat), fields(tenant = %chat.tenant))]
    pub fn create_chat(&self, chat: NewChat) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let tools = serde_json::to_string(&chat.allowed_tools).unwrap_or_else(|_| "[]".into());
        let metadata = chat
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_else(|_| "null".into()));

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO chats
             (tenant, system_prompt, workspace, allowed_tools, max_turns, metadata,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                chat.tenant,
                chat.system_prompt,
                chat.workspace,
                tools,
                chat.max_turns,
                metadata,
                now
            ],
        )?;
        let id = db.last_insert_rowid();
        info!(chat_id = id, "chat created");
        Ok(id)
    }

    pub fn get_chat(&self, id: i64) -> Result<Option<Chat>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
            [id],
            row_to_chat,
        ) {
            Ok(chat) => Ok(Some(chat)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_chat_with_messages(&self, id: i64) -> Result<Option<(Chat, Vec<Message>)>> {
        let db = self.db.lock().unwrap();
        let chat = match db.query_row(
            &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
            [id],
            row_to_chat,
        ) {
            Ok(chat) => chat,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let messages = query_messages(&db, id)?;
        Ok(Some((chat, messages)))
    }

    /// List chats newest first, optionally filtered by tenant and by
    /// metadata key/value pairs (matched in memory, good enough for
    /// reasonable volumes).
    pub fn list_chats(
        &self,
        tenant: Option<&str>,
        metadata_filter: Option<&HashMap<String, String>>,
    ) -> Result<Vec<Chat>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats
             WHERE (?1 IS NULL OR tenant = ?1)
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(rusqlite::params![tenant], row_to_chat)?;
        let mut chats: Vec<Chat> = rows.filter_map(|r| r.ok()).collect();

        if let Some(filter) = metadata_filter {
            chats.retain(|c| {
                let meta = c.metadata.as_ref().and_then(|m| m.as_object());
                filter.iter().all(|(k, v)| {
                    meta.and_then(|m| m.get(k))
                        .map(|found| json_value_as_string(found) == *v)
                        .unwrap_or(false)
                })
            });
        }
        Ok(chats)
    }

    /// Apply non-`None` fields and bump `updated_at`. Returns false when
    /// the chat does not exist.
    #[instrument(skip(self, update))]
    pub fn update_chat(&self, id: i64, update: ChatUpdate) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let tools = update
            .allowed_tools
            .as_ref()
            .map(|t| serde_json::to_string(t).unwrap_or_else(|_| "[]".into()));
        let metadata = update
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_else(|_| "null".into()));

        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE chats
             SET system_prompt = COALESCE(?1, system_prompt),
                 workspace     = COALESCE(?2, workspace),
                 allowed_tools = COALESCE(?3, allowed_tools),
                 max_turns     = COALESCE(?4, max_turns),
                 metadata      = COALESCE(?5, metadata),
                 updated_at    = ?6
             WHERE id = ?7",
            rusqlite::params![
                update.system_prompt,
                update.workspace,
                tools,
                update.max_turns,
                metadata,
                now,
                id
            ],
        )?;
        Ok(n > 0)
    }

    /// Append a message, assigning the next sequence number.
    ///
    /// The sequence is computed inside the INSERT, so the read-then-write
    /// runs under the database's write lock and stays gapless under
    /// concurrent appends; UNIQUE(chat_id, sequence) backs it up.
    /// Returns the assigned sequence.
    #[instrument(skip(self, content))]
    pub fn append_message(
        &self,
        chat_id: i64,
        role: MessageRole,
        content: &str,
        tokens_input: i64,
        tokens_output: i64,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let sequence = db.query_row(
            "INSERT INTO messages
             (chat_id, role, content, sequence, tokens_input, tokens_output, created_at)
             VALUES (?1, ?2, ?3,
                     (SELECT IFNULL(MAX(sequence), 0) + 1 FROM messages WHERE chat_id = ?1),
                     ?4, ?5, ?6)
             RETURNING sequence",
            rusqlite::params![
                chat_id,
                role.as_str(),
                content,
                tokens_input,
                tokens_output,
                now
            ],
            |row| row.get(0),
        )?;
        Ok(sequence)
    }

    /// Message history as role + content pairs, oldest first.
    pub fn history(&self, chat_id: i64) -> Result<Vec<HistoryEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT role, content FROM messages WHERE chat_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt.query_map([chat_id], |row| {
            let role_str: String = row.get(0)?;
            Ok(HistoryEntry {
                role: role_str.parse().unwrap_or(MessageRole::User),
                content: row.get(1)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn list_messages(&self, chat_id: i64) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        query_messages(&db, chat_id)
    }

    /// Transcript with per-turn text and tool_use events replacing the
    /// concatenated assistant messages. See [`projection`].
    pub fn list_messages_with_tools(&self, chat_id: i64) -> Result<Vec<TranscriptItem>> {
        let db = self.db.lock().unwrap();
        let messages = query_messages(&db, chat_id)?;
        projection::interleave_tool_events(&db, chat_id, &messages)
    }

    /// Direct connection access for tests that seed the tasks and
    /// task_events tables the projection reads.
    #[cfg(test)]
    pub(crate) fn raw_for_tests(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap()
    }

    /// Token totals over messages in matching chats.
    pub fn usage(
        &self,
        tenant: Option<&str>,
        since: Option<&str>,
        until: Option<&str>,
    ) -> Result<Usage> {
        let db = self.db.lock().unwrap();
        let usage = db.query_row(
            "SELECT IFNULL(SUM(m.tokens_input), 0),
                    IFNULL(SUM(m.tokens_output), 0),
                    COUNT(*)
             FROM messages m
             JOIN chats c ON c.id = m.chat_id
             WHERE (?1 IS NULL OR c.tenant = ?1)
               AND (?2 IS NULL OR m.created_at >= ?2)
               AND (?3 IS NULL OR m.created_at <= ?3)",
            rusqlite::params![tenant, since, until],
            |row| {
                Ok(Usage {
                    total_input_tokens: row.get(0)?,
                    total_output_tokens: row.get(1)?,
                    message_count: row.get(2)?,
                })
            },
        )?;
        Ok(usage)
    }
}

fn query_messages(db: &Connection, chat_id: i64) -> Result<Vec<Message>> {
    let mut stmt = db.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 ORDER BY sequence"
    ))?;
    let rows = stmt.query_map([chat_id], row_to_message)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let tools_str: String = row.get(4)?;
    let metadata_str: Option<String> = row.get(6)?;
    Ok(Chat {
        id: row.get(0)?,
        tenant: row.get(1)?,
        system_prompt: row.get(2)?,
        workspace: row.get(3)?,
        allowed_tools: serde_json::from_str(&tools_str).unwrap_or_default(),
        max_turns: row.get(5)?,
        metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role: role_str.parse().unwrap_or(MessageRole::User),
        content: row.get(3)?,
        sequence: row.get(4)?,
        tokens_input: row.get(5)?,
        tokens_output: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Render a metadata value the way filters compare it: strings bare,
/// everything else via JSON.
fn json_value_as_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn store() -> ChatStore {
        ChatStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn create_and_get_chat() {
        let s = store();
        let mut chat = NewChat::new("acme", "You are terse.");
        chat.allowed_tools = vec!["Bash".into(), "Read".into()];
        chat.metadata = Some(serde_json::json!({"client_id": "c-1"}));
        let id = s.create_chat(chat).unwrap();

        let loaded = s.get_chat(id).unwrap().unwrap();
        assert_eq!(loaded.tenant, "acme");
        assert_eq!(loaded.system_prompt, "You are terse.");
        assert_eq!(loaded.allowed_tools, vec!["Bash", "Read"]);
        assert_eq!(loaded.max_turns, 50);
        assert!(s.get_chat(id + 1).unwrap().is_none());
    }

    #[test]
    fn sequences_are_dense_and_ordered() {
        let s = store();
        let id = s.create_chat(NewChat::new("acme", "sys")).unwrap();

        assert_eq!(
            s.append_message(id, MessageRole::User, "ping", 0, 0).unwrap(),
            1
        );
        assert_eq!(
            s.append_message(id, MessageRole::Assistant, "pong", 10, 20)
                .unwrap(),
            2
        );
        assert_eq!(
            s.append_message(id, MessageRole::User, "again", 0, 0).unwrap(),
            3
        );

        let messages = s.list_messages(id).unwrap();
        let sequences: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn sequences_are_per_chat() {
        let s = store();
        let a = s.create_chat(NewChat::new("acme", "sys")).unwrap();
        let b = s.create_chat(NewChat::new("acme", "sys")).unwrap();

        assert_eq!(s.append_message(a, MessageRole::User, "1", 0, 0).unwrap(), 1);
        assert_eq!(s.append_message(b, MessageRole::User, "1", 0, 0).unwrap(), 1);
        assert_eq!(s.append_message(a, MessageRole::User, "2", 0, 0).unwrap(), 2);
    }

    #[test]
    fn concurrent_appends_stay_gapless() {
        let s = Arc::new(store());
        let id = s.create_chat(NewChat::new("acme", "sys")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = s.clone();
                std::thread::spawn(move || {
                    s.append_message(id, MessageRole::User, &format!("m{i}"), 0, 0)
                        .unwrap()
                })
            })
            .collect();
        let assigned: HashSet<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(assigned.len(), 8, "no duplicate sequences");
        assert_eq!(*assigned.iter().min().unwrap(), 1);
        assert_eq!(*assigned.iter().max().unwrap(), 8);
    }

    #[test]
    fn history_returns_role_content_pairs() {
        let s = store();
        let id = s.create_chat(NewChat::new("acme", "sys")).unwrap();
        s.append_message(id, MessageRole::User, "hi", 0, 0).unwrap();
        s.append_message(id, MessageRole::Assistant, "hello", 5, 7)
            .unwrap();

        let history = s.history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].role, MessageRole::Assistant);
    }

    #[test]
    fn update_chat_patches_only_given_fields() {
        let s = store();
        let id = s.create_chat(NewChat::new("acme", "original")).unwrap();

        let ok = s
            .update_chat(
                id,
                ChatUpdate {
                    max_turns: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(ok);

        let chat = s.get_chat(id).unwrap().unwrap();
        assert_eq!(chat.max_turns, 10);
        assert_eq!(chat.system_prompt, "original");

        assert!(!s.update_chat(id + 1, ChatUpdate::default()).unwrap());
    }

    #[test]
    fn list_chats_filters_tenant_and_metadata() {
        let s = store();
        let mut a = NewChat::new("acme", "sys");
        a.metadata = Some(serde_json::json!({"client_id": "c-1"}));
        s.create_chat(a).unwrap();
        let mut b = NewChat::new("acme", "sys");
        b.metadata = Some(serde_json::json!({"client_id": "c-2"}));
        s.create_chat(b).unwrap();
        s.create_chat(NewChat::new("globex", "sys")).unwrap();

        assert_eq!(s.list_chats(None, None).unwrap().len(), 3);
        assert_eq!(s.list_chats(Some("acme"), None).unwrap().len(), 2);

        let mut filter = HashMap::new();
        filter.insert("client_id".to_string(), "c-2".to_string());
        let filtered = s.list_chats(Some("acme"), Some(&filter)).unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn usage_aggregates_by_tenant() {
        let s = store();
        let a = s.create_chat(NewChat::new("acme", "sys")).unwrap();
        let b = s.create_chat(NewChat::new("globex", "sys")).unwrap();

        s.append_message(a, MessageRole::User, "q", 0, 0).unwrap();
        s.append_message(a, MessageRole::Assistant, "r", 100, 200)
            .unwrap();
        s.append_message(b, MessageRole::Assistant, "r", 11, 13).unwrap();

        let all = s.usage(None, None, None).unwrap();
        assert_eq!(all.total_input_tokens, 111);
        assert_eq!(all.total_output_tokens, 213);
        assert_eq!(all.message_count, 3);

        let acme = s.usage(Some("acme"), None, None).unwrap();
        assert_eq!(acme.total_input_tokens, 100);
        assert_eq!(acme.total_output_tokens, 200);

        let none = s.usage(None, Some("2999-01-01T00:00:00+00:00"), None).unwrap();
        assert_eq!(none.message_count, 0);
    }
}
