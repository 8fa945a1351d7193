//! Tool-interleaved transcript projection.
//!
//! The plain message log stores one concatenated assistant message per
//! turn. For UIs that want the fine-grained view, this projection
//! replaces each assistant message with the per-turn `text` and
//! `tool_use` events from the durable event log, giving
//! user -> text -> tool -> tool -> text -> ... ordering.
//!
//! Tasks are matched to user messages by creation order: the k-th user
//! message corresponds to the k-th task of the chat chronologically.

use std::collections::HashMap;

use rusqlite::Connection;

use crate::error::Result;
use crate::types::{Message, TranscriptItem};

/// Truncation width for rendered shell commands.
const COMMAND_PREVIEW_CHARS: usize = 80;

pub fn interleave_tool_events(
    db: &Connection,
    chat_id: i64,
    messages: &[Message],
) -> Result<Vec<TranscriptItem>> {
    let mut items: Vec<TranscriptItem> =
        messages.iter().map(TranscriptItem::from_message).collect();

    let events_by_task = collect_events(db, chat_id)?;
    let task_ids = chat_task_ids(db, chat_id)?;

    // k-th task <-> k-th user message
    let user_indices: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == "user")
        .map(|(i, _)| i)
        .collect();
    let mut task_for_user: HashMap<usize, i64> = HashMap::new();
    for (task_idx, task_id) in task_ids.iter().enumerate() {
        if let Some(&user_idx) = user_indices.get(task_idx) {
            task_for_user.insert(user_idx, *task_id);
        }
    }

    // The assistant message that follows a user message with events is
    // replaced by the per-turn entries, so skip it.
    let mut skip = vec![false; items.len()];
    for (&user_idx, task_id) in &task_for_user {
        if events_by_task.get(task_id).is_some_and(|e| !e.is_empty()) {
            for j in (user_idx + 1)..items.len() {
                if items[j].role == "assistant" {
                    skip[j] = true;
                    break;
                }
            }
        }
    }

    let mut transcript = Vec::with_capacity(items.len());
    for (i, item) in items.drain(..).enumerate() {
        if skip[i] {
            continue;
        }
        let is_user = item.role == "user";
        transcript.push(item);
        if is_user {
            if let Some(task_id) = task_for_user.get(&i) {
                if let Some(events) = events_by_task.get(task_id) {
                    transcript.extend(events.iter().cloned());
                }
            }
        }
    }
    Ok(transcript)
}

/// Per-task text/tool_use entries in chronological order.
fn collect_events(db: &Connection, chat_id: i64) -> Result<HashMap<i64, Vec<TranscriptItem>>> {
    let mut stmt = db.prepare(
        "SELECT te.task_id, te.event_type, te.event_data, te.created_at
         FROM task_events te
         JOIN tasks t ON t.id = te.task_id
         WHERE t.chat_id = ?1 AND te.event_type IN ('text', 'tool_use')
         ORDER BY te.task_id, te.sequence",
    )?;
    let rows = stmt.query_map([chat_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut by_task: HashMap<i64, Vec<TranscriptItem>> = HashMap::new();
    for row in rows.filter_map(|r| r.ok()) {
        let (task_id, event_type, data_str, created_at) = row;
        let data: serde_json::Value = data_str
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null);

        let item = if event_type == "tool_use" {
            TranscriptItem::event("tool_use", summarize_tool_use(&data), created_at)
        } else {
            let content = data
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();
            TranscriptItem::event("assistant", content, created_at)
        };
        by_task.entry(task_id).or_default().push(item);
    }
    Ok(by_task)
}

fn chat_task_ids(db: &Connection, chat_id: i64) -> Result<Vec<i64>> {
    let mut stmt = db.prepare(
        "SELECT id FROM tasks WHERE chat_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map([chat_id], |row| row.get(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// One-line rendering of a tool invocation: tool name plus the salient
/// input field (shell command, file path, or search pattern).
fn summarize_tool_use(data: &serde_json::Value) -> String {
    let tool = data.get("tool").and_then(|t| t.as_str()).unwrap_or("tool");
    let input = data.get("input");

    let field = |name: &str| {
        input
            .and_then(|i| i.get(name))
            .and_then(|v| v.as_str())
            .map(String::from)
    };

    match tool {
        "Bash" => match field("command") {
            Some(cmd) if cmd.chars().count() > COMMAND_PREVIEW_CHARS => {
                let preview: String = cmd.chars().take(COMMAND_PREVIEW_CHARS).collect();
                format!("{tool}: {preview}...")
            }
            Some(cmd) => format!("{tool}: {cmd}"),
            None => tool.to_string(),
        },
        "Read" | "Write" | "Edit" => match field("file_path") {
            Some(path) => format!("{tool}: {path}"),
            None => tool.to_string(),
        },
        "Glob" | "Grep" => match field("pattern") {
            Some(pattern) => format!("{tool}: {pattern}"),
            None => tool.to_string(),
        },
        other => other.to_string(),
    }
}
