//! One agent turn bound to a chat.
//!
//! Reads chat config and history, drives the agent stream, fans events
//! out through the bus, and on success appends the user/assistant
//! message pair to the chat. The HTTP layer guarantees at most one
//! in-flight task per chat before the task was ever created; this module
//! relies on that and does not re-check.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use taskforge_chats::{ChatStore, HistoryEntry, MessageRole};
use taskforge_events::EventBus;
use taskforge_tasks::Task;

use crate::agent::{AgentMessage, AgentRequest, AgentRunner, ContentBlock};

/// What one chat-bound turn produced.
#[derive(Debug)]
pub struct TurnOutcome {
    pub success: bool,
    pub output: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_count: u64,
    pub error: Option<String>,
}

/// Run one agent turn for `task` (which must carry `chat_id` and
/// `prompt`, both validated by the dispatcher).
///
/// Event order per run: `start`, then `text`/`tool_use` per content
/// block, `thinking` after a turn that ended in plain text, and finally
/// exactly one of `complete` or `error`. The in-memory tail is cleaned
/// up unconditionally; durable events remain.
#[instrument(skip_all, fields(task_id = task.id, chat_id))]
pub async fn run_chat_turn(
    chats: &ChatStore,
    bus: &EventBus,
    runner: Arc<dyn AgentRunner>,
    task: &Task,
    chat_id: i64,
    prompt: &str,
    model: &str,
) -> TurnOutcome {
    let outcome = drive_turn(chats, bus, runner, task, chat_id, prompt, model).await;
    bus.cleanup(task.id);
    outcome
}

async fn drive_turn(
    chats: &ChatStore,
    bus: &EventBus,
    runner: Arc<dyn AgentRunner>,
    task: &Task,
    chat_id: i64,
    prompt: &str,
    model: &str,
) -> TurnOutcome {
    let (chat, history) = match load_chat(chats, chat_id) {
        Ok(pair) => pair,
        Err(message) => {
            bus.emit(task.id, "error", serde_json::json!({ "error": message }));
            return failure(message);
        }
    };

    let request = AgentRequest {
        prompt: render_prompt(&history, prompt),
        system_prompt: Some(chat.system_prompt.clone()),
        allowed_tools: chat.allowed_tools.clone(),
        max_turns: chat.max_turns,
        workspace: task.workspace.clone().or(chat.workspace.clone()),
        model: model.to_string(),
    };

    bus.emit(task.id, "start", serde_json::json!({ "model": model }));

    let (tx, mut rx) = mpsc::channel::<AgentMessage>(64);
    let runner_task = tokio::spawn(async move { runner.run(request, tx).await });

    let mut response_parts: Vec<String> = Vec::new();
    let mut turn_index: u64 = 0;
    let mut tool_count: u64 = 0;
    let mut input_tokens: u64 = 0;
    let mut output_tokens: u64 = 0;

    while let Some(message) = rx.recv().await {
        match message {
            AgentMessage::Assistant { blocks } => {
                turn_index += 1;
                let mut text_blocks = 0u32;
                let mut tool_blocks = 0u32;
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            text_blocks += 1;
                            response_parts.push(text.clone());
                            bus.emit(
                                task.id,
                                "text",
                                serde_json::json!({ "content": text, "turn": turn_index }),
                            );
                        }
                        ContentBlock::ToolUse { name, input } => {
                            tool_blocks += 1;
                            tool_count += 1;
                            bus.emit(
                                task.id,
                                "tool_use",
                                serde_json::json!({
                                    "tool": name,
                                    "count": tool_count,
                                    "input": input,
                                }),
                            );
                        }
                    }
                }
                // A turn of pure text means the agent stopped to reason.
                if text_blocks > 0 && tool_blocks == 0 {
                    bus.emit(task.id, "thinking", serde_json::json!({}));
                }
            }
            AgentMessage::Result {
                input_tokens: i,
                output_tokens: o,
            } => {
                input_tokens = i;
                output_tokens = o;
            }
            AgentMessage::Other => {}
        }
    }

    // The stream is drained; surface any runner failure.
    match runner_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let message = e.to_string();
            warn!(error = %message, "agent run failed");
            bus.emit(task.id, "error", serde_json::json!({ "error": message }));
            return failure(message);
        }
        Err(e) => {
            let message = format!("agent task panicked: {e}");
            bus.emit(task.id, "error", serde_json::json!({ "error": message }));
            return failure(message);
        }
    }

    bus.emit(
        task.id,
        "complete",
        serde_json::json!({
            "tools_used": tool_count,
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        }),
    );

    let output = response_parts.join("\n");

    // Persist the turn: user message first, then the assistant response
    // with its token accounting.
    if let Err(e) = chats.append_message(chat_id, MessageRole::User, prompt, 0, 0) {
        return failure(format!("failed to persist user message: {e}"));
    }
    if let Err(e) = chats.append_message(
        chat_id,
        MessageRole::Assistant,
        &output,
        input_tokens as i64,
        output_tokens as i64,
    ) {
        return failure(format!("failed to persist assistant message: {e}"));
    }

    info!(tool_count, input_tokens, output_tokens, "agent turn completed");

    TurnOutcome {
        success: true,
        output,
        input_tokens,
        output_tokens,
        tool_count,
        error: None,
    }
}

fn load_chat(
    chats: &ChatStore,
    chat_id: i64,
) -> std::result::Result<(taskforge_chats::Chat, Vec<HistoryEntry>), String> {
    let chat = chats
        .get_chat(chat_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("chat not found: {chat_id}"))?;
    let history = chats.history(chat_id).map_err(|e| e.to_string())?;
    Ok((chat, history))
}

/// Render history as alternating "User:"/"Assistant:" blocks followed by
/// the new user message.
fn render_prompt(history: &[HistoryEntry], new_message: &str) -> String {
    if history.is_empty() {
        return new_message.to_string();
    }
    let mut out = String::new();
    for entry in history {
        let label = match entry.role {
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
        };
        out.push_str(&format!("{label}: {}\n\n", entry.content));
    }
    out.push_str(&format!("User: {new_message}"));
    out
}

fn failure(message: String) -> TurnOutcome {
    TurnOutcome {
        success: false,
        output: String::new(),
        input_tokens: 0,
        output_tokens: 0,
        tool_count: 0,
        error: Some(message),
    }
}
