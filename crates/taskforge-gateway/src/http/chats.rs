use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;

use taskforge_chats::{ChatUpdate, NewChat};
use taskforge_tasks::NewTask;

use crate::app::AppState;
use crate::auth::{error, require_api_key, ApiError, ErrorBody};

#[derive(Deserialize)]
pub struct ListChatsQuery {
    pub tenant: Option<String>,
    pub metadata_client_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateChatRequest {
    pub tenant: String,
    pub system_prompt: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_max_turns() -> u32 {
    50
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default)]
    pub include_tools: bool,
}

/// GET /chats?tenant=&metadata_client_id=
pub async fn list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListChatsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&state, &headers)?;

    let mut filter = HashMap::new();
    if let Some(client_id) = query.metadata_client_id {
        filter.insert("client_id".to_string(), client_id);
    }
    let chats = state
        .chats
        .list_chats(
            query.tenant.as_deref(),
            if filter.is_empty() { None } else { Some(&filter) },
        )
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(chats).unwrap_or_default()))
}

/// POST /chats
pub async fn create_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require_api_key(&state, &headers)?;

    if req.tenant.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "tenant cannot be empty"));
    }

    let id = state
        .chats
        .create_chat(NewChat {
            tenant: req.tenant,
            system_prompt: req.system_prompt,
            workspace: req.workspace,
            allowed_tools: req.allowed_tools.unwrap_or_default(),
            max_turns: req.max_turns,
            metadata: req.metadata,
        })
        .map_err(internal)?;

    Ok((StatusCode::CREATED, Json(serde_json::json!({"id": id}))))
}

/// GET /chats/{id}, chat with its full message log.
pub async fn get_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&state, &headers)?;

    let (chat, messages) = state
        .chats
        .get_chat_with_messages(id)
        .map_err(internal)?
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "Chat not found"))?;

    let mut body = serde_json::to_value(&chat).unwrap_or_default();
    body["messages"] = serde_json::to_value(&messages).unwrap_or_default();
    Ok(Json(body))
}

/// PATCH /chats/{id}
pub async fn update_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(update): Json<ChatUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&state, &headers)?;

    if update.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "No fields to update"));
    }
    let found = state.chats.update_chat(id, update).map_err(internal)?;
    if !found {
        return Err(error(StatusCode::NOT_FOUND, "Chat not found"));
    }
    Ok(Json(serde_json::json!({"ok": true})))
}

/// GET /chats/{id}/messages?include_tools=
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&state, &headers)?;

    if state.chats.get_chat(id).map_err(internal)?.is_none() {
        return Err(error(StatusCode::NOT_FOUND, "Chat not found"));
    }

    let body = if query.include_tools {
        serde_json::to_value(state.chats.list_messages_with_tools(id).map_err(internal)?)
    } else {
        serde_json::to_value(state.chats.list_messages(id).map_err(internal)?)
    };
    Ok(Json(body.unwrap_or_default()))
}

/// POST /chats/{id}/messages, submit a user turn.
///
/// Refused with 409 (carrying the conflicting task id) while the chat
/// already has a non-terminal task; the one-in-flight-turn-per-chat
/// invariant is enforced here, before the task exists.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require_api_key(&state, &headers)?;

    let chat = state
        .chats
        .get_chat(id)
        .map_err(internal)?
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "Chat not found"))?;

    if req.content.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "content cannot be empty"));
    }

    if let Some(active) = state.tasks.active_for_chat(id).map_err(internal)? {
        return Err((
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: format!("Chat already has active task {}", active.id),
                task_id: Some(active.id),
            }),
        ));
    }

    let mut new_task = NewTask::agent(req.content).with_chat(id);
    new_task.workspace = chat.workspace;
    let task_id = state.tasks.create(new_task).map_err(internal)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"task_id": task_id})),
    ))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
