use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;

use taskforge_tasks::TaskStatus;

use crate::app::AppState;
use crate::auth::{error, require_api_key, ApiError};

#[derive(Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /tasks?status=&limit=
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&state, &headers)?;

    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<TaskStatus>()
                .map_err(|e| error(StatusCode::BAD_REQUEST, e))?,
        ),
        None => None,
    };
    let tasks = state
        .tasks
        .list(status, query.limit)
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::to_value(tasks).unwrap_or_default()))
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&state, &headers)?;

    let task = state
        .tasks
        .get(id)
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "Task not found"))?;
    Ok(Json(serde_json::to_value(task).unwrap_or_default()))
}

/// POST /tasks/{id}/retry, re-queue a failed task.
pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&state, &headers)?;

    let reset = state
        .tasks
        .retry(id)
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if reset {
        Ok(Json(serde_json::json!({"ok": true})))
    } else {
        Err(error(
            StatusCode::BAD_REQUEST,
            "Cannot retry (not failed or not found)",
        ))
    }
}
