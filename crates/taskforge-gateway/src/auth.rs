use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;

use crate::app::AppState;

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

pub fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
            task_id: None,
        }),
    )
}

/// Reject the request with 401 when an API key is configured and the
/// `x-api-key` header does not match. An unset key leaves the surface
/// open (dev mode).
pub fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.server.api_key.as_deref() else {
        return Ok(());
    };
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(error(StatusCode::UNAUTHORIZED, "Invalid API key"))
    }
}
