use axum::Json;

/// GET /health, unauthenticated liveness probe.
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
