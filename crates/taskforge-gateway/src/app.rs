use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use taskforge_chats::ChatStore;
use taskforge_core::ForgeConfig;
use taskforge_events::EventBus;
use taskforge_tasks::TaskStore;

/// Central shared state, passed as Arc<AppState> to all handlers.
pub struct AppState {
    pub config: ForgeConfig,
    pub tasks: Arc<TaskStore>,
    pub chats: Arc<ChatStore>,
    pub bus: Arc<EventBus>,
}

/// Assemble the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/chats",
            get(crate::http::chats::list_chats).post(crate::http::chats::create_chat),
        )
        .route(
            "/chats/{id}",
            get(crate::http::chats::get_chat).patch(crate::http::chats::update_chat),
        )
        .route(
            "/chats/{id}/messages",
            get(crate::http::chats::list_messages).post(crate::http::chats::send_message),
        )
        .route("/chats/{id}/events", get(crate::http::events::stream_events))
        .route("/usage", get(crate::http::usage::usage_handler))
        .route("/tasks", get(crate::http::tasks::list_tasks))
        .route("/tasks/{id}", get(crate::http::tasks::get_task))
        .route("/tasks/{id}/retry", post(crate::http::tasks::retry_task))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
}

/// CORS layer from the comma-separated origins config. `*` allows any
/// origin.
fn cors_layer(origins: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.trim() == "*" {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|o| o.trim().parse().ok())
            .collect();
        layer.allow_origin(parsed)
    }
}
