use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};

use crate::app::AppState;
use crate::auth::{require_api_key, ApiError};

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// GET /chats/{id}/events, SSE stream of the chat's active task.
///
/// Frames are `data: <json>` events; idle periods produce `: keepalive`
/// comments every 30 s. After a keepalive the task's stored status is
/// consulted so a terminal task that never emitted its final event still
/// closes the stream. The stream ends after `complete` or `error`.
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    require_api_key(&state, &headers)?;

    let stream = async_stream::stream! {
        let task = match state.tasks.active_for_chat(chat_id) {
            Ok(Some(task)) => task,
            _ => {
                yield Ok(Event::default().data(r#"{"type":"no_task"}"#));
                return;
            }
        };
        let task_id = task.id;
        let mut index = 0usize;

        loop {
            for event in state.bus.snapshot(task_id, index) {
                index += 1;
                let terminal = matches!(
                    event.get("type").and_then(|t| t.as_str()),
                    Some("complete" | "error")
                );
                yield Ok(Event::default().data(event.to_string()));
                if terminal {
                    return;
                }
            }

            if !state.bus.wait(task_id, WAIT_TIMEOUT).await {
                yield Ok(Event::default().comment("keepalive"));

                // Safety net: the task may have settled without a final
                // emit (worker crash, cross-process execution).
                if let Ok(Some(task)) = state.tasks.get(task_id) {
                    if task.status.is_terminal() {
                        yield Ok(Event::default().data(r#"{"type":"complete"}"#));
                        return;
                    }
                }
            }
        }
    };

    Ok(Sse::new(stream))
}
