use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;

use crate::app::AppState;
use crate::auth::{error, require_api_key, ApiError};

// Sonnet-class pricing used for the cost estimate.
const INPUT_USD_PER_MTOK: f64 = 3.0;
const OUTPUT_USD_PER_MTOK: f64 = 15.0;

#[derive(Deserialize)]
pub struct UsageQuery {
    pub tenant: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
}

/// GET /usage?tenant=&since=&until=, token totals plus a cost estimate.
pub async fn usage_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&state, &headers)?;

    let usage = state
        .chats
        .usage(
            query.tenant.as_deref(),
            query.since.as_deref(),
            query.until.as_deref(),
        )
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let input_cost = usage.total_input_tokens as f64 * INPUT_USD_PER_MTOK / 1_000_000.0;
    let output_cost = usage.total_output_tokens as f64 * OUTPUT_USD_PER_MTOK / 1_000_000.0;
    let estimated = ((input_cost + output_cost) * 10_000.0).round() / 10_000.0;

    Ok(Json(serde_json::json!({
        "total_input_tokens": usage.total_input_tokens,
        "total_output_tokens": usage.total_output_tokens,
        "message_count": usage.message_count,
        "estimated_cost_usd": estimated,
        "pricing_note": format!(
            "${INPUT_USD_PER_MTOK}/MTok in, ${OUTPUT_USD_PER_MTOK}/MTok out"
        ),
    })))
}
