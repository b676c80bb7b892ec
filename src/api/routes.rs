//! Route handlers for the non-WebSocket endpoints

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::hub::handler::CoreState;

use super::error::{ApiError, ApiResult};

/// Header carrying the hex SHA-256 of the script body.
pub const SCRIPT_CHECKSUM_HEADER: &str = "x-script-checksum";

/// GET /api/scripts/:id/content
///
/// Serves the script body as plain text so agents can stage and execute
/// it; the checksum header lets them verify what they downloaded.
pub async fn script_content(
    Path(id): Path<String>,
    State(state): State<CoreState>,
) -> ApiResult<impl IntoResponse> {
    let script = state
        .scripts
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("script {id} not found")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(&script.checksum) {
        headers.insert(SCRIPT_CHECKSUM_HEADER, value);
    }

    Ok((StatusCode::OK, headers, script.content))
}

/// GET /api/health
pub async fn health(State(state): State<CoreState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "agents_online": state.hub.online_count(),
    }))
}
