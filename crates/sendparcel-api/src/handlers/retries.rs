//! Retry queue statistics.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

use super::callbacks::error_response;
use crate::AppState;

/// Body of `GET /callbacks/retries/stats`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RetryStatsResponse {
    /// Records still waiting for a successful replay.
    pub pending: u64,
}

/// Reports how many callbacks are waiting in the retry queue.
///
/// Answers `pending: 0` when retries are not configured.
#[instrument(name = "retry_stats", skip(state))]
pub async fn retry_stats(State(state): State<AppState>) -> Response {
    let Some(store) = state.retry_store.as_ref() else {
        return (StatusCode::OK, Json(RetryStatsResponse { pending: 0 })).into_response();
    };

    match store.count_pending().await {
        Ok(pending) => (StatusCode::OK, Json(RetryStatsResponse { pending })).into_response(),
        Err(e) => {
            error!(error = %e, "failed to count pending retries");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
        },
    }
}
