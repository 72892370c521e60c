//! Provider callback endpoint.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use sendparcel_core::{ShipmentId, ShipmentStatus};
use sendparcel_retry::{CallbackError, InboundCallback};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::AppState;

/// Largest callback body accepted.
const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Response for an applied callback.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackResponse {
    /// Provider slug that handled the callback.
    pub provider: String,
    /// Always `accepted`.
    pub status: String,
    /// Shipment status after the callback.
    pub shipment_status: ShipmentStatus,
}

/// Error body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable description.
    pub detail: String,
    /// Machine-readable error code.
    pub code: String,
}

/// Receives a shipping provider callback.
///
/// # Responses
///
/// - 201: callback applied
/// - 400: malformed body, wrong provider, or failed verification
/// - 404: unknown shipment
/// - 409: the callback would move the shipment backwards or out of a final
///   status
/// - 413: body too large
/// - 500: storage or configuration failure
/// - 502: provider unreachable; the callback has been queued for retry
#[instrument(
    name = "receive_callback",
    skip(state, headers, body),
    fields(provider = %provider_slug, shipment_id = %shipment_id, content_length = body.len())
)]
pub async fn receive_callback(
    State(state): State<AppState>,
    Path((provider_slug, shipment_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(shipment_id) = shipment_id.parse::<ShipmentId>() else {
        warn!("callback for malformed shipment id");
        return error_response(StatusCode::NOT_FOUND, "not_found", "shipment not found");
    };

    if body.len() > MAX_PAYLOAD_SIZE {
        warn!(limit = MAX_PAYLOAD_SIZE, "callback payload exceeds size limit");
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid_callback",
            format!("payload exceeds {MAX_PAYLOAD_SIZE} bytes"),
        );
    }

    let payload = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(payload @ serde_json::Value::Object(_)) => payload,
        Ok(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_callback",
                "payload must be a JSON object",
            );
        },
        Err(e) => {
            warn!(error = %e, "callback body is not valid JSON");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_callback",
                format!("invalid JSON payload: {e}"),
            );
        },
    };

    let callback =
        InboundCallback::new(provider_slug, shipment_id, payload, extract_headers(&headers));

    match state.dispatcher.handle_callback(callback).await {
        Ok(accepted) => {
            info!(shipment_status = %accepted.shipment_status, "callback accepted");
            (
                StatusCode::CREATED,
                Json(CallbackResponse {
                    provider: accepted.provider,
                    status: "accepted".to_string(),
                    shipment_status: accepted.shipment_status,
                }),
            )
                .into_response()
        },
        Err(err) => callback_error_response(&err),
    }
}

/// Maps a dispatch failure to its HTTP status.
pub fn status_for(err: &CallbackError) -> StatusCode {
    match err {
        CallbackError::ShipmentNotFound { .. } => StatusCode::NOT_FOUND,
        CallbackError::InvalidCallback { .. } => StatusCode::BAD_REQUEST,
        CallbackError::InvalidTransition { .. } => StatusCode::CONFLICT,
        CallbackError::Communication { .. } => StatusCode::BAD_GATEWAY,
        CallbackError::ProviderNotRegistered { .. } | CallbackError::Storage { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        },
    }
}

fn callback_error_response(err: &CallbackError) -> Response {
    error_response(status_for(err), err.code(), err.to_string())
}

/// Builds the standard error body.
pub fn error_response(status: StatusCode, code: &str, detail: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { detail: detail.into(), code: code.to_string() })).into_response()
}

/// Header names arrive lower-cased from the HTTP layer; values that are not
/// valid UTF-8 are dropped.
fn extract_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}
