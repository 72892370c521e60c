//! Shipment endpoints.
//!
//! Thin wrappers over [`ShipmentFlow`](sendparcel_retry::ShipmentFlow): decode
//! the request, run the operation, map the outcome to a status code.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use sendparcel_core::{Shipment, ShipmentId, ShipmentStatus};
use sendparcel_retry::{ShipmentError, ShipmentRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::callbacks::error_response;
use crate::AppState;

/// Body of `POST /shipments`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CreateShipmentBody {
    /// Provider slug; the configured default is used when absent.
    #[serde(default)]
    pub provider: Option<String>,
    /// Pickup address.
    #[serde(default)]
    pub sender_address: Option<Value>,
    /// Delivery address.
    #[serde(default)]
    pub receiver_address: Option<Value>,
    /// Parcels in the shipment.
    #[serde(default)]
    pub parcels: Option<Vec<Value>>,
}

impl CreateShipmentBody {
    /// Splits the body into the provider slug and a complete request.
    ///
    /// # Errors
    ///
    /// Names every required field that is missing.
    pub fn into_request(self) -> Result<(Option<String>, ShipmentRequest), String> {
        let missing: Vec<&str> = [
            ("sender_address", self.sender_address.is_none()),
            ("receiver_address", self.receiver_address.is_none()),
            ("parcels", self.parcels.is_none()),
        ]
        .into_iter()
        .filter_map(|(field, absent)| absent.then_some(field))
        .collect();

        match (self.sender_address, self.receiver_address, self.parcels) {
            (Some(sender_address), Some(receiver_address), Some(parcels)) => Ok((
                self.provider,
                ShipmentRequest { sender_address, receiver_address, parcels },
            )),
            _ => Err(format!("missing required fields: {}", missing.join(", "))),
        }
    }
}

/// A shipment as returned by every shipment endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShipmentResponse {
    /// Shipment ID.
    pub id: ShipmentId,
    /// Lifecycle status.
    pub status: ShipmentStatus,
    /// Owning provider.
    pub provider: String,
    /// Provider-assigned identifier.
    pub external_id: String,
    /// Carrier tracking number.
    pub tracking_number: String,
    /// Label download location, empty until a label exists.
    pub label_url: String,
}

impl From<Shipment> for ShipmentResponse {
    fn from(shipment: Shipment) -> Self {
        Self {
            id: shipment.id,
            status: shipment.status,
            provider: shipment.provider,
            external_id: shipment.external_id,
            tracking_number: shipment.tracking_number,
            label_url: shipment.label_url,
        }
    }
}

/// `GET /shipments/health`
pub async fn shipments_health() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

/// Registers a shipment with a provider.
///
/// # Responses
///
/// - 201: shipment created
/// - 400: malformed body, missing fields, or the provider cannot create
///   shipments
/// - 500: no provider resolved, or storage failure
/// - 502: provider unreachable
#[instrument(name = "create_shipment", skip(state, body), fields(content_length = body.len()))]
pub async fn create_shipment(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed = match serde_json::from_slice::<CreateShipmentBody>(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "create shipment body is not valid JSON");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("invalid JSON payload: {e}"),
            );
        },
    };
    let (provider, request) = match parsed.into_request() {
        Ok(split) => split,
        Err(detail) => return error_response(StatusCode::BAD_REQUEST, "invalid_request", detail),
    };

    match state.shipment_flow.create_shipment(provider.as_deref(), &request).await {
        Ok(shipment) => {
            info!(shipment_id = %shipment.id, provider = %shipment.provider, "shipment created");
            shipment_response(StatusCode::CREATED, shipment)
        },
        Err(err) => shipment_error_response(&err),
    }
}

/// Generates a label for the shipment.
///
/// # Responses
///
/// - 201: label created, shipment is `label_ready`
/// - 404: unknown shipment
/// - 409: shipment is already past `label_ready`
#[instrument(name = "create_label", skip(state))]
pub async fn create_label(
    State(state): State<AppState>,
    Path(shipment_id): Path<String>,
) -> Response {
    let Ok(id) = shipment_id.parse::<ShipmentId>() else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "shipment not found");
    };

    match state.shipment_flow.create_label(id).await {
        Ok(shipment) => shipment_response(StatusCode::CREATED, shipment),
        Err(err) => shipment_error_response(&err),
    }
}

/// Pulls the shipment's status from its provider.
///
/// # Responses
///
/// - 200: current shipment
/// - 404: unknown shipment
/// - 409: the reported status cannot follow the stored one
#[instrument(name = "fetch_status", skip(state))]
pub async fn fetch_status(
    State(state): State<AppState>,
    Path(shipment_id): Path<String>,
) -> Response {
    let Ok(id) = shipment_id.parse::<ShipmentId>() else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "shipment not found");
    };

    match state.shipment_flow.fetch_status(id).await {
        Ok(shipment) => shipment_response(StatusCode::OK, shipment),
        Err(err) => shipment_error_response(&err),
    }
}

/// Maps a shipment operation failure to its HTTP status.
pub fn status_for_shipment_error(err: &ShipmentError) -> StatusCode {
    match err {
        ShipmentError::NotFound { .. } => StatusCode::NOT_FOUND,
        ShipmentError::InvalidRequest { .. } | ShipmentError::Unsupported { .. } => {
            StatusCode::BAD_REQUEST
        },
        ShipmentError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ShipmentError::Communication { .. } => StatusCode::BAD_GATEWAY,
        ShipmentError::Configuration { .. } | ShipmentError::Storage { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        },
    }
}

fn shipment_response(status: StatusCode, shipment: Shipment) -> Response {
    (status, Json(ShipmentResponse::from(shipment))).into_response()
}

fn shipment_error_response(err: &ShipmentError) -> Response {
    error_response(status_for_shipment_error(err), err.code(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_kind() {
        let cases = [
            (ShipmentError::NotFound { shipment_id: ShipmentId::new() }, StatusCode::NOT_FOUND),
            (ShipmentError::InvalidRequest { reason: "bad".into() }, StatusCode::BAD_REQUEST),
            (
                ShipmentError::Unsupported { provider: "inpost".into(), operation: "create_label" },
                StatusCode::BAD_REQUEST,
            ),
            (
                ShipmentError::InvalidTransition {
                    from: ShipmentStatus::InTransit,
                    to: ShipmentStatus::LabelReady,
                },
                StatusCode::CONFLICT,
            ),
            (ShipmentError::Communication { reason: "down".into() }, StatusCode::BAD_GATEWAY),
            (
                ShipmentError::Configuration { reason: "none".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ShipmentError::Storage { message: "db".into() }, StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(status_for_shipment_error(&err), expected, "{err:?}");
        }
    }

    #[test]
    fn missing_fields_are_named() {
        let body = CreateShipmentBody {
            provider: Some("inpost".into()),
            sender_address: Some(json!({})),
            ..CreateShipmentBody::default()
        };

        assert_eq!(
            body.into_request().unwrap_err(),
            "missing required fields: receiver_address, parcels"
        );
    }

    #[test]
    fn complete_body_becomes_request() {
        let body: CreateShipmentBody = serde_json::from_value(json!({
            "sender_address": {"country_code": "PL"},
            "receiver_address": {"country_code": "DE"},
            "parcels": [{"weight_kg": "1.0"}],
        }))
        .unwrap();

        let (provider, request) = body.into_request().unwrap();

        assert_eq!(provider, None);
        assert_eq!(request.parcels.len(), 1);
        assert_eq!(request.receiver_address, json!({"country_code": "DE"}));
    }
}
