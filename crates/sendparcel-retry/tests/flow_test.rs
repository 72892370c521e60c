//! Shipment flow tests.
//!
//! Creating shipments, generating labels and pulling status through the
//! dummy provider, including the transitions the flow refuses.

mod common;

use common::{ApplyMode, Harness, PROVIDER};
use sendparcel_core::{ShipmentId, ShipmentStatus};
use sendparcel_retry::{ShipmentError, ShipmentRequest};

fn request() -> ShipmentRequest {
    ShipmentRequest {
        sender_address: serde_json::json!({"country_code": "PL"}),
        receiver_address: serde_json::json!({"country_code": "DE"}),
        parcels: vec![serde_json::json!({"weight_kg": "1.0"})],
    }
}

#[tokio::test]
async fn create_label_and_status_walk_the_lifecycle() {
    let harness = Harness::new();
    let flow = harness.flow();

    let created = flow.create_shipment(Some(PROVIDER), &request()).await.unwrap();
    assert_eq!(created.status, ShipmentStatus::Created);
    assert_eq!(created.provider, PROVIDER);
    assert_eq!(created.external_id, format!("ext-{}", created.id));
    assert_eq!(created.tracking_number, "TRK-1");

    let labelled = flow.create_label(created.id).await.unwrap();
    assert_eq!(labelled.status, ShipmentStatus::LabelReady);
    assert_eq!(labelled.label_url, format!("https://labels.test/{}.pdf", created.id));
    assert_eq!(labelled.external_id, created.external_id);

    let pulled = flow.fetch_status(created.id).await.unwrap();
    assert_eq!(pulled.status, ShipmentStatus::InTransit);
    assert_eq!(
        harness.shipments.get(created.id).await.map(|s| s.status),
        Some(ShipmentStatus::InTransit)
    );
}

#[tokio::test]
async fn default_provider_is_used_when_none_is_named() {
    let harness = Harness::new();

    let err = harness.flow().create_shipment(None, &request()).await.unwrap_err();
    assert_eq!(err.code(), "configuration_error");

    let flow = harness.flow().with_default_provider(Some(PROVIDER.to_string()));
    let created = flow.create_shipment(None, &request()).await.unwrap();
    assert_eq!(created.provider, PROVIDER);
}

#[tokio::test]
async fn unknown_provider_is_a_configuration_error() {
    let harness = Harness::new();

    let err = harness.flow().create_shipment(Some("dhl"), &request()).await.unwrap_err();

    assert!(matches!(err, ShipmentError::Configuration { .. }));
}

#[tokio::test]
async fn provider_outage_on_create_is_a_communication_error() {
    let harness = Harness::new();
    harness.provider.set_mode(ApplyMode::Timeout).await;

    let err = harness.flow().create_shipment(Some(PROVIDER), &request()).await.unwrap_err();

    assert_eq!(err.code(), "communication_error");
}

/// Labels cannot be generated once the parcel is on its way.
#[tokio::test]
async fn label_after_pickup_is_a_conflict() {
    let harness = Harness::new();
    let shipment = harness.shipments.insert(PROVIDER, ShipmentStatus::InTransit).await;

    let err = harness.flow().create_label(shipment.id).await.unwrap_err();

    assert!(matches!(
        err,
        ShipmentError::InvalidTransition {
            from: ShipmentStatus::InTransit,
            to: ShipmentStatus::LabelReady
        }
    ));
    assert_eq!(err.code(), "invalid_transition");
    assert_eq!(harness.shipments.get(shipment.id).await.unwrap().label_url, "");
}

#[tokio::test]
async fn relabelling_keeps_label_ready() {
    let harness = Harness::new();
    let shipment = harness.shipments.insert(PROVIDER, ShipmentStatus::LabelReady).await;

    let labelled = harness.flow().create_label(shipment.id).await.unwrap();

    assert_eq!(labelled.status, ShipmentStatus::LabelReady);
    assert!(!labelled.label_url.is_empty());
}

/// A pulled status that would move a terminal shipment is refused and the
/// stored status kept.
#[tokio::test]
async fn pulled_status_cannot_reopen_a_delivered_shipment() {
    let harness = Harness::new();
    let shipment = harness.shipments.insert(PROVIDER, ShipmentStatus::Delivered).await;
    harness.provider.report_status(ShipmentStatus::InTransit).await;

    let err = harness.flow().fetch_status(shipment.id).await.unwrap_err();

    assert_eq!(err.code(), "invalid_transition");
    assert_eq!(
        harness.shipments.get(shipment.id).await.map(|s| s.status),
        Some(ShipmentStatus::Delivered)
    );
}

#[tokio::test]
async fn unchanged_status_is_not_a_transition() {
    let harness = Harness::new();
    let shipment = harness.shipments.insert(PROVIDER, ShipmentStatus::Delivered).await;
    harness.provider.report_status(ShipmentStatus::Delivered).await;

    let pulled = harness.flow().fetch_status(shipment.id).await.unwrap();

    assert_eq!(pulled, shipment);
}

#[tokio::test]
async fn missing_shipment_is_not_found() {
    let harness = Harness::new();
    let missing = ShipmentId::new();

    let err = harness.flow().create_label(missing).await.unwrap_err();
    assert!(matches!(err, ShipmentError::NotFound { shipment_id } if shipment_id == missing));

    let err = harness.flow().fetch_status(missing).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn repository_outage_is_a_storage_error() {
    let harness = Harness::new();
    let shipment = harness.shipment().await;
    harness.shipments.set_unavailable(Some("connection reset".to_string())).await;

    let err = harness.flow().fetch_status(shipment.id).await.unwrap_err();

    assert_eq!(err.code(), "storage_error");
}
