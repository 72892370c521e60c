//! Built-in provider integration for signed status callbacks.
//!
//! A provider configured here signs each callback body with a shared secret
//! and reports the shipment's new status in the `status` field:
//!
//! ```json
//! {"status": "in_transit", "tracking_number": "TRK123"}
//! ```
//!
//! These providers only push status. Creating shipments, labels and status
//! pulls are left to the `ShippingProvider` defaults and answer
//! `unsupported_operation`.

use std::{future::Future, pin::Pin, str::FromStr, sync::Arc};

use sendparcel_core::{CoreError, Shipment, ShipmentStatus};
use sendparcel_retry::{
    InboundCallback, ProviderError, ProviderRegistry, ShipmentRepository, ShippingProvider,
};
use tracing::{debug, info};

use crate::{
    config::{Config, ProviderSettings},
    crypto::verify_payload_signature,
};

/// Provider whose callbacks carry an HMAC-SHA256 signature and a status.
pub struct SignedStatusProvider {
    slug: String,
    settings: ProviderSettings,
    shipments: Arc<dyn ShipmentRepository>,
}

impl SignedStatusProvider {
    /// Creates a provider for `slug`.
    pub fn new(
        slug: impl Into<String>,
        settings: ProviderSettings,
        shipments: Arc<dyn ShipmentRepository>,
    ) -> Self {
        let settings = ProviderSettings {
            signature_header: settings.signature_header.to_ascii_lowercase(),
            ..settings
        };
        Self { slug: slug.into(), settings, shipments }
    }

    fn requested_status(callback: &InboundCallback) -> Result<ShipmentStatus, ProviderError> {
        let status = callback
            .payload
            .get("status")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProviderError::invalid("payload has no 'status' string"))?;

        ShipmentStatus::from_str(status).map_err(ProviderError::invalid)
    }
}

impl ShippingProvider for SignedStatusProvider {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn verify_callback<'a>(
        &'a self,
        _shipment: &'a Shipment,
        callback: &'a InboundCallback,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            let signature = callback.header(&self.settings.signature_header).unwrap_or_default();
            verify_payload_signature(&callback.payload, signature, &self.settings.signing_secret)
                .map_err(|err| ProviderError::invalid(err.to_string()))
        })
    }

    fn apply_callback<'a>(
        &'a self,
        shipment: &'a Shipment,
        callback: &'a InboundCallback,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            let requested = Self::requested_status(callback)?;

            if requested == shipment.status {
                debug!(shipment_id = %shipment.id, status = %requested, "status unchanged");
                return Ok(shipment.clone());
            }

            if !shipment.status.can_transition_to(requested) {
                return Err(ProviderError::InvalidTransition {
                    from: shipment.status,
                    to: requested,
                });
            }

            let updated = self.shipments.update_status(shipment.id, requested).await.map_err(
                |err| match err {
                    CoreError::NotFound(message) => ProviderError::invalid(message),
                    other => ProviderError::communication(other.to_string()),
                },
            )?;

            info!(
                shipment_id = %shipment.id,
                provider = %self.slug,
                from = %shipment.status,
                to = %updated.status,
                "shipment status updated"
            );
            Ok(updated)
        })
    }
}

/// Builds the registry from the configured providers.
pub fn build_registry(config: &Config, shipments: &Arc<dyn ShipmentRepository>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for (slug, settings) in &config.providers {
        registry.register(Arc::new(SignedStatusProvider::new(
            slug.clone(),
            settings.clone(),
            shipments.clone(),
        )));
    }
    registry
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use sendparcel_core::{Clock, TestClock};
    use sendparcel_retry::repository::memory::InMemoryShipmentRepository;
    use serde_json::json;

    use super::*;
    use crate::crypto::sign_payload;

    const SECRET: &str = "test-secret";

    fn setup() -> (Arc<InMemoryShipmentRepository>, SignedStatusProvider) {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let repository = Arc::new(InMemoryShipmentRepository::new(clock));
        let settings = ProviderSettings {
            signing_secret: SECRET.into(),
            signature_header: "X-Signature".into(),
        };
        let provider = SignedStatusProvider::new("inpost", settings, repository.clone());
        (repository, provider)
    }

    fn signed(shipment: &Shipment, payload: serde_json::Value) -> InboundCallback {
        let signature = sign_payload(&payload, SECRET).unwrap();
        InboundCallback::new(
            "inpost",
            shipment.id,
            payload,
            HashMap::from([("x-signature".to_string(), signature)]),
        )
    }

    #[tokio::test]
    async fn valid_signature_verifies() {
        let (repository, provider) = setup();
        let shipment = repository.insert("inpost", ShipmentStatus::Created).await;

        let callback = signed(&shipment, json!({"status": "in_transit"}));
        assert!(provider.verify_callback(&shipment, &callback).await.is_ok());
    }

    #[tokio::test]
    async fn missing_or_wrong_signature_is_invalid() {
        let (repository, provider) = setup();
        let shipment = repository.insert("inpost", ShipmentStatus::Created).await;

        let unsigned =
            InboundCallback::new("inpost", shipment.id, json!({"status": "delivered"}), HashMap::new());
        let err = provider.verify_callback(&shipment, &unsigned).await.unwrap_err();
        assert!(!err.is_retryable());

        let mut tampered = signed(&shipment, json!({"status": "in_transit"}));
        tampered.payload = json!({"status": "delivered"});
        assert!(provider.verify_callback(&shipment, &tampered).await.is_err());
    }

    #[tokio::test]
    async fn apply_moves_shipment_to_requested_status() {
        let (repository, provider) = setup();
        let shipment = repository.insert("inpost", ShipmentStatus::Created).await;

        let callback = signed(&shipment, json!({"status": "out_for_delivery"}));
        let updated = provider.apply_callback(&shipment, &callback).await.unwrap();

        assert_eq!(updated.status, ShipmentStatus::OutForDelivery);
        assert_eq!(repository.get(shipment.id).await.unwrap().status, ShipmentStatus::OutForDelivery);
    }

    #[tokio::test]
    async fn repeated_apply_is_idempotent() {
        let (repository, provider) = setup();
        let shipment = repository.insert("inpost", ShipmentStatus::Delivered).await;

        let callback = signed(&shipment, json!({"status": "delivered"}));
        let updated = provider.apply_callback(&shipment, &callback).await.unwrap();

        assert_eq!(updated, shipment);
    }

    #[tokio::test]
    async fn backward_or_terminal_transitions_conflict() {
        let (repository, provider) = setup();
        let delivered = repository.insert("inpost", ShipmentStatus::Delivered).await;
        let out = repository.insert("inpost", ShipmentStatus::OutForDelivery).await;

        let reopen = signed(&delivered, json!({"status": "in_transit"}));
        assert!(matches!(
            provider.apply_callback(&delivered, &reopen).await,
            Err(ProviderError::InvalidTransition {
                from: ShipmentStatus::Delivered,
                to: ShipmentStatus::InTransit
            })
        ));

        let back = signed(&out, json!({"status": "label_ready"}));
        assert!(matches!(
            provider.apply_callback(&out, &back).await,
            Err(ProviderError::InvalidTransition { .. })
        ));
        assert_eq!(repository.get(out.id).await.unwrap().status, ShipmentStatus::OutForDelivery);
    }

    #[tokio::test]
    async fn unknown_or_missing_status_is_invalid() {
        let (repository, provider) = setup();
        let created = repository.insert("inpost", ShipmentStatus::Created).await;

        let unknown = signed(&created, json!({"status": "teleported"}));
        assert!(matches!(
            provider.apply_callback(&created, &unknown).await,
            Err(ProviderError::InvalidCallback { .. })
        ));

        let missing = signed(&created, json!({"tracking_number": "TRK1"}));
        assert!(matches!(
            provider.apply_callback(&created, &missing).await,
            Err(ProviderError::InvalidCallback { .. })
        ));
    }

    #[tokio::test]
    async fn repository_outage_is_communication_error() {
        let (repository, provider) = setup();
        let shipment = repository.insert("inpost", ShipmentStatus::Created).await;
        repository.set_unavailable(Some("connection reset".into())).await;

        let callback = signed(&shipment, json!({"status": "in_transit"}));
        let err = provider.apply_callback(&shipment, &callback).await.unwrap_err();

        assert!(err.is_retryable());
    }

    #[test]
    fn registry_contains_configured_providers() {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let shipments: Arc<dyn ShipmentRepository> =
            Arc::new(InMemoryShipmentRepository::new(clock));
        let config = Config {
            providers: HashMap::from([
                (
                    "inpost".to_string(),
                    ProviderSettings { signing_secret: "a".into(), signature_header: "x-a".into() },
                ),
                (
                    "dpd".to_string(),
                    ProviderSettings { signing_secret: "b".into(), signature_header: "x-b".into() },
                ),
            ]),
            ..Config::default()
        };

        let registry = build_registry(&config, &shipments);

        assert_eq!(registry.slugs(), vec!["dpd", "inpost"]);
    }

    #[tokio::test]
    async fn shipment_operations_are_unsupported() {
        let (repository, provider) = setup();
        let shipment = repository.insert("inpost", ShipmentStatus::Created).await;

        assert!(matches!(
            provider.create_label(&shipment).await,
            Err(ProviderError::Unsupported { operation: "create_label" })
        ));
        assert!(matches!(
            provider.fetch_status(&shipment).await,
            Err(ProviderError::Unsupported { .. })
        ));
    }
}
