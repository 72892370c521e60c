//! Provider-initiated shipment operations.
//!
//! Creating a shipment, generating its label and pulling its status all go
//! through the shipment's provider and then persist what the provider
//! returned. The status change an operation implies is checked before the
//! provider is called, so a forbidden transition never reaches the provider.

use std::sync::Arc;

use sendparcel_core::{Clock, Shipment, ShipmentId, ShipmentStatus};
use tracing::{debug, info, warn};

use crate::{
    error::ShipmentError,
    provider::{ProviderRegistry, ShipmentRequest, ShippingProvider},
    repository::ShipmentRepository,
};

type Result<T> = std::result::Result<T, ShipmentError>;

/// Runs shipment operations against registered providers.
pub struct ShipmentFlow {
    shipments: Arc<dyn ShipmentRepository>,
    registry: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    default_provider: Option<String>,
}

impl ShipmentFlow {
    /// Creates a flow without a default provider.
    pub fn new(
        shipments: Arc<dyn ShipmentRepository>,
        registry: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { shipments, registry, clock, default_provider: None }
    }

    /// Sets the provider used when a create request names none.
    #[must_use]
    pub fn with_default_provider(mut self, slug: Option<String>) -> Self {
        self.default_provider = slug;
        self
    }

    /// Registers a new shipment with `provider`, or the default provider.
    ///
    /// The shipment is stored as `created` with the identifiers the provider
    /// assigned. Nothing is stored if the provider call fails.
    ///
    /// # Errors
    ///
    /// - `Configuration` if no provider is named and none is the default, or
    ///   the slug is not registered.
    /// - `Unsupported`, `InvalidRequest` or `Communication` from the provider.
    /// - `Storage` if the insert fails.
    pub async fn create_shipment(
        &self,
        provider: Option<&str>,
        request: &ShipmentRequest,
    ) -> Result<Shipment> {
        let slug = provider.or(self.default_provider.as_deref()).ok_or_else(|| {
            ShipmentError::Configuration {
                reason: "no provider given and no default provider configured".to_string(),
            }
        })?;
        let integration = self.provider(slug)?;

        let mut shipment = Shipment::new(slug, ShipmentStatus::New, self.clock.now());
        let assigned = integration
            .create_shipment(&shipment, request)
            .await
            .map_err(|err| ShipmentError::from_provider(slug, err))?;

        shipment.external_id = assigned.external_id;
        shipment.tracking_number = assigned.tracking_number;
        shipment.status = ShipmentStatus::Created;

        let id = shipment.id;
        let created =
            self.shipments.create(shipment).await.map_err(|err| ShipmentError::from_core(id, err))?;

        info!(
            shipment_id = %created.id,
            provider = %created.provider,
            external_id = %created.external_id,
            "shipment created"
        );
        Ok(created)
    }

    /// Generates a label and moves the shipment to `label_ready`.
    ///
    /// Asking again while the shipment is `label_ready` replaces the label.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the shipment does not exist.
    /// - `InvalidTransition` if the shipment is already past `label_ready`.
    /// - Provider and storage failures as for [`Self::create_shipment`].
    pub async fn create_label(&self, id: ShipmentId) -> Result<Shipment> {
        let mut shipment = self.load(id).await?;
        if shipment.status != ShipmentStatus::LabelReady {
            ensure_transition(&shipment, ShipmentStatus::LabelReady)?;
        }
        let integration = self.provider(&shipment.provider)?;

        let label_url = integration
            .create_label(&shipment)
            .await
            .map_err(|err| ShipmentError::from_provider(&shipment.provider, err))?;

        shipment.label_url = label_url;
        shipment.status = ShipmentStatus::LabelReady;
        let saved =
            self.shipments.save(shipment).await.map_err(|err| ShipmentError::from_core(id, err))?;

        info!(shipment_id = %id, label_url = %saved.label_url, "shipment label created");
        Ok(saved)
    }

    /// Pulls the current status from the provider and stores it.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the shipment does not exist.
    /// - `InvalidTransition` if the reported status cannot follow the stored
    ///   one; the stored status is kept.
    /// - Provider and storage failures as for [`Self::create_shipment`].
    pub async fn fetch_status(&self, id: ShipmentId) -> Result<Shipment> {
        let shipment = self.load(id).await?;
        let integration = self.provider(&shipment.provider)?;

        let reported = integration
            .fetch_status(&shipment)
            .await
            .map_err(|err| ShipmentError::from_provider(&shipment.provider, err))?;

        if reported == shipment.status {
            debug!(shipment_id = %id, status = %reported, "provider status unchanged");
            return Ok(shipment);
        }
        ensure_transition(&shipment, reported)?;

        let updated = self
            .shipments
            .update_status(id, reported)
            .await
            .map_err(|err| ShipmentError::from_core(id, err))?;

        info!(
            shipment_id = %id,
            from = %shipment.status,
            to = %updated.status,
            "shipment status pulled"
        );
        Ok(updated)
    }

    async fn load(&self, id: ShipmentId) -> Result<Shipment> {
        self.shipments.get_by_id(id).await.map_err(|err| ShipmentError::from_core(id, err))
    }

    fn provider(&self, slug: &str) -> Result<Arc<dyn ShippingProvider>> {
        self.registry.get(slug).ok_or_else(|| ShipmentError::Configuration {
            reason: format!("no provider registered for slug '{slug}'"),
        })
    }
}

fn ensure_transition(shipment: &Shipment, to: ShipmentStatus) -> Result<()> {
    if shipment.status.can_transition_to(to) {
        Ok(())
    } else {
        warn!(shipment_id = %shipment.id, from = %shipment.status, %to, "transition rejected");
        Err(ShipmentError::InvalidTransition { from: shipment.status, to })
    }
}
