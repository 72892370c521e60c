//! Shipping provider integrations and the registry that resolves them.

use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

use sendparcel_core::{RetryView, Shipment, ShipmentId, ShipmentStatus};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// A callback as received from a provider, or as replayed from the retry
/// queue.
///
/// Header names are lower-case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundCallback {
    /// Slug of the provider the callback claims to come from.
    pub provider_slug: String,

    /// Shipment the callback is about.
    pub shipment_id: ShipmentId,

    /// Decoded JSON body.
    pub payload: serde_json::Value,

    /// Request headers.
    pub headers: HashMap<String, String>,
}

impl InboundCallback {
    /// Creates a callback from its parts.
    pub fn new(
        provider_slug: impl Into<String>,
        shipment_id: ShipmentId,
        payload: serde_json::Value,
        headers: HashMap<String, String>,
    ) -> Self {
        Self { provider_slug: provider_slug.into(), shipment_id, payload, headers }
    }

    /// Looks up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl From<RetryView> for InboundCallback {
    fn from(view: RetryView) -> Self {
        Self {
            provider_slug: view.provider_slug,
            shipment_id: view.shipment_id,
            payload: view.payload,
            headers: view.headers,
        }
    }
}

/// Addresses and parcels a shipment is registered with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRequest {
    /// Where the parcel is picked up.
    pub sender_address: serde_json::Value,
    /// Where the parcel is delivered.
    pub receiver_address: serde_json::Value,
    /// One entry per parcel.
    pub parcels: Vec<serde_json::Value>,
}

/// Identifiers a provider assigns when a shipment is registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderShipment {
    /// Provider's own shipment identifier.
    pub external_id: String,
    /// Carrier tracking number.
    pub tracking_number: String,
}

/// Hooks a shipping provider integration exposes.
///
/// `verify_callback` authenticates the callback and must not have side
/// effects. `apply_callback` performs the state change and returns the
/// shipment as it stands afterwards. Applying the same callback twice must
/// be safe, since retries deliver at least once.
///
/// The provider-initiated operations default to
/// [`ProviderError::Unsupported`]; push-only integrations leave them out.
pub trait ShippingProvider: Send + Sync + 'static {
    /// Slug this integration is registered under.
    fn slug(&self) -> &str;

    /// Authenticates a callback.
    fn verify_callback<'a>(
        &'a self,
        shipment: &'a Shipment,
        callback: &'a InboundCallback,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProviderError>> + Send + 'a>>;

    /// Applies a verified callback to the shipment.
    fn apply_callback<'a>(
        &'a self,
        shipment: &'a Shipment,
        callback: &'a InboundCallback,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment, ProviderError>> + Send + 'a>>;

    /// Registers `shipment` with the provider.
    fn create_shipment<'a>(
        &'a self,
        _shipment: &'a Shipment,
        _request: &'a ShipmentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderShipment, ProviderError>> + Send + 'a>> {
        Box::pin(async { Err(ProviderError::Unsupported { operation: "create_shipment" }) })
    }

    /// Generates a label and returns where it can be downloaded.
    fn create_label<'a>(
        &'a self,
        _shipment: &'a Shipment,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + 'a>> {
        Box::pin(async { Err(ProviderError::Unsupported { operation: "create_label" }) })
    }

    /// Asks the provider for the shipment's current status.
    fn fetch_status<'a>(
        &'a self,
        _shipment: &'a Shipment,
    ) -> Pin<Box<dyn Future<Output = Result<ShipmentStatus, ProviderError>> + Send + 'a>> {
        Box::pin(async { Err(ProviderError::Unsupported { operation: "fetch_status" }) })
    }
}

/// Slug-keyed set of provider integrations.
///
/// Built once at start-up and shared behind an `Arc`.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ShippingProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider, replacing any previous one with the same slug.
    pub fn register(&mut self, provider: Arc<dyn ShippingProvider>) {
        self.providers.insert(provider.slug().to_string(), provider);
    }

    /// Builder-style variant of [`Self::register`].
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn ShippingProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Looks up a provider by slug.
    pub fn get(&self, slug: &str) -> Option<Arc<dyn ShippingProvider>> {
        self.providers.get(slug).cloned()
    }

    /// Registered slugs in sorted order.
    pub fn slugs(&self) -> Vec<&str> {
        let mut slugs: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        slugs.sort_unstable();
        slugs
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true if no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry").field("providers", &self.slugs()).finish()
    }
}
