//! HTTP surface for shipping-provider callbacks.
//!
//! Exposes `POST /callbacks/{provider_slug}/{shipment_id}`, retry queue
//! statistics, the `/shipments` operations, and health checks. Everything
//! behind the routes lives in `sendparcel-retry`; this crate decodes requests,
//! maps outcomes to status codes, and owns configuration and the built-in
//! signed provider.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use sendparcel_core::{storage::Storage, Clock};
use sendparcel_retry::{CallbackDispatcher, RetryStore, ShipmentFlow};

pub mod config;
pub mod crypto;
pub mod handlers;
pub mod providers;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Callback dispatcher.
    pub dispatcher: Arc<CallbackDispatcher>,
    /// Shipment operations over the dispatcher's repository and providers.
    pub shipment_flow: Arc<ShipmentFlow>,
    /// Retry queue, when retries are configured.
    pub retry_store: Option<Arc<dyn RetryStore>>,
    /// Database handle used by health checks, absent for in-memory setups.
    pub storage: Option<Arc<Storage>>,
    /// Clock for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates state around a dispatcher; the retry store, shipment
    /// repository and providers are taken from it.
    pub fn new(dispatcher: Arc<CallbackDispatcher>, clock: Arc<dyn Clock>) -> Self {
        let retry_store = dispatcher.retry_store().cloned();
        let shipment_flow = Arc::new(ShipmentFlow::new(
            dispatcher.shipments().clone(),
            dispatcher.registry().clone(),
            clock.clone(),
        ));
        Self { dispatcher, shipment_flow, retry_store, storage: None, clock }
    }

    /// Sets the provider used by `POST /shipments` when the body names none.
    #[must_use]
    pub fn with_default_provider(mut self, slug: Option<String>) -> Self {
        let flow = ShipmentFlow::new(
            self.dispatcher.shipments().clone(),
            self.dispatcher.registry().clone(),
            self.clock.clone(),
        );
        self.shipment_flow = Arc::new(flow.with_default_provider(slug));
        self
    }

    /// Attaches the database checked by `/health`.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }
}
