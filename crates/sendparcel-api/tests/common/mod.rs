//! Shared fixtures for HTTP tests.
//!
//! Builds the full router over in-memory shipments and retry queue, with a
//! signed `inpost` provider, an `outage` provider whose apply always fails
//! transiently, and a `depot` provider that creates shipments and labels and
//! is the default for `POST /shipments`.

#![allow(dead_code)]

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use sendparcel_api::{
    config::ProviderSettings, create_router, providers::SignedStatusProvider, AppState,
};
use sendparcel_core::{Clock, Shipment, ShipmentStatus, TestClock};
use sendparcel_retry::{
    memory::InMemoryRetryStore, repository::memory::InMemoryShipmentRepository, CallbackDispatcher,
    InboundCallback, ProviderError, ProviderRegistry, ProviderShipment, RetryPolicy, RetryStore,
    ShipmentRepository, ShipmentRequest, ShippingProvider,
};
use serde_json::Value;
use tower::ServiceExt;

pub const SECRET: &str = "inpost-secret";
pub const SIGNED: &str = "inpost";
pub const OUTAGE: &str = "outage";
pub const DEPOT: &str = "depot";

/// Provider that accepts every callback but can never reach its backend.
pub struct OutageProvider;

impl ShippingProvider for OutageProvider {
    fn slug(&self) -> &str {
        OUTAGE
    }

    fn verify_callback<'a>(
        &'a self,
        _shipment: &'a Shipment,
        _callback: &'a InboundCallback,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProviderError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn apply_callback<'a>(
        &'a self,
        _shipment: &'a Shipment,
        _callback: &'a InboundCallback,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment, ProviderError>> + Send + 'a>> {
        Box::pin(async { Err(ProviderError::communication("carrier API timed out")) })
    }
}

/// Provider that supports the shipment operations and reports every parcel
/// as in transit.
pub struct DepotProvider;

impl ShippingProvider for DepotProvider {
    fn slug(&self) -> &str {
        DEPOT
    }

    fn verify_callback<'a>(
        &'a self,
        _shipment: &'a Shipment,
        _callback: &'a InboundCallback,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProviderError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn apply_callback<'a>(
        &'a self,
        shipment: &'a Shipment,
        _callback: &'a InboundCallback,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment, ProviderError>> + Send + 'a>> {
        Box::pin(async move { Ok(shipment.clone()) })
    }

    fn create_shipment<'a>(
        &'a self,
        shipment: &'a Shipment,
        _request: &'a ShipmentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderShipment, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(ProviderShipment {
                external_id: format!("depot-{}", shipment.id),
                tracking_number: "DEP123".to_string(),
            })
        })
    }

    fn create_label<'a>(
        &'a self,
        shipment: &'a Shipment,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + 'a>> {
        Box::pin(async move { Ok(format!("https://depot.test/labels/{}.pdf", shipment.id)) })
    }

    fn fetch_status<'a>(
        &'a self,
        _shipment: &'a Shipment,
    ) -> Pin<Box<dyn Future<Output = Result<ShipmentStatus, ProviderError>> + Send + 'a>> {
        Box::pin(async { Ok(ShipmentStatus::InTransit) })
    }
}

pub struct TestApp {
    pub clock: TestClock,
    pub shipments: Arc<InMemoryShipmentRepository>,
    pub store: Arc<InMemoryRetryStore>,
    pub router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        let clock = TestClock::new();
        let dyn_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let shipments = Arc::new(InMemoryShipmentRepository::new(dyn_clock.clone()));
        let store = Arc::new(InMemoryRetryStore::new(dyn_clock.clone()));

        let repository: Arc<dyn ShipmentRepository> = shipments.clone();
        let settings = ProviderSettings {
            signing_secret: SECRET.to_string(),
            signature_header: "X-Signature".to_string(),
        };
        let registry = ProviderRegistry::new()
            .with(Arc::new(SignedStatusProvider::new(SIGNED, settings, repository.clone())))
            .with(Arc::new(OutageProvider))
            .with(Arc::new(DepotProvider));

        let retry_store: Arc<dyn RetryStore> = store.clone();
        let dispatcher = CallbackDispatcher::new(repository, Arc::new(registry), policy)
            .with_retry_store(retry_store);

        let state = AppState::new(Arc::new(dispatcher), dyn_clock)
            .with_default_provider(Some(DEPOT.to_string()));
        let router = create_router(state, Duration::from_secs(5));

        Self { clock, shipments, store, router }
    }

    pub async fn shipment(&self, provider: &str, status: ShipmentStatus) -> Shipment {
        self.shipments.insert(provider, status).await
    }

    pub async fn post(
        &self,
        uri: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        send(&self.router, request).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
        send(&self.router, request).await
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("request failed");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("response should be JSON")
    };
    (status, body)
}

pub fn shipment_uri(shipment: &Shipment, operation: &str) -> String {
    format!("/shipments/{}/{operation}", shipment.id)
}

pub fn callback_uri(provider: &str, shipment: &Shipment) -> String {
    format!("/callbacks/{provider}/{}", shipment.id)
}

