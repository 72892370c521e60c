//! Shared fixtures for retry pipeline tests.
//!
//! `DummyProvider` accepts callbacks carrying `x-test-token: valid` and moves
//! the shipment to `in_transit` on apply. Its apply step can be switched to
//! time out, reject or conflict so tests can drive every classification
//! path. It also implements the provider-initiated operations, reporting a
//! configurable status on fetch.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use sendparcel_core::{Clock, Shipment, ShipmentId, ShipmentStatus, TestClock};
use sendparcel_retry::{
    memory::InMemoryRetryStore, repository::memory::InMemoryShipmentRepository,
    CallbackDispatcher, InboundCallback, ProviderError, ProviderRegistry, ProviderShipment,
    RetryPolicy, RetrySweep, ShipmentFlow, ShipmentRepository, ShipmentRequest,
    ShippingProvider, SweepConfig,
};
use tokio::sync::RwLock;

pub const PROVIDER: &str = "dummy";
pub const TOKEN_HEADER: &str = "x-test-token";

/// How the dummy provider's apply step behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Succeed,
    Timeout,
    Reject,
    Conflict,
}

pub struct DummyProvider {
    shipments: Arc<InMemoryShipmentRepository>,
    mode: RwLock<ApplyMode>,
    reported: RwLock<ShipmentStatus>,
    applied: AtomicUsize,
}

impl DummyProvider {
    pub fn new(shipments: Arc<InMemoryShipmentRepository>) -> Self {
        Self {
            shipments,
            mode: RwLock::new(ApplyMode::Succeed),
            reported: RwLock::new(ShipmentStatus::InTransit),
            applied: AtomicUsize::new(0),
        }
    }

    pub async fn set_mode(&self, mode: ApplyMode) {
        *self.mode.write().await = mode;
    }

    /// Status `fetch_status` reports from now on.
    pub async fn report_status(&self, status: ShipmentStatus) {
        *self.reported.write().await = status;
    }

    /// Number of apply calls that reached the repository.
    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }
}

impl ShippingProvider for DummyProvider {
    fn slug(&self) -> &str {
        PROVIDER
    }

    fn verify_callback<'a>(
        &'a self,
        _shipment: &'a Shipment,
        callback: &'a InboundCallback,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            match callback.header(TOKEN_HEADER) {
                Some("valid") => Ok(()),
                _ => Err(ProviderError::invalid("invalid token")),
            }
        })
    }

    fn apply_callback<'a>(
        &'a self,
        shipment: &'a Shipment,
        _callback: &'a InboundCallback,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            match *self.mode.read().await {
                ApplyMode::Succeed => {
                    self.applied.fetch_add(1, Ordering::SeqCst);
                    self.shipments
                        .update_status(shipment.id, ShipmentStatus::InTransit)
                        .await
                        .map_err(|err| ProviderError::communication(err.to_string()))
                },
                ApplyMode::Timeout => Err(ProviderError::communication("provider timed out")),
                ApplyMode::Reject => Err(ProviderError::invalid("status transition rejected")),
                ApplyMode::Conflict => Err(ProviderError::InvalidTransition {
                    from: shipment.status,
                    to: ShipmentStatus::InTransit,
                }),
            }
        })
    }

    fn create_shipment<'a>(
        &'a self,
        shipment: &'a Shipment,
        _request: &'a ShipmentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderShipment, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            match *self.mode.read().await {
                ApplyMode::Timeout => Err(ProviderError::communication("provider timed out")),
                _ => Ok(ProviderShipment {
                    external_id: format!("ext-{}", shipment.id),
                    tracking_number: "TRK-1".to_string(),
                }),
            }
        })
    }

    fn create_label<'a>(
        &'a self,
        shipment: &'a Shipment,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + 'a>> {
        Box::pin(async move { Ok(format!("https://labels.test/{}.pdf", shipment.id)) })
    }

    fn fetch_status<'a>(
        &'a self,
        _shipment: &'a Shipment,
    ) -> Pin<Box<dyn Future<Output = Result<ShipmentStatus, ProviderError>> + Send + 'a>> {
        Box::pin(async move { Ok(*self.reported.read().await) })
    }
}

/// Dispatcher, store and provider wired together over a controllable clock.
pub struct Harness {
    pub clock: TestClock,
    pub shipments: Arc<InMemoryShipmentRepository>,
    pub store: Arc<InMemoryRetryStore>,
    pub provider: Arc<DummyProvider>,
    pub dispatcher: Arc<CallbackDispatcher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        let clock = TestClock::at(start_time());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());

        let shipments = Arc::new(InMemoryShipmentRepository::new(shared.clone()));
        let store = Arc::new(InMemoryRetryStore::with_backoff(shared, policy.backoff_seconds));
        let provider = Arc::new(DummyProvider::new(shipments.clone()));
        let registry = ProviderRegistry::new().with(provider.clone());

        let dispatcher = Arc::new(
            CallbackDispatcher::new(shipments.clone(), Arc::new(registry), policy)
                .with_retry_store(store.clone()),
        );

        Self { clock, shipments, store, provider, dispatcher }
    }

    pub fn flow(&self) -> ShipmentFlow {
        let shared: Arc<dyn Clock> = Arc::new(self.clock.clone());
        ShipmentFlow::new(
            self.dispatcher.shipments().clone(),
            self.dispatcher.registry().clone(),
            shared,
        )
    }

    pub fn sweep(&self) -> RetrySweep {
        self.sweep_with(SweepConfig::default())
    }

    pub fn sweep_with(&self, config: SweepConfig) -> RetrySweep {
        RetrySweep::new(self.dispatcher.clone(), self.store.clone(), config)
    }

    pub async fn shipment(&self) -> Shipment {
        self.shipments.insert(PROVIDER, ShipmentStatus::Created).await
    }

    /// Moves the clock far enough that every pending record is due.
    pub fn advance_past_backoff(&self) {
        self.clock.advance(Duration::from_secs(24 * 60 * 60));
    }
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
}

pub fn callback(shipment_id: ShipmentId, token: &str) -> InboundCallback {
    let headers = HashMap::from([(TOKEN_HEADER.to_string(), token.to_string())]);
    InboundCallback::new(PROVIDER, shipment_id, serde_json::json!({"status": "in_transit"}), headers)
}
