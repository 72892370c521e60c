//! Callback dispatch with durable, backed-off retry.
//!
//! Shipping providers report shipment progress through callbacks. This crate
//! routes each callback to the provider integration that owns the shipment
//! and guarantees that callbacks which failed for transient reasons are
//! replayed later.
//!
//! # Architecture
//!
//! 1. **Dispatch** - [`CallbackDispatcher`] resolves the shipment, checks the
//!    provider, verifies and applies the callback.
//! 2. **Classify** - permanent failures are reported and dropped; transient
//!    failures are written to the [`RetryStore`] and then reported.
//! 3. **Sweep** - [`RetrySweep`] claims due records with `FOR UPDATE SKIP
//!    LOCKED`, replays them and marks each succeeded, rescheduled or
//!    exhausted.
//! 4. **Schedule** - [`SweepWorker`] runs sweep passes on an interval until
//!    cancelled.
//!
//! Replays are fenced by the claim they were handed out under: once a lease
//! lapses and another pass reclaims the record, the late pass can no longer
//! record an outcome.
//!
//! [`ShipmentFlow`] covers the provider-initiated side: creating shipments,
//! generating labels and pulling status.
//!
//! Backoff is exponential: a record that has failed `n` times waits
//! `base * 2^n` before its next replay.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sendparcel_core::{RealClock, ShipmentId};
//! use sendparcel_retry::{
//!     memory::InMemoryRetryStore, repository::memory::InMemoryShipmentRepository,
//!     CallbackDispatcher, InboundCallback, ProviderRegistry, RetryPolicy,
//! };
//!
//! # async fn example() {
//! let clock = Arc::new(RealClock::new());
//! let shipments = Arc::new(InMemoryShipmentRepository::new(clock.clone()));
//! let store = Arc::new(InMemoryRetryStore::new(clock));
//!
//! let dispatcher =
//!     CallbackDispatcher::new(shipments, Arc::new(ProviderRegistry::new()), RetryPolicy::default())
//!         .with_retry_store(store);
//!
//! let callback = InboundCallback::new(
//!     "inpost",
//!     ShipmentId::new(),
//!     serde_json::json!({"status": "in_transit"}),
//!     Default::default(),
//! );
//! let _ = dispatcher.handle_callback(callback).await;
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod dispatcher;
pub mod error;
pub mod flow;
pub mod provider;
pub mod repository;
pub mod storage;
pub mod sweep;
pub mod worker;

pub use backoff::{compute_next_retry_at, RetryPolicy};
pub use dispatcher::{CallbackAccepted, CallbackDispatcher};
pub use error::{CallbackError, ProviderError, Result, ShipmentError};
pub use flow::ShipmentFlow;
pub use provider::{
    InboundCallback, ProviderRegistry, ProviderShipment, ShipmentRequest, ShippingProvider,
};
pub use repository::{PostgresShipmentRepository, ShipmentRepository};
pub use storage::{memory, PostgresRetryStore, RetryStore};
pub use sweep::{RecordOutcome, RetrySweep, SweepConfig, SweepReport};
pub use worker::{SweepHandle, SweepStats, SweepWorker, WorkerConfig};
