//! HTTP request handlers.
//!
//! Every failure is answered with `{"detail": ..., "code": ...}` and a status
//! derived from the error kind.

pub mod callbacks;
pub mod health;
pub mod retries;
pub mod shipments;

pub use callbacks::receive_callback;
pub use health::{health_check, liveness_check, readiness_check};
pub use retries::retry_stats;
pub use shipments::{create_label, create_shipment, fetch_status, shipments_health};
