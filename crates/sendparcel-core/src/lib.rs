//! Core domain models, persistence and time primitives.
//!
//! Provides the shipment and retry-record types shared by the callback
//! pipeline, the PostgreSQL repositories behind them, and the clock
//! abstraction every scheduling decision is computed from.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    ClaimToken, RetryId, RetryRecord, RetryStatus, RetryView, Shipment, ShipmentId,
    ShipmentStatus,
};
pub use time::{Clock, RealClock, TestClock};
