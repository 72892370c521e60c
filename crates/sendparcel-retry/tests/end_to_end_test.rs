//! Full callback lifecycle: rejected, queued, replayed.
//!
//! A forged callback is rejected without touching the queue, a genuine one
//! that times out is queued once, and the next sweep delivers it.

mod common;

use common::{callback, ApplyMode, Harness};
use sendparcel_core::{RetryStatus, ShipmentStatus};
use sendparcel_retry::{CallbackError, RetryStore};

#[tokio::test]
async fn rejected_then_queued_then_replayed() {
    let harness = Harness::new();
    let shipment = harness.shipment().await;

    // Bad token: permanent, nothing queued.
    let err = harness.dispatcher.handle_callback(callback(shipment.id, "bad")).await.unwrap_err();
    assert!(matches!(err, CallbackError::InvalidCallback { .. }));
    assert_eq!(harness.store.count_pending().await.unwrap(), 0);

    // Good token, provider times out: transient, one record.
    harness.provider.set_mode(ApplyMode::Timeout).await;
    let err = harness.dispatcher.handle_callback(callback(shipment.id, "valid")).await.unwrap_err();
    assert!(matches!(err, CallbackError::Communication { queued: Some(_), .. }));

    let records = harness.store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 0);
    assert_eq!(records[0].status, RetryStatus::Pending);

    // Provider recovers; the sweep delivers the callback.
    harness.provider.set_mode(ApplyMode::Succeed).await;
    harness.advance_past_backoff();

    let sweep = harness.sweep();
    let report = sweep.process_due_retries().await.unwrap();
    assert_eq!(report.processed, 1);

    let record = harness.store.find_by_id(records[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, RetryStatus::Succeeded);
    assert_eq!(
        harness.shipments.get(shipment.id).await.map(|s| s.status),
        Some(ShipmentStatus::InTransit)
    );

    // Subsequent passes ignore the finished record.
    harness.advance_past_backoff();
    assert_eq!(sweep.process_due_retries().await.unwrap().processed, 0);
    assert_eq!(harness.store.count_pending().await.unwrap(), 0);
    assert_eq!(harness.provider.applied(), 1);
}
