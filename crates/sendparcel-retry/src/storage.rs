//! Storage abstraction for the callback retry queue.
//!
//! The dispatcher and the sweep only ever talk to `RetryStore`. Production
//! wraps the PostgreSQL repository in `sendparcel_core::storage`; tests use
//! the in-memory store in [`memory`], which honours the same state machine.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use sendparcel_core::{
    error::Result, storage::Storage, ClaimToken, Clock, RetryId, RetryRecord, RetryView,
    ShipmentId,
};

use crate::backoff::compute_next_retry_at;

/// Durable queue of callbacks that failed transiently.
///
/// Every mutation is atomic per record. Mutations addressed to an unknown id
/// or to a record that is already `succeeded` or `exhausted` change nothing
/// and report `false`.
///
/// Mutations take the [`ClaimToken`] a record was claimed under. With
/// `Some(token)` they only apply while the record is still `processing`
/// under that token, so a sweep that outlived its lease reports `false`
/// instead of overwriting the sweep that reclaimed the record. `None`
/// applies to any non-terminal record.
pub trait RetryStore: Send + Sync + 'static {
    /// Persists a failed callback as a new `pending` record.
    ///
    /// The record starts with zero attempts and becomes due one base backoff
    /// interval from now.
    fn store_failed_callback(
        &self,
        shipment_id: ShipmentId,
        provider_slug: String,
        payload: serde_json::Value,
        headers: HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<RetryId>> + Send + '_>>;

    /// Lists up to `limit` pending records that are due, oldest-due first.
    ///
    /// Read-only; concurrent sweeps should use `claim_due_retries` instead.
    fn get_due_retries(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RetryView>>> + Send + '_>>;

    /// Claims up to `limit` due records for exclusive processing.
    ///
    /// Claimed records move to `processing` for `lease` under a fresh claim
    /// token, carried in each returned view. Records whose lease has lapsed
    /// are claimable again.
    fn claim_due_retries(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RetryView>>> + Send + '_>>;

    /// Marks a record as succeeded. Idempotent.
    fn mark_succeeded(
        &self,
        id: RetryId,
        claim: Option<ClaimToken>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Counts a failed attempt and reschedules the record.
    fn mark_failed(
        &self,
        id: RetryId,
        claim: Option<ClaimToken>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Moves a record to the terminal `exhausted` state.
    ///
    /// `attempts` is not incremented: a record exhausted because its budget
    /// ran out keeps `max_attempts - 1` attempts, and the final failure is
    /// only recorded as `last_error`.
    fn mark_exhausted(
        &self,
        id: RetryId,
        claim: Option<ClaimToken>,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Returns a claimed record to `pending` without counting an attempt.
    fn release_claim(
        &self,
        id: RetryId,
        claim: Option<ClaimToken>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Counts records that are still awaiting a successful replay.
    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Loads a single record, whatever its status.
    fn find_by_id(
        &self,
        id: RetryId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RetryRecord>>> + Send + '_>>;
}

fn lease_until(clock: &dyn Clock, lease: Duration) -> chrono::DateTime<chrono::Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
    clock.now().checked_add_signed(lease).unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

/// Production retry store backed by PostgreSQL.
pub struct PostgresRetryStore {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    backoff_seconds: u64,
}

impl PostgresRetryStore {
    /// Creates a new PostgreSQL retry store.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>, backoff_seconds: u64) -> Self {
        Self { storage, clock, backoff_seconds }
    }
}

impl RetryStore for PostgresRetryStore {
    fn store_failed_callback(
        &self,
        shipment_id: ShipmentId,
        provider_slug: String,
        payload: serde_json::Value,
        headers: HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<RetryId>> + Send + '_>> {
        Box::pin(async move {
            let next_retry_at = compute_next_retry_at(self.clock.now(), 1, self.backoff_seconds);
            self.storage
                .callback_retries
                .create(shipment_id, &provider_slug, &payload, &headers, next_retry_at)
                .await
        })
    }

    fn get_due_retries(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RetryView>>> + Send + '_>> {
        Box::pin(async move {
            let records = self.storage.callback_retries.find_due(limit).await?;
            Ok(records.iter().map(RetryRecord::view).collect())
        })
    }

    fn claim_due_retries(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RetryView>>> + Send + '_>> {
        Box::pin(async move {
            let claimed_until = lease_until(self.clock.as_ref(), lease);
            let records = self.storage.callback_retries.claim_due(limit, claimed_until).await?;
            Ok(records.iter().map(RetryRecord::view).collect())
        })
    }

    fn mark_succeeded(
        &self,
        id: RetryId,
        claim: Option<ClaimToken>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.callback_retries.mark_succeeded(id, claim).await })
    }

    fn mark_failed(
        &self,
        id: RetryId,
        claim: Option<ClaimToken>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now();
            let backoff_seconds = self.backoff_seconds;
            self.storage
                .callback_retries
                .mark_failed(id, claim, &error, move |attempts| {
                    compute_next_retry_at(now, attempts.saturating_add(1), backoff_seconds)
                })
                .await
        })
    }

    fn mark_exhausted(
        &self,
        id: RetryId,
        claim: Option<ClaimToken>,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.callback_retries.mark_exhausted(id, claim, &reason).await })
    }

    fn release_claim(
        &self,
        id: RetryId,
        claim: Option<ClaimToken>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.callback_retries.release(id, claim).await })
    }

    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.callback_retries.count_pending().await })
    }

    fn find_by_id(
        &self,
        id: RetryId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RetryRecord>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.callback_retries.find_by_id(id).await })
    }
}

pub mod memory {
    //! In-memory retry store.
    //!
    //! Implements the same transitions as the PostgreSQL store behind a
    //! single `RwLock`, so each mutation is atomic with respect to every
    //! other. Supports injecting storage failures to exercise the paths
    //! where the queue itself is unavailable.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

    use sendparcel_core::{
        error::Result, ClaimToken, Clock, CoreError, RetryId, RetryRecord, RetryStatus,
        RetryView, ShipmentId,
    };
    use sqlx::types::Json;
    use tokio::sync::RwLock;

    use super::{lease_until, RetryStore};
    use crate::backoff::{compute_next_retry_at, DEFAULT_BACKOFF_SECONDS};

    /// Retry store holding records in a map.
    #[derive(Clone)]
    pub struct InMemoryRetryStore {
        records: Arc<RwLock<HashMap<RetryId, RetryRecord>>>,
        failure: Arc<RwLock<Option<String>>>,
        clock: Arc<dyn Clock>,
        backoff_seconds: u64,
    }

    impl InMemoryRetryStore {
        /// Creates an empty store using the default backoff.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self::with_backoff(clock, DEFAULT_BACKOFF_SECONDS)
        }

        /// Creates an empty store with a specific base backoff.
        pub fn with_backoff(clock: Arc<dyn Clock>, backoff_seconds: u64) -> Self {
            Self {
                records: Arc::new(RwLock::new(HashMap::new())),
                failure: Arc::new(RwLock::new(None)),
                clock,
                backoff_seconds,
            }
        }

        /// Makes every subsequent operation fail with a database error until
        /// [`Self::clear_failure`] is called.
        pub async fn inject_failure(&self, message: impl Into<String>) {
            *self.failure.write().await = Some(message.into());
        }

        /// Stops failing operations.
        pub async fn clear_failure(&self) {
            *self.failure.write().await = None;
        }

        /// Returns a snapshot of every record, oldest first.
        pub async fn records(&self) -> Vec<RetryRecord> {
            let mut records: Vec<RetryRecord> =
                self.records.read().await.values().cloned().collect();
            records.sort_by_key(|record| record.created_at);
            records
        }

        /// Total number of records regardless of status.
        pub async fn len(&self) -> usize {
            self.records.read().await.len()
        }

        /// Returns true if the store holds no records.
        pub async fn is_empty(&self) -> bool {
            self.records.read().await.is_empty()
        }

        async fn check_available(&self) -> Result<()> {
            match self.failure.read().await.as_ref() {
                Some(message) => Err(CoreError::Database(message.clone())),
                None => Ok(()),
            }
        }

        fn due_sorted<'a>(
            records: impl Iterator<Item = &'a RetryRecord>,
            limit: usize,
        ) -> Vec<RetryId> {
            let mut due: Vec<&RetryRecord> = records.collect();
            due.sort_by(|a, b| {
                a.next_retry_at.cmp(&b.next_retry_at).then(a.created_at.cmp(&b.created_at))
            });
            due.into_iter().take(limit).map(|record| record.id).collect()
        }

        async fn update_active<F>(
            &self,
            id: RetryId,
            claim: Option<ClaimToken>,
            apply: F,
        ) -> Result<bool>
        where
            F: FnOnce(&mut RetryRecord),
        {
            self.check_available().await?;
            let mut records = self.records.write().await;
            match records.get_mut(&id) {
                Some(record) if held_by(record, claim) => {
                    apply(record);
                    record.claimed_until = None;
                    record.claim_token = None;
                    Ok(true)
                },
                _ => Ok(false),
            }
        }
    }

    fn held_by(record: &RetryRecord, claim: Option<ClaimToken>) -> bool {
        match claim {
            None => !record.status.is_terminal(),
            Some(token) => {
                record.status == RetryStatus::Processing && record.claim_token == Some(token)
            },
        }
    }

    impl RetryStore for InMemoryRetryStore {
        fn store_failed_callback(
            &self,
            shipment_id: ShipmentId,
            provider_slug: String,
            payload: serde_json::Value,
            headers: HashMap<String, String>,
        ) -> Pin<Box<dyn Future<Output = Result<RetryId>> + Send + '_>> {
            Box::pin(async move {
                self.check_available().await?;
                let now = self.clock.now();
                let record = RetryRecord {
                    id: RetryId::new(),
                    shipment_id,
                    provider_slug,
                    payload: Json(payload),
                    headers: Json(headers),
                    attempts: 0,
                    status: RetryStatus::Pending,
                    next_retry_at: compute_next_retry_at(now, 1, self.backoff_seconds),
                    claimed_until: None,
                    claim_token: None,
                    last_error: None,
                    created_at: now,
                };
                let id = record.id;
                self.records.write().await.insert(id, record);
                Ok(id)
            })
        }

        fn get_due_retries(
            &self,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<RetryView>>> + Send + '_>> {
            Box::pin(async move {
                self.check_available().await?;
                let now = self.clock.now();
                let records = self.records.read().await;
                let due = Self::due_sorted(
                    records.values().filter(|record| {
                        record.status == RetryStatus::Pending && record.next_retry_at <= now
                    }),
                    limit,
                );
                Ok(due.iter().filter_map(|id| records.get(id)).map(RetryRecord::view).collect())
            })
        }

        fn claim_due_retries(
            &self,
            limit: usize,
            lease: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<RetryView>>> + Send + '_>> {
            Box::pin(async move {
                self.check_available().await?;
                let now = self.clock.now();
                let claimed_until = lease_until(self.clock.as_ref(), lease);
                let token = ClaimToken::new();
                let mut records = self.records.write().await;

                let due = Self::due_sorted(
                    records.values().filter(|record| match record.status {
                        RetryStatus::Pending => record.next_retry_at <= now,
                        RetryStatus::Processing => {
                            record.claimed_until.is_some_and(|until| until <= now)
                        },
                        RetryStatus::Succeeded | RetryStatus::Exhausted => false,
                    }),
                    limit,
                );

                let mut claimed = Vec::with_capacity(due.len());
                for id in due {
                    if let Some(record) = records.get_mut(&id) {
                        record.status = RetryStatus::Processing;
                        record.claimed_until = Some(claimed_until);
                        record.claim_token = Some(token);
                        claimed.push(record.view());
                    }
                }
                Ok(claimed)
            })
        }

        fn mark_succeeded(
            &self,
            id: RetryId,
            claim: Option<ClaimToken>,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(self.update_active(id, claim, |record| {
                record.status = RetryStatus::Succeeded;
            }))
        }

        fn mark_failed(
            &self,
            id: RetryId,
            claim: Option<ClaimToken>,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            let now = self.clock.now();
            let backoff_seconds = self.backoff_seconds;
            Box::pin(self.update_active(id, claim, move |record| {
                record.attempts = record.attempts.saturating_add(1);
                let attempts = u32::try_from(record.attempts).unwrap_or(u32::MAX);
                record.next_retry_at =
                    compute_next_retry_at(now, attempts.saturating_add(1), backoff_seconds);
                record.last_error = Some(error);
                record.status = RetryStatus::Pending;
            }))
        }

        fn mark_exhausted(
            &self,
            id: RetryId,
            claim: Option<ClaimToken>,
            reason: String,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(self.update_active(id, claim, move |record| {
                record.status = RetryStatus::Exhausted;
                record.last_error = Some(reason);
            }))
        }

        fn release_claim(
            &self,
            id: RetryId,
            claim: Option<ClaimToken>,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(async move {
                self.check_available().await?;
                let mut records = self.records.write().await;
                match records.get_mut(&id) {
                    Some(record)
                        if record.status == RetryStatus::Processing
                            && claim.map_or(true, |token| record.claim_token == Some(token)) =>
                    {
                        record.status = RetryStatus::Pending;
                        record.claimed_until = None;
                        record.claim_token = None;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move {
                self.check_available().await?;
                let records = self.records.read().await;
                let count = records.values().filter(|record| !record.status.is_terminal()).count();
                Ok(u64::try_from(count).unwrap_or(u64::MAX))
            })
        }

        fn find_by_id(
            &self,
            id: RetryId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<RetryRecord>>> + Send + '_>> {
            Box::pin(async move {
                self.check_available().await?;
                Ok(self.records.read().await.get(&id).cloned())
            })
        }
    }
}
