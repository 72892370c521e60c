//! Repository for the callback retry queue.
//!
//! Every mutation is a single statement or a single transaction holding a
//! row lock, so concurrent sweeps never observe a record with `attempts`
//! updated but `next_retry_at` stale. Mutations only touch non-terminal
//! rows; the returned `bool` says whether a row changed.
//!
//! A mutation given a [`ClaimToken`] is fenced: it only applies while the
//! row is `processing` under that token. Without a token it applies to any
//! non-terminal row.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{ClaimToken, RetryId, RetryRecord, RetryStatus, ShipmentId},
    time::Clock,
};

const RETRY_COLUMNS: &str = "id, shipment_id, provider_slug, payload, headers, attempts, status, \
                             next_retry_at, claimed_until, claim_token, last_error, created_at";

/// Row guard for mutations; `$2` is the optional claim token.
const HELD_BY_CLAIM: &str = "(($2::uuid IS NULL AND status IN ('pending', 'processing')) \
                             OR (status = 'processing' AND claim_token = $2))";

/// Repository for callback retry records.
pub struct Repository {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new pending record.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(
        &self,
        shipment_id: ShipmentId,
        provider_slug: &str,
        payload: &serde_json::Value,
        headers: &HashMap<String, String>,
        next_retry_at: DateTime<Utc>,
    ) -> Result<RetryId> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO callback_retries (
                id, shipment_id, provider_slug, payload, headers,
                attempts, status, next_retry_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(RetryId::new())
        .bind(shipment_id)
        .bind(provider_slug)
        .bind(Json(payload))
        .bind(Json(headers))
        .bind(RetryStatus::Pending.to_string())
        .bind(next_retry_at)
        .bind(self.clock.now())
        .fetch_one(&*self.pool)
        .await?;

        Ok(RetryId(id))
    }

    /// Finds a record by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: RetryId) -> Result<Option<RetryRecord>> {
        let record = sqlx::query_as::<_, RetryRecord>(&format!(
            "SELECT {RETRY_COLUMNS} FROM callback_retries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Lists pending records that are due, oldest-due first.
    ///
    /// Read-only: the records stay `pending`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_due(&self, limit: usize) -> Result<Vec<RetryRecord>> {
        let records = sqlx::query_as::<_, RetryRecord>(&format!(
            r#"
            SELECT {RETRY_COLUMNS}
            FROM callback_retries
            WHERE status = 'pending'
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            LIMIT $2
            "#
        ))
        .bind(self.clock.now())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Claims due records for a sweep.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent sweeps claim disjoint
    /// sets. A `processing` record whose lease has expired is claimable
    /// again; that is how work abandoned by a crashed sweep is recovered.
    /// Each call issues a fresh claim token to every row it claims.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_due(
        &self,
        limit: usize,
        claimed_until: DateTime<Utc>,
    ) -> Result<Vec<RetryRecord>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM callback_retries
            WHERE (status = 'pending' AND next_retry_at <= $1)
               OR (status = 'processing' AND claimed_until <= $1)
            ORDER BY next_retry_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let token = ClaimToken::new();
        let mut records = sqlx::query_as::<_, RetryRecord>(&format!(
            r#"
            UPDATE callback_retries
            SET status = 'processing', claimed_until = $2, claim_token = $3
            WHERE id = ANY($1)
            RETURNING {RETRY_COLUMNS}
            "#
        ))
        .bind(&ids)
        .bind(claimed_until)
        .bind(token)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            claimed = records.len(),
            %claimed_until,
            claim = %token,
            "claimed due callback retries"
        );

        records.sort_by_key(|record| record.next_retry_at);
        Ok(records)
    }

    /// Marks a record as succeeded.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_succeeded(&self, id: RetryId, claim: Option<ClaimToken>) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE callback_retries
            SET status = 'succeeded', claimed_until = NULL, claim_token = NULL
            WHERE id = $1 AND {HELD_BY_CLAIM}
            "#
        ))
        .bind(id)
        .bind(claim)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records a failed attempt and reschedules the record.
    ///
    /// `schedule` receives the new attempt count and returns the next
    /// eligible time; it runs while the row lock is held so the count and
    /// the deadline are written together.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn mark_failed<F>(
        &self,
        id: RetryId,
        claim: Option<ClaimToken>,
        error: &str,
        schedule: F,
    ) -> Result<bool>
    where
        F: FnOnce(u32) -> DateTime<Utc> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let attempts: Option<i32> = sqlx::query_scalar(&format!(
            r#"
            SELECT attempts FROM callback_retries
            WHERE id = $1 AND {HELD_BY_CLAIM}
            FOR UPDATE
            "#
        ))
        .bind(id)
        .bind(claim)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(attempts) = attempts else {
            tx.rollback().await?;
            tracing::warn!(retry_id = %id, "no active retry record to mark failed");
            return Ok(false);
        };

        let attempts = attempts.saturating_add(1);
        let next_retry_at = schedule(u32::try_from(attempts).unwrap_or(u32::MAX));

        sqlx::query(
            r#"
            UPDATE callback_retries
            SET attempts = $2,
                last_error = $3,
                next_retry_at = $4,
                status = 'pending',
                claimed_until = NULL,
                claim_token = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(next_retry_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Moves a record to the dead-letter state.
    ///
    /// `attempts` is left as it was: a record exhausted by its attempt budget
    /// keeps `max_attempts - 1`, the final failure is only kept in
    /// `last_error`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_exhausted(
        &self,
        id: RetryId,
        claim: Option<ClaimToken>,
        reason: &str,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE callback_retries
            SET status = 'exhausted', last_error = $3, claimed_until = NULL, claim_token = NULL
            WHERE id = $1 AND {HELD_BY_CLAIM}
            "#
        ))
        .bind(id)
        .bind(claim)
        .bind(reason)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns a claimed record to `pending` without counting an attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release(&self, id: RetryId, claim: Option<ClaimToken>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE callback_retries
            SET status = 'pending', claimed_until = NULL, claim_token = NULL
            WHERE id = $1 AND status = 'processing'
              AND ($2::uuid IS NULL OR claim_token = $2)
            "#,
        )
        .bind(id)
        .bind(claim)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts records that are not yet terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_pending(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM callback_retries WHERE status IN ('pending', 'processing')",
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
