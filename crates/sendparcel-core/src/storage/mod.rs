//! Database access layer implementing the repository pattern.
//!
//! The repositories translate between domain models and the PostgreSQL
//! schema. All SQL lives in this module; callers above it work with
//! `Shipment` and `RetryRecord` only.

use std::sync::Arc;

use sqlx::PgPool;

pub mod callback_retries;
pub mod shipments;

use crate::{error::Result, time::Clock};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS shipments (
        id UUID PRIMARY KEY,
        provider TEXT NOT NULL,
        status TEXT NOT NULL,
        external_id TEXT NOT NULL DEFAULT '',
        tracking_number TEXT NOT NULL DEFAULT '',
        label_url TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS callback_retries (
        id UUID PRIMARY KEY,
        shipment_id UUID NOT NULL,
        provider_slug TEXT NOT NULL,
        payload JSONB NOT NULL,
        headers JSONB NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        next_retry_at TIMESTAMPTZ NOT NULL,
        claimed_until TIMESTAMPTZ,
        claim_token UUID,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    "ALTER TABLE callback_retries ADD COLUMN IF NOT EXISTS claim_token UUID",
    r"
    CREATE INDEX IF NOT EXISTS idx_callback_retries_due
    ON callback_retries(status, next_retry_at)
    WHERE status IN ('pending', 'processing')
    ",
];

/// Creates the tables and indexes the repositories need.
///
/// Every statement is idempotent, so this runs on each startup.
///
/// # Errors
///
/// Returns `CoreError::Database` if a statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for &statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!(statements = SCHEMA.len(), "schema up to date");
    Ok(())
}

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for the callback retry queue.
    pub callback_retries: Arc<callback_retries::Repository>,

    /// Repository for shipment lookups and status updates.
    pub shipments: Arc<shipments::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool, clock: &Arc<dyn Clock>) -> Self {
        let pool = Arc::new(pool);

        Self {
            callback_retries: Arc::new(callback_retries::Repository::new(
                pool.clone(),
                clock.clone(),
            )),
            shipments: Arc::new(shipments::Repository::new(pool, clock.clone())),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) =
            sqlx::query_as("SELECT 1").fetch_one(&*self.callback_retries.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::RealClock;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let _storage = Storage::new(pool, &clock);
    }
}
