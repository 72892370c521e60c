//! Repository for shipment lookups and updates.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Shipment, ShipmentId, ShipmentStatus},
    time::Clock,
};

/// Repository for shipment records.
pub struct Repository {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Inserts a shipment.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the ID already exists.
    pub async fn create(&self, shipment: &Shipment) -> Result<ShipmentId> {
        sqlx::query(
            r#"
            INSERT INTO shipments (
                id, provider, status, external_id, tracking_number, label_url,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(shipment.id)
        .bind(&shipment.provider)
        .bind(shipment.status.to_string())
        .bind(&shipment.external_id)
        .bind(&shipment.tracking_number)
        .bind(&shipment.label_url)
        .bind(shipment.created_at)
        .bind(shipment.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(shipment.id)
    }

    /// Finds a shipment by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: ShipmentId) -> Result<Option<Shipment>> {
        let shipment = sqlx::query_as::<_, Shipment>(
            r#"
            SELECT id, provider, status, external_id, tracking_number, label_url,
                   created_at, updated_at
            FROM shipments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(shipment)
    }

    /// Sets a shipment's status and returns the updated row.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_status(
        &self,
        id: ShipmentId,
        status: ShipmentStatus,
    ) -> Result<Option<Shipment>> {
        let shipment = sqlx::query_as::<_, Shipment>(
            r#"
            UPDATE shipments
            SET status = $2, updated_at = $3
            WHERE id = $1
            RETURNING id, provider, status, external_id, tracking_number, label_url,
                      created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(self.clock.now())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(shipment)
    }

    /// Writes the provider-assigned fields and status of `shipment`.
    ///
    /// `updated_at` is set from the clock; `provider` and `created_at` never
    /// change. Returns `None` if the row does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn save(&self, shipment: &Shipment) -> Result<Option<Shipment>> {
        let saved = sqlx::query_as::<_, Shipment>(
            r#"
            UPDATE shipments
            SET status = $2, external_id = $3, tracking_number = $4, label_url = $5,
                updated_at = $6
            WHERE id = $1
            RETURNING id, provider, status, external_id, tracking_number, label_url,
                      created_at, updated_at
            "#,
        )
        .bind(shipment.id)
        .bind(shipment.status.to_string())
        .bind(&shipment.external_id)
        .bind(&shipment.tracking_number)
        .bind(&shipment.label_url)
        .bind(self.clock.now())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(saved)
    }
}
