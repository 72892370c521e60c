//! Shipment lookup used by the dispatcher and by provider integrations.
//!
//! The dispatcher only needs to resolve a shipment and providers only need
//! to persist the status a callback moves it to. The shipment flow also
//! creates shipments and saves the identifiers a provider assigns.

use std::{future::Future, pin::Pin, sync::Arc};

use sendparcel_core::{
    error::Result, storage::Storage, CoreError, Shipment, ShipmentId, ShipmentStatus,
};

/// Access to shipment records.
pub trait ShipmentRepository: Send + Sync + 'static {
    /// Loads a shipment, failing with `CoreError::NotFound` if it is absent.
    fn get_by_id(
        &self,
        id: ShipmentId,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>>;

    /// Sets a shipment's status and returns the updated record.
    fn update_status(
        &self,
        id: ShipmentId,
        status: ShipmentStatus,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>>;

    /// Inserts a shipment.
    fn create(&self, shipment: Shipment)
        -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>>;

    /// Persists status and provider-assigned fields of an existing shipment.
    fn save(&self, shipment: Shipment)
        -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>>;
}

fn shipment_not_found(id: ShipmentId) -> CoreError {
    CoreError::NotFound(format!("shipment {id} not found"))
}

/// Shipment repository backed by PostgreSQL.
pub struct PostgresShipmentRepository {
    storage: Arc<Storage>,
}

impl PostgresShipmentRepository {
    /// Creates a new PostgreSQL shipment repository.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl ShipmentRepository for PostgresShipmentRepository {
    fn get_by_id(
        &self,
        id: ShipmentId,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.shipments.find_by_id(id).await?.ok_or_else(|| shipment_not_found(id))
        })
    }

    fn update_status(
        &self,
        id: ShipmentId,
        status: ShipmentStatus,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.shipments.update_status(id, status).await?.ok_or_else(|| shipment_not_found(id))
        })
    }

    fn create(
        &self,
        shipment: Shipment,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.shipments.create(&shipment).await?;
            Ok(shipment)
        })
    }

    fn save(
        &self,
        shipment: Shipment,
    ) -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.shipments.save(&shipment).await?.ok_or_else(|| shipment_not_found(shipment.id))
        })
    }
}

pub mod memory {
    //! In-memory shipment repository for tests and local runs.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use sendparcel_core::{
        error::Result, Clock, CoreError, Shipment, ShipmentId, ShipmentStatus,
    };
    use tokio::sync::RwLock;

    use super::{shipment_not_found, ShipmentRepository};

    /// Shipment repository holding records in a map.
    ///
    /// `set_unavailable` simulates an outage of the backing system: every
    /// call fails with a database error until it is cleared.
    #[derive(Clone)]
    pub struct InMemoryShipmentRepository {
        shipments: Arc<RwLock<HashMap<ShipmentId, Shipment>>>,
        outage: Arc<RwLock<Option<String>>>,
        clock: Arc<dyn Clock>,
    }

    impl InMemoryShipmentRepository {
        /// Creates an empty repository.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                shipments: Arc::new(RwLock::new(HashMap::new())),
                outage: Arc::new(RwLock::new(None)),
                clock,
            }
        }

        /// Creates a shipment for `provider` in `status` and stores it.
        pub async fn insert(&self, provider: &str, status: ShipmentStatus) -> Shipment {
            let shipment = Shipment::new(provider, status, self.clock.now());
            self.shipments.write().await.insert(shipment.id, shipment.clone());
            shipment
        }

        /// Returns the stored shipment without going through the trait.
        pub async fn get(&self, id: ShipmentId) -> Option<Shipment> {
            self.shipments.read().await.get(&id).cloned()
        }

        /// Fails every call with `message` until cleared with `None`.
        pub async fn set_unavailable(&self, message: Option<String>) {
            *self.outage.write().await = message;
        }

        async fn check_available(&self) -> Result<()> {
            match self.outage.read().await.as_ref() {
                Some(message) => Err(CoreError::Database(message.clone())),
                None => Ok(()),
            }
        }
    }

    impl ShipmentRepository for InMemoryShipmentRepository {
        fn get_by_id(
            &self,
            id: ShipmentId,
        ) -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>> {
            Box::pin(async move {
                self.check_available().await?;
                self.shipments.read().await.get(&id).cloned().ok_or_else(|| shipment_not_found(id))
            })
        }

        fn update_status(
            &self,
            id: ShipmentId,
            status: ShipmentStatus,
        ) -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>> {
            Box::pin(async move {
                self.check_available().await?;
                let mut shipments = self.shipments.write().await;
                let shipment = shipments.get_mut(&id).ok_or_else(|| shipment_not_found(id))?;
                shipment.status = status;
                shipment.updated_at = self.clock.now();
                Ok(shipment.clone())
            })
        }

        fn create(
            &self,
            shipment: Shipment,
        ) -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>> {
            Box::pin(async move {
                self.check_available().await?;
                let mut shipments = self.shipments.write().await;
                if shipments.contains_key(&shipment.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "shipment {} already exists",
                        shipment.id
                    )));
                }
                shipments.insert(shipment.id, shipment.clone());
                Ok(shipment)
            })
        }

        fn save(
            &self,
            shipment: Shipment,
        ) -> Pin<Box<dyn Future<Output = Result<Shipment>> + Send + '_>> {
            Box::pin(async move {
                self.check_available().await?;
                let mut shipments = self.shipments.write().await;
                let stored =
                    shipments.get_mut(&shipment.id).ok_or_else(|| shipment_not_found(shipment.id))?;
                stored.status = shipment.status;
                stored.external_id = shipment.external_id;
                stored.tracking_number = shipment.tracking_number;
                stored.label_url = shipment.label_url;
                stored.updated_at = self.clock.now();
                Ok(stored.clone())
            })
        }
    }
}
