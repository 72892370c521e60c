//! Callback dispatch: resolve, verify, apply, classify.
//!
//! A callback that fails permanently (unknown shipment, wrong provider,
//! failed verification, invalid content) is reported and dropped. A callback
//! that fails because a downstream system could not be reached is persisted
//! to the retry queue before the failure is reported, so the caller still
//! sees the outage but recovery is guaranteed.

use std::sync::Arc;

use sendparcel_core::{CoreError, RetryId, Shipment, ShipmentStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::RetryPolicy,
    error::{CallbackError, ProviderError, Result},
    provider::{InboundCallback, ProviderRegistry, ShippingProvider},
    repository::ShipmentRepository,
    storage::RetryStore,
};

/// Outcome of a callback that was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAccepted {
    /// Provider slug that handled the callback.
    pub provider: String,

    /// Status of the shipment after the callback.
    pub shipment_status: ShipmentStatus,
}

/// Routes callbacks to provider integrations.
pub struct CallbackDispatcher {
    shipments: Arc<dyn ShipmentRepository>,
    registry: Arc<ProviderRegistry>,
    retry_store: Option<Arc<dyn RetryStore>>,
    policy: RetryPolicy,
}

impl CallbackDispatcher {
    /// Creates a dispatcher without a retry queue.
    ///
    /// Transient failures are still reported as such, but nothing is
    /// enqueued until a store is attached with [`Self::with_retry_store`].
    pub fn new(
        shipments: Arc<dyn ShipmentRepository>,
        registry: Arc<ProviderRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self { shipments, registry, retry_store: None, policy }
    }

    /// Attaches the retry queue transient failures are persisted to.
    #[must_use]
    pub fn with_retry_store(mut self, store: Arc<dyn RetryStore>) -> Self {
        self.retry_store = Some(store);
        self
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Attached retry queue, if any.
    pub fn retry_store(&self) -> Option<&Arc<dyn RetryStore>> {
        self.retry_store.as_ref()
    }

    /// Shipment repository callbacks are resolved against.
    pub fn shipments(&self) -> &Arc<dyn ShipmentRepository> {
        &self.shipments
    }

    /// Registered provider integrations.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Handles a live callback.
    ///
    /// # Errors
    ///
    /// - `ShipmentNotFound` if the shipment does not exist.
    /// - `InvalidCallback` if the provider does not own the shipment, or the
    ///   callback fails verification or is rejected on apply. Never queued.
    /// - `InvalidTransition` if the callback asks for a status the shipment
    ///   cannot move to. Never queued.
    /// - `Communication` if apply failed transiently; `queued` names the
    ///   retry record when one was created.
    /// - `ProviderNotRegistered` if no integration serves the slug.
    /// - `Storage` if the shipment lookup or the enqueue failed.
    pub async fn handle_callback(&self, callback: InboundCallback) -> Result<CallbackAccepted> {
        let (shipment, provider) = self.resolve(&callback).await?;

        if let Err(err) = provider.verify_callback(&shipment, &callback).await {
            return Err(self.classify(&callback, err).await);
        }

        match provider.apply_callback(&shipment, &callback).await {
            Ok(updated) => {
                info!(
                    shipment_id = %callback.shipment_id,
                    provider = %callback.provider_slug,
                    status = %updated.status,
                    "callback applied"
                );
                Ok(CallbackAccepted {
                    provider: callback.provider_slug,
                    shipment_status: updated.status,
                })
            },
            Err(err) => Err(self.classify(&callback, err).await),
        }
    }

    /// Re-runs a previously failed callback. Never enqueues.
    ///
    /// Verification runs again when `verify` is set.
    ///
    /// # Errors
    ///
    /// Same classification as [`Self::handle_callback`], except that
    /// communication failures carry no `queued` record.
    pub async fn replay(&self, callback: &InboundCallback, verify: bool) -> Result<Shipment> {
        let (shipment, provider) = self.resolve(callback).await?;

        if verify {
            provider.verify_callback(&shipment, callback).await?;
        }

        let updated = provider.apply_callback(&shipment, callback).await?;
        debug!(
            shipment_id = %callback.shipment_id,
            provider = %callback.provider_slug,
            status = %updated.status,
            "replayed callback applied"
        );
        Ok(updated)
    }

    async fn resolve(
        &self,
        callback: &InboundCallback,
    ) -> Result<(Shipment, Arc<dyn ShippingProvider>)> {
        let shipment = self.shipments.get_by_id(callback.shipment_id).await.map_err(|err| {
            match err {
                CoreError::NotFound(_) => {
                    CallbackError::ShipmentNotFound { shipment_id: callback.shipment_id }
                },
                other => CallbackError::from(other),
            }
        })?;

        if shipment.provider != callback.provider_slug {
            warn!(
                shipment_id = %shipment.id,
                expected = %shipment.provider,
                received = %callback.provider_slug,
                "callback provider does not match shipment"
            );
            return Err(CallbackError::invalid(format!(
                "shipment {} is not handled by provider '{}'",
                shipment.id, callback.provider_slug
            )));
        }

        let provider = self.registry.get(&shipment.provider).ok_or_else(|| {
            error!(provider = %shipment.provider, "no provider registered for shipment");
            CallbackError::ProviderNotRegistered { slug: shipment.provider.clone() }
        })?;

        Ok((shipment, provider))
    }

    async fn classify(&self, callback: &InboundCallback, err: ProviderError) -> CallbackError {
        match err {
            ProviderError::Communication { reason } => {
                warn!(
                    shipment_id = %callback.shipment_id,
                    provider = %callback.provider_slug,
                    reason = %reason,
                    "callback failed transiently"
                );
                match self.enqueue(callback).await {
                    Ok(queued) => CallbackError::Communication { reason, queued },
                    Err(err) => err,
                }
            },
            rejected => {
                warn!(
                    shipment_id = %callback.shipment_id,
                    provider = %callback.provider_slug,
                    reason = %rejected,
                    "callback rejected"
                );
                rejected.into()
            },
        }
    }

    async fn enqueue(&self, callback: &InboundCallback) -> Result<Option<RetryId>> {
        let Some(store) = self.retry_store.as_ref().filter(|_| self.policy.enabled) else {
            debug!(shipment_id = %callback.shipment_id, "retry disabled, callback not queued");
            return Ok(None);
        };

        match store
            .store_failed_callback(
                callback.shipment_id,
                callback.provider_slug.clone(),
                callback.payload.clone(),
                callback.headers.clone(),
            )
            .await
        {
            Ok(retry_id) => {
                info!(
                    retry_id = %retry_id,
                    shipment_id = %callback.shipment_id,
                    provider = %callback.provider_slug,
                    "callback queued for retry"
                );
                Ok(Some(retry_id))
            },
            Err(err) => {
                error!(
                    shipment_id = %callback.shipment_id,
                    provider = %callback.provider_slug,
                    error = %err,
                    "failed to queue callback for retry"
                );
                Err(CallbackError::from(err))
            },
        }
    }
}
