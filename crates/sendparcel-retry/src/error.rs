//! Error types for callback dispatch and retry processing.
//!
//! `ProviderError` is what a provider integration reports from its hooks.
//! `CallbackError` is what the dispatcher reports to its caller and
//! `ShipmentError` what the shipment flow reports; each variant carries a
//! stable machine-readable code so the HTTP layer can map it to a status
//! without string matching.

use sendparcel_core::{CoreError, RetryId, ShipmentId, ShipmentStatus};
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, CallbackError>;

/// Failure reported by a shipping provider integration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The callback is malformed, unauthenticated, or describes an
    /// impossible transition. Retrying it cannot help.
    #[error("invalid callback: {reason}")]
    InvalidCallback {
        /// Why the callback was rejected
        reason: String,
    },

    /// The shipment cannot move from its current status to the requested
    /// one.
    #[error("shipment cannot move from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: ShipmentStatus,
        /// Requested status
        to: ShipmentStatus,
    },

    /// The integration does not implement the requested operation.
    #[error("provider does not support {operation}")]
    Unsupported {
        /// Operation name
        operation: &'static str,
    },

    /// The provider or a downstream system could not be reached.
    #[error("provider communication failed: {reason}")]
    Communication {
        /// Description of the transport or availability failure
        reason: String,
    },
}

impl ProviderError {
    /// Creates an invalid-callback error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidCallback { reason: reason.into() }
    }

    /// Creates a communication error.
    pub fn communication(reason: impl Into<String>) -> Self {
        Self::Communication { reason: reason.into() }
    }

    /// Returns true when the failure is worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication { .. })
    }
}

/// Failure of a callback dispatch or replay.
#[derive(Debug, Clone, Error)]
pub enum CallbackError {
    /// The shipment named in the callback does not exist.
    #[error("shipment {shipment_id} not found")]
    ShipmentNotFound {
        /// Shipment that could not be resolved
        shipment_id: ShipmentId,
    },

    /// The callback was rejected on structural or authentication grounds.
    #[error("invalid callback: {reason}")]
    InvalidCallback {
        /// Why the callback was rejected
        reason: String,
    },

    /// The callback asks for a status change the shipment cannot make.
    #[error("shipment cannot move from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: ShipmentStatus,
        /// Requested status
        to: ShipmentStatus,
    },

    /// Applying the callback failed transiently.
    ///
    /// `queued` carries the retry record created for the callback, if one
    /// was created. Replays never enqueue, so it is `None` there.
    #[error("provider communication failed: {reason}")]
    Communication {
        /// Description of the transport failure
        reason: String,
        /// Retry record scheduled for this callback
        queued: Option<RetryId>,
    },

    /// The shipment's provider has no registered integration.
    #[error("no provider registered for slug '{slug}'")]
    ProviderNotRegistered {
        /// Slug that failed to resolve
        slug: String,
    },

    /// A database operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Underlying storage error message
        message: String,
    },
}

impl CallbackError {
    /// Creates an invalid-callback error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidCallback { reason: reason.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Stable code used in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ShipmentNotFound { .. } => "not_found",
            Self::InvalidCallback { .. } => "invalid_callback",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Communication { .. } => "communication_error",
            Self::ProviderNotRegistered { .. } => "configuration_error",
            Self::Storage { .. } => "storage_error",
        }
    }

    /// Returns true if another attempt at the same callback may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication { .. })
    }

    /// Returns true if the callback can never succeed as sent.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::ShipmentNotFound { .. }
                | Self::InvalidCallback { .. }
                | Self::InvalidTransition { .. }
        )
    }
}

impl From<ProviderError> for CallbackError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidCallback { reason } => Self::InvalidCallback { reason },
            ProviderError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            // Callbacks only reach verify and apply, which every integration
            // implements.
            err @ ProviderError::Unsupported { .. } => {
                Self::InvalidCallback { reason: err.to_string() }
            },
            ProviderError::Communication { reason } => Self::Communication { reason, queued: None },
        }
    }
}

impl From<CoreError> for CallbackError {
    fn from(err: CoreError) -> Self {
        Self::Storage { message: err.to_string() }
    }
}

/// Failure of a shipment flow operation.
#[derive(Debug, Clone, Error)]
pub enum ShipmentError {
    /// No shipment with this ID.
    #[error("shipment {shipment_id} not found")]
    NotFound {
        /// Shipment that could not be resolved
        shipment_id: ShipmentId,
    },

    /// The request is incomplete or the provider rejected it.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong
        reason: String,
    },

    /// The operation would move the shipment along a forbidden edge.
    #[error("shipment cannot move from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: ShipmentStatus,
        /// Status the operation leads to
        to: ShipmentStatus,
    },

    /// The provider integration does not offer this operation.
    #[error("provider '{provider}' does not support {operation}")]
    Unsupported {
        /// Provider slug
        provider: String,
        /// Operation name
        operation: &'static str,
    },

    /// No provider given and no default configured, or the slug is unknown.
    #[error("configuration error: {reason}")]
    Configuration {
        /// What is missing
        reason: String,
    },

    /// The provider could not be reached.
    #[error("provider communication failed: {reason}")]
    Communication {
        /// Description of the transport failure
        reason: String,
    },

    /// A database operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Underlying storage error message
        message: String,
    },
}

impl ShipmentError {
    /// Stable code used in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Unsupported { .. } => "unsupported_operation",
            Self::Configuration { .. } => "configuration_error",
            Self::Communication { .. } => "communication_error",
            Self::Storage { .. } => "storage_error",
        }
    }

    /// Wraps a provider failure for the provider named `provider`.
    pub fn from_provider(provider: &str, err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidCallback { reason } => Self::InvalidRequest { reason },
            ProviderError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            ProviderError::Unsupported { operation } => {
                Self::Unsupported { provider: provider.to_string(), operation }
            },
            ProviderError::Communication { reason } => Self::Communication { reason },
        }
    }

    /// Maps a repository failure on `shipment_id`.
    pub fn from_core(shipment_id: ShipmentId, err: CoreError) -> Self {
        match err {
            CoreError::NotFound(_) => Self::NotFound { shipment_id },
            other => Self::Storage { message: other.to_string() },
        }
    }
}
