//! Health check handlers for service monitoring.
//!
//! `/health` and `/ready` check the database (when one is attached) and the
//! retry queue; `/live` only confirms the process answers HTTP.

use std::{sync::Arc, time::Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use sendparcel_core::{storage::Storage, Clock};
use sendparcel_retry::RetryStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Callbacks are accepted but failures cannot be queued
    Degraded,
    /// Critical systems failing
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthChecks {
    /// Database connectivity, absent when running without one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ComponentHealth>,
    /// Retry queue reachability, absent when retries are not configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_queue: Option<ComponentHealth>,
}

/// Health status for individual components.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Runs component checks and folds them into an overall status.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks every attached component.
    ///
    /// A failing database makes the service unhealthy. A failing retry queue
    /// only degrades it: callbacks are still applied, only failures cannot
    /// be queued.
    pub async fn health_check(
        &self,
        storage: Option<&Storage>,
        retry_store: Option<&Arc<dyn RetryStore>>,
    ) -> HealthResponse {
        debug!("performing health check");

        let database = match storage {
            Some(storage) => Some(check_database(storage).await),
            None => None,
        };
        let retry_queue = match retry_store {
            Some(store) => Some(check_retry_queue(store.as_ref()).await),
            None => None,
        };

        let is_down = |component: &Option<ComponentHealth>| {
            component.as_ref().is_some_and(|c| c.status == ComponentStatus::Down)
        };
        let status = if is_down(&database) {
            HealthStatus::Unhealthy
        } else if is_down(&retry_queue) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthResponse {
            status,
            timestamp: self.clock.now(),
            checks: HealthChecks { database, retry_queue },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

async fn check_database(storage: &Storage) -> ComponentHealth {
    let started = Instant::now();
    match storage.health_check().await {
        Ok(()) => up(started),
        Err(e) => {
            error!(error = %e, "database health check failed");
            down(started, format!("database connection failed: {e}"))
        },
    }
}

async fn check_retry_queue(store: &dyn RetryStore) -> ComponentHealth {
    let started = Instant::now();
    match store.count_pending().await {
        Ok(pending) => {
            debug!(pending, "retry queue reachable");
            up(started)
        },
        Err(e) => {
            error!(error = %e, "retry queue health check failed");
            down(started, format!("retry queue unavailable: {e}"))
        },
    }
}

fn up(started: Instant) -> ComponentHealth {
    ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms: elapsed_ms(started) }
}

fn down(started: Instant, message: String) -> ComponentHealth {
    ComponentHealth {
        status: ComponentStatus::Down,
        message: Some(message),
        response_time_ms: elapsed_ms(started),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Health check endpoint handler.
///
/// Degraded still answers 200 so load balancers keep routing callbacks.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let service = HealthService::new(app_state.clock.clone());
    let response =
        service.health_check(app_state.storage.as_deref(), app_state.retry_store.as_ref()).await;

    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(status = ?response.status, "health check completed");

    (status_code, Json(response)).into_response()
}

/// Readiness check endpoint for orchestrators.
#[instrument(name = "readiness_check", skip(app_state))]
pub async fn readiness_check(State(app_state): State<AppState>) -> Response {
    health_check(State(app_state)).await
}

/// Liveness check endpoint. Touches no external dependency.
#[instrument(name = "liveness_check", skip(app_state))]
pub async fn liveness_check(State(app_state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": app_state.clock.now(),
        "service": "sendparcel-api"
    });

    (StatusCode::OK, Json(response)).into_response()
}
