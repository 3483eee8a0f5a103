//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, component status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON snapshot of every component
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (executor running, broker reachable)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{
    BatcherStats, ExecutorStats, OrderTaskExecutor, ReloaderStats, SHARED_BREAKER,
    SubscriptionReloader, TickBatcher,
};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::resilience::{
    CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitBreakerState, TaskMonitor,
    TaskMonitorStats,
};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Order executor snapshot.
    pub executor: ExecutorStats,
    /// Tick batcher snapshot.
    pub batcher: BatcherStats,
    /// Subscription reloader snapshot.
    pub reloader: ReloaderStats,
    /// Every registered circuit breaker.
    pub circuit_breakers: Vec<CircuitBreakerMetrics>,
    /// Background task counters.
    pub tasks: TaskMonitorStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    executor: Arc<OrderTaskExecutor>,
    batcher: Arc<TickBatcher>,
    reloader: Arc<SubscriptionReloader>,
    breakers: Arc<CircuitBreakerRegistry>,
    monitor: TaskMonitor,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        executor: Arc<OrderTaskExecutor>,
        batcher: Arc<TickBatcher>,
        reloader: Arc<SubscriptionReloader>,
        breakers: Arc<CircuitBreakerRegistry>,
        monitor: TaskMonitor,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            executor,
            batcher,
            reloader,
            breakers,
            monitor,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the health router.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let breakers = state.breakers.all_metrics();
    let status = determine_health_status(state.executor.is_running(), &breakers);

    if status == HealthStatus::Unhealthy {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let executor = state.executor.stats();
    let circuit_breakers = state.breakers.all_metrics();
    let status = determine_health_status(executor.running, &circuit_breakers);

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        executor,
        batcher: state.batcher.get_stats(),
        reloader: state.reloader.stats(),
        circuit_breakers,
        tasks: state.monitor.stats(),
    }
}

/// Unhealthy when orders cannot flow at all, degraded when any breaker is
/// not closed.
fn determine_health_status(
    executor_running: bool,
    breakers: &[CircuitBreakerMetrics],
) -> HealthStatus {
    let broker_open = breakers
        .iter()
        .any(|b| b.name == SHARED_BREAKER && b.state == CircuitBreakerState::Open);

    if !executor_running || broker_open {
        return HealthStatus::Unhealthy;
    }

    if breakers
        .iter()
        .all(|b| b.state == CircuitBreakerState::Closed)
    {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
