//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, relay status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (upstream authenticated)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{Relay, RelayStatus};
use crate::domain::subscription::SubscriptionSnapshot;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream connection status.
    pub upstream: UpstreamInfo,
    /// Connected subscriber count.
    pub clients: usize,
    /// Consolidated subscriptions.
    pub subscriptions: SubscriptionSnapshot,
    /// Requests waiting for the upstream.
    pub pending_requests: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream authenticated.
    Healthy,
    /// Upstream connected but not authenticated.
    Degraded,
    /// Upstream disconnected.
    Unhealthy,
}

/// Upstream connection status.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamInfo {
    /// Session state.
    pub state: &'static str,
    /// Whether the transport is open.
    pub connected: bool,
    /// Whether the session is authenticated.
    pub authenticated: bool,
    /// Reconnects since the last successful open.
    pub reconnect_attempts: u32,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
#[derive(Debug)]
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    relay: Arc<Relay>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, relay: Arc<Relay>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            relay,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
#[derive(Debug)]
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
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, create_router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the health router.
pub fn create_router(state: Arc<HealthServerState>) -> Router {
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
    if state.relay.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
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
    let status = state.relay.status();

    HealthResponse {
        status: determine_health_status(&status),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream: UpstreamInfo {
            state: status.state,
            connected: status.connected,
            authenticated: status.authenticated,
            reconnect_attempts: status.reconnect_attempts,
        },
        clients: status.clients,
        subscriptions: status.subscriptions,
        pending_requests: status.pending_requests,
    }
}

const fn determine_health_status(status: &RelayStatus) -> HealthStatus {
    if status.authenticated {
        HealthStatus::Healthy
    } else if status.connected {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{MockUpstreamConnector, UpstreamEvent, UpstreamLink};
    use crate::application::services::RelaySettings;
    use crate::domain::streaming::Payload;

    fn status(connected: bool, authenticated: bool) -> RelayStatus {
        RelayStatus {
            state: "ready",
            connected,
            authenticated,
            reconnect_attempts: 0,
            clients: 0,
            pending_requests: 0,
            subscriptions: SubscriptionSnapshot::default(),
        }
    }

    fn health_state() -> (Arc<Relay>, HealthServerState) {
        let mut connector = MockUpstreamConnector::new();
        connector.expect_connect().returning(|_, _| ());
        let (relay, _events) = Relay::new(RelaySettings::default(), Arc::new(connector));
        let state = HealthServerState::new("1.0.0".to_string(), Arc::clone(&relay));
        (relay, state)
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn determine_status_authenticated() {
        assert_eq!(
            determine_health_status(&status(true, true)),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn determine_status_connected_only() {
        assert_eq!(
            determine_health_status(&status(true, false)),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn determine_status_disconnected() {
        assert_eq!(
            determine_health_status(&status(false, false)),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn response_reflects_relay() {
        let (relay, state) = health_state();

        let response = build_health_response(&state);
        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert_eq!(response.upstream.state, "disconnected");
        assert_eq!(response.version, "1.0.0");

        relay.connect();
        let (link, _upstream) = UpstreamLink::channel();
        relay.handle_event(UpstreamEvent::Opened {
            generation: 1,
            link,
        });
        relay.handle_event(UpstreamEvent::Message {
            generation: 1,
            payload: Payload::Text(r#"[{"T":"success","msg":"authenticated"}]"#.to_string()),
        });

        let response = build_health_response(&state);
        assert_eq!(response.status, HealthStatus::Healthy);
        assert!(response.upstream.authenticated);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["upstream"]["state"], "ready");
        assert_eq!(json["pending_requests"], 0);
    }
}
