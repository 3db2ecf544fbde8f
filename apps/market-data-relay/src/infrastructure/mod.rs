//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process-level plumbing.

/// Alpaca upstream WebSocket connector.
pub mod alpaca;

/// Subscriber WebSocket server.
pub mod websocket;

/// Periodic subscriber and upstream liveness probe.
pub mod heartbeat;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
