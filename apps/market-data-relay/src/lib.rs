#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Market Data Relay - Single-Upstream Stream Multiplexer
//!
//! Holds exactly one authenticated WebSocket connection to Alpaca's stock
//! market data stream and fans every upstream frame out, unmodified, to any
//! number of downstream WebSocket subscribers. Subscriber subscription
//! requests are folded into one consolidated set that is restored after
//! every reconnect.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Wire types and state machines, no I/O
//!   - `streaming`: Control messages, codec, credentials, raw payloads
//!   - `subscription`: Consolidated subscription ledger and pending queue
//!   - `session`: Upstream session state machine and reconnect backoff
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Upstream connector, upstream link, client handles
//!   - `services`: The relay and its client registry
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `alpaca`: Upstream WebSocket connector
//!   - `websocket`: Subscriber WebSocket server
//!   - `heartbeat`: Liveness monitor
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                       ┌──────────────┐     ┌─────────────┐
//! Alpaca WS ◄──────────►│    Relay     │────►│  Subscriber │──► Client 1
//!   (auth, restore,     │  (session,   │     │   server    │──► Client 2
//!    subscriptions)     │   ledger)    │◄────│  (axum ws)  │──► Client N
//!                       └──────────────┘     └─────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core relay types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::session::{ReconnectConfig, ReconnectPolicy, SessionState, UpstreamSession};
pub use domain::streaming::{Credentials, Payload};
pub use domain::subscription::{Category, SubscriptionLedger, Symbol};

// Relay service
pub use application::ports::{ClientHandle, ClientId, UpstreamConnector};
pub use application::services::{Relay, RelaySettings, RelayStatus};

// Infrastructure config
pub use infrastructure::config::{ConfigError, DataFeed, RelayConfig, ServerSettings};

// Servers (for integration tests)
pub use infrastructure::alpaca::WebSocketConnector;
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::websocket::{RelayServer, RelayServerError, RelayServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
