//! Market Data Relay Binary
//!
//! Starts the single-upstream market data relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Credentials
//! - `ALPACA_KEY`: Alpaca API key
//! - `ALPACA_SECRET`: Alpaca API secret
//!
//! Without them the relay still serves subscribers but the upstream never
//! authenticates.
//!
//! ## Optional
//! - `ALPACA_FEED`: Market data feed - "sip" | "iex" (default: sip)
//! - `STREAM_RELAY_UPSTREAM_URL`: Upstream URL override
//! - `STREAM_RELAY_PORT`: Subscriber WebSocket port (default: 8080)
//! - `STREAM_RELAY_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `STREAM_RELAY_RECONNECT_DELAY_INITIAL_MS`: Initial backoff (default: 1000)
//! - `STREAM_RELAY_RECONNECT_DELAY_MAX_MS`: Backoff cap (default: 30000)
//! - `STREAM_RELAY_RECONNECT_DELAY_MULTIPLIER`: Backoff multiplier (default: 2.0)
//! - `STREAM_RELAY_HEARTBEAT_INTERVAL_SECS`: Liveness probe interval (default: 30)
//! - `STREAM_RELAY_ALLOWED_ORIGINS`: Comma-separated origin allow-list (default: allow all)
//! - `STREAM_RELAY_CLIENT_QUEUE_CAPACITY`: Per-subscriber queue (default: 1024)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-data-relay)
//! - `RUST_LOG`: Log filter (default: `market_data_relay=info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_data_relay::infrastructure::alpaca::WebSocketConnector;
use market_data_relay::infrastructure::heartbeat::LivenessMonitor;
use market_data_relay::infrastructure::health::{HealthServer, HealthServerState};
use market_data_relay::infrastructure::telemetry;
use market_data_relay::infrastructure::websocket::{RelayServer, RelayServerState};
use market_data_relay::{Relay, RelayConfig, RelaySettings, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting market data relay");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed, metrics disabled");
    }

    let config = RelayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    if config.credentials.is_none() {
        tracing::error!(
            "ALPACA_KEY and ALPACA_SECRET are not set; the upstream connection will not authenticate"
        );
    }

    let shutdown_token = CancellationToken::new();

    // Relay core
    let connector = Arc::new(WebSocketConnector::new(config.upstream_url()));
    let (relay, events) = Relay::new(
        RelaySettings {
            credentials: config.credentials.clone(),
            reconnect: config.reconnect.clone(),
        },
        connector,
    );

    let relay_task = tokio::spawn(Arc::clone(&relay).run(events, shutdown_token.clone()));
    relay.connect();

    // Liveness monitor
    let monitor = LivenessMonitor::new(
        config.heartbeat_interval,
        Arc::clone(&relay),
        shutdown_token.clone(),
    );
    tokio::spawn(monitor.run());

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&relay),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Subscriber server
    let server_state = RelayServerState::new(
        Arc::clone(&relay),
        config.allowed_origins.clone(),
        config.client_queue_capacity,
        shutdown_token.clone(),
    );
    let relay_server = RelayServer::new(config.server.port, server_state, shutdown_token.clone());
    tokio::spawn(async move {
        if let Err(e) = relay_server.run().await {
            tracing::error!(error = %e, "Relay server error");
        }
    });

    tracing::info!("Market data relay ready");

    await_shutdown(shutdown_token).await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, relay_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Relay task failed"),
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Relay did not stop before the shutdown timeout"
        ),
    }

    tracing::info!("Market data relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        feed = config.feed.as_str(),
        port = config.server.port,
        health_port = config.server.health_port,
        heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
        allowed_origins = config.allowed_origins.len(),
        client_queue_capacity = config.client_queue_capacity,
        "Configuration loaded"
    );
    tracing::debug!(
        upstream_url = %config.upstream_url(),
        reconnect = ?config.reconnect,
        "Upstream endpoint"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                if let Err(e) = dotenvy::from_path(&env_path) {
                    eprintln!("Failed to load {}: {e}", env_path.display());
                }
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT), then cancel every task.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
