//! Subscriber WebSocket Server
//!
//! Accepts downstream WebSocket connections and bridges each one to the
//! relay through a [`ClientHandle`].
//!
//! # Endpoints
//!
//! - `GET /` - WebSocket upgrade
//! - `GET /stream` - WebSocket upgrade (alias)
//!
//! # Connection Task
//!
//! Every connection runs one task that owns both halves of the socket:
//!
//! ```text
//! ClientHandle queue ──► write half        (frames, pings)
//! read half ──► Relay::on_client_message   (text)
//!           ──► Relay::record_pong         (pong)
//! kill token ──► drop the socket           (liveness termination)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ClientCommand, ClientHandle};
use crate::application::services::Relay;
use crate::domain::streaming::Payload;

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the subscriber server.
#[derive(Debug, Clone)]
pub struct RelayServerState {
    relay: Arc<Relay>,
    allowed_origins: Arc<Vec<String>>,
    client_queue_capacity: usize,
    shutdown: CancellationToken,
}

impl RelayServerState {
    /// Create server state. An empty origin list accepts every origin.
    #[must_use]
    pub fn new(
        relay: Arc<Relay>,
        allowed_origins: Vec<String>,
        client_queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            relay,
            allowed_origins: Arc::new(allowed_origins),
            client_queue_capacity,
            shutdown,
        }
    }
}

/// Build the subscriber router.
pub fn create_router(state: RelayServerState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/stream", get(ws_handler))
        .with_state(state)
}

// =============================================================================
// Relay Server
// =============================================================================

/// Subscriber WebSocket server.
#[derive(Debug)]
pub struct RelayServer {
    port: u16,
    state: RelayServerState,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Create a new subscriber server.
    #[must_use]
    pub const fn new(port: u16, state: RelayServerState, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `RelayServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), RelayServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayServerError::BindFailed(self.port, e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already-bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `RelayServerError::ServerFailed` if the HTTP server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayServerError> {
        let port = listener.local_addr().map_or(self.port, |addr| addr.port());
        tracing::info!(port, "Relay server listening");

        axum::serve(listener, create_router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| RelayServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Relay server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn ws_handler(
    State(state): State<RelayServerState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .map(|value| value.to_str().unwrap_or_default());

    if !origin_allowed(&state.allowed_origins, origin) {
        tracing::warn!(origin = origin.unwrap_or_default(), "Rejected subscriber origin");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Check an `Origin` header against the allow-list.
///
/// An empty list allows everything, and requests without an `Origin`
/// header (non-browser clients) are always allowed.
#[must_use]
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    match origin {
        None => true,
        Some(_) if allowed.is_empty() => true,
        Some(origin) => allowed.iter().any(|candidate| candidate == origin),
    }
}

// =============================================================================
// Connection Task
// =============================================================================

async fn handle_socket(socket: WebSocket, state: RelayServerState) {
    let (handle, mut commands) = ClientHandle::new(state.client_queue_capacity);
    let id = handle.id();
    let kill = handle.kill_token();
    let (mut sender, mut receiver) = socket.split();

    state.relay.accept(handle.clone());

    loop {
        tokio::select! {
            () = kill.cancelled() => {
                tracing::debug!(client_id = %id, "Subscriber terminated");
                break;
            }
            () = state.shutdown.cancelled() => {
                let frame = CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                };
                if let Err(e) = sender.send(Message::Close(Some(frame))).await {
                    tracing::debug!(client_id = %id, error = %e, "Close frame not sent");
                }
                break;
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                let message = match command {
                    ClientCommand::Frame(Payload::Text(text)) => Message::Text(text.into()),
                    ClientCommand::Frame(Payload::Binary(data)) => Message::Binary(data.into()),
                    ClientCommand::Ping => Message::Ping(Vec::new().into()),
                };
                if let Err(e) = sender.send(message).await {
                    tracing::debug!(client_id = %id, error = %e, "Subscriber write failed");
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.relay.on_client_message(&handle, text.as_str());
                    }
                    Some(Ok(Message::Pong(_))) => state.relay.record_pong(id),
                    Some(Ok(Message::Binary(_) | Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(client_id = %id, error = %e, "Subscriber read failed");
                        break;
                    }
                }
            }
        }
    }

    handle.terminate();
    state.relay.remove(id);
}

// =============================================================================
// Errors
// =============================================================================

/// Subscriber server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
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
