//! Port Interfaces
//!
//! Defines the interfaces (ports) between the relay core and its transports,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`UpstreamConnector`]: opens the upstream WebSocket and reports its
//!   lifecycle as [`UpstreamEvent`]s
//! - [`UpstreamLink`]: write side of an open upstream connection
//!
//! ## Driver Ports (Inbound)
//!
//! - [`ClientHandle`]: write side and kill switch of one subscriber
//!   connection, owned by the transport and registered with the relay

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::session::Generation;
use crate::domain::streaming::Payload;

// =============================================================================
// Upstream
// =============================================================================

/// Command for the upstream writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCommand {
    /// Send a text frame.
    Text(String),
    /// Send a WebSocket ping.
    Ping,
    /// Close with a normal-closure code.
    Close,
}

/// Write side of an open upstream connection.
///
/// Sends never block: commands go to the connection's writer task over an
/// unbounded channel.
#[derive(Debug, Clone)]
pub struct UpstreamLink {
    tx: mpsc::UnboundedSender<UpstreamCommand>,
}

impl UpstreamLink {
    /// Wrap a command sender.
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<UpstreamCommand>) -> Self {
        Self { tx }
    }

    /// Create a link and the receiver its writer task drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UpstreamCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Queue a text frame. Returns `false` if the writer is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(UpstreamCommand::Text(text)).is_ok()
    }

    /// Queue a ping.
    pub fn ping(&self) -> bool {
        self.tx.send(UpstreamCommand::Ping).is_ok()
    }

    /// Ask the writer to close the connection.
    pub fn close(&self) -> bool {
        self.tx.send(UpstreamCommand::Close).is_ok()
    }

    /// Check if the writer task has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Transport event from an upstream connection attempt.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// Transport handshake completed.
    Opened {
        /// Attempt this event belongs to.
        generation: Generation,
        /// Write side of the new connection.
        link: UpstreamLink,
    },
    /// Data frame received.
    Message {
        /// Attempt this event belongs to.
        generation: Generation,
        /// Raw frame.
        payload: Payload,
    },
    /// Connection closed or failed to open. Always the last event of an attempt.
    Closed {
        /// Attempt this event belongs to.
        generation: Generation,
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason or failure description.
        reason: String,
    },
    /// Transport-level error. A `Closed` event follows.
    TransportError {
        /// Attempt this event belongs to.
        generation: Generation,
        /// Error description.
        error: String,
    },
}

impl UpstreamEvent {
    /// Attempt this event belongs to.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        match self {
            Self::Opened { generation, .. }
            | Self::Message { generation, .. }
            | Self::Closed { generation, .. }
            | Self::TransportError { generation, .. } => *generation,
        }
    }
}

/// Opens upstream connections.
///
/// `connect` must return immediately. The implementation reports progress on
/// `events`: `Opened` on handshake, then any `Message`/`TransportError`
/// events, and always a final `Closed`, including when the handshake fails.
#[cfg_attr(test, mockall::automock)]
pub trait UpstreamConnector: Send + Sync {
    /// Start connection attempt `generation`.
    fn connect(&self, generation: Generation, events: mpsc::UnboundedSender<UpstreamEvent>);
}

// =============================================================================
// Subscribers
// =============================================================================

/// Unique identifier for a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client_{}", self.0)
    }
}

/// Command for a subscriber's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Send a data frame.
    Frame(Payload),
    /// Send a WebSocket ping.
    Ping,
}

/// Why a frame could not be queued for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The subscriber's queue is full.
    #[error("client send queue full")]
    Full,
    /// The subscriber's writer has gone away.
    #[error("client connection closed")]
    Closed,
}

impl DeliveryError {
    /// Short label for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// Handle to one subscriber connection.
///
/// Cloning is cheap; every clone addresses the same connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<ClientCommand>,
    kill: CancellationToken,
}

impl ClientHandle {
    /// Create a handle with a bounded queue, returning the queue's receiver.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ClientCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ClientId::new(),
            tx,
            kill: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Queue a command without waiting.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError` if the queue is full or closed, or the
    /// connection has been terminated.
    pub fn send(&self, command: ClientCommand) -> Result<(), DeliveryError> {
        if self.kill.is_cancelled() {
            return Err(DeliveryError::Closed);
        }

        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Tell the transport to drop this connection.
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    /// Check if the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.kill.is_cancelled() && !self.tx.is_closed()
    }

    /// Token cancelled by [`ClientHandle::terminate`].
    #[must_use]
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}
