//! Upstream Session State Machine
//!
//! Pure lifecycle state for the single upstream connection:
//!
//! ```text
//!                connect            transport open        auth success
//! Disconnected ──────────► Connecting ──────────► Authenticating ──────────► Ready
//!      ▲                       │                        │                      │
//!      └───────────────────────┴──────── close ─────────┴──────────────────────┘
//! ```
//!
//! Every connection attempt gets a new generation number. Transport events
//! tagged with an older generation belong to a superseded connection and are
//! ignored. After [`UpstreamSession::begin_shutdown`] no new attempt starts.
//!
//! The session does no I/O; the relay service drives it and performs the
//! sends, timers and socket operations each transition asks for.

pub mod reconnect;

use std::time::Duration;

pub use reconnect::{ReconnectConfig, ReconnectPolicy};

/// Identifies one connection attempt.
pub type Generation = u64;

/// Lifecycle state of the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No connection and no attempt in flight.
    #[default]
    Disconnected,
    /// Transport connect in progress.
    Connecting,
    /// Transport open, waiting for auth success.
    Authenticating,
    /// Authenticated; requests go straight upstream.
    Ready,
}

impl SessionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
        }
    }

    /// Numeric value for the state gauge.
    #[must_use]
    pub const fn as_gauge(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Authenticating => 2.0,
            Self::Ready => 3.0,
        }
    }

    /// Check if the transport is open.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Authenticating | Self::Ready)
    }

    /// Check if the session is authenticated.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the relay should do after a transport close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The close belongs to a superseded connection; nothing changed.
    Stale,
    /// Unexpected close; schedule a reconnect.
    Reconnect,
    /// Close after shutdown; stay disconnected.
    Stopped,
}

/// State of the single upstream connection.
#[derive(Debug, Default)]
pub struct UpstreamSession {
    state: SessionState,
    generation: Generation,
    reconnect_attempts: u32,
    intentional_close: bool,
}

impl UpstreamSession {
    /// Create a disconnected session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Generation of the latest connection attempt.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Reconnects scheduled since the last successful open.
    #[must_use]
    pub const fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Check if the session is authenticated.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Check if shutdown has begun.
    #[must_use]
    pub const fn is_shutting_down(&self) -> bool {
        self.intentional_close
    }

    /// True if `generation` is the live attempt.
    #[must_use]
    pub const fn is_current(&self, generation: Generation) -> bool {
        self.generation == generation
    }

    /// Start a new connection attempt.
    ///
    /// Returns the attempt's generation, or `None` if an attempt is already
    /// in flight or open, or shutdown has begun.
    pub fn begin_connect(&mut self) -> Option<Generation> {
        if self.intentional_close || self.state != SessionState::Disconnected {
            return None;
        }

        self.generation += 1;
        self.state = SessionState::Connecting;
        Some(self.generation)
    }

    /// Transport opened. Moves to `Authenticating` and resets the backoff.
    ///
    /// Returns `false` when the open belongs to an attempt that is no longer
    /// wanted; the caller should close that connection.
    pub fn on_open(&mut self, generation: Generation) -> bool {
        if !self.is_current(generation) || self.state != SessionState::Connecting {
            return false;
        }

        self.state = SessionState::Authenticating;
        self.reconnect_attempts = 0;
        true
    }

    /// Auth success received. Returns `true` on the transition to `Ready`.
    pub fn on_authenticated(&mut self, generation: Generation) -> bool {
        if !self.is_current(generation) || self.state != SessionState::Authenticating {
            return false;
        }

        self.state = SessionState::Ready;
        true
    }

    /// Transport closed.
    pub fn on_close(&mut self, generation: Generation) -> CloseOutcome {
        if !self.is_current(generation) {
            return CloseOutcome::Stale;
        }

        self.state = SessionState::Disconnected;
        if self.intentional_close {
            CloseOutcome::Stopped
        } else {
            CloseOutcome::Reconnect
        }
    }

    /// Delay for the next reconnect; increments the attempt counter.
    pub fn next_reconnect_delay(&mut self, policy: &ReconnectPolicy) -> Duration {
        let delay = policy.delay(self.reconnect_attempts);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        delay
    }

    /// Mark the session as intentionally closed.
    ///
    /// Returns `false` if shutdown had already begun.
    pub fn begin_shutdown(&mut self) -> bool {
        if self.intentional_close {
            return false;
        }

        self.intentional_close = true;
        self.state = SessionState::Disconnected;
        true
    }
}
