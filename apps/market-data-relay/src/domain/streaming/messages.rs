//! Stream Message Types
//!
//! Wire format types for the two sides of the relay.
//!
//! # Upstream (Alpaca market data stream)
//!
//! ## Control Messages
//! - `Success`: Connection or authentication success
//! - `Error`: Error response with code and message
//! - `Subscription`: Subscription confirmation
//!
//! Everything else (quotes, trades, bars, statuses) is relayed without being
//! decoded.
//!
//! ## Outbound
//! - `AuthRequest`: `{"action":"auth","key":..,"secret":..}`
//! - `SubscriptionRequest`: `{"action":"subscribe","trades":[..],..}`
//!
//! # Downstream (subscribers)
//!
//! - `ClientRequest`: `{"action":"ping"|"subscribe"|"unsubscribe",..}`
//! - `ConnectionGreeting`: sent once on accept
//! - `PongReply`: `{"type":"pong"}`
//!
//! # References
//!
//! - [Stock Streaming](https://docs.alpaca.markets/docs/real-time-stock-pricing-data)

use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// Control Messages (Upstream -> Relay)
// =============================================================================

/// Success message indicating connection or authentication succeeded.
///
/// # Wire Format (JSON)
/// ```json
/// {"T": "success", "msg": "connected"}
/// {"T": "success", "msg": "authenticated"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessMessage {
    /// Message type (always "success")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Success message: "connected" or "authenticated"
    #[serde(default)]
    pub msg: String,
}

impl SuccessMessage {
    /// Classify the `msg` field.
    #[must_use]
    pub fn kind(&self) -> SuccessKind {
        match self.msg.as_str() {
            "connected" => SuccessKind::Connected,
            "authenticated" => SuccessKind::Authenticated,
            _ => SuccessKind::Other,
        }
    }
}

/// Kind of success message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessKind {
    /// Initial connection established
    Connected,
    /// Authentication successful
    Authenticated,
    /// Any other success text
    Other,
}

/// Error message with code and description.
///
/// # Wire Format (JSON)
/// ```json
/// {"T": "error", "code": 401, "msg": "not authenticated"}
/// ```
///
/// # Error Codes
/// - 400: Invalid syntax
/// - 401: Not authenticated
/// - 402: Auth failed
/// - 403: Already authenticated
/// - 404: Auth timeout
/// - 405: Symbol limit exceeded
/// - 406: Connection limit exceeded
/// - 407: Slow client
/// - 408: Insufficient subscription
/// - 409: Not allowed (internal)
/// - 500: Internal error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Message type (always "error")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Error code
    #[serde(default)]
    pub code: i32,

    /// Error message
    #[serde(default)]
    pub msg: String,
}

impl ErrorMessage {
    /// Check if this is an authentication error.
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self.code, 401..=404)
    }
}

/// Subscription confirmation message.
///
/// # Wire Format (JSON)
/// ```json
/// {"T": "subscription", "trades": ["AAPL"], "quotes": ["AMD"], "bars": []}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMessage {
    /// Message type (always "subscription")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Subscribed trade symbols
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trades: Vec<String>,

    /// Subscribed quote symbols
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quotes: Vec<String>,

    /// Subscribed bar symbols
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bars: Vec<String>,
}

/// A classified element of an upstream payload.
///
/// Only control messages are decoded. Market data falls into `Opaque` with
/// its `T` tag, if any, kept for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `{"T":"success",..}`
    Success(SuccessMessage),
    /// `{"T":"error",..}`
    Error(ErrorMessage),
    /// `{"T":"subscription",..}`
    Subscription(SubscriptionMessage),
    /// Anything else.
    Opaque(Option<String>),
}

// =============================================================================
// Outbound Messages (Relay -> Upstream)
// =============================================================================

/// Authentication request for market data streams.
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest {
    /// Action: "auth"
    pub action: &'static str,

    /// API key
    pub key: String,

    /// API secret
    pub secret: String,
}

impl AuthRequest {
    /// Create a new authentication request.
    #[must_use]
    pub const fn new(key: String, secret: String) -> Self {
        Self {
            action: "auth",
            key,
            secret,
        }
    }
}

/// Subscription request for market data streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    /// Action: "subscribe" or "unsubscribe"
    pub action: String,

    /// Trade symbols
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trades: Vec<String>,

    /// Quote symbols
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub quotes: Vec<String>,

    /// Bar symbols
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bars: Vec<String>,
}

impl SubscriptionRequest {
    /// Create a subscribe request.
    #[must_use]
    pub fn subscribe() -> Self {
        Self {
            action: "subscribe".to_string(),
            ..Default::default()
        }
    }

    /// Add trade symbols.
    #[must_use]
    pub fn with_trades(mut self, symbols: Vec<String>) -> Self {
        self.trades = symbols;
        self
    }

    /// Add quote symbols.
    #[must_use]
    pub fn with_quotes(mut self, symbols: Vec<String>) -> Self {
        self.quotes = symbols;
        self
    }

    /// Add bar symbols.
    #[must_use]
    pub fn with_bars(mut self, symbols: Vec<String>) -> Self {
        self.bars = symbols;
        self
    }
}

// =============================================================================
// Subscriber Messages (Client <-> Relay)
// =============================================================================

/// Action carried by a subscriber request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    /// Application-level keepalive, answered locally.
    Ping,
    /// Add symbols.
    Subscribe,
    /// Remove symbols.
    Unsubscribe,
    /// Unrecognised action.
    Unknown,
}

/// Request sent by a downstream subscriber.
///
/// # Wire Format (JSON)
/// ```json
/// {"action": "subscribe", "trades": ["AAPL"], "quotes": ["msft"]}
/// {"action": "ping"}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientRequest {
    /// Requested action.
    #[serde(default)]
    pub action: String,

    /// Trade symbols
    #[serde(default, deserialize_with = "null_as_empty")]
    pub trades: Vec<String>,

    /// Quote symbols
    #[serde(default, deserialize_with = "null_as_empty")]
    pub quotes: Vec<String>,

    /// Bar symbols
    #[serde(default, deserialize_with = "null_as_empty")]
    pub bars: Vec<String>,
}

/// Treat an explicit `null` category like an absent one.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ClientRequest {
    /// Classify the action field. Matching is exact, as upstream expects.
    #[must_use]
    pub fn kind(&self) -> ClientAction {
        match self.action.as_str() {
            "ping" => ClientAction::Ping,
            "subscribe" => ClientAction::Subscribe,
            "unsubscribe" => ClientAction::Unsubscribe,
            _ => ClientAction::Unknown,
        }
    }
}

/// Upstream status reported in the connection greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    /// Session is ready.
    Authenticated,
    /// Session is anywhere short of ready.
    Connecting,
}

/// Greeting sent to a subscriber immediately after accept.
///
/// # Wire Format (JSON)
/// ```json
/// [{"T": "success", "msg": "connected", "upstreamStatus": "authenticated"}]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionGreeting {
    /// Message type (always "success")
    #[serde(rename = "T")]
    pub msg_type: &'static str,

    /// Always "connected"
    pub msg: &'static str,

    /// Current upstream status.
    #[serde(rename = "upstreamStatus")]
    pub upstream_status: UpstreamStatus,
}

impl ConnectionGreeting {
    /// Create a greeting for the given upstream status.
    #[must_use]
    pub const fn new(upstream_status: UpstreamStatus) -> Self {
        Self {
            msg_type: "success",
            msg: "connected",
            upstream_status,
        }
    }
}

/// Local reply to a subscriber ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PongReply {
    /// Always "pong"
    #[serde(rename = "type")]
    pub reply_type: &'static str,
}

impl Default for PongReply {
    fn default() -> Self {
        Self { reply_type: "pong" }
    }
}
