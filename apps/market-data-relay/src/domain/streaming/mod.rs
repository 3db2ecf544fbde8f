//! Stream Types
//!
//! Wire messages, the JSON codec and the raw frame type shared by the
//! upstream connection and subscriber connections.

pub mod auth;
pub mod codec;
pub mod messages;

pub use auth::{AuthError, Credentials};
pub use codec::{CodecError, JsonCodec};
pub use messages::{
    AuthRequest, ClientAction, ClientRequest, ConnectionGreeting, ControlMessage, ErrorMessage,
    PongReply, SubscriptionMessage, SubscriptionRequest, SuccessKind, SuccessMessage,
    UpstreamStatus,
};

/// A raw WebSocket data frame, relayed without modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl Payload {
    /// Frame length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// True for a zero-length frame.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text content, if this is a text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}
