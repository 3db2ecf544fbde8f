//! Upstream WebSocket Connector
//!
//! Opens the single connection to Alpaca's market data stream. Each attempt
//! runs in its own task and reports its lifecycle to the relay as
//! [`UpstreamEvent`]s tagged with the attempt's generation.
//!
//! # Stream URL
//!
//! - SIP: `wss://stream.data.alpaca.markets/v2/sip`
//! - IEX: `wss://stream.data.alpaca.markets/v2/iex`
//!
//! The connector knows nothing about authentication or subscriptions; it
//! writes what the relay sends through the [`UpstreamLink`] and forwards
//! every inbound data frame unmodified.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::application::ports::{UpstreamCommand, UpstreamConnector, UpstreamEvent, UpstreamLink};
use crate::domain::session::Generation;
use crate::domain::streaming::Payload;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end an upstream connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The relay stopped listening for events.
    #[error("relay event channel closed")]
    ChannelClosed,
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CloseInfo {
    code: Option<u16>,
    reason: String,
}

impl CloseInfo {
    fn new(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// [`UpstreamConnector`] over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Create a connector for the given stream URL.
    #[must_use]
    pub const fn new(url: String) -> Self {
        Self { url }
    }
}

impl UpstreamConnector for WebSocketConnector {
    fn connect(&self, generation: Generation, events: mpsc::UnboundedSender<UpstreamEvent>) {
        tokio::spawn(run_connection(self.url.clone(), generation, events));
    }
}

/// Run one connection attempt and always finish with a `Closed` event.
async fn run_connection(
    url: String,
    generation: Generation,
    events: mpsc::UnboundedSender<UpstreamEvent>,
) {
    let close = match connect_and_run(&url, generation, &events).await {
        Ok(close) => close,
        Err(UpstreamError::ChannelClosed) => return,
        Err(e) => {
            emit(
                &events,
                UpstreamEvent::TransportError {
                    generation,
                    error: e.to_string(),
                },
            );
            CloseInfo::new(None, e.to_string())
        }
    };

    tracing::debug!(generation, code = ?close.code, reason = %close.reason, "Upstream attempt finished");

    emit(
        &events,
        UpstreamEvent::Closed {
            generation,
            code: close.code,
            reason: close.reason,
        },
    );
}

/// Connect, then pump commands out and frames in until either side closes.
async fn connect_and_run(
    url: &str,
    generation: Generation,
    events: &mpsc::UnboundedSender<UpstreamEvent>,
) -> Result<CloseInfo, UpstreamError> {
    tracing::info!(url, generation, "Opening upstream connection");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();

    let (link, mut commands) = UpstreamLink::channel();
    if !emit(events, UpstreamEvent::Opened { generation, link }) {
        return Err(UpstreamError::ChannelClosed);
    }

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(UpstreamCommand::Text(text)) => {
                        write.send(Message::Text(text.into())).await?;
                    }
                    Some(UpstreamCommand::Ping) => {
                        write.send(Message::Ping(Vec::new().into())).await?;
                    }
                    Some(UpstreamCommand::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "relay shutting down".into(),
                        };
                        write.send(Message::Close(Some(frame))).await?;
                        return Ok(CloseInfo::new(Some(1000), "closed by relay"));
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let payload = Payload::Text(text.as_str().to_owned());
                        if !emit(events, UpstreamEvent::Message { generation, payload }) {
                            return Err(UpstreamError::ChannelClosed);
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let payload = Payload::Binary(data.to_vec());
                        if !emit(events, UpstreamEvent::Message { generation, payload }) {
                            return Err(UpstreamError::ChannelClosed);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        tracing::trace!(generation, "Upstream pong");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(generation, "Upstream sent close frame");
                        return Ok(frame.map_or_else(
                            || CloseInfo::new(None, String::new()),
                            |frame| CloseInfo::new(Some(u16::from(frame.code)), frame.reason.as_str()),
                        ));
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        tracing::info!(generation, "Upstream stream ended");
                        return Ok(CloseInfo::new(None, "stream ended"));
                    }
                }
            }
        }
    }
}

fn emit(events: &mpsc::UnboundedSender<UpstreamEvent>, event: UpstreamEvent) -> bool {
    if events.send(event).is_err() {
        tracing::debug!("Relay event channel closed, dropping upstream event");
        return false;
    }
    true
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<UpstreamEvent>) -> UpstreamEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn refused_connection_reports_error_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WebSocketConnector::new(format!("ws://{addr}"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        connector.connect(3, tx);

        assert!(matches!(
            next_event(&mut rx).await,
            UpstreamEvent::TransportError { generation: 3, .. }
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            UpstreamEvent::Closed {
                generation: 3,
                code: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn relays_frames_and_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"[{"T":"success","msg":"connected"}]"#.into()))
                .await
                .unwrap();
            ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();

            let received = ws.next().await.unwrap().unwrap();
            assert_eq!(received, Message::Text(r#"{"action":"auth"}"#.into()));

            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "bye".into(),
            })))
            .await
            .unwrap();
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        connector.connect(1, tx);

        let UpstreamEvent::Opened { generation, link } = next_event(&mut rx).await else {
            panic!("expected Opened");
        };
        assert_eq!(generation, 1);

        match next_event(&mut rx).await {
            UpstreamEvent::Message { payload, .. } => assert_eq!(
                payload,
                Payload::Text(r#"[{"T":"success","msg":"connected"}]"#.to_string())
            ),
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut rx).await {
            UpstreamEvent::Message { payload, .. } => {
                assert_eq!(payload, Payload::Binary(vec![1, 2, 3]));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(link.send_text(r#"{"action":"auth"}"#.to_string()));

        match next_event(&mut rx).await {
            UpstreamEvent::Closed {
                generation,
                code,
                reason,
            } => {
                assert_eq!(generation, 1);
                assert_eq!(code, Some(1001));
                assert_eq!(reason, "bye");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        server.await.unwrap();
    }
}
