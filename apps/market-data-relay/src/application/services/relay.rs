//! Relay Service
//!
//! The single owner of all mutable relay state: the upstream session, the
//! live upstream link, the reconnect timer, the subscription ledger and the
//! client registry. Everything sits in one [`RelayState`] behind one mutex.
//!
//! # Event Flow
//!
//! ```text
//! UpstreamConnector ──UpstreamEvent──► Relay::run ──► handle_event
//!                                                      │
//!        subscribers ◄── broadcast (snapshot, try_send) ┘
//!
//! subscriber text ──► on_client_message ──► ledger ──► route_or_queue ──► UpstreamLink
//! ```
//!
//! The lock is never held across an `.await`, and every send it guards is a
//! non-blocking channel push. Fan-out copies the client handles under the
//! lock and delivers outside it.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::ClientRegistry;
use crate::application::ports::{
    ClientCommand, ClientHandle, ClientId, UpstreamConnector, UpstreamEvent, UpstreamLink,
};
use crate::domain::session::{
    CloseOutcome, Generation, ReconnectConfig, ReconnectPolicy, SessionState, UpstreamSession,
};
use crate::domain::streaming::{
    AuthError, ClientAction, ConnectionGreeting, ControlMessage, Credentials, JsonCodec, Payload,
    PongReply, SuccessKind, UpstreamStatus,
};
use crate::domain::subscription::{
    CategorySymbols, RouteOutcome, SubscriptionAction, SubscriptionLedger, SubscriptionSnapshot,
};
use crate::infrastructure::metrics::{self, MessageKind};

// =============================================================================
// Settings
// =============================================================================

/// Relay settings fixed for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct RelaySettings {
    /// Upstream credentials. Without them the connection never authenticates.
    pub credentials: Option<Credentials>,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
struct ReconnectTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct RelayState {
    session: UpstreamSession,
    link: Option<UpstreamLink>,
    reconnect_timer: Option<ReconnectTimer>,
    next_timer_id: u64,
    ledger: SubscriptionLedger,
    clients: ClientRegistry,
}

impl RelayState {
    fn send_upstream(&self, text: String) -> bool {
        self.session.is_ready() && self.link.as_ref().is_some_and(|link| link.send_text(text))
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.handle.abort();
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Point-in-time relay status for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    /// Upstream session state.
    pub state: &'static str,
    /// Whether the upstream transport is open.
    pub connected: bool,
    /// Whether the upstream session is authenticated.
    pub authenticated: bool,
    /// Reconnects scheduled since the last successful open.
    pub reconnect_attempts: u32,
    /// Connected subscribers.
    pub clients: usize,
    /// Requests waiting for the upstream.
    pub pending_requests: usize,
    /// Consolidated subscriptions.
    pub subscriptions: SubscriptionSnapshot,
}

/// What happened to one subscriber message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessageOutcome {
    /// Answered locally with a pong.
    Pong,
    /// Applied to the ledger and sent or queued.
    Routed(RouteOutcome),
    /// Malformed or unknown; dropped.
    Ignored,
}

/// Delivery counts for one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers the frame was queued to.
    pub delivered: usize,
    /// Subscribers whose queue was full or closed.
    pub failed: usize,
}

/// Outcome of one client liveness probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeReport {
    /// Subscribers terminated for missing the previous probe or for a ping
    /// that could not be queued.
    pub terminated: usize,
    /// Subscribers whose ping was queued.
    pub pinged: usize,
}

// =============================================================================
// Relay
// =============================================================================

/// Single-upstream, multi-subscriber relay.
pub struct Relay {
    credentials: Option<Credentials>,
    policy: ReconnectPolicy,
    connector: Arc<dyn UpstreamConnector>,
    events_tx: mpsc::UnboundedSender<UpstreamEvent>,
    codec: JsonCodec,
    state: Mutex<RelayState>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("credentials", &self.credentials)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Create a relay and the event receiver to pass to [`Relay::run`].
    #[must_use]
    pub fn new(
        settings: RelaySettings,
        connector: Arc<dyn UpstreamConnector>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let relay = Arc::new(Self {
            credentials: settings.credentials,
            policy: ReconnectPolicy::new(settings.reconnect),
            connector,
            events_tx,
            codec: JsonCodec::new(),
            state: Mutex::new(RelayState::default()),
        });
        (relay, events_rx)
    }

    /// Apply upstream events in order until cancelled, then shut down.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<UpstreamEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.shutdown();
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
            }
        }

        tracing::info!("Relay event loop stopped");
    }

    /// Apply one upstream event.
    pub fn handle_event(self: &Arc<Self>, event: UpstreamEvent) {
        tracing::trace!(generation = event.generation(), "Upstream event");

        match event {
            UpstreamEvent::Opened { generation, link } => self.on_open(generation, link),
            UpstreamEvent::Message {
                generation,
                payload,
            } => self.on_message(generation, &payload),
            UpstreamEvent::Closed {
                generation,
                code,
                reason,
            } => self.on_close(generation, code, &reason),
            UpstreamEvent::TransportError { generation, error } => {
                self.on_transport_error(generation, &error);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Upstream session
    // -------------------------------------------------------------------------

    /// Start a connection attempt unless one is in flight or open.
    pub fn connect(&self) {
        let generation = {
            let mut state = self.state.lock();
            let generation = state.session.begin_connect();
            metrics::set_upstream_state(state.session.state());
            generation
        };

        if let Some(generation) = generation {
            tracing::info!(generation, "Connecting to upstream");
            self.connector.connect(generation, self.events_tx.clone());
        } else {
            tracing::debug!("Connect skipped: attempt already active or shutting down");
        }
    }

    fn on_open(&self, generation: Generation, link: UpstreamLink) {
        let mut state = self.state.lock();

        if !state.session.on_open(generation) {
            tracing::debug!(generation, "Closing unwanted upstream connection");
            link.close();
            return;
        }

        metrics::set_upstream_state(state.session.state());
        tracing::info!(generation, "Upstream transport open, authenticating");

        let Some(credentials) = &self.credentials else {
            tracing::error!(
                generation,
                "Upstream credentials are not configured; connection will stay unauthenticated"
            );
            metrics::record_upstream_error("missing_credentials");
            state.link = Some(link);
            return;
        };

        match self.codec.encode(&credentials.to_auth_request()) {
            Ok(auth) => {
                if !link.send_text(auth) {
                    tracing::warn!(generation, "Upstream writer gone before auth was sent");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode auth request"),
        }

        state.link = Some(link);
    }

    fn on_message(&self, generation: Generation, payload: &Payload) {
        match payload {
            Payload::Text(text) => match self.codec.decode_upstream(text) {
                Ok(messages) => {
                    for message in messages {
                        self.on_control_message(generation, message);
                    }
                }
                Err(e) => {
                    metrics::record_upstream_message(MessageKind::Unparsed);
                    tracing::warn!(error = %e, len = text.len(), "Unparseable upstream frame");
                }
            },
            Payload::Binary(bytes) => {
                metrics::record_upstream_message(MessageKind::Unparsed);
                tracing::debug!(len = bytes.len(), "Binary upstream frame");
            }
        }

        self.broadcast(payload);
    }

    fn on_control_message(&self, generation: Generation, message: ControlMessage) {
        match message {
            ControlMessage::Success(success) => {
                metrics::record_upstream_message(MessageKind::Success);
                match success.kind() {
                    SuccessKind::Authenticated => self.on_authenticated(generation),
                    SuccessKind::Connected => {
                        tracing::debug!(generation, "Upstream greeting received");
                    }
                    SuccessKind::Other => {
                        tracing::debug!(msg = %success.msg, "Unrecognised upstream success");
                    }
                }
            }
            ControlMessage::Error(error) => {
                metrics::record_upstream_message(MessageKind::Error);
                let classified = AuthError::from(&error);
                metrics::record_upstream_error(classified.as_str());
                tracing::error!(
                    code = error.code,
                    msg = %error.msg,
                    auth_error = error.is_auth_error(),
                    error = %classified,
                    "Upstream error"
                );
            }
            ControlMessage::Subscription(subscription) => {
                metrics::record_upstream_message(MessageKind::Subscription);
                tracing::info!(
                    trades = subscription.trades.len(),
                    quotes = subscription.quotes.len(),
                    bars = subscription.bars.len(),
                    "Upstream subscriptions confirmed"
                );
            }
            ControlMessage::Opaque(tag) => {
                metrics::record_upstream_message(MessageKind::Opaque);
                tracing::trace!(tag = ?tag, "Upstream data");
            }
        }
    }

    fn on_authenticated(&self, generation: Generation) {
        let mut state = self.state.lock();

        if !state.session.on_authenticated(generation) {
            tracing::debug!(generation, "Ignoring auth success outside Authenticating");
            return;
        }

        metrics::set_upstream_state(state.session.state());

        let pending = state.ledger.drain_pending();
        let flushed = pending.len();
        let mut unsent = pending.into_iter();
        for raw in unsent.by_ref() {
            if !state.send_upstream(raw.clone()) {
                state.ledger.enqueue(raw);
                break;
            }
        }
        for raw in unsent {
            state.ledger.enqueue(raw);
        }

        if let Some(request) = state.ledger.restore_request() {
            match self.codec.encode(&request) {
                Ok(text) => {
                    state.send_upstream(text);
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode restore request"),
            }
        }

        metrics::set_ledger_stats(&state.ledger.stats());
        let subscriptions = state.ledger.stats();
        drop(state);

        tracing::info!(
            generation,
            flushed,
            trades = subscriptions.trades,
            quotes = subscriptions.quotes,
            bars = subscriptions.bars,
            "Upstream authenticated"
        );
    }

    fn on_close(self: &Arc<Self>, generation: Generation, code: Option<u16>, reason: &str) {
        let mut state = self.state.lock();

        match state.session.on_close(generation) {
            CloseOutcome::Stale => {
                tracing::debug!(generation, "Ignoring close from superseded connection");
            }
            CloseOutcome::Reconnect => {
                state.link = None;
                metrics::set_upstream_state(state.session.state());
                tracing::warn!(generation, code = ?code, reason, "Upstream connection closed");
                self.schedule_reconnect_locked(&mut state);
            }
            CloseOutcome::Stopped => {
                state.link = None;
                metrics::set_upstream_state(state.session.state());
                tracing::info!(generation, code = ?code, reason, "Upstream connection closed after shutdown");
            }
        }
    }

    fn on_transport_error(&self, generation: Generation, error: &str) {
        metrics::record_upstream_error("transport");
        tracing::warn!(generation, error, "Upstream transport error");
    }

    /// Send text upstream if the session is ready.
    ///
    /// Returns `false` when the caller should queue instead.
    pub fn send(&self, text: String) -> bool {
        self.state.lock().send_upstream(text)
    }

    /// Arm the reconnect timer, replacing any armed one.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        let mut state = self.state.lock();
        self.schedule_reconnect_locked(&mut state);
    }

    fn schedule_reconnect_locked(self: &Arc<Self>, state: &mut RelayState) {
        state.cancel_timer();

        if state.session.is_shutting_down() {
            return;
        }

        let attempt = state.session.reconnect_attempts() + 1;
        let delay = state.session.next_reconnect_delay(&self.policy);
        let id = state.next_timer_id;
        state.next_timer_id += 1;

        let relay = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire_reconnect_timer(&relay, id);
        });
        state.reconnect_timer = Some(ReconnectTimer { id, handle });

        metrics::record_reconnect();
        tracing::info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Upstream reconnect scheduled"
        );
    }

    fn on_reconnect_timer(&self, id: u64) {
        {
            let mut state = self.state.lock();
            if state.reconnect_timer.as_ref().is_none_or(|timer| timer.id != id) {
                return;
            }
            state.reconnect_timer = None;
        }

        self.connect();
    }

    /// Stop for good: no reconnects, close the upstream and every subscriber.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        let clients = {
            let mut state = self.state.lock();
            if !state.session.begin_shutdown() {
                return;
            }

            state.cancel_timer();
            if let Some(link) = state.link.take() {
                link.close();
            }
            metrics::set_upstream_state(state.session.state());
            state.clients.snapshot()
        };

        for client in &clients {
            client.terminate();
        }

        tracing::info!(clients = clients.len(), "Relay shut down");
    }

    // -------------------------------------------------------------------------
    // Subscribers
    // -------------------------------------------------------------------------

    /// Register a subscriber and send it the greeting.
    pub fn accept(&self, client: ClientHandle) {
        let id = client.id();
        let count = {
            let mut state = self.state.lock();
            let status = if state.session.is_ready() {
                UpstreamStatus::Authenticated
            } else {
                UpstreamStatus::Connecting
            };

            match self.codec.encode(&[ConnectionGreeting::new(status)]) {
                Ok(greeting) => {
                    if let Err(e) = client.send(ClientCommand::Frame(Payload::Text(greeting))) {
                        tracing::warn!(client_id = %id, error = %e, "Failed to queue greeting");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode greeting"),
            }

            state.clients.insert(client);
            state.clients.len()
        };

        metrics::set_clients(count);
        tracing::info!(client_id = %id, clients = count, "Subscriber connected");
    }

    /// Handle a text frame from a subscriber.
    pub fn on_client_message(&self, client: &ClientHandle, raw: &str) -> ClientMessageOutcome {
        let request = match self.codec.decode_client(raw) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(client_id = %client.id(), error = %e, "Malformed subscriber message");
                return ClientMessageOutcome::Ignored;
            }
        };

        let action = match request.kind() {
            ClientAction::Ping => {
                match self.codec.encode(&PongReply::default()) {
                    Ok(pong) => {
                        if let Err(e) = client.send(ClientCommand::Frame(Payload::Text(pong))) {
                            tracing::debug!(client_id = %client.id(), error = %e, "Pong not queued");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to encode pong"),
                }
                return ClientMessageOutcome::Pong;
            }
            ClientAction::Subscribe => SubscriptionAction::Subscribe,
            ClientAction::Unsubscribe => SubscriptionAction::Unsubscribe,
            ClientAction::Unknown => {
                tracing::warn!(
                    client_id = %client.id(),
                    action = %request.action,
                    "Unknown subscriber action"
                );
                return ClientMessageOutcome::Ignored;
            }
        };

        let outcome = {
            let mut state = self.state.lock();
            state
                .ledger
                .apply(action, &CategorySymbols::from(&request));
            let outcome = route_locked(&mut state, raw.to_string());
            metrics::set_ledger_stats(&state.ledger.stats());
            outcome
        };

        tracing::debug!(
            client_id = %client.id(),
            action = %request.action,
            outcome = ?outcome,
            "Subscriber request applied"
        );
        ClientMessageOutcome::Routed(outcome)
    }

    /// Send a raw request upstream, or queue it until the session is ready.
    pub fn route_or_queue(&self, raw: String) -> RouteOutcome {
        let mut state = self.state.lock();
        let outcome = route_locked(&mut state, raw);
        metrics::set_ledger_stats(&state.ledger.stats());
        outcome
    }

    /// Queue a frame to every open subscriber without blocking.
    pub fn broadcast(&self, payload: &Payload) -> BroadcastReport {
        let started = Instant::now();
        let clients = self.state.lock().clients.snapshot();
        let mut report = BroadcastReport::default();

        for client in clients.iter().filter(|client| client.is_open()) {
            match client.send(ClientCommand::Frame(payload.clone())) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    metrics::record_delivery_failure(e.as_str());
                    tracing::warn!(client_id = %client.id(), error = %e, "Broadcast delivery failed");
                }
            }
        }

        metrics::record_deliveries(report.delivered as u64);
        metrics::record_broadcast_duration(started.elapsed());
        report
    }

    /// Deregister a subscriber. Safe during a broadcast.
    pub fn remove(&self, id: ClientId) -> bool {
        let (removed, count) = {
            let mut state = self.state.lock();
            let removed = state.clients.remove(id);
            (removed, state.clients.len())
        };

        if removed {
            metrics::set_clients(count);
            tracing::info!(client_id = %id, clients = count, "Subscriber disconnected");
        }
        removed
    }

    /// Record a subscriber's pong.
    pub fn record_pong(&self, id: ClientId) {
        self.state.lock().clients.mark_alive(id);
    }

    // -------------------------------------------------------------------------
    // Liveness
    // -------------------------------------------------------------------------

    /// Terminate subscribers that missed the last probe and ping the rest.
    ///
    /// A subscriber whose ping cannot be queued could never answer it, so it
    /// is terminated in the same round.
    pub fn probe_clients(&self) -> ProbeReport {
        let sweep = self.state.lock().clients.sweep();

        for client in &sweep.dead {
            client.terminate();
            tracing::warn!(client_id = %client.id(), "Subscriber missed heartbeat, terminating");
        }

        let mut pinged = 0;
        let mut unreachable = Vec::new();
        for client in &sweep.probe {
            match client.send(ClientCommand::Ping) {
                Ok(()) => pinged += 1,
                Err(e) => {
                    client.terminate();
                    tracing::warn!(
                        client_id = %client.id(),
                        error = %e,
                        "Heartbeat ping not queued, terminating subscriber"
                    );
                    unreachable.push(client.id());
                }
            }
        }

        let terminated = sweep.dead.len() + unreachable.len();
        if terminated > 0 {
            let count = {
                let mut state = self.state.lock();
                for id in unreachable {
                    state.clients.remove(id);
                }
                state.clients.len()
            };
            metrics::record_clients_terminated(terminated as u64);
            metrics::set_clients(count);
        }

        ProbeReport { terminated, pinged }
    }

    /// Ping the upstream if the session is ready.
    pub fn probe_upstream(&self) -> bool {
        let state = self.state.lock();
        state.session.is_ready() && state.link.as_ref().is_some_and(UpstreamLink::ping)
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Current upstream state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.state.lock().session.state()
    }

    /// Check if the upstream session is authenticated.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.lock().session.is_ready()
    }

    /// Number of connected subscribers.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Delay the next reconnect would use.
    #[must_use]
    pub fn next_reconnect_delay(&self) -> Duration {
        let attempts = self.state.lock().session.reconnect_attempts();
        self.policy.delay(attempts)
    }

    /// Snapshot for health reporting.
    #[must_use]
    pub fn status(&self) -> RelayStatus {
        let state = self.state.lock();
        let session_state = state.session.state();
        RelayStatus {
            state: session_state.as_str(),
            connected: session_state.is_connected(),
            authenticated: session_state.is_ready(),
            reconnect_attempts: state.session.reconnect_attempts(),
            clients: state.clients.len(),
            pending_requests: state.ledger.pending_len(),
            subscriptions: state.ledger.snapshot(),
        }
    }
}

fn route_locked(state: &mut RelayState, raw: String) -> RouteOutcome {
    let RelayState {
        session,
        link,
        ledger,
        ..
    } = state;

    ledger.route_or_queue(raw, |text| {
        session.is_ready() && link.as_ref().is_some_and(|l| l.send_text(text.to_string()))
    })
}

fn fire_reconnect_timer(relay: &Weak<Relay>, id: u64) {
    if let Some(relay) = relay.upgrade() {
        relay.on_reconnect_timer(id);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{MockUpstreamConnector, UpstreamCommand};

    type Attempts = Arc<Mutex<Vec<Generation>>>;

    fn recording_connector() -> (Arc<MockUpstreamConnector>, Attempts) {
        let attempts: Attempts = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&attempts);
        let mut connector = MockUpstreamConnector::new();
        connector
            .expect_connect()
            .returning(move |generation, _events| recorded.lock().push(generation));
        (Arc::new(connector), attempts)
    }

    fn settings() -> RelaySettings {
        RelaySettings {
            credentials: Some(Credentials::new("key".to_string(), "secret".to_string())),
            reconnect: ReconnectConfig::new(
                Duration::from_millis(100),
                Duration::from_secs(1),
                2.0,
            ),
        }
    }

    fn relay() -> (Arc<Relay>, Attempts) {
        let (connector, attempts) = recording_connector();
        let (relay, _events) = Relay::new(settings(), connector);
        (relay, attempts)
    }

    fn text(value: &str) -> Payload {
        Payload::Text(value.to_string())
    }

    /// Drive the relay through connect and transport open.
    fn open(relay: &Arc<Relay>) -> (Generation, mpsc::UnboundedReceiver<UpstreamCommand>) {
        relay.connect();
        let generation = relay.state.lock().session.generation();
        let (link, rx) = UpstreamLink::channel();
        relay.handle_event(UpstreamEvent::Opened { generation, link });
        (generation, rx)
    }

    fn authenticate(relay: &Arc<Relay>, generation: Generation) {
        relay.handle_event(UpstreamEvent::Message {
            generation,
            payload: text(r#"[{"T":"success","msg":"authenticated"}]"#),
        });
    }

    fn drain_upstream(rx: &mut mpsc::UnboundedReceiver<UpstreamCommand>) -> Vec<UpstreamCommand> {
        let mut out = Vec::new();
        while let Ok(command) = rx.try_recv() {
            out.push(command);
        }
        out
    }

    fn drain_client(rx: &mut mpsc::Receiver<ClientCommand>) -> Vec<ClientCommand> {
        let mut out = Vec::new();
        while let Ok(command) = rx.try_recv() {
            out.push(command);
        }
        out
    }

    fn upstream_text(value: &str) -> UpstreamCommand {
        UpstreamCommand::Text(value.to_string())
    }

    // -------------------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (relay, attempts) = relay();

        relay.connect();
        relay.connect();

        assert_eq!(*attempts.lock(), vec![1]);
        assert_eq!(relay.session_state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn open_sends_auth_request() {
        let (relay, _) = relay();
        let (_, mut upstream) = open(&relay);

        assert_eq!(relay.session_state(), SessionState::Authenticating);
        assert_eq!(
            drain_upstream(&mut upstream),
            vec![upstream_text(
                r#"{"action":"auth","key":"key","secret":"secret"}"#
            )]
        );
    }

    #[tokio::test]
    async fn missing_credentials_keep_connection_unauthenticated() {
        let (connector, _) = recording_connector();
        let (relay, _events) = Relay::new(
            RelaySettings {
                credentials: None,
                ..settings()
            },
            connector,
        );

        let (_, mut upstream) = open(&relay);

        assert!(drain_upstream(&mut upstream).is_empty());
        assert_eq!(relay.session_state(), SessionState::Authenticating);
        assert!(relay.status().connected);
        assert!(!relay.status().authenticated);
    }

    #[tokio::test]
    async fn queued_requests_flush_before_restore() {
        let (relay, _) = relay();
        let (client, _client_rx) = ClientHandle::new(16);
        relay.accept(client.clone());

        let raw = r#"{"action":"subscribe","trades":["aapl"]}"#;
        assert_eq!(
            relay.on_client_message(&client, raw),
            ClientMessageOutcome::Routed(RouteOutcome::Queued)
        );
        assert_eq!(relay.status().pending_requests, 1);

        let (generation, mut upstream) = open(&relay);
        drain_upstream(&mut upstream);
        authenticate(&relay, generation);

        assert!(relay.is_ready());
        assert_eq!(
            drain_upstream(&mut upstream),
            vec![
                upstream_text(raw),
                upstream_text(r#"{"action":"subscribe","trades":["AAPL"]}"#),
            ]
        );
        assert_eq!(relay.status().pending_requests, 0);
        assert_eq!(relay.status().subscriptions.trades, vec!["AAPL"]);
    }

    #[tokio::test]
    async fn auth_with_empty_ledger_sends_no_restore() {
        let (relay, _) = relay();
        let (generation, mut upstream) = open(&relay);
        drain_upstream(&mut upstream);

        authenticate(&relay, generation);

        assert!(relay.is_ready());
        assert!(drain_upstream(&mut upstream).is_empty());
    }

    #[tokio::test]
    async fn send_only_when_ready() {
        let (relay, _) = relay();
        assert!(!relay.send("x".to_string()));

        let (generation, mut upstream) = open(&relay);
        assert!(!relay.send("x".to_string()));

        authenticate(&relay, generation);
        drain_upstream(&mut upstream);
        assert!(relay.send("x".to_string()));
        assert_eq!(drain_upstream(&mut upstream), vec![upstream_text("x")]);
    }

    #[tokio::test]
    async fn ready_requests_go_straight_upstream() {
        let (relay, _) = relay();
        let (generation, mut upstream) = open(&relay);
        authenticate(&relay, generation);
        drain_upstream(&mut upstream);

        let (client, _rx) = ClientHandle::new(16);
        relay.accept(client.clone());
        let raw = r#"{"action":"subscribe","quotes":["msft"]}"#;

        assert_eq!(
            relay.on_client_message(&client, raw),
            ClientMessageOutcome::Routed(RouteOutcome::Sent)
        );
        assert_eq!(drain_upstream(&mut upstream), vec![upstream_text(raw)]);
        assert_eq!(relay.status().subscriptions.quotes, vec!["MSFT"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_reconnects_with_backoff() {
        let (relay, attempts) = relay();

        relay.connect();
        relay.handle_event(UpstreamEvent::Closed {
            generation: 1,
            code: None,
            reason: "refused".to_string(),
        });
        assert_eq!(relay.session_state(), SessionState::Disconnected);
        assert_eq!(relay.status().reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(*attempts.lock(), vec![1]);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*attempts.lock(), vec![1, 2]);

        // Second failure doubles the delay.
        relay.handle_event(UpstreamEvent::Closed {
            generation: 2,
            code: None,
            reason: "refused".to_string(),
        });
        assert_eq!(relay.next_reconnect_delay(), Duration::from_millis(400));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*attempts.lock(), vec![1, 2]);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*attempts.lock(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_backoff() {
        let (relay, attempts) = relay();

        for generation in 1..=3 {
            relay.connect();
            relay.handle_event(UpstreamEvent::Closed {
                generation,
                code: None,
                reason: "refused".to_string(),
            });
            relay.state.lock().cancel_timer();
        }
        assert_eq!(relay.status().reconnect_attempts, 3);

        let (generation, _upstream) = open(&relay);
        assert_eq!(relay.status().reconnect_attempts, 0);

        relay.handle_event(UpstreamEvent::Closed {
            generation,
            code: Some(1006),
            reason: String::new(),
        });
        assert_eq!(relay.status().reconnect_attempts, 1);
        assert_eq!(relay.next_reconnect_delay(), Duration::from_millis(200));

        // The reconnect armed by that close uses the initial delay.
        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(attempts.lock().len(), 4);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(attempts.lock().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_close_is_ignored() {
        let (relay, attempts) = relay();
        let (generation, _upstream) = open(&relay);
        authenticate(&relay, generation);

        relay.handle_event(UpstreamEvent::Closed {
            generation: generation + 5,
            code: Some(1000),
            reason: String::new(),
        });
        relay.handle_event(UpstreamEvent::Closed {
            generation: generation - 1,
            code: Some(1000),
            reason: String::new(),
        });

        assert!(relay.is_ready());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*attempts.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_armed_timer() {
        let (relay, attempts) = relay();
        relay.connect();
        relay.handle_event(UpstreamEvent::Closed {
            generation: 1,
            code: None,
            reason: String::new(),
        });

        // A second schedule cancels the first timer.
        relay.schedule_reconnect();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(*attempts.lock(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_reconnect_and_closes_link() {
        let (relay, attempts) = relay();
        let (generation, mut upstream) = open(&relay);
        drain_upstream(&mut upstream);

        relay.shutdown();
        relay.shutdown();

        assert_eq!(drain_upstream(&mut upstream), vec![UpstreamCommand::Close]);

        relay.handle_event(UpstreamEvent::Closed {
            generation,
            code: Some(1000),
            reason: String::new(),
        });
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*attempts.lock(), vec![1]);
        assert_eq!(relay.session_state(), SessionState::Disconnected);

        relay.connect();
        assert_eq!(*attempts.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_prevents_reconnect() {
        let (relay, attempts) = relay();
        relay.connect();
        relay.handle_event(UpstreamEvent::Closed {
            generation: 1,
            code: None,
            reason: String::new(),
        });

        relay.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*attempts.lock(), vec![1]);
    }

    #[tokio::test]
    async fn open_after_shutdown_is_closed() {
        let (relay, _) = relay();
        relay.connect();
        relay.shutdown();

        let (link, mut rx) = UpstreamLink::channel();
        relay.handle_event(UpstreamEvent::Opened {
            generation: 1,
            link,
        });

        assert_eq!(drain_upstream(&mut rx), vec![UpstreamCommand::Close]);
    }

    #[tokio::test]
    async fn run_shuts_down_on_cancel() {
        let (connector, _) = recording_connector();
        let (relay, events) = Relay::new(settings(), connector);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&relay).run(events, cancel.clone()));
        cancel.cancel();
        task.await.unwrap();

        assert!(relay.state.lock().session.is_shutting_down());
    }

    // -------------------------------------------------------------------------
    // Subscribers
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn accept_greets_with_upstream_status() {
        let (relay, _) = relay();
        let (early, mut early_rx) = ClientHandle::new(4);
        relay.accept(early);

        let (generation, _upstream) = open(&relay);
        authenticate(&relay, generation);

        let (late, mut late_rx) = ClientHandle::new(4);
        relay.accept(late);

        assert_eq!(
            early_rx.try_recv().unwrap(),
            ClientCommand::Frame(text(
                r#"[{"T":"success","msg":"connected","upstreamStatus":"connecting"}]"#
            ))
        );
        assert_eq!(
            late_rx.try_recv().unwrap(),
            ClientCommand::Frame(text(
                r#"[{"T":"success","msg":"connected","upstreamStatus":"authenticated"}]"#
            ))
        );
        assert_eq!(relay.client_count(), 2);
    }

    #[tokio::test]
    async fn ping_is_answered_locally() {
        let (relay, _) = relay();
        let (generation, mut upstream) = open(&relay);
        authenticate(&relay, generation);
        drain_upstream(&mut upstream);

        let (pinger, mut pinger_rx) = ClientHandle::new(8);
        let (other, mut other_rx) = ClientHandle::new(8);
        relay.accept(pinger.clone());
        relay.accept(other);
        drain_client(&mut pinger_rx);
        drain_client(&mut other_rx);

        assert_eq!(
            relay.on_client_message(&pinger, r#"{"action":"ping"}"#),
            ClientMessageOutcome::Pong
        );

        assert_eq!(
            drain_client(&mut pinger_rx),
            vec![ClientCommand::Frame(text(r#"{"type":"pong"}"#))]
        );
        assert!(drain_client(&mut other_rx).is_empty());
        assert!(drain_upstream(&mut upstream).is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_are_dropped() {
        let (relay, _) = relay();
        let (client, _rx) = ClientHandle::new(8);
        relay.accept(client.clone());

        assert_eq!(
            relay.on_client_message(&client, "{not json"),
            ClientMessageOutcome::Ignored
        );
        assert_eq!(
            relay.on_client_message(&client, r#"{"action":"listen"}"#),
            ClientMessageOutcome::Ignored
        );

        assert_eq!(relay.status().pending_requests, 0);
        assert_eq!(relay.client_count(), 1);
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn union_unsubscribe_removes_for_all_clients() {
        let (relay, _) = relay();
        let (a, _rx_a) = ClientHandle::new(8);
        let (b, _rx_b) = ClientHandle::new(8);
        relay.accept(a.clone());
        relay.accept(b.clone());

        relay.on_client_message(&a, r#"{"action":"subscribe","trades":["AAPL"]}"#);
        relay.on_client_message(&b, r#"{"action":"unsubscribe","trades":["AAPL"]}"#);

        assert!(relay.status().subscriptions.trades.is_empty());
        assert_eq!(relay.status().pending_requests, 2);
    }

    #[tokio::test]
    async fn upstream_frames_are_broadcast_verbatim() {
        let (relay, _) = relay();
        let (generation, _upstream) = open(&relay);

        let (a, mut rx_a) = ClientHandle::new(8);
        let (b, mut rx_b) = ClientHandle::new(8);
        relay.accept(a);
        relay.accept(b);
        drain_client(&mut rx_a);
        drain_client(&mut rx_b);

        let frames = [
            text(r#"[{"T":"t","S":"AAPL","p":1.5}]"#),
            text("not json at all"),
            Payload::Binary(vec![0, 159, 146, 150]),
            text(r#"[{"T":"error","code":402,"msg":"auth failed"}]"#),
        ];
        for payload in &frames {
            relay.handle_event(UpstreamEvent::Message {
                generation,
                payload: payload.clone(),
            });
        }

        let expected: Vec<_> = frames.iter().cloned().map(ClientCommand::Frame).collect();
        assert_eq!(drain_client(&mut rx_a), expected);
        assert_eq!(drain_client(&mut rx_b), expected);
        assert_eq!(relay.session_state(), SessionState::Authenticating);
    }

    #[tokio::test]
    async fn auth_success_is_broadcast_too() {
        let (relay, _) = relay();
        let (client, mut rx) = ClientHandle::new(8);
        relay.accept(client);
        drain_client(&mut rx);

        let (generation, _upstream) = open(&relay);
        authenticate(&relay, generation);

        assert_eq!(
            drain_client(&mut rx),
            vec![ClientCommand::Frame(text(
                r#"[{"T":"success","msg":"authenticated"}]"#
            ))]
        );
    }

    #[tokio::test]
    async fn failing_client_does_not_block_others() {
        let (relay, _) = relay();
        let (full, _full_rx) = ClientHandle::new(1);
        let (closed, closed_rx) = ClientHandle::new(8);
        let (healthy, mut healthy_rx) = ClientHandle::new(8);
        relay.accept(full);
        relay.accept(closed);
        relay.accept(healthy);
        drop(closed_rx);
        drain_client(&mut healthy_rx);

        // `full` still holds its greeting, so its queue is at capacity.
        let report = relay.broadcast(&text("tick"));

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(
            drain_client(&mut healthy_rx),
            vec![ClientCommand::Frame(text("tick"))]
        );
    }

    #[tokio::test]
    async fn removed_clients_stop_receiving() {
        let (relay, _) = relay();
        let (client, mut rx) = ClientHandle::new(8);
        let id = client.id();
        relay.accept(client);
        drain_client(&mut rx);

        assert!(relay.remove(id));
        assert!(!relay.remove(id));
        assert_eq!(relay.broadcast(&text("tick")), BroadcastReport::default());
        assert!(drain_client(&mut rx).is_empty());
    }

    // -------------------------------------------------------------------------
    // Liveness
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn silent_client_is_terminated_after_one_missed_probe() {
        let (relay, _) = relay();
        let (responsive, mut responsive_rx) = ClientHandle::new(8);
        let (silent, mut silent_rx) = ClientHandle::new(8);
        relay.accept(responsive.clone());
        relay.accept(silent.clone());
        drain_client(&mut responsive_rx);
        drain_client(&mut silent_rx);

        let first = relay.probe_clients();
        assert_eq!(
            first,
            ProbeReport {
                terminated: 0,
                pinged: 2
            }
        );
        assert_eq!(drain_client(&mut silent_rx), vec![ClientCommand::Ping]);

        relay.record_pong(responsive.id());

        let second = relay.probe_clients();
        assert_eq!(
            second,
            ProbeReport {
                terminated: 1,
                pinged: 1
            }
        );
        assert!(!silent.is_open());
        assert!(responsive.is_open());
        assert_eq!(relay.client_count(), 1);
    }

    #[tokio::test]
    async fn client_with_full_queue_is_terminated_instead_of_pinged() {
        let (relay, _) = relay();
        let (backed_up, mut backed_up_rx) = ClientHandle::new(2);
        let (healthy, mut healthy_rx) = ClientHandle::new(8);
        relay.accept(backed_up.clone());
        relay.accept(healthy.clone());

        // Greeting plus one frame fills the two-slot queue.
        assert_eq!(
            relay.broadcast(&text("tick")),
            BroadcastReport {
                delivered: 2,
                failed: 0
            }
        );

        let report = relay.probe_clients();
        assert_eq!(
            report,
            ProbeReport {
                terminated: 1,
                pinged: 1
            }
        );
        assert!(!backed_up.is_open());
        assert!(healthy.is_open());
        assert_eq!(relay.client_count(), 1);
        assert!(!drain_client(&mut backed_up_rx).contains(&ClientCommand::Ping));
        assert_eq!(drain_client(&mut healthy_rx).last(), Some(&ClientCommand::Ping));

        // The healthy client keeps being probed normally.
        relay.record_pong(healthy.id());
        assert_eq!(
            relay.probe_clients(),
            ProbeReport {
                terminated: 0,
                pinged: 1
            }
        );
    }

    #[tokio::test]
    async fn upstream_probe_only_when_ready() {
        let (relay, _) = relay();
        assert!(!relay.probe_upstream());

        let (generation, mut upstream) = open(&relay);
        drain_upstream(&mut upstream);
        assert!(!relay.probe_upstream());

        authenticate(&relay, generation);
        drain_upstream(&mut upstream);
        assert!(relay.probe_upstream());
        assert_eq!(drain_upstream(&mut upstream), vec![UpstreamCommand::Ping]);
    }

    #[tokio::test]
    async fn shutdown_terminates_clients() {
        let (relay, _) = relay();
        let (client, _rx) = ClientHandle::new(8);
        relay.accept(client.clone());

        relay.shutdown();

        assert!(!client.is_open());
    }
}
