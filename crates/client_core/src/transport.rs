//! Real-time channel for one room.
//!
//! The connection owns a driver task per socket. Every driver is tagged with
//! the generation that spawned it; opening or releasing the connection bumps
//! the generation so callbacks from an older socket or an older reconnect
//! timer are ignored.
//!
//! Teardown goes through a `watch` flag rather than the state mutex, so
//! dropping the connection always reaches the driver and the timer.

use std::{fmt, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use shared::{domain::RoomId, protocol::ChatEnvelope};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientSettings,
    envelope::{parse_envelope, EnvelopeRejection},
    error::TransportError,
};

/// Close code that marks a deliberate shutdown; it is never retried.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to reopen after an abnormal close.
    Reconnecting { attempt: u32 },
    /// Reconnect attempts are used up; only a manual connect recovers.
    Exhausted,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Message(ChatEnvelope),
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub ws_url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub event_capacity: usize,
}

impl From<&ClientSettings> for TransportSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            ws_url: settings.ws_url.clone(),
            reconnect_delay: settings.reconnect_delay,
            max_reconnect_attempts: settings.max_reconnect_attempts,
            connect_timeout: settings.connect_timeout,
            event_capacity: settings.event_capacity,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
struct ConnectionTarget {
    credential: String,
    room_id: RoomId,
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("credential", &"<redacted>")
            .field("room_id", &self.room_id)
            .finish()
    }
}

enum Outbound {
    Text(String),
    Close,
}

struct TransportInner {
    state: ConnectionState,
    target: Option<ConnectionTarget>,
    attempt: u32,
    generation: u64,
    deliberate_close: bool,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

struct Shared {
    settings: TransportSettings,
    inner: Mutex<TransportInner>,
    events: broadcast::Sender<TransportEvent>,
    /// Lossless copy of every event for the owner; subscribers may lag.
    feed: Option<mpsc::UnboundedSender<TransportEvent>>,
    shutdown: watch::Sender<bool>,
}

/// Reconnecting WebSocket connection scoped to a single room.
pub struct TransportConnection {
    shared: Arc<Shared>,
}

impl TransportConnection {
    pub fn new(settings: TransportSettings) -> Self {
        Self::build(settings, None)
    }

    /// Like [`Self::new`], plus an unbounded receiver that sees every event
    /// in order regardless of `event_capacity`.
    pub fn with_feed(
        settings: TransportSettings,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        (Self::build(settings, Some(feed_tx)), feed_rx)
    }

    fn build(
        settings: TransportSettings,
        feed: Option<mpsc::UnboundedSender<TransportEvent>>,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                settings,
                inner: Mutex::new(TransportInner {
                    state: ConnectionState::Disconnected,
                    target: None,
                    attempt: 0,
                    generation: 0,
                    deliberate_close: false,
                    outbound: None,
                    reconnect_timer: None,
                }),
                events,
                feed,
                shutdown,
            }),
        }
    }

    /// Opens the channel for `room_id`. A manual connect resets the reconnect
    /// counter; connecting to the room already connected or connecting is a
    /// no-op, while a different room releases the current socket first.
    pub async fn connect(
        &self,
        credential: Option<&str>,
        room_id: Option<RoomId>,
    ) -> Result<(), TransportError> {
        let credential = credential
            .filter(|credential| !credential.trim().is_empty())
            .ok_or(TransportError::MissingCredential)?;
        let room_id = room_id.ok_or(TransportError::MissingRoom)?;
        let target = ConnectionTarget {
            credential: credential.to_string(),
            room_id,
        };
        self.shared.connection_url(&target)?;

        let mut inner = self.shared.inner.lock().await;
        if inner.target.as_ref() == Some(&target)
            && matches!(
                inner.state,
                ConnectionState::Connected | ConnectionState::Connecting
            )
        {
            debug!(room_id = room_id.0, "ws: already connected to room");
            return Ok(());
        }
        if inner.target.as_ref().is_some_and(|current| current != &target) {
            self.shared.release(&mut inner);
        }
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        inner.target = Some(target);
        inner.attempt = 0;
        self.shared.open(&mut inner)
    }

    /// Reconnects to the last target after the attempts were exhausted or
    /// after a manual disconnect.
    pub async fn retry(&self) -> Result<(), TransportError> {
        let target = self.shared.inner.lock().await.target.clone();
        match target {
            Some(target) => {
                self.connect(Some(&target.credential), Some(target.room_id))
                    .await
            }
            None => Err(TransportError::MissingCredential),
        }
    }

    /// Closes the socket with the normal closure code and cancels any
    /// pending reconnect. The target is kept for [`Self::retry`].
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.release(&mut inner);
        info!("ws: disconnected");
    }

    /// Disconnects and forgets the credential.
    pub async fn sign_out(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.release(&mut inner);
        inner.target = None;
        info!("ws: signed out");
    }

    /// Serializes `frame` and writes it to the socket. Fails unless the
    /// connection is open.
    pub async fn send<T: Serialize + ?Sized>(&self, frame: &T) -> Result<(), TransportError> {
        let payload =
            serde_json::to_string(frame).map_err(|err| TransportError::Encode(err.to_string()))?;
        let inner = self.shared.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        inner
            .outbound
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .send(Outbound::Text(payload))
            .map_err(|_| TransportError::NotConnected)
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.lock().await.state
    }

    pub async fn reconnect_attempt(&self) -> u32 {
        self.shared.inner.lock().await.attempt
    }

    pub async fn room_id(&self) -> Option<RoomId> {
        self.shared
            .inner
            .lock()
            .await
            .target
            .as_ref()
            .map(|target| target.room_id)
    }

    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Stops the connection for good: the socket is closed normally, any
    /// scheduled reconnect is dropped and later connects fail. Does not
    /// wait on the state lock.
    pub fn shutdown(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        match self.shared.inner.try_lock() {
            Ok(mut inner) => self.shared.release(&mut inner),
            Err(_) => debug!("ws: state busy at shutdown, driver closes on the signal"),
        }
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn connection_url(&self, target: &ConnectionTarget) -> Result<String, TransportError> {
        let invalid = |reason: String| TransportError::InvalidUrl {
            url: self.settings.ws_url.clone(),
            reason,
        };
        let mut url = Url::parse(&self.settings.ws_url).map_err(|err| invalid(err.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid(format!("cannot switch to {scheme}")))?;
        url.query_pairs_mut()
            .append_pair("token", &target.credential)
            .append_pair("project_id", &target.room_id.to_string());
        Ok(url.into())
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(feed) = &self.feed {
            let _ = feed.send(event.clone());
        }
        let _ = self.events.send(event);
    }

    fn set_state(&self, inner: &mut TransportInner, state: ConnectionState) {
        if inner.state != state {
            inner.state = state;
            self.emit(TransportEvent::StateChanged(state));
        }
    }

    fn open(self: &Arc<Self>, inner: &mut TransportInner) -> Result<(), TransportError> {
        if self.is_shut_down() {
            return Err(TransportError::ShutDown);
        }
        let target = inner
            .target
            .clone()
            .ok_or(TransportError::MissingCredential)?;
        let url = self.connection_url(&target)?;

        inner.generation += 1;
        inner.deliberate_close = false;
        let generation = inner.generation;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        inner.outbound = Some(outbound_tx);
        self.set_state(inner, ConnectionState::Connecting);
        info!(
            room_id = target.room_id.0,
            attempt = inner.attempt,
            "ws: connecting"
        );

        // Detached: the driver ends on close, or once its generation is stale.
        let shared = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            shared.drive(generation, url, outbound_rx, shutdown).await;
        });
        Ok(())
    }

    /// Deliberate close of whatever the connection currently holds.
    fn release(&self, inner: &mut TransportInner) {
        inner.deliberate_close = true;
        inner.generation += 1;
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(outbound) = inner.outbound.take() {
            let _ = outbound.send(Outbound::Close);
        }
        self.set_state(inner, ConnectionState::Disconnected);
    }

    async fn drive(
        self: Arc<Self>,
        generation: u64,
        url: String,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let handshake = tokio::time::timeout(self.settings.connect_timeout, connect_async(url)).await;
        let ws_stream = match handshake {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(err)) => {
                warn!("ws: handshake failed: {err}");
                self.handle_close(generation, None).await;
                return;
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.settings.connect_timeout.as_millis() as u64,
                    "ws: handshake timed out"
                );
                self.handle_close(generation, None).await;
                return;
            }
        };
        let (mut sink, mut stream) = ws_stream.split();

        if !self.handle_open(generation).await {
            let _ = sink.send(normal_close()).await;
            return;
        }

        let close_code = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(normal_close()).await;
                    break Some(NORMAL_CLOSURE);
                }
                command = outbound.recv() => match command {
                    Some(Outbound::Text(payload)) => {
                        if let Err(err) = sink.send(Message::Text(payload)).await {
                            warn!("ws: send failed: {err}");
                            break None;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(normal_close()).await;
                        break Some(NORMAL_CLOSURE);
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(generation, &text).await,
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|frame| u16::from(frame.code));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("ws: receive failed: {err}");
                        break None;
                    }
                    None => break None,
                },
            }
        };

        self.handle_close(generation, close_code).await;
    }

    async fn handle_open(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || self.is_shut_down() {
            debug!("ws: stale socket opened, closing it");
            return false;
        }
        inner.attempt = 0;
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        info!(
            room_id = inner.target.as_ref().map(|target| target.room_id.0),
            "ws: connected"
        );
        self.set_state(&mut inner, ConnectionState::Connected);
        true
    }

    async fn handle_frame(&self, generation: u64, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!("ws: discarding unparseable frame: {err}");
                return;
            }
        };
        let envelope = match parse_envelope(value) {
            Ok(envelope) => envelope,
            Err(EnvelopeRejection::WrongKind) => {
                debug!("ws: ignoring non-chat frame");
                return;
            }
            Err(rejection) => {
                warn!("ws: discarding invalid chat frame: {rejection}");
                return;
            }
        };

        let inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        if inner.target.as_ref().map(|target| target.room_id) != Some(envelope.room_id) {
            debug!(
                room_id = envelope.room_id.0,
                "ws: ignoring frame for another room"
            );
            return;
        }
        self.emit(TransportEvent::Message(envelope));
    }

    async fn handle_close(self: &Arc<Self>, generation: u64, code: Option<u16>) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        inner.outbound = None;
        self.set_state(&mut inner, ConnectionState::Disconnected);

        if inner.deliberate_close || code == Some(NORMAL_CLOSURE) || self.is_shut_down() {
            info!(?code, "ws: closed normally");
            return;
        }
        if inner.target.is_none() {
            return;
        }
        if inner.attempt >= self.settings.max_reconnect_attempts {
            warn!(
                attempts = inner.attempt,
                "ws: reconnect attempts exhausted, real-time updates unavailable"
            );
            self.set_state(&mut inner, ConnectionState::Exhausted);
            return;
        }

        inner.attempt += 1;
        let attempt = inner.attempt;
        warn!(
            ?code,
            attempt,
            max_attempts = self.settings.max_reconnect_attempts,
            "ws: connection lost, reconnecting in {:?}",
            self.settings.reconnect_delay
        );
        self.set_state(&mut inner, ConnectionState::Reconnecting { attempt });

        let shared = Arc::clone(self);
        let delay = self.settings.reconnect_delay;
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = shared.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.reconnect_timer = None;
            if let Err(err) = shared.open(&mut inner) {
                warn!("ws: reconnect aborted: {err}");
                shared.set_state(&mut inner, ConnectionState::Disconnected);
            }
        }));
    }
}

fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "Manual disconnect".into(),
    }))
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
