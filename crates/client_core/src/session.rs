//! Chat session for one room: history, real-time merges, and sends.

use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{AuthorProjection, ChatEnvelope, ChatMessage, ClientFrame, CreateMessageRequest},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    api::ChatApi,
    config::ClientSettings,
    error::{RequestError, SendError, SessionError, TransportError},
    filter::ChatFilter,
    store::{ReconciliationStore, StoredMessage},
    transport::{ConnectionState, TransportConnection, TransportEvent, TransportSettings},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The ordered sequence or its projection changed.
    MessagesChanged,
    ConnectionChanged(ConnectionState),
    /// Reconnects are exhausted; durable reads and writes still work.
    RealtimeUnavailable,
    HistoryLoaded { added: usize },
}

struct RoomState {
    store: ReconciliationStore,
    filter: Option<ChatFilter>,
    last_provisional_id: i64,
}

pub struct RoomSession {
    room_id: RoomId,
    credential: Option<String>,
    author: AuthorProjection,
    api: Arc<dyn ChatApi>,
    transport: TransportConnection,
    state: Arc<Mutex<RoomState>>,
    events: broadcast::Sender<SessionEvent>,
    pump: JoinHandle<()>,
}

impl RoomSession {
    /// Builds the session and starts forwarding real-time frames into its
    /// store. Must be called inside a Tokio runtime.
    pub fn new(
        settings: &ClientSettings,
        api: Arc<dyn ChatApi>,
        credential: Option<String>,
        room_id: RoomId,
        author: AuthorProjection,
    ) -> Self {
        let (transport, feed) = TransportConnection::with_feed(TransportSettings::from(settings));
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let state = Arc::new(Mutex::new(RoomState {
            store: ReconciliationStore::new(settings.merge_policy()),
            filter: None,
            last_provisional_id: 0,
        }));
        let pump = tokio::spawn(pump_transport_events(
            feed,
            Arc::clone(&state),
            events.clone(),
        ));

        Self {
            room_id,
            credential,
            author: local_author(author),
            api,
            transport,
            state,
            events,
            pump,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Opens the real-time channel, then loads history for the active scope.
    pub async fn start(&self) -> Result<usize, SessionError> {
        self.transport
            .connect(self.credential.as_deref(), Some(self.room_id))
            .await?;
        Ok(self.load_history().await?)
    }

    /// Bulk-loads the active scope and merges it into the store. Pending
    /// entries and messages already received survive the load.
    pub async fn load_history(&self) -> Result<usize, RequestError> {
        let scope = self.state.lock().await.filter;
        self.load_scope(scope).await
    }

    async fn load_scope(&self, scope: Option<ChatFilter>) -> Result<usize, RequestError> {
        let messages = match self.api.list_messages(self.room_id, scope.as_ref()).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(room_id = self.room_id.0, ?scope, "chat: history load failed: {err}");
                return Err(err);
            }
        };
        let added = self.state.lock().await.store.apply_history(messages, scope);
        info!(room_id = self.room_id.0, ?scope, added, "chat: history loaded");
        let _ = self.events.send(SessionEvent::HistoryLoaded { added });
        if added > 0 {
            let _ = self.events.send(SessionEvent::MessagesChanged);
        }
        Ok(added)
    }

    /// Changes the projection. A scope not covered by earlier loads is
    /// fetched before the projection is returned.
    pub async fn set_filter(
        &self,
        filter: Option<ChatFilter>,
    ) -> Result<Vec<ChatMessage>, RequestError> {
        let needs_load = {
            let mut state = self.state.lock().await;
            state.filter = filter;
            !state.store.has_loaded(filter.as_ref())
        };
        let _ = self.events.send(SessionEvent::MessagesChanged);
        if needs_load {
            self.load_scope(filter).await?;
        }
        Ok(self.visible_messages().await)
    }

    pub async fn filter(&self) -> Option<ChatFilter> {
        self.state.lock().await.filter
    }

    pub async fn visible_messages(&self) -> Vec<ChatMessage> {
        let state = self.state.lock().await;
        state
            .store
            .visible(state.filter.as_ref())
            .into_iter()
            .cloned()
            .collect()
    }

    /// Like [`Self::visible_messages`] but keeps the delivery marker.
    pub async fn visible_entries(&self) -> Vec<StoredMessage> {
        let state = self.state.lock().await;
        let filter = state.filter;
        state
            .store
            .entries()
            .iter()
            .filter(|entry| crate::filter::matches_filter(filter.as_ref(), &entry.message))
            .cloned()
            .collect()
    }

    /// Inserts an optimistic entry, then performs the durable write. On
    /// success the entry is reconciled with the stored record; on failure it
    /// is rolled back and the reason returned.
    pub async fn send_message(&self, content: &str) -> Result<ChatMessage, SendError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyContent);
        }

        let (provisional_id, request) = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let provisional_id = now
                .timestamp_millis()
                .max(state.last_provisional_id + 1);
            state.last_provisional_id = provisional_id;

            let request = CreateMessageRequest {
                content: content.to_string(),
                file_id: state.filter.and_then(|filter| filter.file_id()),
                task_id: state.filter.and_then(|filter| filter.task_id()),
            };
            state.store.insert_pending(ChatMessage {
                id: MessageId(provisional_id),
                content: request.content.clone(),
                author_id: UserId(self.author.id),
                author: self.author.clone(),
                room_id: self.room_id,
                file_id: request.file_id,
                task_id: request.task_id,
                created_at: now,
                updated_at: now,
            });
            (MessageId(provisional_id), request)
        };
        let _ = self.events.send(SessionEvent::MessagesChanged);

        match self.api.create_message(self.room_id, &request).await {
            Ok(stored) => {
                let outcome = self
                    .state
                    .lock()
                    .await
                    .store
                    .confirm(provisional_id, stored.clone(), Utc::now());
                if outcome.changed() {
                    let _ = self.events.send(SessionEvent::MessagesChanged);
                }
                Ok(stored)
            }
            Err(err) => {
                self.state.lock().await.store.remove_pending(provisional_id);
                warn!(
                    room_id = self.room_id.0,
                    "chat: send failed, optimistic entry rolled back: {err}"
                );
                let _ = self.events.send(SessionEvent::MessagesChanged);
                Err(SendError::Request(err))
            }
        }
    }

    /// Application-level keepalive.
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.transport.send(&ClientFrame::Ping).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.transport.state().await
    }

    pub async fn retry_connection(&self) -> Result<(), TransportError> {
        self.transport.retry().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Closes the real-time channel normally and stops merging frames.
    pub async fn close(&self) {
        self.transport.disconnect().await;
        self.pump.abort();
        info!(room_id = self.room_id.0, "chat: session closed");
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.transport.shutdown();
        self.pump.abort();
    }
}

fn local_author(mut author: AuthorProjection) -> AuthorProjection {
    if author.name.is_empty() && author.username.is_empty() {
        author.username = "You".into();
        author.name = "You".into();
    }
    author
}

/// Drains the transport feed into the store. The feed is unbounded, so a
/// burst that arrives while the store is locked is merged late, never lost.
async fn pump_transport_events(
    mut feed: mpsc::UnboundedReceiver<TransportEvent>,
    state: Arc<Mutex<RoomState>>,
    events: broadcast::Sender<SessionEvent>,
) {
    while let Some(event) = feed.recv().await {
        match event {
            TransportEvent::Message(envelope) => {
                merge_broadcast(&state, &events, envelope).await;
            }
            TransportEvent::StateChanged(connection) => {
                let _ = events.send(SessionEvent::ConnectionChanged(connection));
                if connection == ConnectionState::Exhausted {
                    let _ = events.send(SessionEvent::RealtimeUnavailable);
                }
            }
        }
    }
}

async fn merge_broadcast(
    state: &Mutex<RoomState>,
    events: &broadcast::Sender<SessionEvent>,
    envelope: ChatEnvelope,
) {
    let outcome = state
        .lock()
        .await
        .store
        .merge(envelope.payload, Utc::now());
    if outcome.changed() {
        let _ = events.send(SessionEvent::MessagesChanged);
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
