use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::channel::StateSummary;

pub use crate::error::HubError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub username: String,
    pub message: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl ChatMessage {
    pub fn now(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            message: message.into(),
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Events pushed to viewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    StateUpdate { state: StateSummary },
    Chat(ChatMessage),
}

impl HubEvent {
    pub fn to_json(&self) -> Result<String, HubError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Deserialize)]
struct InboundChat {
    username: String,
    message: String,
}

/// Parses a viewer payload. Only `{"type":"chat","username":..,"message":..}`
/// is recognised.
pub fn parse_inbound(raw: &str) -> Result<(String, String), HubError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| HubError::Malformed(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::Malformed("missing type".into()))?;
    if kind != "chat" {
        return Err(HubError::UnsupportedKind(kind.to_string()));
    }
    let chat: InboundChat =
        serde_json::from_value(value).map_err(|err| HubError::Malformed(err.to_string()))?;
    Ok((chat.username, chat.message))
}

/// Receiving side of a joined connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Receiver<String>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }
}

#[derive(Default)]
struct HubInner {
    connections: HashMap<ConnectionId, mpsc::Sender<String>>,
    chat: VecDeque<ChatMessage>,
    last_state: Option<String>,
}

impl HubInner {
    /// Queues `payload` on every connection. Closed connections are pruned;
    /// a full queue drops the payload for that connection only.
    fn deliver(&mut self, payload: &str) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in &self.connections {
            match sender.try_send(payload.to_string()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection = %id, "error broadcasting message: outbound queue full");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            debug!(connection = %id, "pruning closed connection");
            self.connections.remove(&id);
        }
        delivered
    }
}

/// Live viewer connections plus the shared chat ring.
///
/// Every mutation and every broadcast happens under one lock, so chat events
/// reach each connection in the same order they enter the ring.
pub struct BroadcastHub {
    inner: Mutex<HubInner>,
    next_id: AtomicU64,
    chat_capacity: usize,
    outbound_buffer: usize,
}

impl fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("chat_capacity", &self.chat_capacity)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(100, 256)
    }
}

impl BroadcastHub {
    pub fn new(chat_capacity: usize, outbound_buffer: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            next_id: AtomicU64::new(1),
            chat_capacity,
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a connection. The new connection is first sent the last
    /// broadcast state and the chat history, then every later event.
    pub fn join(&self) -> ConnectionHandle {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let capacity = self.outbound_buffer.max(self.chat_capacity + 1);
        let (sender, outbound) = mpsc::channel(capacity);

        let mut inner = self.lock();
        if let Some(state) = &inner.last_state {
            let _ = sender.try_send(state.clone());
        }
        for message in &inner.chat {
            match HubEvent::Chat(message.clone()).to_json() {
                Ok(payload) => {
                    let _ = sender.try_send(payload);
                }
                Err(err) => warn!(error = %err, "failed to encode chat history"),
            }
        }
        inner.connections.insert(id, sender);
        debug!(connection = %id, total = inner.connections.len(), "connection joined");
        ConnectionHandle { id, outbound }
    }

    /// Removes a connection; returns false if it was already gone.
    pub fn leave(&self, id: ConnectionId) -> bool {
        let mut inner = self.lock();
        let removed = inner.connections.remove(&id).is_some();
        if removed {
            debug!(connection = %id, total = inner.connections.len(), "connection left");
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn send_to(&self, id: ConnectionId, event: &HubEvent) -> Result<(), HubError> {
        let payload = event.to_json()?;
        let mut inner = self.lock();
        let sender = inner
            .connections
            .get(&id)
            .ok_or(HubError::UnknownConnection(id))?;
        match sender.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(HubError::QueueFull(id)),
            Err(TrySendError::Closed(_)) => {
                inner.connections.remove(&id);
                Err(HubError::UnknownConnection(id))
            }
        }
    }

    /// Sends a state update to every connection and returns how many
    /// accepted it.
    pub fn broadcast_state(&self, state: &StateSummary) -> usize {
        let event = HubEvent::StateUpdate {
            state: state.clone(),
        };
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode state update");
                return 0;
            }
        };
        let mut inner = self.lock();
        inner.last_state = Some(payload.clone());
        inner.deliver(&payload)
    }

    pub fn post_chat(&self, username: impl Into<String>, message: impl Into<String>) -> ChatMessage {
        let message = ChatMessage::now(username, message);
        self.post_chat_message(message.clone());
        message
    }

    /// Appends to the chat ring, evicting the oldest entries beyond its
    /// capacity, then fans the message out.
    pub fn post_chat_message(&self, message: ChatMessage) -> usize {
        let payload = match HubEvent::Chat(message.clone()).to_json() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode chat message");
                return 0;
            }
        };
        let mut inner = self.lock();
        inner.chat.push_back(message);
        while inner.chat.len() > self.chat_capacity {
            inner.chat.pop_front();
        }
        inner.deliver(&payload)
    }

    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.lock().chat.iter().cloned().collect()
    }

    /// Applies one inbound payload from `id`. Anything other than a chat
    /// message is logged and dropped.
    pub fn handle_inbound(&self, id: ConnectionId, raw: &str) -> Option<ChatMessage> {
        match parse_inbound(raw) {
            Ok((username, message)) => Some(self.post_chat(username, message)),
            Err(err) => {
                warn!(connection = %id, error = %err, "dropping inbound message");
                None
            }
        }
    }
}
