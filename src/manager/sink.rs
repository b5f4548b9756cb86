//! Persistence and live-subscriber collaborators.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::error::Result;
use crate::types::{EventEnvelope, SessionMode, StoredMessage};

/// Message persistence consumed by the orchestrator.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn add_message(&self, conversation_id: &str, message: StoredMessage) -> Result<()>;

    /// Upsert keyed by message id, used for streaming accretion.
    async fn add_or_update_message(
        &self,
        conversation_id: &str,
        message: StoredMessage,
        source_tag: &str,
    ) -> Result<()>;

    async fn load_session_mode(&self, conversation_id: &str) -> Result<Option<SessionMode>>;

    async fn save_session_mode(&self, conversation_id: &str, mode: SessionMode) -> Result<()>;

    async fn load_session_key(&self, conversation_id: &str) -> Result<Option<String>>;

    async fn save_session_key(&self, conversation_id: &str, key: &str) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    messages: HashMap<String, Vec<StoredMessage>>,
    modes: HashMap<String, SessionMode>,
    keys: HashMap<String, String>,
}

/// In-memory [`MessageStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of a conversation in insertion order.
    pub async fn messages(&self, conversation_id: &str) -> Vec<StoredMessage> {
        self.state
            .read()
            .await
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn add_message(&self, conversation_id: &str, message: StoredMessage) -> Result<()> {
        self.state
            .write()
            .await
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn add_or_update_message(
        &self,
        conversation_id: &str,
        message: StoredMessage,
        source_tag: &str,
    ) -> Result<()> {
        tracing::trace!(conversation_id, message_id = message.id, source_tag, "Upsert message");
        let mut state = self.state.write().await;
        let messages = state
            .messages
            .entry(conversation_id.to_string())
            .or_default();
        match messages.iter_mut().find(|existing| existing.id == message.id) {
            Some(existing) => *existing = message,
            None => messages.push(message),
        }
        Ok(())
    }

    async fn load_session_mode(&self, conversation_id: &str) -> Result<Option<SessionMode>> {
        Ok(self.state.read().await.modes.get(conversation_id).copied())
    }

    async fn save_session_mode(&self, conversation_id: &str, mode: SessionMode) -> Result<()> {
        self.state
            .write()
            .await
            .modes
            .insert(conversation_id.to_string(), mode);
        Ok(())
    }

    async fn load_session_key(&self, conversation_id: &str) -> Result<Option<String>> {
        Ok(self.state.read().await.keys.get(conversation_id).cloned())
    }

    async fn save_session_key(&self, conversation_id: &str, key: &str) -> Result<()> {
        self.state
            .write()
            .await
            .keys
            .insert(conversation_id.to_string(), key.to_string());
        Ok(())
    }
}

/// Fire-and-forget broadcast to live subscribers. Must not block.
pub trait EventBus: Send + Sync {
    fn emit(&self, conversation_id: &str, envelope: EventEnvelope);
}

/// [`EventBus`] over a tokio broadcast channel; lagging subscribers lose events.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastBus {
    fn emit(&self, conversation_id: &str, envelope: EventEnvelope) {
        if self.tx.send(envelope).is_err() {
            tracing::trace!(conversation_id, "No live subscribers");
        }
    }
}
