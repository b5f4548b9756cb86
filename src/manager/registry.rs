//! Conversations by id, plus a single active slot.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::conversation::AgentManager;
use crate::error::Result;

/// Explicit registry injected into whatever needs to reach a live conversation.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentManager>>>,
    active: RwLock<Option<String>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manager, replacing any previous one for the same conversation.
    pub async fn insert(&self, manager: AgentManager) -> Arc<AgentManager> {
        let manager = Arc::new(manager);
        let previous = self
            .agents
            .write()
            .await
            .insert(manager.conversation_id().to_string(), manager.clone());
        if let Some(previous) = previous {
            if let Err(e) = previous.shutdown().await {
                tracing::warn!(conversation_id = previous.conversation_id(), error = %e, "Replaced manager failed to shut down");
            }
        }
        manager
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Arc<AgentManager>> {
        self.agents.read().await.get(conversation_id).cloned()
    }

    /// Point the active slot at `conversation_id`.
    ///
    /// The previously active conversation gets a cleanup pass; returns the
    /// tool calls it canceled.
    pub async fn set_active(&self, conversation_id: &str) -> Vec<String> {
        let previous = self
            .active
            .write()
            .await
            .replace(conversation_id.to_string());

        let Some(previous) = previous.filter(|id| id != conversation_id) else {
            return Vec::new();
        };
        match self.get(&previous).await {
            Some(manager) => {
                let canceled = manager.cleanup().await;
                tracing::debug!(from = previous, to = conversation_id, ?canceled, "Active conversation switched");
                canceled
            }
            None => Vec::new(),
        }
    }

    pub async fn active(&self) -> Option<Arc<AgentManager>> {
        let id = self.active.read().await.clone()?;
        self.get(&id).await
    }

    /// Drop a conversation and release its backend.
    pub async fn remove(&self, conversation_id: &str) -> Result<()> {
        let removed = self.agents.write().await.remove(conversation_id);
        {
            let mut active = self.active.write().await;
            if active.as_deref() == Some(conversation_id) {
                *active = None;
            }
        }
        match removed {
            Some(manager) => manager.shutdown().await,
            None => Ok(()),
        }
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}
