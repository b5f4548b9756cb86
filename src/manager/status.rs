//! Observable state of one conversation.

use serde::Serialize;
use tokio::sync::watch;

use crate::types::{BackendKind, ConnectionState, ConversationStatus, SessionMode};

/// Point-in-time view of a conversation, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub conversation_id: String,
    pub backend: BackendKind,
    pub status: ConversationStatus,
    pub connection: ConnectionState,
    pub session_mode: SessionMode,
    pub pending_confirmations: usize,
    /// Message id of the turn in flight.
    pub current_msg_id: Option<String>,
    pub last_error: Option<String>,
}

impl AgentSnapshot {
    pub fn new(conversation_id: impl Into<String>, backend: BackendKind, mode: SessionMode) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            backend,
            status: ConversationStatus::Pending,
            connection: ConnectionState::Connecting,
            session_mode: mode,
            pending_confirmations: 0,
            current_msg_id: None,
            last_error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ConversationStatus::Running
    }
}

/// Publishing half; only the conversation actor holds it.
#[derive(Debug)]
pub(crate) struct StatusPublisher {
    tx: watch::Sender<AgentSnapshot>,
}

impl StatusPublisher {
    pub(crate) fn new(initial: AgentSnapshot) -> (Self, watch::Receiver<AgentSnapshot>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    /// Apply `change`, notifying watchers only when something differs.
    pub(crate) fn update(&self, change: impl FnOnce(&mut AgentSnapshot)) {
        self.tx.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            change(snapshot);
            *snapshot != before
        });
    }

    pub(crate) fn current(&self) -> AgentSnapshot {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unchanged_updates_do_not_wake_watchers() {
        let (publisher, mut rx) =
            StatusPublisher::new(AgentSnapshot::new("c1", BackendKind::Sdk, SessionMode::Default));
        rx.borrow_and_update();

        publisher.update(|s| s.status = ConversationStatus::Pending);
        assert!(!rx.has_changed().unwrap());

        publisher.update(|s| s.status = ConversationStatus::Running);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_running());
    }
}
