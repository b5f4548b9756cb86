//! Canonical event vocabulary every backend is translated into.

use serde::{Deserialize, Serialize};

use super::confirmation::{Confirmation, RemovalReason};
use super::session::ConnectionState;
use super::tool::{ToolCallStatus, ToolKind};

/// One normalized event for a turn.
///
/// A turn is bracketed by exactly one [`CanonicalEvent::Start`] and one
/// [`CanonicalEvent::Finish`]; everything else falls between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    Start,
    /// Visible assistant text delta.
    Content {
        text: String,
    },
    /// Reasoning delta. Forwarded live, never persisted.
    Thought {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        text: String,
    },
    ToolCallRequest {
        call_id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolCallUpdate {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ToolKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    ConfirmationRequest {
        confirmation: Confirmation,
    },
    ConfirmationRemoved {
        call_id: String,
        id: String,
        reason: RemovalReason,
    },
    AgentStatus {
        state: ConnectionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
    Finish,
}

impl CanonicalEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self::Thought {
            subject: None,
            text: text.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Events that belong inside a turn and therefore need a preceding `Start`.
    pub fn is_turn_body(&self) -> bool {
        matches!(
            self,
            Self::Content { .. }
                | Self::Thought { .. }
                | Self::ToolCallRequest { .. }
                | Self::ToolCallUpdate { .. }
                | Self::ConfirmationRequest { .. }
        )
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Content { .. } => "content",
            Self::Thought { .. } => "thought",
            Self::ToolCallRequest { .. } => "tool_call_request",
            Self::ToolCallUpdate { .. } => "tool_call_update",
            Self::ConfirmationRequest { .. } => "confirmation_request",
            Self::ConfirmationRemoved { .. } => "confirmation_removed",
            Self::AgentStatus { .. } => "agent_status",
            Self::Error { .. } => "error",
            Self::Finish => "finish",
        }
    }
}
