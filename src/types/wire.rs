//! Envelope forwarded to persistence and live subscribers.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::tool::{ToolCallStatus, ToolKind};

/// `type` field of an [`EventEnvelope`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WireType {
    Content,
    Thought,
    ToolCallRequest,
    ToolGroup,
    ConfirmationRequest,
    ConfirmationRemove,
    Error,
    Start,
    Finish,
    AgentStatus,
}

/// `{ type, conversation_id, msg_id, data }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: WireType,
    pub conversation_id: String,
    pub msg_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        kind: WireType,
        conversation_id: impl Into<String>,
        msg_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            conversation_id: conversation_id.into(),
            msg_id: msg_id.into(),
            data,
        }
    }
}

/// One row of a `tool_group` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolGroupEntry {
    pub call_id: String,
    pub name: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ToolKind>,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}
