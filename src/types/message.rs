//! Messages: rows handed to the store and chat history sent to models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tool::ToolCall;
use super::wire::ToolGroupEntry;

/// Who authored a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Lifecycle of a stored message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Finished,
    Error,
}

/// Payload of a stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text { content: String },
    ToolGroup { calls: Vec<ToolGroupEntry> },
    /// Out-of-band notice (errors, expiry warnings).
    Tips { content: String, level: String },
}

/// A message row as seen by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub body: MessageBody,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: Role,
        body: MessageBody,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            role,
            body,
            status: MessageStatus::Finished,
            created_at: Utc::now(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text { content } | MessageBody::Tips { content, .. } => Some(content),
            MessageBody::ToolGroup { .. } => None,
        }
    }
}

/// A tool call as it appears in chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFunction {
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

impl From<&ToolCall> for ChatToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            kind: "function".to_string(),
            function: ChatFunction {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        }
    }
}

/// One entry of the history an in-process backend sends to its model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>, tool_calls: &[ToolCall]) -> Self {
        let text = text.into();
        Self {
            role: Role::Assistant,
            content: (!text.is_empty() || tool_calls.is_empty()).then_some(text),
            tool_calls: tool_calls.iter().map(ChatToolCall::from).collect(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(output.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assistant_with_tool_calls_omits_empty_content() {
        let call = ToolCall::new("c1", "read_file", json!({"file_path": "a"}));
        let msg = ChatMessage::assistant("", &[call]);
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("content").is_none());
        assert_eq!(value["tool_calls"][0]["function"]["name"], "read_file");
        assert_eq!(
            value["tool_calls"][0]["function"]["arguments"],
            "{\"file_path\":\"a\"}"
        );
    }

    #[test]
    fn stored_message_defaults_to_finished() {
        let msg = StoredMessage::new(
            "m1",
            "conv",
            Role::Assistant,
            MessageBody::Text {
                content: "hello".into(),
            },
        );
        assert_eq!(msg.status, MessageStatus::Finished);
        assert_eq!(msg.text(), Some("hello"));
    }
}
