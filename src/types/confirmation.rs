//! Confirmation requests surfaced to callers before a tool runs.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::tool::ToolKind;

/// What a confirmation is asking permission for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConfirmationAction {
    /// File modification.
    Edit,
    /// Shell or process execution.
    Exec,
    /// Read-only access (file reads, fetches).
    Info,
    /// Call into an external tool server.
    Mcp,
}

impl ConfirmationAction {
    /// Map a tool kind onto the confirmation action that guards it.
    pub fn from_tool_kind(kind: Option<ToolKind>) -> Self {
        match kind {
            Some(ToolKind::Read) => Self::Info,
            Some(ToolKind::Edit) => Self::Edit,
            Some(ToolKind::Execute) => Self::Exec,
            None => Self::Mcp,
        }
    }
}

/// How the backend will interpret a chosen option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    AllowOnce,
    AllowAlways,
    Reject,
}

impl OptionKind {
    /// Best-effort classification of a backend-specific option id.
    pub fn classify(value: &str) -> Self {
        let value = value.to_ascii_lowercase();
        if value.contains("always") {
            Self::AllowAlways
        } else if value.contains("reject")
            || value.contains("cancel")
            || value.contains("deny")
            || value.contains("decline")
        {
            Self::Reject
        } else {
            Self::AllowOnce
        }
    }

    pub fn allows(self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// One selectable answer to a confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationOption {
    pub label: String,
    pub value: String,
    pub kind: OptionKind,
}

impl ConfirmationOption {
    pub fn new(label: impl Into<String>, value: impl Into<String>, kind: OptionKind) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            kind,
        }
    }

    /// Build an option whose kind is inferred from its value.
    pub fn inferred(label: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        let kind = OptionKind::classify(&value);
        Self {
            label: label.into(),
            value,
            kind,
        }
    }
}

/// The standard allow-once / allow-always / reject triple.
pub fn default_options() -> Vec<ConfirmationOption> {
    vec![
        ConfirmationOption::new("Allow once", "proceed_once", OptionKind::AllowOnce),
        ConfirmationOption::new("Always allow", "proceed_always", OptionKind::AllowAlways),
        ConfirmationOption::new("Reject", "cancel", OptionKind::Reject),
    ]
}

/// A pending permission request for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub id: String,
    pub call_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub action: ConfirmationAction,
    /// Root command for exec actions, `server:tool` for external tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
    pub options: Vec<ConfirmationOption>,
}

impl Confirmation {
    pub fn option(&self, value: &str) -> Option<&ConfirmationOption> {
        self.options.iter().find(|option| option.value == value)
    }

    /// Option chosen when a confirmation is approved without asking.
    pub fn preferred_allow_option(&self) -> Option<&ConfirmationOption> {
        self.options
            .iter()
            .find(|option| option.kind == OptionKind::AllowOnce)
            .or_else(|| self.options.iter().find(|option| option.kind.allows()))
            .or_else(|| self.options.first())
    }

    /// Option chosen when a confirmation is rejected without asking.
    pub fn reject_option(&self) -> Option<&ConfirmationOption> {
        self.options
            .iter()
            .find(|option| option.kind == OptionKind::Reject)
    }
}

/// Why a confirmation left the pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Answered,
    AutoApproved,
    Expired,
    Canceled,
}
