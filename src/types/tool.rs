//! Tool-call types shared by every backend.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Wire status of a tool call.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ToolCallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Operation class of a tool call.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ToolKind {
    Read,
    Edit,
    Execute,
}

impl ToolKind {
    /// Infer the kind from a tool name, if the name is recognizable.
    pub fn infer(tool_name: &str) -> Option<Self> {
        let name = tool_name.to_ascii_lowercase();
        match name.as_str() {
            "read" | "read_file" | "read_many_files" | "ls" | "list_directory" | "glob"
            | "grep" | "search_file_content" | "find" | "web_fetch" | "web_search"
            | "google_web_search" | "fetch" => Some(Self::Read),
            "write" | "write_file" | "edit" | "replace" | "apply_patch" | "multi_edit" => {
                Some(Self::Edit)
            }
            "exec" | "shell" | "bash" | "run_shell_command" | "process" | "terminal" => {
                Some(Self::Execute)
            }
            _ => None,
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_kind_from_common_tool_names() {
        assert_eq!(ToolKind::infer("read_file"), Some(ToolKind::Read));
        assert_eq!(ToolKind::infer("Replace"), Some(ToolKind::Edit));
        assert_eq!(ToolKind::infer("run_shell_command"), Some(ToolKind::Execute));
        assert_eq!(ToolKind::infer("custom_tool"), None);
    }

    #[test]
    fn status_parses_from_snake_case() {
        assert_eq!(
            "in_progress".parse::<ToolCallStatus>().ok(),
            Some(ToolCallStatus::InProgress)
        );
        assert!(ToolCallStatus::Canceled.is_terminal());
        assert!(!ToolCallStatus::Pending.is_terminal());
    }
}
