//! Session mode and lifecycle state enums.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Auto-approval policy persisted per conversation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(ascii_case_insensitive)]
pub enum SessionMode {
    #[default]
    #[strum(to_string = "default")]
    Default,
    #[serde(alias = "auto_edit")]
    #[strum(to_string = "autoEdit", serialize = "auto_edit")]
    AutoEdit,
    #[strum(to_string = "yolo")]
    Yolo,
}

impl SessionMode {
    /// Resolve the mode in effect: a forced mode always wins over the persisted one.
    pub fn effective(persisted: SessionMode, force: Option<SessionMode>) -> SessionMode {
        force.unwrap_or(persisted)
    }
}

/// Which adapter drives a conversation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum BackendKind {
    /// In-process model client with a local tool loop.
    #[default]
    Sdk,
    /// Child process speaking JSON-RPC over stdio.
    #[strum(to_string = "jsonrpc", serialize = "acp")]
    Jsonrpc,
    /// WebSocket gateway peer.
    Gateway,
}

/// Liveness of the stream feeding a conversation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Degraded,
    Failed,
    Closed,
}

/// Coarse status of a conversation's current turn.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Pending,
    Running,
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_mode_parses_both_spellings() {
        assert_eq!("autoEdit".parse::<SessionMode>().ok(), Some(SessionMode::AutoEdit));
        assert_eq!("auto_edit".parse::<SessionMode>().ok(), Some(SessionMode::AutoEdit));
        assert_eq!("YOLO".parse::<SessionMode>().ok(), Some(SessionMode::Yolo));
        assert_eq!(
            serde_json::to_string(&SessionMode::AutoEdit).unwrap(),
            "\"autoEdit\""
        );
    }

    #[test]
    fn backend_kind_accepts_aliases() {
        assert_eq!("acp".parse::<BackendKind>().ok(), Some(BackendKind::Jsonrpc));
        assert_eq!("Gateway".parse::<BackendKind>().ok(), Some(BackendKind::Gateway));
        assert_eq!(BackendKind::Jsonrpc.to_string(), "jsonrpc");
    }

    #[test]
    fn force_mode_overrides_persisted_mode() {
        assert_eq!(
            SessionMode::effective(SessionMode::Default, Some(SessionMode::Yolo)),
            SessionMode::Yolo
        );
        assert_eq!(
            SessionMode::effective(SessionMode::AutoEdit, None),
            SessionMode::AutoEdit
        );
    }
}
