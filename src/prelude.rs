//! Convenience re-exports for common use.

pub use crate::backend::{AgentBackend, BackendContext, BackendFactory, EventEmitter, RawEvent};
pub use crate::config::RelayConfig;
pub use crate::error::{RelayError, Result};
pub use crate::manager::{
    AgentManager, AgentRegistry, AgentSnapshot, BroadcastBus, Collaborators, EventBus,
    MemoryStore, MessageStore,
};
pub use crate::types::{
    BackendKind, CanonicalEvent, Confirmation, ConfirmationOption, EventEnvelope, SessionMode,
    ToolCall, ToolCallStatus, WireType,
};
