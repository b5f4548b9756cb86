//! Conversation orchestration: one actor per conversation, a registry to
//! find them, and the collaborator traits they report to.

pub mod conversation;
pub mod registry;
pub mod side_effects;
pub mod sink;
pub mod status;

pub use conversation::{AgentManager, Collaborators};
pub use registry::AgentRegistry;
pub use side_effects::{parse_schedule_commands, ScheduleCommand, SideEffectHandler};
pub use sink::{BroadcastBus, EventBus, MemoryStore, MessageStore};
pub use status::AgentSnapshot;
