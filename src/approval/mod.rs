//! Tool-call confirmation, "always allow" memory and auto-approval.

pub mod pending;
pub mod policy;
pub mod store;
pub mod tracker;

pub use pending::{PendingConfirmations, Upsert};
pub use policy::{approval_keys, decide, root_commands, ApprovalDecision, AutoReason};
pub use store::{ApprovalKey, ApprovalStore};
pub use tracker::ToolTracker;
