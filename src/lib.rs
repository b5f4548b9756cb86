//! agent-relay: streaming and tool-call orchestration for pluggable agent
//! backends.
//!
//! A conversation talks to exactly one backend (in-process SDK loop,
//! JSON-RPC subprocess or WebSocket gateway). Backend output is normalized
//! into canonical events, confirmations are gated by session mode and
//! remembered approvals, and everything reaches subscribers as
//! `{ type, conversation_id, msg_id, data }` envelopes.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use agent_relay::prelude::*;
//! use agent_relay::backend::{sdk::NoTools, ConfiguredFactory};
//!
//! # async fn example() -> agent_relay::error::Result<()> {
//! let bus = Arc::new(BroadcastBus::default());
//! let mut events = bus.subscribe();
//! let deps = Collaborators::new(
//!     Arc::new(MemoryStore::new()),
//!     bus.clone(),
//!     Arc::new(ConfiguredFactory::new(Arc::new(NoTools))),
//! );
//! let manager = AgentManager::new("conv-1", Arc::new(RelayConfig::from_env()), deps);
//! manager.send("Hello!", Vec::new()).await?;
//! while let Ok(envelope) = events.recv().await {
//!     if envelope.kind == WireType::Finish {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod approval;
pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod normalize;
pub mod prelude;
pub mod resilience;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;
