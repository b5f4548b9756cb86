//! Core types shared by backends, the normalizer and the manager.

pub mod confirmation;
pub mod event;
pub mod message;
pub mod session;
pub mod tool;
pub mod wire;

pub use confirmation::*;
pub use event::*;
pub use message::*;
pub use session::*;
pub use tool::*;
pub use wire::*;
