//! Shared domain types for the split-bill settlement system.
//!
//! Every crate in the workspace speaks in terms of these types: sessions,
//! participants, the derived settlement view, cover charges, materialized
//! orders and the events observers subscribe to.

pub mod cover;
pub mod events;
pub mod order;
pub mod participant;
pub mod session;
pub mod view;

pub use cover::*;
pub use events::*;
pub use order::*;
pub use participant::*;
pub use session::*;
pub use view::*;

/// Identifier of a split session.
pub type SessionId = String;

/// Identifier of a participant, unique within its session.
pub type ParticipantId = String;
