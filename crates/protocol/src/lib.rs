//! Wire protocol for the Pairwave relay.
//!
//! A minimal STOMP-style text sub-protocol carried over one persistent
//! WebSocket per client, plus the JSON bodies exchanged on the matching
//! and signaling destinations.

pub mod constants;
pub mod destination;
pub mod frame;
pub mod messages;
pub mod outbox;
pub mod types;

// Re-export primary types for convenience.
pub use destination::AppDestination;
pub use frame::{Command, DecodeError, Frame, FrameReader, decode, encode};
pub use outbox::{LinkState, Outbox, Submit};
pub use types::{EndReason, Gender, Identity, MatchId, Region, SignalKind};
