//! Matching queue and signaling relay.
//!
//! Accepts client WebSocket connections, runs the frame handshake per
//! connection, pairs waiting users, and forwards offer/answer/ICE messages
//! to exactly the other member of a match.

mod collaborators;
mod connection;
mod handler;
mod match_queue;
mod presence;
mod reaper;
mod relay;
mod router;
mod server;

pub use collaborators::{
    AuthError, IdentityResolver, LookupError, Principal, RegionLookup, StaticRegionLookup,
    TokenIdentityResolver,
};
pub use connection::{ConnId, ConnectionSession, Delivery, SessionConfig, SessionError};
pub use handler::{Flow, Handler, HandlerFuture};
pub use match_queue::{
    JoinCriteria, JoinOutcome, LeaveOutcome, Match, MatchQueue, Member, QueueSnapshot,
    WaitingEntry,
};
pub use presence::{DeliveryError, PresenceRegistry};
pub use reaper::{DisconnectReaper, ReapOutcome};
pub use relay::{Relay, RelayConfig};
pub use router::{RouteError, SignalingRouter};
pub use server::{RelayServer, ServerConfig};

/// Per-connection writer queue capacity.
///
/// Bounds how far a client can fall behind. A session whose queue is full
/// is treated as dead and closed instead of stalling the sender.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Frames held per connection while the handshake is pending.
pub const OUTBOX_CAPACITY: usize = 128;

/// Value of the `server` header in CONNECTED.
pub const SERVER_NAME: &str = concat!("pairwave-relay/", env!("CARGO_PKG_VERSION"));

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebSocket upgrade timed out")]
    UpgradeTimeout,

    #[error("server already running")]
    AlreadyRunning,
}
