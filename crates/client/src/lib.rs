//! Client side of the pairwave relay.
//!
//! Keeps one reconnecting link to the relay, buffers requests while the
//! link is down, and drives peer-connection negotiation from relayed
//! signals.

pub mod call;
pub mod client;
pub mod peer;
mod pumps;
pub(crate) mod reconnection;
pub mod transport;
pub mod types;

pub use call::{CallCommand, CallController};
pub use client::RelayClient;
pub use peer::{
    IceCandidate, MediaBackend, NegotiationError, NegotiationFuture, Negotiator, OutboundSignal,
    PeerSession, PeerState, SessionDescription,
};
pub use transport::ClientError;
pub use types::{ClientConfig, ClientEvent, ClientState, ReconnectConfig};
