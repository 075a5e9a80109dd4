//! Handler trait for frames arriving on a relay connection.
//!
//! The connection layer owns framing, the handshake gate, subscriptions and
//! receipts. Everything with domain meaning (who the user is, what a SEND to
//! a destination does, what happens when the socket goes away) is delegated
//! to a [`Handler`].

use std::future::Future;
use std::pin::Pin;

use pairwave_protocol::Frame;

use crate::collaborators::Principal;
use crate::connection::ConnectionSession;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a, T = ()> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the connection should do after a frame was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Close the WebSocket with the given code.
    Close { code: u16, reason: String },
}

/// Domain callbacks for one relay connection.
pub trait Handler: Send + Sync + 'static {
    /// Resolves the CONNECT frame to a principal.
    ///
    /// `Err` carries the message sent back in the ERROR frame before the
    /// connection is closed.
    fn authenticate(
        &self,
        session: ConnectionSession,
        frame: Frame,
    ) -> HandlerFuture<'_, Result<Principal, String>>;

    /// Called after the principal is attached but before CONNECTED is sent.
    ///
    /// Frames sent to the session from here on are buffered and flushed
    /// right after CONNECTED.
    fn on_authenticated(&self, session: ConnectionSession) -> HandlerFuture<'_>;

    /// Called for every SEND after the handshake.
    fn on_send(&self, session: ConnectionSession, frame: Frame) -> HandlerFuture<'_, Flow>;

    /// Called exactly once when the connection is gone, whatever the cause.
    fn on_disconnected(&self, _session: ConnectionSession) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}
