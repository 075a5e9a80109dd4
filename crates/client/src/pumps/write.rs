//! WebSocket write pump: serialises outbound messages.
//!
//! Request frames count as sent only once the socket write succeeds. When
//! the pump stops, the frame that failed and everything still queued behind
//! it go back to the front of the client outbox for the next link.

use std::sync::Arc;

use futures_util::SinkExt;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use pairwave_protocol::{Command, Frame, Outbox};

use crate::transport::to_ws;

/// Item on the writer channel.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Frame(Frame),
    /// Ping, pong or close.
    Control(tungstenite::Message),
}

/// Writes messages to the WebSocket until cancelled or the channel closes.
///
/// Cancellation also stops the read pump: a dead writer means a dead link.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<Outgoing>,
    outbox: Arc<Mutex<Outbox<Frame>>>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let failed = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            msg = write_rx.recv() => {
                let Some(out) = msg else { break None };
                let ws = match &out {
                    Outgoing::Frame(frame) => to_ws(frame),
                    Outgoing::Control(msg) => msg.clone(),
                };
                if let Err(e) = write.send(ws).await {
                    error!("WebSocket write error: {e}");
                    cancel.cancel();
                    break Some(out);
                }
            }
        }
    };

    let healthy = failed.is_none();
    requeue_unsent(failed, &mut write_rx, &outbox).await;

    if healthy {
        debug!("write pump stopping");
        let _ = write.send(tungstenite::Message::Close(None)).await;
        let _ = write.close().await;
    }
}

/// Moves request frames that never reached the socket back into the outbox,
/// ahead of anything submitted since.
async fn requeue_unsent(
    failed: Option<Outgoing>,
    write_rx: &mut mpsc::Receiver<Outgoing>,
    outbox: &Mutex<Outbox<Frame>>,
) {
    // Closing first releases any sender parked on a full channel; that
    // sender may be holding the outbox lock.
    write_rx.close();
    let mut outbox = outbox.lock().await;

    let mut unsent = Vec::new();
    let rest = std::iter::from_fn(|| write_rx.try_recv().ok());
    for out in failed.into_iter().chain(rest) {
        // SUBSCRIBE is replayed by the next handshake anyway.
        if let Outgoing::Frame(frame) = out
            && frame.command == Command::Send
        {
            unsent.push(frame);
        }
    }
    if !unsent.is_empty() {
        debug!(count = unsent.len(), "requeueing frames the link did not write");
        outbox.requeue_front(unsent);
    }
}
