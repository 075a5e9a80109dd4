//! WebSocket read pump: reassembles frames and hands them to the client.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use pairwave_protocol::constants::WS_PONG_WAIT;
use pairwave_protocol::{Frame, FrameReader};

use super::ping::ping_seq;
use super::write::Outgoing;

/// What the read pump reports to its owner.
#[derive(Debug)]
pub(crate) enum Inbound {
    Frame(Frame),
    /// The link is gone. `code` is the relay's close code, if it sent one.
    Closed { code: Option<u16> },
}

/// Reads messages from the WebSocket and forwards decoded frames.
///
/// Any incoming message resets the pong deadline. If nothing arrives within
/// [`WS_PONG_WAIT`] the connection is considered dead and the loop exits.
/// [`Inbound::Closed`] is always the last item sent.
pub(crate) async fn read_pump<S>(
    mut read: S,
    inbound_tx: mpsc::Sender<Inbound>,
    write_tx: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);
    let mut reader = FrameReader::new();
    let mut close_code = None;

    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, connection dead");
                break;
            }

            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                };
                pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match msg {
                    tungstenite::Message::Text(text) => reader.push(text.as_str().as_bytes()),
                    tungstenite::Message::Binary(data) => reader.push(&data),
                    tungstenite::Message::Ping(data) => {
                        trace!("received ping, sending pong");
                        let pong = Outgoing::Control(tungstenite::Message::Pong(data));
                        let _ = write_tx.send(pong).await;
                        continue;
                    }
                    tungstenite::Message::Pong(data) => {
                        if let Some(seq) = ping_seq(&data) {
                            trace!(seq, "pong");
                        }
                        continue;
                    }
                    tungstenite::Message::Close(frame) => {
                        close_code = frame.map(|f| u16::from(f.code));
                        debug!(?close_code, "received close frame");
                        break;
                    }
                    _ => continue,
                }

                loop {
                    match reader.next_frame() {
                        Ok(Some(frame)) => {
                            trace!(command = %frame.command, "received frame");
                            if inbound_tx.send(Inbound::Frame(frame)).await.is_err() {
                                break 'outer;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("undecodable frame from relay: {e}");
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = inbound_tx.send(Inbound::Closed { code: close_code }).await;
}
