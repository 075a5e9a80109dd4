//! Keepalive pings towards the relay.
//!
//! The relay drops a link after [`WS_PONG_WAIT`](pairwave_protocol::constants::WS_PONG_WAIT)
//! of silence, so an idle client pings every [`WS_PING_PERIOD`]. Each ping
//! carries a big-endian sequence number that the relay echoes in its pong.
//! A writer that is already backed up skips the tick: queued frames keep
//! the relay's deadline fresh once they go out.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use pairwave_protocol::constants::WS_PING_PERIOD;

use super::write::Outgoing;

/// Sequence number carried by one of our pings, if `payload` is one.
pub(crate) fn ping_seq(payload: &[u8]) -> Option<u64> {
    payload.try_into().ok().map(u64::from_be_bytes)
}

pub(crate) async fn ping_pump(write_tx: mpsc::Sender<Outgoing>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let ping = tungstenite::Message::Ping(seq.to_be_bytes().to_vec().into());
                match write_tx.try_send(Outgoing::Control(ping)) {
                    Ok(()) => {
                        trace!(seq, "ping");
                        seq = seq.wrapping_add(1);
                    }
                    Err(TrySendError::Full(_)) => trace!(seq, "writer busy, ping skipped"),
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }
}
