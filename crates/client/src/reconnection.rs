//! Connection supervisor with exponential backoff.
//!
//! Owns the current [`Link`], flushes the outbox whenever a link becomes
//! ready, turns inbound frames into [`ClientEvent`]s and reconnects after
//! a loss until the client is stopped or the retry budget runs out.

use std::sync::Arc;

use tracing::{debug, info, warn};

use pairwave_protocol::constants::WS_CLOSE_SUPERSEDED;

use crate::client::Shared;
use crate::pumps::read::Inbound;
use crate::transport::{ClientError, Link};
use crate::types::{ClientEvent, ClientState};

/// Why a supervised link ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkEnd {
    /// Transport loss; try again.
    Lost,
    /// The relay handed our identity to a newer connection.
    Superseded,
    /// The client was stopped.
    Stopped,
}

/// Classifies a close code reported by the read pump.
pub(crate) fn link_end_for(code: Option<u16>) -> LinkEnd {
    match code {
        Some(WS_CLOSE_SUPERSEDED) => LinkEnd::Superseded,
        _ => LinkEnd::Lost,
    }
}

pub(crate) async fn supervise(shared: Arc<Shared>) {
    let mut attempt: u32 = 0;

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        if attempt == 0 {
            shared.set_state(ClientState::Connecting).await;
        }
        shared.outbox.lock().await.begin_connect();

        let outbox = Arc::clone(&shared.outbox);
        let connected = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = Link::connect(&shared.config, outbox, &shared.cancel) => result,
        };

        match connected {
            Ok(mut link) => {
                attempt = 0;
                if let Some(end) = run_link(&shared, &mut link).await {
                    match end {
                        LinkEnd::Stopped => break,
                        LinkEnd::Superseded => {
                            info!("identity taken over by another connection, not reconnecting");
                            shared
                                .emit(ClientEvent::Error {
                                    code: None,
                                    reason: "superseded by a newer connection".into(),
                                    match_id: None,
                                })
                                .await;
                            break;
                        }
                        LinkEnd::Lost => info!("link to relay lost"),
                    }
                }
            }
            Err(ClientError::Rejected(reason)) => {
                warn!(%reason, "relay rejected the connection, not reconnecting");
                shared
                    .emit(ClientEvent::Error {
                        code: None,
                        reason,
                        match_id: None,
                    })
                    .await;
                break;
            }
            Err(e @ ClientError::HandshakeTimeout) => {
                warn!(attempt, "relay did not acknowledge the handshake in time");
                shared
                    .emit(ClientEvent::Error {
                        code: None,
                        reason: e.to_string(),
                        match_id: None,
                    })
                    .await;
            }
            Err(e) => {
                warn!(attempt, error = %e, "connect attempt failed");
            }
        }

        if shared.cancel.is_cancelled() {
            break;
        }

        attempt = attempt.saturating_add(1);
        if shared.config.reconnect.exhausted(attempt) {
            warn!(attempt, "reconnect budget exhausted");
            shared
                .emit(ClientEvent::Error {
                    code: None,
                    reason: format!("gave up after {} attempts", attempt - 1),
                    match_id: None,
                })
                .await;
            break;
        }

        let delay = shared.config.reconnect.delay_for_attempt(attempt);
        let delay_secs = delay.as_secs_f64();
        shared.set_state(ClientState::Reconnecting { attempt }).await;
        shared
            .emit(ClientEvent::Reconnecting {
                attempt,
                next_retry_secs: delay_secs,
            })
            .await;
        info!(
            attempt,
            delay_secs = format_args!("{delay_secs:.1}"),
            "reconnecting"
        );

        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!("reconnect cancelled");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.cancel.cancel();
    shared.set_link(None);
    let dropped = {
        let mut outbox = shared.outbox.lock().await;
        outbox.mark_disconnected();
        outbox.clear()
    };
    if dropped > 0 {
        debug!(dropped, "discarded buffered frames on stop");
    }
    shared.set_state(ClientState::Disconnected).await;
}

/// Drives one connected link until it ends. Returns `None` if the flush
/// failed before the link could be used.
async fn run_link(shared: &Shared, link: &mut Link) -> Option<LinkEnd> {
    if !flush_outbox(shared, link).await {
        link.shutdown().await;
        shared.outbox.lock().await.mark_disconnected();
        return None;
    }

    shared.set_identity(link.identity().clone());
    shared.set_state(ClientState::Connected).await;
    shared
        .emit(ClientEvent::Connected {
            identity: link.identity().clone(),
        })
        .await;

    let end = loop {
        let inbound = tokio::select! {
            _ = shared.cancel.cancelled() => break LinkEnd::Stopped,
            inbound = link.recv() => inbound,
        };
        match inbound {
            Inbound::Frame(frame) => {
                if let Some(event) = shared.event_for(&frame) {
                    shared.emit(event).await;
                }
            }
            Inbound::Closed { code } => {
                debug!(?code, "link closed");
                break link_end_for(code);
            }
        }
    };

    // The old writer must finish requeueing before the next link flushes.
    link.shutdown().await;
    {
        let mut outbox = shared.outbox.lock().await;
        shared.set_link(None);
        outbox.mark_disconnected();
    }
    Some(end)
}

/// Marks the outbox ready and writes everything it held, in order, before
/// the link is published for direct sends.
async fn flush_outbox(shared: &Shared, link: &Link) -> bool {
    let mut outbox = shared.outbox.lock().await;
    let pending = outbox.mark_ready();
    let count = pending.len();
    let mut frames = pending.into_iter();

    while let Some(frame) = frames.next() {
        if let Err(e) = link.send(&frame).await {
            warn!("flush failed: {e}");
            outbox.requeue_front(std::iter::once(frame).chain(frames));
            return false;
        }
    }
    if count > 0 {
        debug!(count, "flushed buffered frames");
    }
    shared.set_link(Some(link.sender()));
    true
}
