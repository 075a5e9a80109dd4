//! Relay client handle.
//!
//! [`RelayClient`] is cheap to clone. Every request goes through a single
//! [`Outbox`] that survives reconnects, so frames submitted while the link
//! is down are written, in order, as soon as the next link is ready.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use pairwave_protocol::constants::{
    CONTENT_TYPE_JSON, HEADER_CONTENT_TYPE, HEADER_DESTINATION, HEADER_MESSAGE,
};
use pairwave_protocol::destination::{
    USER_CHAT_QUEUE, USER_ERROR_QUEUE, USER_MATCH_QUEUE, USER_SIGNAL_QUEUE,
};
use pairwave_protocol::messages::{
    ChatEvent, ChatRequest, ErrorCode, ErrorEvent, JoinRequest, MatchEvent, SignalEvent,
    SignalRequest,
};
use pairwave_protocol::{
    AppDestination, Command, Frame, Identity, MatchId, Outbox, SignalKind, Submit,
};

use crate::transport::{ClientError, LinkSender};
use crate::types::{ClientConfig, ClientEvent, ClientState};

/// State shared between the API handle and the connection supervisor.
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    /// Shared with each link's write pump, which returns unwritten frames.
    pub(crate) outbox: Arc<Mutex<Outbox<Frame>>>,
    pub(crate) link: std::sync::Mutex<Option<LinkSender>>,
    pub(crate) events_tx: mpsc::Sender<ClientEvent>,
    pub(crate) cancel: CancellationToken,
    state: std::sync::Mutex<ClientState>,
    identity: std::sync::Mutex<Option<Identity>>,
    delivery_failures: AtomicU32,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig, events_tx: mpsc::Sender<ClientEvent>) -> Self {
        let outbox = Outbox::new(config.outbox_capacity);
        Self {
            config,
            outbox: Arc::new(Mutex::new(outbox)),
            link: std::sync::Mutex::new(None),
            events_tx,
            cancel: CancellationToken::new(),
            state: std::sync::Mutex::new(ClientState::Disconnected),
            identity: std::sync::Mutex::new(None),
            delivery_failures: AtomicU32::new(0),
        }
    }

    pub(crate) async fn emit(&self, event: ClientEvent) {
        if self.events_tx.send(event).await.is_err() {
            trace!("event receiver dropped");
        }
    }

    pub(crate) async fn set_state(&self, state: ClientState) {
        {
            let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *current == state {
                return;
            }
            *current = state.clone();
        }
        debug!(?state, "client state changed");
        self.emit(ClientEvent::StateChanged(state)).await;
    }

    pub(crate) fn set_link(&self, link: Option<LinkSender>) {
        *self.link.lock().unwrap_or_else(|e| e.into_inner()) = link;
    }

    pub(crate) fn set_identity(&self, identity: Identity) {
        *self.identity.lock().unwrap_or_else(|e| e.into_inner()) = Some(identity);
    }

    /// Turns an inbound frame into the event the user should see, if any.
    pub(crate) fn event_for(&self, frame: &Frame) -> Option<ClientEvent> {
        match frame.command {
            Command::Message => {}
            Command::Error => {
                let reason = frame
                    .header(HEADER_MESSAGE)
                    .or_else(|| frame.body_str())
                    .unwrap_or("relay error")
                    .to_string();
                return Some(ClientEvent::Error {
                    code: None,
                    reason,
                    match_id: None,
                });
            }
            other => {
                trace!(command = %other, "ignoring frame");
                return None;
            }
        }

        let destination = frame.header(HEADER_DESTINATION).unwrap_or_default();
        let result = match destination {
            USER_MATCH_QUEUE => serde_json::from_slice::<MatchEvent>(&frame.body).map(|ev| {
                match ev {
                    MatchEvent::MatchFound {
                        match_id,
                        partner_identity,
                        partner_display_name,
                        initiator,
                    } => {
                        self.delivery_failures.store(0, Ordering::Relaxed);
                        ClientEvent::MatchFound {
                            match_id,
                            partner_identity,
                            partner_display_name,
                            initiator,
                        }
                    }
                    MatchEvent::PartnerLeft { match_id, reason } => {
                        ClientEvent::PartnerLeft { match_id, reason }
                    }
                }
            }),
            USER_SIGNAL_QUEUE => {
                serde_json::from_slice::<SignalEvent>(&frame.body).map(|ev| ClientEvent::Signal {
                    match_id: ev.match_id,
                    kind: ev.kind,
                    payload: ev.payload,
                })
            }
            USER_CHAT_QUEUE => {
                serde_json::from_slice::<ChatEvent>(&frame.body).map(|ev| ClientEvent::ChatMessage {
                    match_id: ev.match_id,
                    from: ev.from,
                    text: ev.text,
                    sent_at: ev.sent_at,
                })
            }
            USER_ERROR_QUEUE => match serde_json::from_slice::<ErrorEvent>(&frame.body) {
                Ok(ev) => return self.error_event(ev),
                Err(e) => Err(e),
            },
            other => {
                debug!(destination = other, "message on unknown destination");
                return None;
            }
        };

        match result {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(destination, "undecodable event body: {e}");
                None
            }
        }
    }

    /// Delivery failures are expected during a partner's reconnect, so only
    /// a run of them is reported.
    fn error_event(&self, ev: ErrorEvent) -> Option<ClientEvent> {
        if ev.code == ErrorCode::DeliveryFailed {
            let failures = self.delivery_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures < self.config.max_delivery_failures {
                debug!(failures, "partner unreachable, message dropped");
                return None;
            }
            self.delivery_failures.store(0, Ordering::Relaxed);
        }
        Some(ClientEvent::Error {
            code: Some(ev.code),
            reason: ev.reason,
            match_id: ev.match_id,
        })
    }
}

/// Handle to a running relay client.
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<Shared>,
}

impl RelayClient {
    /// Starts the client. It connects in the background and keeps
    /// reconnecting until [`stop`](Self::stop) is called.
    pub fn start(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let shared = Arc::new(Shared::new(config, events_tx));
        tokio::spawn(crate::reconnection::supervise(Arc::clone(&shared)));
        (Self { shared }, events_rx)
    }

    pub fn state(&self) -> ClientState {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Identity assigned by the relay on the last successful handshake.
    pub fn identity(&self) -> Option<Identity> {
        self.shared
            .identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Frames waiting for the link.
    pub async fn pending(&self) -> usize {
        self.shared.outbox.lock().await.len()
    }

    /// Enters the matching queue.
    pub async fn join(&self, request: &JoinRequest) -> Result<(), ClientError> {
        let body = serde_json::to_vec(request)?;
        self.submit(send_frame(&AppDestination::MatchJoin, body)).await
    }

    /// Leaves the queue or ends the current match.
    pub async fn leave(&self) -> Result<(), ClientError> {
        self.submit(send_frame(&AppDestination::MatchLeave, Vec::new()))
            .await
    }

    /// Sends a negotiation message to the partner in `match_id`.
    pub async fn signal<T: Serialize>(
        &self,
        match_id: &MatchId,
        kind: SignalKind,
        payload: &T,
    ) -> Result<(), ClientError> {
        let body = serde_json::to_vec(&SignalRequest::new(kind, payload)?)?;
        self.submit(send_frame(&AppDestination::Signal(match_id.clone()), body))
            .await
    }

    /// Sends a chat line to the partner in `match_id`.
    pub async fn chat(&self, match_id: &MatchId, text: &str) -> Result<(), ClientError> {
        let body = serde_json::to_vec(&ChatRequest {
            text: text.to_string(),
        })?;
        self.submit(send_frame(&AppDestination::Chat(match_id.clone()), body))
            .await
    }

    /// Stops the client for good. Buffered frames are dropped.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    async fn submit(&self, frame: Frame) -> Result<(), ClientError> {
        if self.shared.cancel.is_cancelled() {
            return Err(ClientError::Stopped);
        }

        // The outbox lock is held across the hand-off to the writer so frames
        // leave in submission order, including relative to a flush after
        // reconnect. A frame stays owed until the socket write succeeds.
        let mut outbox = self.shared.outbox.lock().await;
        match outbox.submit(frame) {
            Ok(Submit::Transmit(frame)) => {
                let link = self
                    .shared
                    .link
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                let sent = match &link {
                    Some(link) => link.send(&frame).await,
                    None => Err(ClientError::Closed),
                };
                if let Err(e) = sent {
                    debug!("write failed, keeping frame for the next link: {e}");
                    outbox.requeue_front([frame]);
                }
                Ok(())
            }
            Ok(Submit::Buffered) => {
                trace!(pending = outbox.len(), "link not ready, frame buffered");
                Ok(())
            }
            Err(_) => Err(ClientError::OutboxFull),
        }
    }
}

fn send_frame(destination: &AppDestination, body: Vec<u8>) -> Frame {
    let frame = Frame::new(Command::Send).with_header(HEADER_DESTINATION, destination.path());
    if body.is_empty() {
        return frame;
    }
    frame
        .with_header(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON)
        .with_body(body)
}
