//! Glue between [`RelayClient`] events and the [`PeerSession`] machine.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::RelayClient;
use crate::peer::{IceCandidate, MediaBackend, NegotiationError, OutboundSignal, PeerSession, PeerState};
use crate::types::{ClientEvent, ClientState};

/// Requests from the application while a call loop is running.
#[derive(Debug, Clone)]
pub enum CallCommand {
    /// Leave the current match and close the peer connection.
    HangUp,
    /// A candidate gathered by the local negotiation object.
    LocalCandidate(IceCandidate),
}

/// Drives a [`PeerSession`] from client events.
pub struct CallController<M: MediaBackend> {
    peer: PeerSession<M>,
}

impl<M: MediaBackend> CallController<M> {
    pub fn new(media: M) -> Self {
        Self {
            peer: PeerSession::new(media),
        }
    }

    pub fn peer(&self) -> &PeerSession<M> {
        &self.peer
    }

    /// Feeds one client event to the state machine and returns the signal
    /// to send back, if any.
    pub async fn handle_event(
        &mut self,
        event: &ClientEvent,
    ) -> Result<Option<OutboundSignal>, NegotiationError> {
        match event {
            ClientEvent::MatchFound {
                match_id,
                initiator,
                ..
            } => self.peer.on_match_found(match_id.clone(), *initiator).await,
            ClientEvent::Signal {
                match_id,
                kind,
                payload,
            } => self.peer.on_signal(match_id, *kind, payload).await,
            ClientEvent::PartnerLeft { match_id, .. } => {
                self.peer.on_partner_left(match_id);
                Ok(None)
            }
            // The relay drops our match when the link goes, so the peer
            // connection cannot survive a reconnect.
            ClientEvent::Reconnecting { .. }
            | ClientEvent::StateChanged(ClientState::Disconnected) => {
                if !matches!(self.peer.state(), PeerState::Idle | PeerState::Closed) {
                    debug!("link lost, closing peer connection");
                    self.peer.close();
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Runs until the event stream ends. Every event is passed on to
    /// `forward` after the state machine has seen it.
    pub async fn run(
        mut self,
        client: RelayClient,
        mut events: mpsc::Receiver<ClientEvent>,
        mut commands: mpsc::Receiver<CallCommand>,
        forward: mpsc::Sender<ClientEvent>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match self.handle_event(&event).await {
                        Ok(Some(signal)) => send(&client, signal).await,
                        Ok(None) => {}
                        Err(e) => warn!("negotiation error: {e}"),
                    }
                    let _ = forward.send(event).await;
                }
                command = commands.recv(), if commands_open => {
                    match command {
                        Some(CallCommand::HangUp) => {
                            if let Err(e) = client.leave().await {
                                warn!("failed to leave match: {e}");
                            }
                            self.peer.close();
                        }
                        Some(CallCommand::LocalCandidate(candidate)) => {
                            match self.peer.local_candidate(&candidate) {
                                Ok(Some(signal)) => send(&client, signal).await,
                                Ok(None) => debug!("no active match, dropping local candidate"),
                                Err(e) => warn!("failed to encode local candidate: {e}"),
                            }
                        }
                        None => commands_open = false,
                    }
                }
            }
        }
        self.peer.close();
    }
}

async fn send(client: &RelayClient, signal: OutboundSignal) {
    if let Err(e) = client
        .signal(&signal.match_id, signal.kind, &signal.payload)
        .await
    {
        warn!(match_id = %signal.match_id, kind = %signal.kind, "failed to send signal: {e}");
    }
}
