//! Forwards signaling and chat to the other member of a match.

use std::sync::Arc;

use chrono::Utc;
use serde_json::value::RawValue;
use tracing::{debug, trace};

use pairwave_protocol::destination::{USER_CHAT_QUEUE, USER_SIGNAL_QUEUE};
use pairwave_protocol::messages::{ChatEvent, SignalEvent};
use pairwave_protocol::{EndReason, Identity, MatchId, SignalKind};

use crate::match_queue::{Match, MatchQueue};
use crate::presence::PresenceRegistry;

/// Errors from routing a message within a match.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("match {match_id} is unknown or the sender is not a member")]
    InvalidMatch { match_id: MatchId },

    #[error("partner {target} of match {match_id} is not reachable")]
    DeliveryFailed { match_id: MatchId, target: Identity },
}

impl RouteError {
    pub fn match_id(&self) -> &MatchId {
        match self {
            RouteError::InvalidMatch { match_id } | RouteError::DeliveryFailed { match_id, .. } => {
                match_id
            }
        }
    }
}

/// Point-to-point router for match members.
///
/// Messages are never queued and routing never waits on the partner: if the
/// partner is not connected right now, or has stopped reading, the message
/// is dropped and the sender gets [`RouteError::DeliveryFailed`].
pub struct SignalingRouter {
    queue: Arc<MatchQueue>,
    presence: Arc<PresenceRegistry>,
}

impl SignalingRouter {
    pub fn new(queue: Arc<MatchQueue>, presence: Arc<PresenceRegistry>) -> Self {
        Self { queue, presence }
    }

    /// Delivers an offer, answer or ICE candidate to the sender's partner.
    pub fn route(
        &self,
        sender: &Identity,
        match_id: &MatchId,
        kind: SignalKind,
        payload: Box<RawValue>,
    ) -> Result<(), RouteError> {
        let partner = self.queue.partner_of(match_id, sender)?;
        trace!(%match_id, from = %sender, to = %partner.identity, kind = kind.as_str(), "routing signal");

        let event = SignalEvent {
            match_id: match_id.clone(),
            kind,
            payload,
        };
        self.presence
            .deliver(&partner.identity, USER_SIGNAL_QUEUE, &event)
            .map(|_| ())
            .map_err(|e| {
                debug!(%match_id, target = %partner.identity, "signal dropped: {e}");
                RouteError::DeliveryFailed {
                    match_id: match_id.clone(),
                    target: partner.identity.clone(),
                }
            })
    }

    /// Relays a chat line, stamped with the relay clock.
    pub fn route_chat(
        &self,
        sender: &Identity,
        display_name: &str,
        match_id: &MatchId,
        text: String,
    ) -> Result<(), RouteError> {
        let partner = self.queue.partner_of(match_id, sender)?;
        let event = ChatEvent {
            match_id: match_id.clone(),
            from: display_name.to_string(),
            text,
            sent_at: Utc::now(),
        };
        self.presence
            .deliver(&partner.identity, USER_CHAT_QUEUE, &event)
            .map(|_| ())
            .map_err(|_| RouteError::DeliveryFailed {
                match_id: match_id.clone(),
                target: partner.identity.clone(),
            })
    }

    /// Removes the match and tells both members.
    pub fn end_match(&self, match_id: &MatchId, reason: EndReason) -> Option<Match> {
        self.queue.end(match_id, reason)
    }
}
