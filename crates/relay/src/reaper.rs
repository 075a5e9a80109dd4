//! Cleanup when a client connection goes away.

use std::sync::Arc;

use tracing::{debug, info};

use pairwave_protocol::{EndReason, Identity};

use crate::connection::ConnId;
use crate::match_queue::{LeaveOutcome, MatchQueue};
use crate::presence::PresenceRegistry;

/// What [`DisconnectReaper::reap`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Presence removed; the queue/match leave ran with this result.
    Reaped(LeaveOutcome),
    /// The identity already belongs to a newer connection.
    Superseded,
}

/// Unbinds a closed connection and withdraws its user from the queue.
pub struct DisconnectReaper {
    presence: Arc<PresenceRegistry>,
    queue: Arc<MatchQueue>,
}

impl DisconnectReaper {
    pub fn new(presence: Arc<PresenceRegistry>, queue: Arc<MatchQueue>) -> Self {
        Self { presence, queue }
    }

    pub fn reap(&self, identity: &Identity, conn: ConnId) -> ReapOutcome {
        if !self.presence.unbind_if(identity, conn) {
            debug!(%identity, %conn, "superseded connection closed, keeping state");
            return ReapOutcome::Superseded;
        }
        // The user may have logged in again since the unbind.
        match self.queue.leave_if_offline(identity, EndReason::Disconnected) {
            Some(outcome) => {
                info!(%identity, %conn, ?outcome, "reaped disconnected client");
                ReapOutcome::Reaped(outcome)
            }
            None => ReapOutcome::Superseded,
        }
    }
}
