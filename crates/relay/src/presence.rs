//! Tracks which connection currently speaks for which identity.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use tracing::{debug, warn};

use pairwave_protocol::Identity;

use crate::connection::{ConnId, ConnectionSession, Delivery, SessionError};

/// Errors from [`PresenceRegistry::deliver`].
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("{0} is not connected")]
    NotPresent(Identity),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Identity to live connection map.
///
/// At most one connection per identity: a newer login supersedes the
/// older one, and only the connection that owns an entry may remove it.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    sessions: RwLock<HashMap<Identity, ConnectionSession>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `identity` to `session`.
    ///
    /// Returns the previous session if a different connection was bound.
    pub fn bind(&self, identity: Identity, session: ConnectionSession) -> Option<ConnectionSession> {
        let conn = session.id();
        let previous = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.clone(), session)?;
        if previous.id() == conn {
            return None;
        }
        debug!(%identity, old = %previous.id(), new = %conn, "presence superseded");
        Some(previous)
    }

    /// Removes the binding for `identity`, whichever connection owns it.
    pub fn unbind(&self, identity: &Identity) -> Option<ConnectionSession> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(identity)
    }

    /// Removes the binding only if it still belongs to `conn`.
    pub fn unbind_if(&self, identity: &Identity, conn: ConnId) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        match sessions.get(identity) {
            Some(current) if current.id() == conn => {
                sessions.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, identity: &Identity) -> Option<ConnectionSession> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned()
    }

    pub fn is_present(&self, identity: &Identity) -> bool {
        self.lookup(identity).is_some()
    }

    /// Number of bound identities.
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes `event` and queues it for `identity` on `destination`.
    ///
    /// Never waits on the recipient: a client whose writer queue is full is
    /// disconnected and the delivery fails.
    pub fn deliver<T: Serialize>(
        &self,
        identity: &Identity,
        destination: &str,
        event: &T,
    ) -> Result<Delivery, DeliveryError> {
        let body = serde_json::to_vec(event)?;
        let session = self
            .lookup(identity)
            .ok_or_else(|| DeliveryError::NotPresent(identity.clone()))?;
        session.deliver(destination, body).map_err(|e| {
            warn!(%identity, destination, "delivery failed: {e}");
            DeliveryError::from(e)
        })
    }
}
