//! Waiting queue and active match set.
//!
//! Both live behind one lock so a join can never race a leave or a
//! disconnect into a half-formed match. Notifications are queued on the
//! members' sessions under the same lock, so each user sees match events
//! in the order the state changed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use pairwave_protocol::destination::USER_MATCH_QUEUE;
use pairwave_protocol::messages::MatchEvent;
use pairwave_protocol::{EndReason, Gender, Identity, MatchId, Region};

use crate::presence::PresenceRegistry;
use crate::router::RouteError;

/// Pairing filter of a waiting user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JoinCriteria {
    pub home_region: Region,
    pub target_region: Region,
    pub gender: Gender,
    pub target_gender: Gender,
}

impl JoinCriteria {
    /// Symmetric compatibility: each side's targets accept the other side.
    pub fn compatible_with(&self, other: &JoinCriteria) -> bool {
        self.target_region.accepts(&other.home_region)
            && other.target_region.accepts(&self.home_region)
            && self.target_gender.accepts(other.gender)
            && other.target_gender.accepts(self.gender)
    }
}

/// A user waiting to be paired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingEntry {
    pub identity: Identity,
    pub display_name: String,
    pub criteria: JoinCriteria,
    pub enqueued_at: DateTime<Utc>,
}

impl WaitingEntry {
    pub fn new(identity: Identity, display_name: impl Into<String>, criteria: JoinCriteria) -> Self {
        Self {
            identity,
            display_name: display_name.into(),
            criteria,
            enqueued_at: Utc::now(),
        }
    }
}

/// One side of a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub identity: Identity,
    pub display_name: String,
}

/// Two paired users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub id: MatchId,
    /// The member that was waiting.
    pub a: Member,
    /// The member whose join completed the pair.
    pub b: Member,
    /// Member that sends the first offer.
    pub initiator: Identity,
    pub created_at: DateTime<Utc>,
}

impl Match {
    pub fn has_member(&self, identity: &Identity) -> bool {
        self.a.identity == *identity || self.b.identity == *identity
    }

    /// The other member, if `identity` belongs to this match.
    pub fn partner_of(&self, identity: &Identity) -> Option<&Member> {
        if self.a.identity == *identity {
            Some(&self.b)
        } else if self.b.identity == *identity {
            Some(&self.a)
        } else {
            None
        }
    }

    fn members(&self) -> [&Member; 2] {
        [&self.a, &self.b]
    }
}

/// Result of [`MatchQueue::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Appended to the queue at `position` (0-based).
    Queued { position: usize },
    /// Already waiting; criteria replaced, FIFO position kept.
    Requeued { position: usize },
    Matched(Match),
    /// Already in a match; the join was absorbed.
    AlreadyMatched(MatchId),
}

/// Result of [`MatchQueue::leave`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    Dequeued,
    Ended(Match),
    NotFound,
}

/// Point-in-time copy of the queue contents.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub waiting: Vec<WaitingEntry>,
    pub matches: Vec<Match>,
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: VecDeque<WaitingEntry>,
    matches: HashMap<MatchId, Match>,
    /// identity -> its active match
    active: HashMap<Identity, MatchId>,
}

impl QueueState {
    fn position_of(&self, identity: &Identity) -> Option<usize> {
        self.waiting.iter().position(|e| e.identity == *identity)
    }

    fn pair(&mut self, waiting: WaitingEntry, arriving: WaitingEntry) -> Match {
        let m = Match {
            id: MatchId::new(uuid::Uuid::new_v4().to_string()),
            initiator: arriving.identity.clone(),
            a: Member {
                identity: waiting.identity,
                display_name: waiting.display_name,
            },
            b: Member {
                identity: arriving.identity,
                display_name: arriving.display_name,
            },
            created_at: Utc::now(),
        };
        self.active.insert(m.a.identity.clone(), m.id.clone());
        self.active.insert(m.b.identity.clone(), m.id.clone());
        self.matches.insert(m.id.clone(), m.clone());
        m
    }

    fn join(&mut self, entry: WaitingEntry) -> JoinOutcome {
        if let Some(id) = self.active.get(&entry.identity) {
            return JoinOutcome::AlreadyMatched(id.clone());
        }

        // A re-join keeps its place in line and its original enqueue time.
        let mut entry = entry;
        let mut previous = None;
        if let Some(pos) = self.position_of(&entry.identity)
            && let Some(old) = self.waiting.remove(pos)
        {
            entry.enqueued_at = old.enqueued_at;
            previous = Some(pos);
        }

        let partner = self
            .waiting
            .iter()
            .position(|w| w.criteria.compatible_with(&entry.criteria));
        if let Some(waiting) = partner.and_then(|pos| self.waiting.remove(pos)) {
            return JoinOutcome::Matched(self.pair(waiting, entry));
        }

        match previous {
            Some(pos) => {
                self.waiting.insert(pos, entry);
                JoinOutcome::Requeued { position: pos }
            }
            None => {
                self.waiting.push_back(entry);
                JoinOutcome::Queued {
                    position: self.waiting.len() - 1,
                }
            }
        }
    }

    fn remove(&mut self, identity: &Identity) -> LeaveOutcome {
        if let Some(pos) = self.position_of(identity) {
            self.waiting.remove(pos);
            return LeaveOutcome::Dequeued;
        }
        let Some(id) = self.active.get(identity).cloned() else {
            return LeaveOutcome::NotFound;
        };
        match self.remove_match(&id) {
            Some(m) => LeaveOutcome::Ended(m),
            None => LeaveOutcome::NotFound,
        }
    }

    fn remove_match(&mut self, id: &MatchId) -> Option<Match> {
        let m = self.matches.remove(id)?;
        for member in m.members() {
            if self.active.get(&member.identity) == Some(&m.id) {
                self.active.remove(&member.identity);
            }
        }
        Some(m)
    }
}

/// FIFO matching queue.
pub struct MatchQueue {
    state: Mutex<QueueState>,
    presence: Arc<PresenceRegistry>,
}

impl MatchQueue {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            presence,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues or pairs `entry` without notifying anyone.
    pub fn join_entry(&self, entry: WaitingEntry) -> JoinOutcome {
        self.lock().join(entry)
    }

    /// Removes `identity` from the queue or ends its match, without notifying.
    pub fn remove(&self, identity: &Identity) -> LeaveOutcome {
        self.lock().remove(identity)
    }

    /// Joins the queue and sends `match-found` to both members on a pairing.
    pub fn join(&self, entry: WaitingEntry) -> JoinOutcome {
        let identity = entry.identity.clone();
        let mut state = self.lock();
        let outcome = state.join(entry);
        match &outcome {
            JoinOutcome::Queued { position } => {
                debug!(%identity, position, "queued");
            }
            JoinOutcome::Requeued { position } => {
                debug!(%identity, position, "criteria updated");
            }
            JoinOutcome::AlreadyMatched(match_id) => {
                debug!(%identity, %match_id, "join absorbed, already matched");
            }
            JoinOutcome::Matched(m) => {
                info!(
                    match_id = %m.id,
                    a = %m.a.identity,
                    b = %m.b.identity,
                    "match created"
                );
                self.notify_found(m);
            }
        }
        drop(state);
        outcome
    }

    /// Leaves the queue or the current match.
    ///
    /// Ending a match notifies the partner with `partner-left`.
    pub fn leave(&self, identity: &Identity, reason: EndReason) -> LeaveOutcome {
        let mut state = self.lock();
        self.leave_locked(&mut state, identity, reason)
    }

    /// [`leave`](Self::leave) for a connection that went away, skipped if
    /// `identity` has been bound to a newer connection in the meantime.
    ///
    /// Returns `None` when skipped.
    pub fn leave_if_offline(&self, identity: &Identity, reason: EndReason) -> Option<LeaveOutcome> {
        let mut state = self.lock();
        if self.presence.is_present(identity) {
            debug!(%identity, "back online, keeping queue state");
            return None;
        }
        Some(self.leave_locked(&mut state, identity, reason))
    }

    /// Removes a match and tells both members it ended.
    pub fn end(&self, id: &MatchId, reason: EndReason) -> Option<Match> {
        let mut state = self.lock();
        let m = state.remove_match(id)?;
        info!(match_id = %m.id, ?reason, "match ended by relay");
        let event = MatchEvent::PartnerLeft {
            match_id: m.id.clone(),
            reason,
        };
        for member in m.members() {
            if let Err(e) = self
                .presence
                .deliver(&member.identity, USER_MATCH_QUEUE, &event)
            {
                debug!(match_id = %m.id, identity = %member.identity, "end notice not delivered: {e}");
            }
        }
        Some(m)
    }

    /// Removes a match by id. Members are not notified.
    pub fn end_match(&self, id: &MatchId) -> Option<Match> {
        self.lock().remove_match(id)
    }

    /// The member of `match_id` that is not `sender`.
    pub fn partner_of(&self, match_id: &MatchId, sender: &Identity) -> Result<Member, RouteError> {
        let state = self.lock();
        state
            .matches
            .get(match_id)
            .and_then(|m| m.partner_of(sender))
            .cloned()
            .ok_or_else(|| RouteError::InvalidMatch {
                match_id: match_id.clone(),
            })
    }

    pub fn match_for(&self, identity: &Identity) -> Option<Match> {
        let state = self.lock();
        let id = state.active.get(identity)?;
        state.matches.get(id).cloned()
    }

    pub fn is_waiting(&self, identity: &Identity) -> bool {
        self.lock().position_of(identity).is_some()
    }

    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn active_matches(&self) -> usize {
        self.lock().matches.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot {
            waiting: state.waiting.iter().cloned().collect(),
            matches: state.matches.values().cloned().collect(),
        }
    }

    fn leave_locked(
        &self,
        state: &mut QueueState,
        identity: &Identity,
        reason: EndReason,
    ) -> LeaveOutcome {
        let outcome = state.remove(identity);
        match &outcome {
            LeaveOutcome::Dequeued => debug!(%identity, "dequeued"),
            LeaveOutcome::NotFound => debug!(%identity, "leave with nothing to leave"),
            LeaveOutcome::Ended(m) => {
                info!(match_id = %m.id, %identity, ?reason, "match ended");
                if let Some(partner) = m.partner_of(identity) {
                    let event = MatchEvent::PartnerLeft {
                        match_id: m.id.clone(),
                        reason,
                    };
                    if let Err(e) = self
                        .presence
                        .deliver(&partner.identity, USER_MATCH_QUEUE, &event)
                    {
                        debug!(match_id = %m.id, partner = %partner.identity, "partner-left not delivered: {e}");
                    }
                }
            }
        }
        outcome
    }

    fn notify_found(&self, m: &Match) {
        for (me, partner) in [(&m.a, &m.b), (&m.b, &m.a)] {
            let event = MatchEvent::MatchFound {
                match_id: m.id.clone(),
                partner_identity: partner.identity.clone(),
                partner_display_name: partner.display_name.clone(),
                initiator: m.initiator == me.identity,
            };
            if let Err(e) = self.presence.deliver(&me.identity, USER_MATCH_QUEUE, &event) {
                warn!(match_id = %m.id, identity = %me.identity, "match-found not delivered: {e}");
            }
        }
    }
}
