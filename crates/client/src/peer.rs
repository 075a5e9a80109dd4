//! Peer connection state machine.
//!
//! ```text
//! Idle --(match-found, initiator)--> Offering --(offer sent)--> AwaitingAnswer --(answer)--> Connected
//! Idle --(match-found, !initiator)--> Answering --(offer in, answer out)--> Connected
//! *    --(ice-candidate)--> unchanged, candidate applied or buffered
//! any  --(partner-left | transport error | stop)--> Closed
//! ```
//!
//! The WebRTC stack is behind [`Negotiator`] and [`MediaBackend`], so the
//! machine can be driven by any implementation (or a fake in tests).

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::{debug, info, warn};

use pairwave_protocol::{MatchId, SignalKind};

/// Negotiation progress for the current match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Closed,
}

/// An SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Errors from the negotiation machinery.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("media capture failed: {0}")]
    Media(String),

    #[error("negotiation backend error: {0}")]
    Backend(String),

    #[error("unexpected {kind} while {state:?}")]
    Unexpected { kind: SignalKind, state: PeerState },

    #[error("invalid signal payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Boxed future returned by the negotiation traits.
pub type NegotiationFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, NegotiationError>> + Send + 'a>>;

/// One peer-connection object.
pub trait Negotiator: Send {
    fn create_offer(&mut self) -> NegotiationFuture<'_, SessionDescription>;
    fn create_answer(&mut self) -> NegotiationFuture<'_, SessionDescription>;
    fn set_local_description(&mut self, desc: SessionDescription) -> NegotiationFuture<'_, ()>;
    fn set_remote_description(&mut self, desc: SessionDescription) -> NegotiationFuture<'_, ()>;
    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> NegotiationFuture<'_, ()>;
    fn close(&mut self);
}

/// Local capture devices and the factory for negotiation objects.
pub trait MediaBackend: Send {
    fn open_capture(&mut self) -> NegotiationFuture<'_, ()>;
    fn release_capture(&mut self);
    fn create_negotiator(&mut self) -> Result<Box<dyn Negotiator>, NegotiationError>;
}

/// A signal the machine wants delivered to the partner.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    pub match_id: MatchId,
    pub kind: SignalKind,
    pub payload: Box<RawValue>,
}

impl OutboundSignal {
    fn new<T: Serialize>(
        match_id: &MatchId,
        kind: SignalKind,
        payload: &T,
    ) -> Result<Self, NegotiationError> {
        Ok(Self {
            match_id: match_id.clone(),
            kind,
            payload: serde_json::value::to_raw_value(payload)?,
        })
    }
}

/// Negotiation state for one user, across consecutive matches.
pub struct PeerSession<M: MediaBackend> {
    media: M,
    state: PeerState,
    match_id: Option<MatchId>,
    negotiator: Option<Box<dyn Negotiator>>,
    capturing: bool,
    local_set: bool,
    remote_set: bool,
    pending_candidates: Vec<IceCandidate>,
}

impl<M: MediaBackend> PeerSession<M> {
    pub fn new(media: M) -> Self {
        Self {
            media,
            state: PeerState::Idle,
            match_id: None,
            negotiator: None,
            capturing: false,
            local_set: false,
            remote_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn match_id(&self) -> Option<&MatchId> {
        self.match_id.as_ref()
    }

    /// Candidates held until both descriptions are in place.
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    /// Starts a new negotiation cycle, tearing down the previous one first.
    /// Returns the offer to send when this side initiates.
    pub async fn on_match_found(
        &mut self,
        match_id: MatchId,
        initiator: bool,
    ) -> Result<Option<OutboundSignal>, NegotiationError> {
        self.teardown();
        info!(%match_id, initiator, "starting negotiation");
        self.match_id = Some(match_id.clone());

        let result = self.start(&match_id, initiator).await;
        if result.is_err() {
            self.fail();
        }
        result
    }

    async fn start(
        &mut self,
        match_id: &MatchId,
        initiator: bool,
    ) -> Result<Option<OutboundSignal>, NegotiationError> {
        self.media.open_capture().await?;
        self.capturing = true;
        self.negotiator = Some(self.media.create_negotiator()?);

        if !initiator {
            self.state = PeerState::Answering;
            return Ok(None);
        }

        self.state = PeerState::Offering;
        let negotiator = self.active_negotiator()?;
        let offer = negotiator.create_offer().await?;
        negotiator.set_local_description(offer.clone()).await?;
        self.local_set = true;
        self.state = PeerState::AwaitingAnswer;
        Ok(Some(OutboundSignal::new(match_id, SignalKind::Offer, &offer)?))
    }

    /// Applies a relayed signal. Signals for any other match are ignored.
    pub async fn on_signal(
        &mut self,
        match_id: &MatchId,
        kind: SignalKind,
        payload: &RawValue,
    ) -> Result<Option<OutboundSignal>, NegotiationError> {
        if self.match_id.as_ref() != Some(match_id) {
            debug!(%match_id, %kind, "ignoring signal for stale match");
            return Ok(None);
        }

        match kind {
            SignalKind::Offer => {
                if self.state != PeerState::Answering {
                    return Err(NegotiationError::Unexpected {
                        kind,
                        state: self.state,
                    });
                }
                let offer: SessionDescription = serde_json::from_str(payload.get())?;
                let result = self.answer(match_id, offer).await;
                if result.is_err() {
                    self.fail();
                }
                result.map(Some)
            }
            SignalKind::Answer => {
                if self.state != PeerState::AwaitingAnswer {
                    return Err(NegotiationError::Unexpected {
                        kind,
                        state: self.state,
                    });
                }
                let answer: SessionDescription = serde_json::from_str(payload.get())?;
                let result = self.accept_answer(answer).await;
                if result.is_err() {
                    self.fail();
                }
                result.map(|()| None)
            }
            SignalKind::IceCandidate => {
                let candidate: IceCandidate = serde_json::from_str(payload.get())?;
                self.on_remote_candidate(candidate).await;
                Ok(None)
            }
        }
    }

    async fn answer(
        &mut self,
        match_id: &MatchId,
        offer: SessionDescription,
    ) -> Result<OutboundSignal, NegotiationError> {
        let negotiator = self.active_negotiator()?;
        negotiator.set_remote_description(offer).await?;
        let answer = negotiator.create_answer().await?;
        negotiator.set_local_description(answer.clone()).await?;
        self.remote_set = true;
        self.local_set = true;
        self.flush_candidates().await;
        self.state = PeerState::Connected;
        info!(%match_id, "answer created, negotiation complete");
        OutboundSignal::new(match_id, SignalKind::Answer, &answer)
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        self.active_negotiator()?
            .set_remote_description(answer)
            .await?;
        self.remote_set = true;
        self.flush_candidates().await;
        self.state = PeerState::Connected;
        info!(match_id = ?self.match_id, "answer applied, negotiation complete");
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if !matches!(
            self.state,
            PeerState::Offering
                | PeerState::AwaitingAnswer
                | PeerState::Answering
                | PeerState::Connected
        ) {
            debug!(state = ?self.state, "dropping candidate outside a negotiation");
            return;
        }
        if !(self.local_set && self.remote_set) {
            self.pending_candidates.push(candidate);
            return;
        }
        self.apply_candidate(candidate).await;
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(count = pending.len(), "applying buffered candidates");
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    /// A bad candidate does not end the negotiation.
    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Some(negotiator) = self.negotiator.as_mut()
            && let Err(e) = negotiator.add_ice_candidate(candidate).await
        {
            warn!("failed to add remote candidate: {e}");
        }
    }

    /// Wraps a locally gathered candidate for the partner.
    pub fn local_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<Option<OutboundSignal>, NegotiationError> {
        let Some(match_id) = &self.match_id else {
            return Ok(None);
        };
        if matches!(self.state, PeerState::Idle | PeerState::Closed) {
            return Ok(None);
        }
        OutboundSignal::new(match_id, SignalKind::IceCandidate, candidate).map(Some)
    }

    /// The partner left `match_id`. Ignored if it is not the current match.
    pub fn on_partner_left(&mut self, match_id: &MatchId) {
        if self.match_id.as_ref() != Some(match_id) {
            debug!(%match_id, "partner-left for stale match");
            return;
        }
        info!(%match_id, "partner left, closing peer connection");
        self.close();
    }

    /// Ends the current negotiation (hang up, transport loss, shutdown).
    pub fn close(&mut self) {
        self.teardown();
        self.state = PeerState::Closed;
    }

    fn fail(&mut self) {
        warn!(match_id = ?self.match_id, "negotiation failed, tearing down");
        self.close();
    }

    fn active_negotiator(&mut self) -> Result<&mut Box<dyn Negotiator>, NegotiationError> {
        self.negotiator
            .as_mut()
            .ok_or_else(|| NegotiationError::Backend("no active peer connection".into()))
    }

    fn teardown(&mut self) {
        if let Some(mut negotiator) = self.negotiator.take() {
            negotiator.close();
        }
        if self.capturing {
            self.media.release_capture();
            self.capturing = false;
        }
        self.match_id = None;
        self.local_set = false;
        self.remote_set = false;
        self.pending_candidates.clear();
    }
}

impl<M: MediaBackend> Drop for PeerSession<M> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Shared call log for the fakes.
    pub(crate) type Log = Arc<Mutex<Vec<String>>>;

    pub(crate) struct FakeNegotiator {
        name: String,
        log: Log,
        fail_offer: bool,
    }

    impl FakeNegotiator {
        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    impl Negotiator for FakeNegotiator {
        fn create_offer(&mut self) -> NegotiationFuture<'_, SessionDescription> {
            Box::pin(async move {
                if self.fail_offer {
                    return Err(NegotiationError::Backend("no codecs".into()));
                }
                self.record("create_offer".into());
                Ok(SessionDescription {
                    sdp: format!("offer-{}", self.name),
                })
            })
        }

        fn create_answer(&mut self) -> NegotiationFuture<'_, SessionDescription> {
            Box::pin(async move {
                self.record("create_answer".into());
                Ok(SessionDescription {
                    sdp: format!("answer-{}", self.name),
                })
            })
        }

        fn set_local_description(&mut self, desc: SessionDescription) -> NegotiationFuture<'_, ()> {
            Box::pin(async move {
                self.record(format!("local:{}", desc.sdp));
                Ok(())
            })
        }

        fn set_remote_description(
            &mut self,
            desc: SessionDescription,
        ) -> NegotiationFuture<'_, ()> {
            Box::pin(async move {
                self.record(format!("remote:{}", desc.sdp));
                Ok(())
            })
        }

        fn add_ice_candidate(&mut self, candidate: IceCandidate) -> NegotiationFuture<'_, ()> {
            Box::pin(async move {
                self.record(format!("candidate:{}", candidate.candidate));
                Ok(())
            })
        }

        fn close(&mut self) {
            self.record("close".into());
        }
    }

    pub(crate) struct FakeMedia {
        pub(crate) name: String,
        pub(crate) log: Log,
        pub(crate) fail_offer: bool,
    }

    impl FakeMedia {
        pub(crate) fn new(name: &str) -> (Self, Log) {
            let log = Log::default();
            let media = Self {
                name: name.to_string(),
                log: log.clone(),
                fail_offer: false,
            };
            (media, log)
        }
    }

    impl MediaBackend for FakeMedia {
        fn open_capture(&mut self) -> NegotiationFuture<'_, ()> {
            Box::pin(async move {
                self.log.lock().unwrap().push("open_capture".into());
                Ok(())
            })
        }

        fn release_capture(&mut self) {
            self.log.lock().unwrap().push("release_capture".into());
        }

        fn create_negotiator(&mut self) -> Result<Box<dyn Negotiator>, NegotiationError> {
            Ok(Box::new(FakeNegotiator {
                name: self.name.clone(),
                log: self.log.clone(),
                fail_offer: self.fail_offer,
            }))
        }
    }

    fn raw<T: Serialize>(value: &T) -> Box<RawValue> {
        serde_json::value::to_raw_value(value).unwrap()
    }

    fn sdp(s: &str) -> Box<RawValue> {
        raw(&SessionDescription { sdp: s.into() })
    }

    fn candidate(c: &str) -> Box<RawValue> {
        raw(&IceCandidate {
            candidate: c.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        })
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn initiator_offers_then_connects_on_answer() {
        let (media, log) = FakeMedia::new("a");
        let mut peer = PeerSession::new(media);
        let m = MatchId::new("m1");

        let offer = peer.on_match_found(m.clone(), true).await.unwrap().unwrap();
        assert_eq!(offer.kind, SignalKind::Offer);
        assert_eq!(offer.payload.get(), r#"{"sdp":"offer-a"}"#);
        assert_eq!(peer.state(), PeerState::AwaitingAnswer);

        let out = peer
            .on_signal(&m, SignalKind::Answer, &sdp("answer-b"))
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(peer.state(), PeerState::Connected);
        assert_eq!(
            entries(&log),
            ["open_capture", "create_offer", "local:offer-a", "remote:answer-b"]
        );
    }

    #[tokio::test]
    async fn answerer_replies_to_offer() {
        let (media, log) = FakeMedia::new("b");
        let mut peer = PeerSession::new(media);
        let m = MatchId::new("m1");

        assert!(peer.on_match_found(m.clone(), false).await.unwrap().is_none());
        assert_eq!(peer.state(), PeerState::Answering);

        let answer = peer
            .on_signal(&m, SignalKind::Offer, &sdp("offer-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.kind, SignalKind::Answer);
        assert_eq!(answer.match_id, m);
        assert_eq!(peer.state(), PeerState::Connected);
        assert_eq!(
            entries(&log),
            ["open_capture", "remote:offer-a", "create_answer", "local:answer-b"]
        );
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_and_applied_in_order() {
        let (media, log) = FakeMedia::new("b");
        let mut peer = PeerSession::new(media);
        let m = MatchId::new("m1");
        peer.on_match_found(m.clone(), false).await.unwrap();

        for c in ["c1", "c2"] {
            peer.on_signal(&m, SignalKind::IceCandidate, &candidate(c))
                .await
                .unwrap();
        }
        assert_eq!(peer.pending_candidates(), 2);
        assert!(!entries(&log).iter().any(|e| e.starts_with("candidate:")));

        peer.on_signal(&m, SignalKind::Offer, &sdp("offer-a"))
            .await
            .unwrap();
        assert_eq!(peer.pending_candidates(), 0);

        peer.on_signal(&m, SignalKind::IceCandidate, &candidate("c3"))
            .await
            .unwrap();
        let applied: Vec<String> = entries(&log)
            .into_iter()
            .filter(|e| e.starts_with("candidate:"))
            .collect();
        assert_eq!(applied, ["candidate:c1", "candidate:c2", "candidate:c3"]);
    }

    #[tokio::test]
    async fn new_match_tears_down_previous_cycle_first() {
        let (media, log) = FakeMedia::new("a");
        let mut peer = PeerSession::new(media);
        peer.on_match_found(MatchId::new("m1"), true).await.unwrap();
        log.lock().unwrap().clear();

        peer.on_match_found(MatchId::new("m2"), false).await.unwrap();
        assert_eq!(
            entries(&log),
            ["close", "release_capture", "open_capture"]
        );
        assert_eq!(peer.match_id(), Some(&MatchId::new("m2")));
        assert_eq!(peer.state(), PeerState::Answering);
    }

    #[tokio::test]
    async fn signals_for_other_matches_are_ignored() {
        let (media, log) = FakeMedia::new("b");
        let mut peer = PeerSession::new(media);
        peer.on_match_found(MatchId::new("m2"), false).await.unwrap();

        let out = peer
            .on_signal(&MatchId::new("m1"), SignalKind::Offer, &sdp("old"))
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(peer.state(), PeerState::Answering);
        assert_eq!(entries(&log), ["open_capture"]);
    }

    #[tokio::test]
    async fn unexpected_signal_is_an_error() {
        let (media, _log) = FakeMedia::new("b");
        let mut peer = PeerSession::new(media);
        let m = MatchId::new("m1");
        peer.on_match_found(m.clone(), false).await.unwrap();

        let err = peer
            .on_signal(&m, SignalKind::Answer, &sdp("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Unexpected {
                kind: SignalKind::Answer,
                state: PeerState::Answering
            }
        ));
        assert_eq!(peer.state(), PeerState::Answering);
    }

    #[tokio::test]
    async fn partner_left_closes_and_releases() {
        let (media, log) = FakeMedia::new("a");
        let mut peer = PeerSession::new(media);
        let m = MatchId::new("m1");
        peer.on_match_found(m.clone(), true).await.unwrap();
        peer.on_signal(&m, SignalKind::Answer, &sdp("ans"))
            .await
            .unwrap();

        peer.on_partner_left(&MatchId::new("other"));
        assert_eq!(peer.state(), PeerState::Connected);

        peer.on_partner_left(&m);
        assert_eq!(peer.state(), PeerState::Closed);
        assert!(peer.match_id().is_none());
        let log = entries(&log);
        assert_eq!(&log[log.len() - 2..], ["close", "release_capture"]);
    }

    #[tokio::test]
    async fn failed_offer_tears_down() {
        let (mut media, log) = FakeMedia::new("a");
        media.fail_offer = true;
        let mut peer = PeerSession::new(media);

        let err = peer
            .on_match_found(MatchId::new("m1"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Backend(_)));
        assert_eq!(peer.state(), PeerState::Closed);
        assert_eq!(entries(&log), ["open_capture", "close", "release_capture"]);
    }

    #[tokio::test]
    async fn local_candidates_only_during_a_match() {
        let (media, _log) = FakeMedia::new("a");
        let mut peer = PeerSession::new(media);
        let c = IceCandidate {
            candidate: "host".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        assert!(peer.local_candidate(&c).unwrap().is_none());

        peer.on_match_found(MatchId::new("m1"), true).await.unwrap();
        let out = peer.local_candidate(&c).unwrap().unwrap();
        assert_eq!(out.kind, SignalKind::IceCandidate);
        assert_eq!(out.payload.get(), r#"{"candidate":"host"}"#);
    }
}
