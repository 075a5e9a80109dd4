//! Relay wiring: turns SEND frames into queue and router operations.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use pairwave_protocol::constants::{
    HEADER_AUTHORIZATION, HEADER_DESTINATION, HEADER_LOGIN, WS_CLOSE_PROTOCOL_VIOLATION,
    WS_CLOSE_SUPERSEDED,
};
use pairwave_protocol::destination::USER_ERROR_QUEUE;
use pairwave_protocol::messages::{ChatRequest, ErrorCode, ErrorEvent, JoinRequest, SignalRequest};
use pairwave_protocol::{AppDestination, EndReason, Frame, Region};

use crate::collaborators::{IdentityResolver, Principal, RegionLookup};
use crate::connection::ConnectionSession;
use crate::handler::{Flow, Handler, HandlerFuture};
use crate::match_queue::{JoinCriteria, MatchQueue, WaitingEntry};
use crate::presence::PresenceRegistry;
use crate::reaper::DisconnectReaper;
use crate::router::{RouteError, SignalingRouter};

/// Relay policy knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Invalid requests tolerated per connection before it is closed.
    pub max_violations: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { max_violations: 8 }
    }
}

/// The matching and signaling relay.
pub struct Relay {
    presence: Arc<PresenceRegistry>,
    queue: Arc<MatchQueue>,
    router: SignalingRouter,
    reaper: DisconnectReaper,
    resolver: Arc<dyn IdentityResolver>,
    regions: Arc<dyn RegionLookup>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        resolver: Arc<dyn IdentityResolver>,
        regions: Arc<dyn RegionLookup>,
        config: RelayConfig,
    ) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let queue = Arc::new(MatchQueue::new(presence.clone()));
        Self {
            router: SignalingRouter::new(queue.clone(), presence.clone()),
            reaper: DisconnectReaper::new(presence.clone(), queue.clone()),
            presence,
            queue,
            resolver,
            regions,
            config,
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn queue(&self) -> &MatchQueue {
        &self.queue
    }

    pub fn router(&self) -> &SignalingRouter {
        &self.router
    }

    fn join(&self, session: &ConnectionSession, principal: &Principal, req: JoinRequest) {
        let home_region = match req.home_region {
            Some(region) => region,
            None => self.detect_region(session),
        };
        let criteria = JoinCriteria {
            home_region,
            target_region: req.target_region,
            gender: req.gender,
            target_gender: req.target_gender,
        };
        let display_name = req
            .display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| principal.display_name.clone());
        let entry = WaitingEntry::new(principal.identity.clone(), display_name, criteria);
        self.queue.join(entry);
    }

    fn detect_region(&self, session: &ConnectionSession) -> Region {
        let ip = session.remote_addr().ip();
        self.regions.region_for(ip).unwrap_or_else(|e| {
            warn!(conn = %session.id(), "region lookup failed: {e}");
            Region::any()
        })
    }

    fn dispatch(
        &self,
        session: &ConnectionSession,
        principal: &Principal,
        destination: AppDestination,
        frame: &Frame,
    ) -> Result<(), Rejection> {
        match destination {
            AppDestination::MatchJoin => {
                let req = if frame.body.is_empty() {
                    JoinRequest::default()
                } else {
                    parse_body(frame)?
                };
                self.join(session, principal, req);
            }
            AppDestination::MatchLeave => {
                self.queue.leave(&principal.identity, EndReason::Left);
            }
            AppDestination::Signal(match_id) => {
                let req: SignalRequest = parse_body(frame)?;
                self.router
                    .route(&principal.identity, &match_id, req.kind, req.payload)?;
            }
            AppDestination::Chat(match_id) => {
                let req: ChatRequest = parse_body(frame)?;
                self.router
                    .route_chat(&principal.identity, &principal.display_name, &match_id, req.text)?;
            }
        }
        Ok(())
    }

    /// Sends an error event to the offending client and counts a strike.
    fn reject(&self, session: &ConnectionSession, rejection: Rejection) -> Flow {
        let event = rejection.event();
        debug!(conn = %session.id(), code = ?event.code, reason = %event.reason, "request rejected");
        match serde_json::to_vec(&event) {
            Ok(body) => {
                if let Err(e) = session.deliver(USER_ERROR_QUEUE, body) {
                    debug!(conn = %session.id(), "error event not delivered: {e}");
                }
            }
            Err(e) => warn!("failed to encode error event: {e}"),
        }

        if !rejection.is_violation() {
            return Flow::Continue;
        }
        let strikes = session.record_violation();
        if strikes >= self.config.max_violations {
            warn!(conn = %session.id(), strikes, "too many invalid requests, closing");
            return Flow::Close {
                code: WS_CLOSE_PROTOCOL_VIOLATION,
                reason: "too many invalid requests".into(),
            };
        }
        Flow::Continue
    }
}

/// Why a SEND could not be carried out.
#[derive(Debug)]
enum Rejection {
    BadRequest(String),
    Route(RouteError),
}

impl From<RouteError> for Rejection {
    fn from(e: RouteError) -> Self {
        Rejection::Route(e)
    }
}

impl Rejection {
    fn event(&self) -> ErrorEvent {
        match self {
            Rejection::BadRequest(reason) => ErrorEvent {
                code: ErrorCode::BadRequest,
                reason: reason.clone(),
                match_id: None,
            },
            Rejection::Route(e @ RouteError::InvalidMatch { match_id }) => ErrorEvent {
                code: ErrorCode::InvalidMatch,
                reason: e.to_string(),
                match_id: Some(match_id.clone()),
            },
            Rejection::Route(e @ RouteError::DeliveryFailed { match_id, .. }) => ErrorEvent {
                code: ErrorCode::DeliveryFailed,
                reason: e.to_string(),
                match_id: Some(match_id.clone()),
            },
        }
    }

    /// Delivery failures do not count as strikes.
    fn is_violation(&self) -> bool {
        !matches!(self, Rejection::Route(RouteError::DeliveryFailed { .. }))
    }
}

fn parse_body<T: DeserializeOwned>(frame: &Frame) -> Result<T, Rejection> {
    serde_json::from_slice(&frame.body)
        .map_err(|e| Rejection::BadRequest(format!("invalid body: {e}")))
}

impl Handler for Relay {
    fn authenticate(
        &self,
        _session: ConnectionSession,
        frame: Frame,
    ) -> HandlerFuture<'_, Result<Principal, String>> {
        Box::pin(async move {
            let authorization = frame
                .header(HEADER_AUTHORIZATION)
                .or_else(|| frame.header("authorization"));
            self.resolver
                .resolve(authorization, frame.header(HEADER_LOGIN))
                .map_err(|e| e.to_string())
        })
    }

    fn on_authenticated(&self, session: ConnectionSession) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(identity) = session.identity().cloned() else {
                return;
            };
            if let Some(old) = self.presence.bind(identity.clone(), session.clone()) {
                debug!(%identity, old = %old.id(), new = %session.id(), "closing superseded connection");
                old.close(WS_CLOSE_SUPERSEDED, "superseded by a newer connection");
            }
        })
    }

    fn on_send(&self, session: ConnectionSession, frame: Frame) -> HandlerFuture<'_, Flow> {
        Box::pin(async move {
            let Some(principal) = session.principal().cloned() else {
                return Flow::Continue;
            };
            let raw = frame.header(HEADER_DESTINATION).unwrap_or_default();
            let Some(destination) = AppDestination::parse(raw) else {
                let rejection = Rejection::BadRequest(format!("unknown destination {raw:?}"));
                return self.reject(&session, rejection);
            };

            match self.dispatch(&session, &principal, destination, &frame) {
                Ok(()) => Flow::Continue,
                Err(rejection) => self.reject(&session, rejection),
            }
        })
    }

    fn on_disconnected(&self, session: ConnectionSession) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Some(identity) = session.identity() {
                self.reaper.reap(identity, session.id());
            }
        })
    }
}
