use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::types::{EndReason, Gender, Identity, MatchId, Region, SignalKind};

// ---------------------------------------------------------------------------
// Request payloads (SEND bodies)
// ---------------------------------------------------------------------------

/// Body of `/app/match/join`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Caller's own region. Detected from the connection address when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_region: Option<Region>,
    #[serde(default)]
    pub target_region: Region,
    /// Caller's own gender (`ANY` = unspecified).
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub target_gender: Gender,
    /// Overrides the display name provided by the identity resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Body of `/app/signal/{matchId}`.
///
/// The payload is opaque to the relay and forwarded byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: Box<RawValue>,
}

impl SignalRequest {
    pub fn new<T: Serialize>(kind: SignalKind, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: serde_json::value::to_raw_value(payload)?,
        })
    }
}

/// Body of `/app/chat/{matchId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

// ---------------------------------------------------------------------------
// Events (MESSAGE bodies)
// ---------------------------------------------------------------------------

/// Events on [`USER_MATCH_QUEUE`](crate::destination::USER_MATCH_QUEUE).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MatchEvent {
    #[serde(rename_all = "camelCase")]
    MatchFound {
        match_id: MatchId,
        partner_identity: Identity,
        partner_display_name: String,
        /// `true` if this member must create and send the first offer.
        initiator: bool,
    },
    #[serde(rename_all = "camelCase")]
    PartnerLeft { match_id: MatchId, reason: EndReason },
}

/// Event on [`USER_SIGNAL_QUEUE`](crate::destination::USER_SIGNAL_QUEUE).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEvent {
    pub match_id: MatchId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: Box<RawValue>,
}

/// Event on [`USER_CHAT_QUEUE`](crate::destination::USER_CHAT_QUEUE).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub match_id: MatchId,
    pub from: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The match id is unknown or the sender is not a member.
    InvalidMatch,
    /// The partner is no longer reachable; the message was dropped.
    DeliveryFailed,
    /// The request body or destination could not be understood.
    BadRequest,
}

/// Event on [`USER_ERROR_QUEUE`](crate::destination::USER_ERROR_QUEUE).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_id: Option<MatchId>,
}
