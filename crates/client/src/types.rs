//! Public types for the relay client.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::value::RawValue;

use pairwave_protocol::constants::HANDSHAKE_TIMEOUT;
use pairwave_protocol::messages::ErrorCode;
use pairwave_protocol::{EndReason, Identity, MatchId, SignalKind};

/// Link state of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected and not trying.
    Disconnected,
    /// WebSocket or CONNECT handshake in progress.
    Connecting,
    /// CONNECTED received; frames go straight out.
    Connected,
    /// Connection lost, waiting before the next attempt.
    Reconnecting { attempt: u32 },
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(ClientState),
    /// Handshake completed; `identity` is what the relay calls us.
    Connected { identity: Identity },
    MatchFound {
        match_id: MatchId,
        partner_identity: Identity,
        partner_display_name: String,
        initiator: bool,
    },
    Signal {
        match_id: MatchId,
        kind: SignalKind,
        payload: Box<RawValue>,
    },
    ChatMessage {
        match_id: MatchId,
        from: String,
        text: String,
        sent_at: DateTime<Utc>,
    },
    PartnerLeft {
        match_id: MatchId,
        reason: EndReason,
    },
    /// Something the user should hear about.
    Error {
        code: Option<ErrorCode>,
        reason: String,
        match_id: Option<MatchId>,
    },
    /// Reconnection is in progress.
    Reconnecting { attempt: u32, next_retry_secs: f64 },
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Give up after this many consecutive failures (`None` = never).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        let with_jitter = (capped + jitter * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }

    /// `true` once `attempt` failures exhausted the budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL, e.g. `ws://relay.example:7780/ws`.
    pub url: String,
    /// Session token sent as `Authorization: Bearer <token>`.
    pub token: String,
    /// Preferred display name (`login` header).
    pub login: Option<String>,
    /// Budget for the WebSocket upgrade plus CONNECT/CONNECTED.
    pub handshake_timeout: Duration,
    /// Frames kept while the link is down.
    pub outbox_capacity: usize,
    /// Consecutive `delivery-failed` errors before the user is told.
    pub max_delivery_failures: u32,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            login: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            outbox_capacity: 256,
            max_delivery_failures: 3,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_state_equality() {
        assert_eq!(ClientState::Connected, ClientState::Connected);
        assert_ne!(ClientState::Connected, ClientState::Connecting);
        assert_ne!(
            ClientState::Reconnecting { attempt: 1 },
            ClientState::Reconnecting { attempt: 2 },
        );
    }

    #[test]
    fn reconnect_config_delay_backoff() {
        let config = ReconnectConfig::default();
        // Base delays: 250ms, 500ms, 1s, 2s, 4s, 8s, 15s (capped), 15s...
        let expected_base = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 15.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let delay = config.delay_for_attempt((i + 1) as u32);
            let secs = delay.as_secs_f64();
            let lo = base * 0.74;
            let hi = base * 1.26;
            assert!(
                secs >= lo && secs <= hi,
                "attempt {}: {secs:.3}s not in [{lo:.3}, {hi:.3}]",
                i + 1
            );
        }
    }

    #[test]
    fn reconnect_budget() {
        let unlimited = ReconnectConfig::default();
        assert!(!unlimited.exhausted(10_000));

        let limited = ReconnectConfig {
            max_attempts: Some(3),
            ..ReconnectConfig::default()
        };
        assert!(!limited.exhausted(3));
        assert!(limited.exhausted(4));
    }

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::new("ws://localhost:1/ws", "tok");
        assert_eq!(config.handshake_timeout, HANDSHAKE_TIMEOUT);
        assert!(config.login.is_none());
        assert_eq!(config.max_delivery_failures, 3);
    }
}
