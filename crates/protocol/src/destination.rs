//! Destinations carried in the `destination` header.

use crate::types::MatchId;

/// Prefix of client -> relay application destinations.
pub const APP_PREFIX: &str = "/app";

pub const MATCH_JOIN: &str = "/app/match/join";
pub const MATCH_LEAVE: &str = "/app/match/leave";
pub const SIGNAL_PREFIX: &str = "/app/signal/";
pub const CHAT_PREFIX: &str = "/app/chat/";

/// Private relay -> client queue for match-found / partner-left.
pub const USER_MATCH_QUEUE: &str = "/user/queue/match";
/// Private relay -> client queue for relayed negotiation messages.
pub const USER_SIGNAL_QUEUE: &str = "/user/queue/signal";
/// Private relay -> client queue for chat.
pub const USER_CHAT_QUEUE: &str = "/user/queue/chat";
/// Private relay -> client queue for error reports.
pub const USER_ERROR_QUEUE: &str = "/user/queue/errors";

/// Every private queue a client should subscribe to after connecting.
pub const USER_QUEUES: [&str; 4] = [
    USER_MATCH_QUEUE,
    USER_SIGNAL_QUEUE,
    USER_CHAT_QUEUE,
    USER_ERROR_QUEUE,
];

/// A parsed SEND destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppDestination {
    MatchJoin,
    MatchLeave,
    Signal(MatchId),
    Chat(MatchId),
}

impl AppDestination {
    /// Parses a SEND destination. Returns `None` for unknown routes.
    pub fn parse(dest: &str) -> Option<Self> {
        match dest {
            MATCH_JOIN => return Some(AppDestination::MatchJoin),
            MATCH_LEAVE => return Some(AppDestination::MatchLeave),
            _ => {}
        }

        if let Some(id) = dest.strip_prefix(SIGNAL_PREFIX) {
            return valid_match_id(id).map(AppDestination::Signal);
        }
        if let Some(id) = dest.strip_prefix(CHAT_PREFIX) {
            return valid_match_id(id).map(AppDestination::Chat);
        }
        None
    }

    /// Returns the wire destination string.
    pub fn path(&self) -> String {
        match self {
            AppDestination::MatchJoin => MATCH_JOIN.to_string(),
            AppDestination::MatchLeave => MATCH_LEAVE.to_string(),
            AppDestination::Signal(id) => format!("{SIGNAL_PREFIX}{id}"),
            AppDestination::Chat(id) => format!("{CHAT_PREFIX}{id}"),
        }
    }
}

fn valid_match_id(id: &str) -> Option<MatchId> {
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(MatchId::new(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fixed_routes() {
        assert_eq!(
            AppDestination::parse("/app/match/join"),
            Some(AppDestination::MatchJoin)
        );
        assert_eq!(
            AppDestination::parse("/app/match/leave"),
            Some(AppDestination::MatchLeave)
        );
    }

    #[test]
    fn parse_match_scoped_routes() {
        assert_eq!(
            AppDestination::parse("/app/signal/m-1"),
            Some(AppDestination::Signal(MatchId::new("m-1")))
        );
        assert_eq!(
            AppDestination::parse("/app/chat/m-2"),
            Some(AppDestination::Chat(MatchId::new("m-2")))
        );
    }

    #[test]
    fn parse_rejects_unknown_and_malformed() {
        assert_eq!(AppDestination::parse("/app/other"), None);
        assert_eq!(AppDestination::parse("/app/signal/"), None);
        assert_eq!(AppDestination::parse("/app/signal/a/b"), None);
        assert_eq!(AppDestination::parse("/user/queue/match"), None);
    }

    #[test]
    fn path_matches_parse() {
        let dest = AppDestination::Signal(MatchId::new("abc"));
        assert_eq!(dest.path(), "/app/signal/abc");
        assert_eq!(AppDestination::parse(&dest.path()), Some(dest));
    }
}
