use std::time::Duration;

/// Protocol version negotiated in CONNECT / CONNECTED.
pub const PROTOCOL_VERSION: &str = "1.2";

/// Time a freshly opened connection has to complete the CONNECT handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead. Mobile clients may stall for a while
/// when switching networks, so keep this generous.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(30);

/// How often to send WebSocket pings (must be < [`WS_PONG_WAIT`]).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(10);

/// Maximum size of a single encoded frame (SDP offers fit comfortably).
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Frame terminator.
pub const NUL: u8 = 0x00;

// ---------------------------------------------------------------------------
// Header names
// ---------------------------------------------------------------------------

pub const HEADER_ACCEPT_VERSION: &str = "accept-version";
pub const HEADER_VERSION: &str = "version";
pub const HEADER_HOST: &str = "host";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_LOGIN: &str = "login";
pub const HEADER_HEART_BEAT: &str = "heart-beat";
pub const HEADER_SERVER: &str = "server";
pub const HEADER_SESSION: &str = "session";
pub const HEADER_USER_NAME: &str = "user-name";
pub const HEADER_DESTINATION: &str = "destination";
pub const HEADER_ID: &str = "id";
pub const HEADER_SUBSCRIPTION: &str = "subscription";
pub const HEADER_MESSAGE_ID: &str = "message-id";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_CONTENT_LENGTH: &str = "content-length";
pub const HEADER_RECEIPT: &str = "receipt";
pub const HEADER_RECEIPT_ID: &str = "receipt-id";
pub const HEADER_MESSAGE: &str = "message";

/// Content type of every JSON body exchanged by the relay.
pub const CONTENT_TYPE_JSON: &str = "application/json";

// ---------------------------------------------------------------------------
// WebSocket close codes
// ---------------------------------------------------------------------------

/// Another connection authenticated as the same identity.
pub const WS_CLOSE_SUPERSEDED: u16 = 4001;

/// The peer violated the frame protocol (bad frame, spoofing).
pub const WS_CLOSE_PROTOCOL_VIOLATION: u16 = 4002;

/// The CONNECT handshake did not complete in time.
pub const WS_CLOSE_HANDSHAKE_TIMEOUT: u16 = 4003;

/// The client stopped reading and its writer queue filled up.
pub const WS_CLOSE_OVERLOADED: u16 = 4004;
