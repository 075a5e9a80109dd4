fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use pairwave_protocol::constants::{
        HEADER_AUTHORIZATION, HEADER_CONTENT_LENGTH, HEADER_DESTINATION, HEADER_LOGIN,
        HEADER_MESSAGE, HEADER_RECEIPT_ID, HEADER_SUBSCRIPTION,
    };
    use pairwave_protocol::destination::{MATCH_JOIN, USER_SIGNAL_QUEUE};
    use pairwave_protocol::messages::{
        ChatEvent, ChatRequest, ErrorCode, ErrorEvent, JoinRequest, MatchEvent, SignalEvent,
        SignalRequest,
    };
    use pairwave_protocol::{
        AppDestination, Command, EndReason, Frame, FrameReader, Gender, Region, SignalKind, frame,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_bytes(name: &str) -> Vec<u8> {
        let path = fixtures_dir().join(name);
        fs::read(&path).unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let data = load_bytes(name);
        serde_json::from_slice(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    fn load_frame(name: &str) -> Frame {
        frame::decode(&load_bytes(name))
            .unwrap_or_else(|e| panic!("failed to decode fixture {name}: {e}"))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (key order does not matter).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_slice(&load_bytes(name))
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  ours:    {reserialized}"
        );
        parsed
    }

    /// Canonical fixtures must re-encode byte for byte.
    fn reencode_test(name: &str) -> Frame {
        let bytes = load_bytes(name);
        let decoded = load_frame(name);
        assert_eq!(
            frame::encode(&decoded),
            bytes,
            "re-encoding {name} changed its bytes"
        );
        decoded
    }

    // --- Payloads ---

    #[test]
    fn fixture_join_request() {
        let req: JoinRequest = roundtrip_test("join_request.json");
        assert_eq!(req.home_region, Some(Region::new("US")));
        assert_eq!(req.gender, Gender::Female);
        assert!(req.target_gender == Gender::Any);
    }

    #[test]
    fn fixture_signal_request_keeps_payload_verbatim() {
        let fixture = load_fixture("signal_request.json");
        let req: SignalRequest = serde_json::from_slice(&load_bytes("signal_request.json")).unwrap();
        assert_eq!(req.kind, SignalKind::IceCandidate);
        let payload: serde_json::Value = serde_json::from_str(req.payload.get()).unwrap();
        assert_eq!(payload, fixture["payload"]);
    }

    #[test]
    fn fixture_chat_request() {
        let req: ChatRequest = roundtrip_test("chat_request.json");
        assert_eq!(req.text, "hello there");
    }

    #[test]
    fn fixture_match_found() {
        let ev: MatchEvent = roundtrip_test("match_found.json");
        assert!(matches!(ev, MatchEvent::MatchFound { initiator: true, .. }));
    }

    #[test]
    fn fixture_partner_left() {
        let ev: MatchEvent = roundtrip_test("partner_left.json");
        assert!(matches!(
            ev,
            MatchEvent::PartnerLeft {
                reason: EndReason::Disconnected,
                ..
            }
        ));
    }

    #[test]
    fn fixture_signal_event() {
        let ev: SignalEvent = roundtrip_test("signal_event.json");
        assert_eq!(ev.kind, SignalKind::Offer);
    }

    #[test]
    fn fixture_chat_event() {
        let ev: ChatEvent = roundtrip_test("chat_event.json");
        assert_eq!(ev.from, "Bob");
    }

    #[test]
    fn fixture_error_event() {
        let ev: ErrorEvent = roundtrip_test("error_event.json");
        assert_eq!(ev.code, ErrorCode::InvalidMatch);
    }

    #[test]
    fn legacy_join_without_optional_fields() {
        let req: JoinRequest = serde_json::from_str(r#"{"targetRegion":"fr"}"#).unwrap();
        assert!(req.home_region.is_none());
        assert_eq!(req.target_region, Region::new("FR"));
        assert_eq!(req.gender, Gender::Any);
        assert!(req.display_name.is_none());
    }

    // --- Frames ---

    #[test]
    fn fixture_connect_frame() {
        let f = reencode_test("connect.frame");
        assert_eq!(f.command, Command::Connect);
        assert_eq!(f.header(HEADER_AUTHORIZATION), Some("Bearer tok"));
        assert_eq!(f.header(HEADER_LOGIN), Some("Alice"));
        assert!(f.body.is_empty());
    }

    #[test]
    fn crlf_frame_decodes_like_lf() {
        assert_eq!(load_frame("connect_crlf.frame"), load_frame("connect.frame"));
    }

    #[test]
    fn fixture_send_join_frame() {
        let f = reencode_test("send_join.frame");
        assert_eq!(f.command, Command::Send);
        assert_eq!(f.header(HEADER_DESTINATION), Some(MATCH_JOIN));
        assert_eq!(
            AppDestination::parse(f.header(HEADER_DESTINATION).unwrap()),
            Some(AppDestination::MatchJoin)
        );
        assert_eq!(
            f.header(HEADER_CONTENT_LENGTH),
            Some(f.body.len().to_string().as_str())
        );
        let req: JoinRequest = serde_json::from_slice(&f.body).unwrap();
        assert_eq!(req.target_region, Region::new("US"));
    }

    #[test]
    fn fixture_message_signal_frame() {
        let f = reencode_test("message_signal.frame");
        assert_eq!(f.command, Command::Message);
        assert_eq!(f.header(HEADER_DESTINATION), Some(USER_SIGNAL_QUEUE));
        assert_eq!(f.header(HEADER_SUBSCRIPTION), Some("sub-1"));
        let ev: SignalEvent = serde_json::from_slice(&f.body).unwrap();
        assert_eq!(ev.kind, SignalKind::Answer);
        assert_eq!(ev.payload.get(), r#"{"sdp":"v=0"}"#);
    }

    #[test]
    fn fixture_escaped_header() {
        let f = reencode_test("message_escaped.frame");
        assert_eq!(f.header("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn fixture_error_and_receipt_frames() {
        let error = reencode_test("error.frame");
        assert_eq!(error.command, Command::Error);
        assert_eq!(error.header(HEADER_MESSAGE), Some("missing credentials"));

        let receipt = reencode_test("receipt.frame");
        assert_eq!(receipt.header(HEADER_RECEIPT_ID), Some("join-1"));
    }

    #[test]
    fn concatenated_fixtures_stream_through_reader() {
        let names = [
            "connect.frame",
            "send_join.frame",
            "message_signal.frame",
            "error.frame",
        ];
        let mut stream = Vec::new();
        for name in names {
            stream.extend(load_bytes(name));
            stream.push(b'\n'); // heart-beat EOL between frames
        }

        let mut reader = FrameReader::new();
        // Feed in small, uneven chunks.
        for chunk in stream.chunks(7) {
            reader.push(chunk);
        }
        let mut decoded = Vec::new();
        while let Some(f) = reader.next_frame().unwrap() {
            decoded.push(f);
        }
        let expected: Vec<Frame> = names.iter().map(|n| load_frame(n)).collect();
        assert_eq!(decoded, expected);
    }
}
