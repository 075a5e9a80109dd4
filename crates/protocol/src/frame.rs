//! Text frame codec.
//!
//! # Wire format
//!
//! ```text
//! <COMMAND>\n
//! <header-key>:<header-value>\n
//! ...
//! \n
//! <body>\0
//! ```
//!
//! Lines may also end in `\r\n`. Header names and values are escaped
//! (`\\`, `\n`, `\r`, `\c`) on every frame except CONNECT, STOMP and
//! CONNECTED. When a `content-length` header is present the body is exactly
//! that many bytes, otherwise it runs until the first NUL.

use std::fmt;

use crate::constants::{HEADER_CONTENT_LENGTH, MAX_FRAME_SIZE, NUL};

/// Frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Client -> relay
    Connect,
    Stomp,
    Subscribe,
    Unsubscribe,
    Send,
    Disconnect,

    // Relay -> client
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Returns the on-wire spelling of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// Parses a command line.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        })
    }

    /// CONNECT-family frames carry raw header values.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is empty")]
    Empty,

    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("header block is not terminated by a blank line")]
    UnterminatedHeaders,

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header: {0:?}")]
    InvalidEscape(String),

    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    #[error("frame is missing the NUL terminator")]
    MissingTerminator,

    #[error("unexpected data after frame terminator")]
    TrailingData,

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame exceeds maximum size ({size} > {max})")]
    TooLarge { size: usize, max: usize },
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    /// Creates a frame with no headers and no body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Builder-style header setter. Replaces an existing header of the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Builder-style body setter.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a header, replacing any previous value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Returns the value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over all headers.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Returns the body as UTF-8 text, if it is valid.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Encodes a frame. The output always ends with the NUL terminator.
pub fn encode(frame: &Frame) -> Vec<u8> {
    let escape = frame.command.escapes_headers();
    let mut out = Vec::with_capacity(64 + frame.body.len());

    out.extend_from_slice(frame.command.as_str().as_bytes());
    out.push(b'\n');

    let mut wrote_length = false;
    for (name, value) in &frame.headers {
        if name == HEADER_CONTENT_LENGTH {
            // Always derived from the actual body.
            if wrote_length {
                continue;
            }
            wrote_length = true;
            write_header(&mut out, name, &frame.body.len().to_string(), escape);
            continue;
        }
        write_header(&mut out, name, value, escape);
    }
    if !wrote_length && !frame.body.is_empty() {
        write_header(
            &mut out,
            HEADER_CONTENT_LENGTH,
            &frame.body.len().to_string(),
            escape,
        );
    }

    out.push(b'\n');
    out.extend_from_slice(&frame.body);
    out.push(NUL);
    out
}

/// Encodes a frame as text for a WebSocket text message.
///
/// Returns `None` if the body is not UTF-8.
pub fn encode_text(frame: &Frame) -> Option<String> {
    String::from_utf8(encode(frame)).ok()
}

/// Decodes exactly one frame.
///
/// Heart-beat EOLs before and after the frame are tolerated; any other
/// trailing data is rejected.
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let start = skip_eols(bytes);
    if start == bytes.len() {
        return Err(DecodeError::Empty);
    }

    match parse_frame(&bytes[start..])? {
        Parsed::Complete(_, used) if used > MAX_FRAME_SIZE => Err(DecodeError::TooLarge {
            size: used,
            max: MAX_FRAME_SIZE,
        }),
        Parsed::Complete(frame, used) => {
            let rest = &bytes[start + used..];
            if skip_eols(rest) != rest.len() {
                return Err(DecodeError::TrailingData);
            }
            Ok(frame)
        }
        Parsed::NeedHeaders => Err(DecodeError::UnterminatedHeaders),
        Parsed::NeedBody => Err(DecodeError::MissingTerminator),
    }
}

/// Incremental decoder for a byte stream carrying back-to-back frames.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    ///
    /// Frames over [`MAX_FRAME_SIZE`] are rejected whether or not they
    /// arrived whole. After an error the reader should be discarded:
    /// framing is lost.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        let start = skip_eols(&self.buf);
        self.buf.drain(..start);
        if self.buf.is_empty() {
            return Ok(None);
        }

        match parse_frame(&self.buf)? {
            Parsed::Complete(_, used) if used > MAX_FRAME_SIZE => Err(DecodeError::TooLarge {
                size: used,
                max: MAX_FRAME_SIZE,
            }),
            Parsed::Complete(frame, used) => {
                self.buf.drain(..used);
                Ok(Some(frame))
            }
            Parsed::NeedHeaders | Parsed::NeedBody => {
                if self.buf.len() > MAX_FRAME_SIZE {
                    return Err(DecodeError::TooLarge {
                        size: self.buf.len(),
                        max: MAX_FRAME_SIZE,
                    });
                }
                Ok(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

enum Parsed {
    Complete(Frame, usize),
    NeedHeaders,
    NeedBody,
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &str, escape: bool) {
    if escape {
        out.extend_from_slice(escape_value(name).as_bytes());
        out.push(b':');
        out.extend_from_slice(escape_value(value).as_bytes());
    } else {
        out.extend_from_slice(name.as_bytes());
        out.push(b':');
        out.extend_from_slice(value.as_bytes());
    }
    out.push(b'\n');
}

fn escape_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_value(s: &str) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(DecodeError::InvalidEscape(s.to_string())),
        }
    }
    Ok(out)
}

/// Returns the number of leading `\n` / `\r\n` bytes.
fn skip_eols(buf: &[u8]) -> usize {
    let mut i = 0;
    loop {
        match buf.get(i..) {
            Some([b'\n', ..]) => i += 1,
            Some([b'\r', b'\n', ..]) => i += 2,
            _ => return i,
        }
    }
}

/// Reads one line starting at `pos`; returns the line (without EOL) and
/// the position after it, or `None` if no `\n` is buffered yet.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rel = buf[pos..].iter().position(|&b| b == b'\n')?;
    let mut line = &buf[pos..pos + rel];
    if let [head @ .., b'\r'] = line {
        line = head;
    }
    Some((line, pos + rel + 1))
}

fn parse_frame(buf: &[u8]) -> Result<Parsed, DecodeError> {
    let Some((command_line, mut pos)) = read_line(buf, 0) else {
        return Ok(Parsed::NeedHeaders);
    };
    let command_str = std::str::from_utf8(command_line).map_err(|_| DecodeError::InvalidUtf8)?;
    let command = Command::parse(command_str)
        .ok_or_else(|| DecodeError::UnknownCommand(command_str.to_string()))?;
    let escape = command.escapes_headers();

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let Some((line, next)) = read_line(buf, pos) else {
            return Ok(Parsed::NeedHeaders);
        };
        pos = next;
        if line.is_empty() {
            break;
        }

        let line = std::str::from_utf8(line).map_err(|_| DecodeError::InvalidUtf8)?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| DecodeError::MalformedHeader(line.to_string()))?;
        let (name, value) = if escape {
            (unescape_value(name)?, unescape_value(value)?)
        } else {
            (name.to_string(), value.to_string())
        };

        // First occurrence wins.
        if !headers.iter().any(|(n, _)| *n == name) {
            headers.push((name, value));
        }
    }

    let content_length = headers
        .iter()
        .find(|(n, _)| n == HEADER_CONTENT_LENGTH)
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| DecodeError::InvalidContentLength(v.clone()))
        })
        .transpose()?;

    let rest = &buf[pos..];
    let body_len = match content_length {
        Some(len) => {
            if len > MAX_FRAME_SIZE {
                return Err(DecodeError::TooLarge {
                    size: len,
                    max: MAX_FRAME_SIZE,
                });
            }
            match rest.get(len) {
                None => return Ok(Parsed::NeedBody),
                Some(&NUL) => len,
                Some(_) => return Err(DecodeError::MissingTerminator),
            }
        }
        None => match rest.iter().position(|&b| b == NUL) {
            Some(len) => len,
            None => return Ok(Parsed::NeedBody),
        },
    };

    let frame = Frame {
        command,
        headers,
        body: rest[..body_len].to_vec(),
    };
    Ok(Parsed::Complete(frame, pos + body_len + 1))
}
