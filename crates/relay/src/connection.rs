//! Relay connection management: read/write pumps, handshake gate,
//! subscriptions and the pre-handshake outbox.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use pairwave_protocol::constants::{
    CONTENT_TYPE_JSON, HANDSHAKE_TIMEOUT, HEADER_ACCEPT_VERSION, HEADER_CONTENT_TYPE,
    HEADER_DESTINATION, HEADER_HEART_BEAT, HEADER_ID, HEADER_MESSAGE, HEADER_MESSAGE_ID,
    HEADER_RECEIPT, HEADER_RECEIPT_ID, HEADER_SERVER, HEADER_SESSION, HEADER_SUBSCRIPTION,
    HEADER_USER_NAME, HEADER_VERSION, PROTOCOL_VERSION, WS_CLOSE_HANDSHAKE_TIMEOUT,
    WS_CLOSE_OVERLOADED, WS_CLOSE_PROTOCOL_VIOLATION, WS_PING_PERIOD, WS_PONG_WAIT,
};
use pairwave_protocol::{Command, Frame, FrameReader, Identity, Outbox, Submit, frame};

use crate::collaborators::Principal;
use crate::handler::{Flow, Handler};
use crate::{OUTBOX_CAPACITY, SEND_BUFFER_SIZE, SERVER_NAME};

/// Time the write pump gets to flush queued frames on shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time a client has to complete CONNECT after the upgrade.
    pub handshake_timeout: Duration,
    /// Capacity of the writer channel.
    pub send_buffer_size: usize,
    /// Frames held while the handshake is pending.
    pub outbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            send_buffer_size: SEND_BUFFER_SIZE,
            outbox_capacity: OUTBOX_CAPACITY,
        }
    }
}

/// How a frame handed to [`ConnectionSession::send`] was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the writer.
    Sent,
    /// Held until the handshake completes.
    Buffered,
}

/// Errors returned when sending to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("pre-handshake buffer full")]
    BufferFull,

    #[error("client is not keeping up, connection dropped")]
    Overloaded,

    #[error("client unsubscribed from {0}")]
    NotSubscribed(String),
}

/// Item on the writer channel.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Frame(Frame),
    Control(WsMessage),
}

impl Outgoing {
    fn into_ws(self) -> WsMessage {
        match self {
            Outgoing::Frame(f) => match frame::encode_text(&f) {
                Some(text) => WsMessage::Text(text.into()),
                None => WsMessage::Binary(frame::encode(&f).into()),
            },
            Outgoing::Control(msg) => msg,
        }
    }
}

#[derive(Debug, Default)]
struct Subscriptions {
    /// subscription id -> destination
    by_id: BTreeMap<String, String>,
    /// Destinations the client explicitly unsubscribed from.
    muted: HashSet<String>,
}

struct Inner {
    id: ConnId,
    remote_addr: SocketAddr,
    principal: OnceLock<Principal>,
    ready: AtomicBool,
    outbox: StdMutex<Outbox<Frame>>,
    tx: mpsc::Sender<Outgoing>,
    subscriptions: StdMutex<Subscriptions>,
    next_message_id: AtomicU64,
    violations: AtomicU32,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to one client connection.
///
/// Cloneable; all clones refer to the same connection.
#[derive(Clone)]
pub struct ConnectionSession {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("identity", &self.identity())
            .finish()
    }
}

impl ConnectionSession {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        config: &SessionConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Outgoing>) {
        // Room for CONNECTED and a full outbox flush on top of the
        // steady-state buffer.
        let capacity = config.send_buffer_size.max(1) + config.outbox_capacity + 1;
        let (tx, rx) = mpsc::channel(capacity);
        let mut outbox = Outbox::new(config.outbox_capacity);
        outbox.begin_connect();
        let inner = Inner {
            id: ConnId::next(),
            remote_addr,
            principal: OnceLock::new(),
            ready: AtomicBool::new(false),
            outbox: StdMutex::new(outbox),
            tx,
            subscriptions: StdMutex::new(Subscriptions::default()),
            next_message_id: AtomicU64::new(1),
            violations: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            cancel,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// The authenticated principal, once CONNECT succeeded.
    pub fn principal(&self) -> Option<&Principal> {
        self.inner.principal.get()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.principal().map(|p| &p.identity)
    }

    /// `true` once CONNECTED has been queued.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Counts a protocol-level misbehaviour and returns the new total.
    pub fn record_violation(&self) -> u32 {
        self.inner.violations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn set_principal(&self, principal: Principal) {
        if self.inner.principal.set(principal).is_err() {
            warn!(conn = %self.id(), "principal already set, ignoring");
        }
    }

    /// Queues a frame for the client without waiting.
    ///
    /// Before the handshake completes the frame is held in the outbox and
    /// written right after CONNECTED, in submission order. Once ready, a
    /// full writer queue closes the session with [`WS_CLOSE_OVERLOADED`].
    pub fn send(&self, frame: Frame) -> Result<Delivery, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut outbox = self.lock_outbox();
        match outbox.submit(frame) {
            Ok(Submit::Buffered) => Ok(Delivery::Buffered),
            Ok(Submit::Transmit(frame)) => {
                self.push(Outgoing::Frame(frame))?;
                Ok(Delivery::Sent)
            }
            Err(_) => {
                warn!(conn = %self.id(), "outbox full, dropping frame");
                Err(SessionError::BufferFull)
            }
        }
    }

    /// Sends a JSON body as a MESSAGE on a user destination.
    pub fn deliver(
        &self,
        destination: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Delivery, SessionError> {
        let subscription = self.subscription_for(destination)?;
        let seq = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = Frame::new(Command::Message)
            .with_header(HEADER_DESTINATION, destination)
            .with_header(HEADER_MESSAGE_ID, format!("{}-{seq}", self.id()))
            .with_header(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON)
            .with_body(body);
        if let Some(id) = subscription {
            frame.set_header(HEADER_SUBSCRIPTION, id);
        }
        self.send(frame)
    }

    /// Closes the connection. Only the first call has any effect.
    pub fn close(&self, code: u16, reason: &str) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(conn = %self.id(), code, reason, "closing connection");
        let close = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self
            .inner
            .tx
            .try_send(Outgoing::Control(WsMessage::Close(Some(close))));
        self.inner.cancel.cancel();
    }

    /// Queues CONNECTED and flushes the outbox behind it.
    pub(crate) fn complete_handshake(&self) -> Result<(), SessionError> {
        let user_name = self
            .identity()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default();
        let connected = Frame::new(Command::Connected)
            .with_header(HEADER_VERSION, PROTOCOL_VERSION)
            .with_header(HEADER_HEART_BEAT, "0,0")
            .with_header(HEADER_SERVER, SERVER_NAME)
            .with_header(HEADER_SESSION, self.id().to_string())
            .with_header(HEADER_USER_NAME, user_name);

        let mut outbox = self.lock_outbox();
        self.push(Outgoing::Frame(connected))?;
        let pending = outbox.mark_ready();
        if !pending.is_empty() {
            debug!(conn = %self.id(), count = pending.len(), "flushing buffered frames");
        }
        for frame in pending {
            self.push(Outgoing::Frame(frame))?;
        }
        self.inner.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Writes a frame ahead of the outbox (ERROR, RECEIPT before ready).
    fn send_direct(&self, frame: Frame) -> Result<(), SessionError> {
        self.push(Outgoing::Frame(frame))
    }

    fn send_error(&self, message: &str) {
        let frame = Frame::new(Command::Error).with_header(HEADER_MESSAGE, message);
        let _ = self.send_direct(frame);
    }

    fn push(&self, out: Outgoing) -> Result<(), SessionError> {
        match self.inner.tx.try_send(out) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed),
            Err(TrySendError::Full(_)) => {
                warn!(conn = %self.id(), "writer queue full, dropping slow client");
                self.close(WS_CLOSE_OVERLOADED, "client too slow");
                Err(SessionError::Overloaded)
            }
        }
    }

    fn lock_outbox(&self) -> std::sync::MutexGuard<'_, Outbox<Frame>> {
        self.inner.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribe(&self, id: &str, destination: &str) {
        let mut subs = self.lock_subscriptions();
        subs.muted.remove(destination);
        subs.by_id.insert(id.to_string(), destination.to_string());
    }

    fn unsubscribe(&self, id: &str) -> Option<String> {
        let mut subs = self.lock_subscriptions();
        let destination = subs.by_id.remove(id)?;
        if !subs.by_id.values().any(|d| *d == destination) {
            subs.muted.insert(destination.clone());
        }
        Some(destination)
    }

    /// Subscription id to stamp on a MESSAGE for `destination`.
    fn subscription_for(&self, destination: &str) -> Result<Option<String>, SessionError> {
        let subs = self.lock_subscriptions();
        if let Some((id, _)) = subs.by_id.iter().find(|(_, d)| *d == destination) {
            return Ok(Some(id.clone()));
        }
        if subs.muted.contains(destination) {
            return Err(SessionError::NotSubscribed(destination.to_string()));
        }
        Ok(None)
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Subscriptions> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Runs the read and write pumps for an upgraded WebSocket.
///
/// Returns the session handle and the read task. The read task ends after
/// [`Handler::on_disconnected`] has run.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    remote_addr: SocketAddr,
    handler: Arc<H>,
    config: &SessionConfig,
    server_cancel: &CancellationToken,
) -> (ConnectionSession, JoinHandle<()>)
where
    S: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (sink, stream) = ws_stream.split();
    spawn_pumps(sink, stream, remote_addr, handler, config, server_cancel)
}

fn spawn_pumps<W, R, H>(
    sink: W,
    stream: R,
    remote_addr: SocketAddr,
    handler: Arc<H>,
    config: &SessionConfig,
    server_cancel: &CancellationToken,
) -> (ConnectionSession, JoinHandle<()>)
where
    W: futures_util::Sink<WsMessage, Error = tungstenite::Error> + Send + Unpin + 'static,
    R: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Send
        + Unpin
        + 'static,
    H: Handler,
{
    let cancel = server_cancel.child_token();
    let (session, rx) = ConnectionSession::new(remote_addr, config, cancel.clone());

    tokio::spawn(write_pump(sink, rx, cancel));

    let read_session = session.clone();
    let handshake_timeout = config.handshake_timeout;
    let task = tokio::spawn(async move {
        read_pump(stream, read_session.clone(), handler.clone(), handshake_timeout).await;
        read_session.close(u16::from(CloseCode::Normal), "");
        handler.on_disconnected(read_session.clone()).await;
        info!(conn = %read_session.id(), addr = %read_session.remote_addr(), "client disconnected");
    });

    (session, task)
}

/// Write pump: drains the writer channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<Outgoing>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tungstenite::Error> + Send + Unpin,
{
    let start = tokio::time::Instant::now() + WS_PING_PERIOD;
    let mut ping_interval = tokio::time::interval_at(start, WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut healthy = true;

    loop {
        tokio::select! {
            biased;

            msg = rx.recv() => match msg {
                Some(out) => {
                    if let Err(e) = sink.send(out.into_ws()).await {
                        warn!("write pump send error: {e}");
                        healthy = false;
                        break;
                    }
                }
                None => break,
            },

            _ = cancel.cancelled() => break,

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    warn!("write pump ping error: {e}");
                    healthy = false;
                    break;
                }
            }
        }
    }

    cancel.cancel();

    // Frames queued before shutdown (ERROR, RECEIPT, the close frame) still go out.
    if healthy {
        let flush = async {
            while let Ok(out) = rx.try_recv() {
                if sink.send(out.into_ws()).await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
            debug!("flush on shutdown timed out");
        }
    }

    let _ = sink.close().await;
}

/// Read pump: reassembles frames and dispatches them.
///
/// Until the handshake completes the deadline is the handshake timeout;
/// afterwards any inbound message pushes it out by [`WS_PONG_WAIT`].
async fn read_pump<S, H>(
    mut stream: S,
    session: ConnectionSession,
    handler: Arc<H>,
    handshake_timeout: Duration,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>> + Send + Unpin,
    H: Handler,
{
    let mut reader = FrameReader::new();
    let deadline = tokio::time::sleep(handshake_timeout);
    tokio::pin!(deadline);
    let cancel = session.inner.cancel.clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                if session.is_ready() {
                    warn!(conn = %session.id(), "pong timeout, closing connection");
                    session.close(u16::from(CloseCode::Away), "idle timeout");
                } else {
                    warn!(conn = %session.id(), "handshake timeout");
                    session.send_error("handshake timeout");
                    session.close(WS_CLOSE_HANDSHAKE_TIMEOUT, "handshake timeout");
                }
                break;
            }

            msg = stream.next() => {
                let keep_going = match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        reader.push(text.as_str().as_bytes());
                        drain_frames(&mut reader, &session, &handler).await
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        reader.push(&data);
                        drain_frames(&mut reader, &session, &handler).await
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        trace!("received ping, sending pong");
                        let _ = session.push(Outgoing::Control(WsMessage::Pong(data)));
                        true
                    }
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => true,
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(conn = %session.id(), "received close frame");
                        false
                    }
                    Some(Err(e)) => {
                        debug!(conn = %session.id(), "read error: {e}");
                        false
                    }
                    None => false,
                };
                if !keep_going {
                    break;
                }
                if session.is_ready() {
                    deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                }
            }
        }
    }
}

/// Dispatches every complete frame in the reader. Returns `false` when the
/// connection must stop reading.
async fn drain_frames<H: Handler>(
    reader: &mut FrameReader,
    session: &ConnectionSession,
    handler: &Arc<H>,
) -> bool {
    loop {
        match reader.next_frame() {
            Ok(Some(frame)) => {
                if let Flow::Close { code, reason } = dispatch(session, handler, frame).await {
                    session.close(code, &reason);
                    return false;
                }
            }
            Ok(None) => return true,
            Err(e) => {
                warn!(conn = %session.id(), "undecodable frame: {e}");
                session.send_error(&e.to_string());
                session.close(WS_CLOSE_PROTOCOL_VIOLATION, "malformed frame");
                return false;
            }
        }
    }
}

async fn dispatch<H: Handler>(
    session: &ConnectionSession,
    handler: &Arc<H>,
    frame: Frame,
) -> Flow {
    trace!(conn = %session.id(), command = %frame.command, "received frame");

    if !session.is_ready() {
        return match frame.command {
            Command::Connect | Command::Stomp => handshake(session, handler, frame).await,
            other => reject(session, &format!("expected CONNECT, got {other}")),
        };
    }

    let receipt = frame.header(HEADER_RECEIPT).map(str::to_owned);
    let flow = match frame.command {
        Command::Subscribe => {
            let (Some(id), Some(destination)) =
                (frame.header(HEADER_ID), frame.header(HEADER_DESTINATION))
            else {
                return reject(session, "SUBSCRIBE requires id and destination");
            };
            debug!(conn = %session.id(), id, destination, "subscribe");
            session.subscribe(id, destination);
            Flow::Continue
        }
        Command::Unsubscribe => {
            let Some(id) = frame.header(HEADER_ID) else {
                return reject(session, "UNSUBSCRIBE requires id");
            };
            if session.unsubscribe(id).is_none() {
                debug!(conn = %session.id(), id, "unsubscribe for unknown id");
            }
            Flow::Continue
        }
        Command::Send => {
            if frame.header(HEADER_DESTINATION).is_none() {
                return reject(session, "SEND requires destination");
            }
            handler.on_send(session.clone(), frame).await
        }
        Command::Disconnect => Flow::Close {
            code: u16::from(CloseCode::Normal),
            reason: String::new(),
        },
        Command::Connect | Command::Stomp => return reject(session, "already connected"),
        other => return reject(session, &format!("{other} is a server frame")),
    };

    if let Some(id) = receipt {
        let frame = Frame::new(Command::Receipt).with_header(HEADER_RECEIPT_ID, id);
        let _ = session.send(frame);
    }
    flow
}

async fn handshake<H: Handler>(
    session: &ConnectionSession,
    handler: &Arc<H>,
    frame: Frame,
) -> Flow {
    let version_ok = frame
        .header(HEADER_ACCEPT_VERSION)
        .is_none_or(|versions| versions.split(',').any(|v| v.trim() == PROTOCOL_VERSION));
    if !version_ok {
        return reject(session, "unsupported protocol version");
    }

    let principal = match handler.authenticate(session.clone(), frame).await {
        Ok(principal) => principal,
        Err(reason) => {
            info!(conn = %session.id(), %reason, "authentication failed");
            return reject(session, &reason);
        }
    };
    info!(
        conn = %session.id(),
        addr = %session.remote_addr(),
        identity = %principal.identity,
        "client connected"
    );
    session.set_principal(principal);

    handler.on_authenticated(session.clone()).await;

    match session.complete_handshake() {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::Close {
            code: u16::from(CloseCode::Normal),
            reason: String::new(),
        },
    }
}

/// Sends an ERROR frame and asks for the connection to be closed.
fn reject(session: &ConnectionSession, message: &str) -> Flow {
    warn!(conn = %session.id(), message, "protocol violation");
    session.send_error(message);
    Flow::Close {
        code: WS_CLOSE_PROTOCOL_VIOLATION,
        reason: "protocol violation".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::handler::HandlerFuture;
    use pairwave_protocol::constants::HEADER_AUTHORIZATION;

    #[derive(Default)]
    struct TestHandler {
        sends: StdMutex<Vec<Frame>>,
        authenticated: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl Handler for TestHandler {
        fn authenticate(
            &self,
            _session: ConnectionSession,
            frame: Frame,
        ) -> HandlerFuture<'_, Result<Principal, String>> {
            Box::pin(async move {
                match frame.header(HEADER_AUTHORIZATION) {
                    Some(token) => Ok(Principal {
                        identity: Identity::new(token),
                        display_name: "tester".into(),
                    }),
                    None => Err("missing credentials".into()),
                }
            })
        }

        fn on_authenticated(&self, _session: ConnectionSession) -> HandlerFuture<'_> {
            Box::pin(async move {
                self.authenticated.fetch_add(1, Ordering::SeqCst);
            })
        }

        fn on_send(&self, _session: ConnectionSession, frame: Frame) -> HandlerFuture<'_, Flow> {
            Box::pin(async move {
                self.sends.lock().unwrap().push(frame);
                Flow::Continue
            })
        }

        fn on_disconnected(&self, _session: ConnectionSession) -> HandlerFuture<'_> {
            Box::pin(async move {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    struct Harness {
        input: mpsc::UnboundedSender<WsMessage>,
        output: mpsc::UnboundedReceiver<WsMessage>,
        session: ConnectionSession,
        handler: Arc<TestHandler>,
        task: JoinHandle<()>,
        _cancel: CancellationToken,
    }

    impl Harness {
        fn new(config: SessionConfig) -> Self {
            let (input, in_rx) = mpsc::unbounded_channel::<WsMessage>();
            let (out_tx, output) = mpsc::unbounded_channel::<WsMessage>();

            let stream = Box::pin(futures_util::stream::unfold(in_rx, |mut rx| async move {
                rx.recv().await.map(|m| (Ok(m), rx))
            }));
            let sink = Box::pin(futures_util::sink::unfold(
                out_tx,
                |tx, msg: WsMessage| async move {
                    tx.send(msg)
                        .map_err(|_| tungstenite::Error::ConnectionClosed)?;
                    Ok::<_, tungstenite::Error>(tx)
                },
            ));

            let handler = Arc::new(TestHandler::default());
            let cancel = CancellationToken::new();
            let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
            let (session, task) =
                spawn_pumps(sink, stream, addr, handler.clone(), &config, &cancel);
            Self {
                input,
                output,
                session,
                handler,
                task,
                _cancel: cancel,
            }
        }

        fn send_frame(&self, frame: Frame) {
            let text = frame::encode_text(&frame).unwrap();
            self.input.send(WsMessage::Text(text.into())).unwrap();
        }

        fn connect(&self) {
            self.send_frame(
                Frame::new(Command::Connect)
                    .with_header(HEADER_ACCEPT_VERSION, "1.1,1.2")
                    .with_header(HEADER_AUTHORIZATION, "alice"),
            );
        }

        async fn next_message(&mut self) -> WsMessage {
            loop {
                let msg = self.output.recv().await.expect("output closed");
                if !matches!(msg, WsMessage::Ping(_)) {
                    return msg;
                }
            }
        }

        async fn next_frame(&mut self) -> Frame {
            match self.next_message().await {
                WsMessage::Text(text) => frame::decode(text.as_str().as_bytes()).unwrap(),
                other => panic!("expected text frame, got {other:?}"),
            }
        }

        async fn next_close_code(&mut self) -> u16 {
            loop {
                if let WsMessage::Close(Some(close)) = self.next_message().await {
                    return u16::from(close.code);
                }
            }
        }
    }

    #[tokio::test]
    async fn connect_yields_connected() {
        let mut h = Harness::new(SessionConfig::default());
        h.connect();

        let connected = h.next_frame().await;
        assert_eq!(connected.command, Command::Connected);
        assert_eq!(connected.header(HEADER_VERSION), Some(PROTOCOL_VERSION));
        assert_eq!(connected.header(HEADER_USER_NAME), Some("alice"));
        assert_eq!(connected.header(HEADER_SERVER), Some(SERVER_NAME));
        assert!(h.session.is_ready());
        assert_eq!(h.handler.authenticated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn frames_sent_before_handshake_follow_connected_in_order() {
        let mut h = Harness::new(SessionConfig::default());

        for n in 1..=3 {
            let delivery = h
                .session
                .deliver("/user/queue/match", format!("{{\"n\":{n}}}"))
                .unwrap();
            assert_eq!(delivery, Delivery::Buffered);
        }
        h.connect();

        assert_eq!(h.next_frame().await.command, Command::Connected);
        for n in 1..=3 {
            let msg = h.next_frame().await;
            assert_eq!(msg.command, Command::Message);
            assert_eq!(msg.body_str(), Some(format!("{{\"n\":{n}}}").as_str()));
        }

        let delivery = h.session.deliver("/user/queue/match", "{}").unwrap();
        assert_eq!(delivery, Delivery::Sent);
    }

    #[tokio::test]
    async fn full_outbox_rejects_frames() {
        let h = Harness::new(SessionConfig {
            outbox_capacity: 1,
            ..SessionConfig::default()
        });
        h.session.deliver("/user/queue/match", "{}").unwrap();
        assert_eq!(
            h.session.deliver("/user/queue/match", "{}"),
            Err(SessionError::BufferFull)
        );
    }

    #[tokio::test]
    async fn full_writer_queue_drops_the_session_instead_of_waiting() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let config = SessionConfig {
            send_buffer_size: 1,
            outbox_capacity: 0,
            ..SessionConfig::default()
        };
        // Nobody drains `_rx`: the client has stopped reading.
        let (session, _rx) = ConnectionSession::new(addr, &config, CancellationToken::new());
        session.complete_handshake().unwrap();

        assert_eq!(session.deliver("/user/queue/signal", "{}"), Ok(Delivery::Sent));
        assert_eq!(
            session.deliver("/user/queue/signal", "{}"),
            Err(SessionError::Overloaded)
        );
        assert!(session.is_closed());
        assert_eq!(
            session.deliver("/user/queue/signal", "{}"),
            Err(SessionError::Closed)
        );
    }

    #[tokio::test]
    async fn non_connect_first_frame_is_rejected() {
        let mut h = Harness::new(SessionConfig::default());
        h.send_frame(Frame::new(Command::Send).with_header(HEADER_DESTINATION, "/app/match/join"));

        let error = h.next_frame().await;
        assert_eq!(error.command, Command::Error);
        assert_eq!(h.next_close_code().await, WS_CLOSE_PROTOCOL_VIOLATION);
        tokio_test::assert_ok!(h.task.await);
        assert!(h.handler.sends.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_authentication_closes() {
        let mut h = Harness::new(SessionConfig::default());
        h.send_frame(Frame::new(Command::Connect));

        let error = h.next_frame().await;
        assert_eq!(error.command, Command::Error);
        assert_eq!(error.header(HEADER_MESSAGE), Some("missing credentials"));
        assert_eq!(h.next_close_code().await, WS_CLOSE_PROTOCOL_VIOLATION);
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let mut h = Harness::new(SessionConfig::default());
        h.send_frame(
            Frame::new(Command::Connect)
                .with_header(HEADER_ACCEPT_VERSION, "1.0")
                .with_header(HEADER_AUTHORIZATION, "alice"),
        );
        assert_eq!(h.next_frame().await.command, Command::Error);
        assert_eq!(h.next_close_code().await, WS_CLOSE_PROTOCOL_VIOLATION);
        assert_eq!(h.handler.authenticated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_closes_with_code() {
        let mut h = Harness::new(SessionConfig {
            handshake_timeout: Duration::from_secs(5),
            ..SessionConfig::default()
        });
        let error = h.next_frame().await;
        assert_eq!(error.command, Command::Error);
        assert_eq!(error.header(HEADER_MESSAGE), Some("handshake timeout"));
        match h.next_message().await {
            WsMessage::Close(Some(close)) => {
                assert_eq!(u16::from(close.code), WS_CLOSE_HANDSHAKE_TIMEOUT);
            }
            other => panic!("expected close after ERROR, got {other:?}"),
        }
        tokio_test::assert_ok!(h.task.await);
        assert_eq!(h.handler.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_frame_closes_connection() {
        let mut h = Harness::new(SessionConfig::default());
        h.input
            .send(WsMessage::Text("BOGUS\n\n\0".to_string().into()))
            .unwrap();
        assert_eq!(h.next_frame().await.command, Command::Error);
        assert_eq!(h.next_close_code().await, WS_CLOSE_PROTOCOL_VIOLATION);
    }

    #[tokio::test]
    async fn send_is_handed_to_handler_with_receipt() {
        let mut h = Harness::new(SessionConfig::default());
        h.connect();
        h.next_frame().await;

        h.send_frame(
            Frame::new(Command::Send)
                .with_header(HEADER_DESTINATION, "/app/match/join")
                .with_header(HEADER_RECEIPT, "r-1")
                .with_body("{}"),
        );
        let receipt = h.next_frame().await;
        assert_eq!(receipt.command, Command::Receipt);
        assert_eq!(receipt.header(HEADER_RECEIPT_ID), Some("r-1"));

        let sends = h.handler.sends.lock().unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].header(HEADER_DESTINATION), Some("/app/match/join"));
    }

    #[tokio::test]
    async fn subscription_id_is_stamped_and_unsubscribe_mutes() {
        let mut h = Harness::new(SessionConfig::default());
        h.connect();
        h.next_frame().await;

        h.send_frame(
            Frame::new(Command::Subscribe)
                .with_header(HEADER_ID, "sub-0")
                .with_header(HEADER_DESTINATION, "/user/queue/chat")
                .with_header(HEADER_RECEIPT, "r"),
        );
        h.next_frame().await;

        h.session.deliver("/user/queue/chat", "{}").unwrap();
        let msg = h.next_frame().await;
        assert_eq!(msg.header(HEADER_SUBSCRIPTION), Some("sub-0"));
        assert_eq!(msg.header(HEADER_DESTINATION), Some("/user/queue/chat"));

        h.send_frame(
            Frame::new(Command::Unsubscribe)
                .with_header(HEADER_ID, "sub-0")
                .with_header(HEADER_RECEIPT, "r"),
        );
        h.next_frame().await;

        assert_eq!(
            h.session.deliver("/user/queue/chat", "{}"),
            Err(SessionError::NotSubscribed("/user/queue/chat".into()))
        );
    }

    #[tokio::test]
    async fn disconnect_sends_receipt_then_closes() {
        let mut h = Harness::new(SessionConfig::default());
        h.connect();
        h.next_frame().await;

        h.send_frame(Frame::new(Command::Disconnect).with_header(HEADER_RECEIPT, "bye"));
        let receipt = h.next_frame().await;
        assert_eq!(receipt.header(HEADER_RECEIPT_ID), Some("bye"));
        assert_eq!(h.next_close_code().await, u16::from(CloseCode::Normal));

        tokio_test::assert_ok!(h.task.await);
        assert_eq!(h.handler.disconnects.load(Ordering::SeqCst), 1);
        assert!(h.session.is_closed());
        assert_eq!(
            h.session.send(Frame::new(Command::Message)),
            Err(SessionError::Closed)
        );
    }

    #[tokio::test]
    async fn stream_end_runs_disconnect_once() {
        let mut h = Harness::new(SessionConfig::default());
        h.connect();
        h.next_frame().await;

        let Harness {
            input,
            task,
            handler,
            session,
            ..
        } = h;
        drop(input);
        tokio_test::assert_ok!(task.await);
        session.close(4000, "again");
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_ping_is_answered() {
        let mut h = Harness::new(SessionConfig::default());
        h.input.send(WsMessage::Ping(vec![7].into())).unwrap();
        match h.next_message().await {
            WsMessage::Pong(data) => assert_eq!(&data[..], &[7]),
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[test]
    fn conn_ids_are_unique() {
        let a = ConnId::next();
        let b = ConnId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with('c'));
    }
}
