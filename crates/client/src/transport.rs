//! One physical link to the relay.
//!
//! [`Link::connect`] performs the WebSocket upgrade and the CONNECT /
//! CONNECTED exchange under a single timeout, subscribes to the private
//! queues, then hands the socket to the read/write/ping pumps.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use pairwave_protocol::constants::{
    HEADER_ACCEPT_VERSION, HEADER_AUTHORIZATION, HEADER_DESTINATION, HEADER_HEART_BEAT,
    HEADER_HOST, HEADER_ID, HEADER_LOGIN, HEADER_MESSAGE, HEADER_USER_NAME, MAX_FRAME_SIZE,
    PROTOCOL_VERSION,
};
use pairwave_protocol::destination::USER_QUEUES;
use pairwave_protocol::{Command, DecodeError, Frame, FrameReader, Identity, Outbox, frame};

use crate::pumps::read::Inbound;
use crate::pumps::write::Outgoing;
use crate::types::ClientConfig;

/// Errors from the relay client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame from relay: {0}")]
    Decode(#[from] DecodeError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("relay rejected the connection: {0}")]
    Rejected(String),

    #[error("connection closed")]
    Closed,

    #[error("outbox full, message dropped")]
    OutboxFull,

    #[error("client stopped")]
    Stopped,
}

/// Encodes a frame as a WebSocket message, preferring text.
pub(crate) fn to_ws(frame: &Frame) -> tungstenite::Message {
    match frame::encode_text(frame) {
        Some(text) => tungstenite::Message::Text(text.into()),
        None => tungstenite::Message::Binary(frame::encode(frame).into()),
    }
}

/// How long [`Link::shutdown`] waits for the write pump to hand back
/// unwritten frames and say goodbye.
const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// A connected, authenticated and subscribed link.
pub(crate) struct Link {
    identity: Identity,
    write_tx: mpsc::Sender<Outgoing>,
    inbound_rx: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
    writer: Option<JoinHandle<()>>,
}

impl Link {
    /// Connects to the relay. Everything up to CONNECTED must finish within
    /// `config.handshake_timeout`.
    ///
    /// Request frames the link fails to write are returned to `outbox`.
    pub(crate) async fn connect(
        config: &ClientConfig,
        outbox: Arc<Mutex<Outbox<Frame>>>,
        parent: &CancellationToken,
    ) -> Result<Self, ClientError> {
        let request = config.url.as_str().into_client_request()?;
        let host = request.uri().host().unwrap_or_default().to_string();

        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_FRAME_SIZE);
        ws_config.max_frame_size = Some(MAX_FRAME_SIZE);

        let mut connect = Frame::new(Command::Connect)
            .with_header(HEADER_ACCEPT_VERSION, PROTOCOL_VERSION)
            .with_header(HEADER_HOST, host)
            .with_header(HEADER_HEART_BEAT, "0,0");
        if !config.token.is_empty() {
            connect.set_header(HEADER_AUTHORIZATION, format!("Bearer {}", config.token));
        }
        if let Some(login) = &config.login {
            connect.set_header(HEADER_LOGIN, login.clone());
        }

        let handshake = async {
            let (mut ws, _) =
                tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false)
                    .await?;
            ws.send(to_ws(&connect)).await?;

            let mut reader = FrameReader::new();
            let reply = loop {
                if let Some(frame) = reader.next_frame()? {
                    break frame;
                }
                match ws.next().await {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        reader.push(text.as_str().as_bytes())
                    }
                    Some(Ok(tungstenite::Message::Binary(data))) => reader.push(&data),
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        return Err(ClientError::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            };
            Ok::<_, ClientError>((ws, reply))
        };

        let (ws, reply) = tokio::time::timeout(config.handshake_timeout, handshake)
            .await
            .map_err(|_| ClientError::HandshakeTimeout)??;

        let identity = match reply.command {
            Command::Connected => Identity::new(reply.header(HEADER_USER_NAME).unwrap_or_default()),
            Command::Error => {
                let reason = reply
                    .header(HEADER_MESSAGE)
                    .map(str::to_string)
                    .or_else(|| reply.body_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown error".into());
                return Err(ClientError::Rejected(reason));
            }
            other => {
                return Err(ClientError::Rejected(format!(
                    "expected CONNECTED, got {other}"
                )));
            }
        };
        info!(%identity, url = %config.url, "connected to relay");

        let (write, read) = ws.split();
        let (write_tx, write_rx) = mpsc::channel::<Outgoing>(256);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(256);
        let cancel = parent.child_token();

        let writer = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            outbox,
            cancel.clone(),
        ));
        tokio::spawn(crate::pumps::read::read_pump(
            read,
            inbound_tx,
            write_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(crate::pumps::ping::ping_pump(
            write_tx.clone(),
            cancel.clone(),
        ));

        let link = Self {
            identity,
            write_tx,
            inbound_rx,
            cancel,
            writer: Some(writer),
        };
        for (i, queue) in USER_QUEUES.iter().enumerate() {
            let subscribe = Frame::new(Command::Subscribe)
                .with_header(HEADER_ID, format!("sub-{i}"))
                .with_header(HEADER_DESTINATION, *queue);
            link.send(&subscribe).await?;
        }
        debug!(queues = USER_QUEUES.len(), "subscribed to private queues");
        Ok(link)
    }

    pub(crate) fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queues a frame for the write pump.
    pub(crate) async fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        trace!(command = %frame.command, "sending frame");
        self.sender().send(frame).await
    }

    /// A cheap handle for writing from other tasks.
    pub(crate) fn sender(&self) -> LinkSender {
        LinkSender::new(self.write_tx.clone(), self.cancel.clone())
    }

    /// Next inbound item. Returns [`Inbound::Closed`] once the link is gone.
    pub(crate) async fn recv(&mut self) -> Inbound {
        self.inbound_rx
            .recv()
            .await
            .unwrap_or(Inbound::Closed { code: None })
    }

    /// Tears the link down and waits until the write pump has returned
    /// any unwritten requests to the outbox. The pump sends a close frame
    /// on the way out.
    pub(crate) async fn shutdown(&mut self) {
        self.cancel.cancel();
        let Some(writer) = self.writer.take() else {
            return;
        };
        if tokio::time::timeout(WRITER_STOP_TIMEOUT, writer).await.is_err() {
            warn!("write pump did not stop in time");
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Write half of a [`Link`], shared with the API side of the client.
#[derive(Clone)]
pub(crate) struct LinkSender {
    write_tx: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
}

impl LinkSender {
    pub(crate) fn new(write_tx: mpsc::Sender<Outgoing>, cancel: CancellationToken) -> Self {
        Self { write_tx, cancel }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.write_tx.is_closed()
    }

    pub(crate) async fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        // Handing over is not delivery: the write pump requeues the frame
        // if the socket write fails.
        self.write_tx
            .send(Outgoing::Frame(frame.clone()))
            .await
            .map_err(|_| ClientError::Closed)
    }
}
