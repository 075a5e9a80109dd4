//! Relay WebSocket server.
//!
//! Listens on a TCP port, upgrades every connection to WebSocket and runs a
//! [`ConnectionSession`] for it until either side closes.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use pairwave_protocol::constants::MAX_FRAME_SIZE;

use crate::RelayError;
use crate::connection::{self, ConnId, ConnectionSession, SessionConfig};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            session: SessionConfig::default(),
        }
    }
}

/// The relay WebSocket server.
pub struct RelayServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    sessions: StdMutex<HashMap<ConnId, ConnectionSession>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

impl<H: Handler> RelayServer<H> {
    /// Creates a new server with the given handler.
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(handler),
            sessions: StdMutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), RelayError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RelayError::AlreadyRunning);
        }

        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("relay listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.close_all();
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_FRAME_SIZE);
        ws_config.max_frame_size = Some(MAX_FRAME_SIZE);

        // The CONNECT deadline only starts once the socket is upgraded, so
        // the upgrade gets its own.
        let upgrade = accept_async_with_config(stream, Some(ws_config));
        let ws_stream = tokio::time::timeout(self.config.session.handshake_timeout, upgrade)
            .await
            .map_err(|_| RelayError::UpgradeTimeout)??;
        tracing::debug!(%peer_addr, "WebSocket connection established");

        let (session, task) = connection::spawn_connection(
            ws_stream,
            peer_addr,
            Arc::clone(&self.handler),
            &self.config.session,
            &self.cancel,
        );
        let id = session.id();
        self.lock_sessions().insert(id, session);

        let server = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::error!(conn = %id, "connection task failed: {e}");
            }
            server.lock_sessions().remove(&id);
        });
        Ok(())
    }

    fn close_all(&self) {
        let sessions: Vec<ConnectionSession> = self.lock_sessions().values().cloned().collect();
        for session in sessions {
            session.close(u16::from(CloseCode::Away), "server shutting down");
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<ConnId, ConnectionSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
