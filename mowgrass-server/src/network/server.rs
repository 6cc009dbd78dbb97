//! WebSocket Game Server
//!
//! Async WebSocket server for multiplayer connections.
//! Accepts sockets, feeds their frames to the [`ConnectionRouter`] and runs
//! the [`Broadcaster`] alongside the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, broadcast};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::game::tick::Simulation;
use crate::network::broadcaster::{Broadcaster, DEFAULT_PERIOD};
use crate::network::protocol::ServerMessage;
use crate::network::router::ConnectionRouter;
use crate::network::session::SessionRegistry;

/// Default bind address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8765";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How often sessions are ticked and broadcast.
    pub broadcast_period: Duration,
    /// Per-connection outbound queue length.
    pub outbound_buffer: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8765)),
            max_connections: 1000,
            broadcast_period: DEFAULT_PERIOD,
            outbound_buffer: 64,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// - `MOWGRASS_BIND_ADDR`
    /// - `MOWGRASS_BROADCAST_MS`
    /// - `MOWGRASS_MAX_CONNECTIONS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("MOWGRASS_BIND_ADDR") {
            match addr.parse() {
                Ok(addr) => config.bind_addr = addr,
                Err(e) => warn!("Ignoring MOWGRASS_BIND_ADDR={}: {}", addr, e),
            }
        }

        if let Some(ms) = lookup("MOWGRASS_BROADCAST_MS") {
            match ms.parse::<u64>() {
                Ok(ms) if ms > 0 => config.broadcast_period = Duration::from_millis(ms),
                _ => warn!("Ignoring MOWGRASS_BROADCAST_MS={}", ms),
            }
        }

        if let Some(max) = lookup("MOWGRASS_MAX_CONNECTIONS") {
            match max.parse() {
                Ok(max) => config.max_connections = max,
                Err(e) => warn!("Ignoring MOWGRASS_MAX_CONNECTIONS={}: {}", max, e),
            }
        }

        config
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Session registry.
    sessions: Arc<SessionRegistry>,
    /// Connection state machines.
    router: Arc<ConnectionRouter>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server whose sessions never advance on their own.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, Arc::new(SessionRegistry::new()))
    }

    /// Create a server whose sessions run `simulation` every tick.
    pub fn with_simulation(config: ServerConfig, simulation: Arc<dyn Simulation>) -> Self {
        Self::with_registry(config, Arc::new(SessionRegistry::with_simulation(simulation)))
    }

    fn with_registry(config: ServerConfig, sessions: Arc<SessionRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let router = Arc::new(ConnectionRouter::new(sessions.clone()));

        Self {
            config,
            sessions,
            router,
            shutdown_tx,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and run until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run on an already-bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server v{} listening on {}", self.config.version, listener.local_addr()?);

        let broadcaster = Broadcaster::new(
            self.sessions.clone(),
            self.router.clone(),
            self.config.broadcast_period,
        );
        let broadcast_handle = tokio::spawn(broadcaster.run(self.shutdown_tx.subscribe()));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.router.connection_count().await;
                            if clients_count >= self.config.max_connections {
                                warn!("{}, rejecting {}", GameServerError::ConnectionLimitReached, addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        broadcast_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let router = self.router.clone();
        let buffer = self.config.outbound_buffer.max(1);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(buffer);

            let conn = router.register(msg_tx).await;
            debug!("Client {} registered as connection {}", addr, conn);

            // Only this task writes to the socket
            let mut sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                router.handle_text(conn, &text).await;
                            }
                            Some(Ok(Message::Binary(data))) => {
                                router.handle_bytes(conn, &data).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            // tungstenite answers pings itself
                            _ => {}
                        }
                    }
                    _ = &mut sender_task => {
                        debug!("Writer for {} stopped", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            // Drops the router's sender, which ends the writer task
            router.disconnect(conn).await;
            if !sender_task.is_finished() {
                sender_task.abort();
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.router.connection_count().await
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.session_count().await
    }

    /// Session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}
