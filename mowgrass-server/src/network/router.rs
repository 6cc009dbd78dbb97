//! Connection Router
//!
//! Per-connection state machine. Maps a live connection to the
//! (session, player) it is bound to, turns client commands into session
//! mutations and pushes lobby updates to every connection.
//!
//! ```text
//! Connected --join--> Joined(session, player) --leave--> Connected
//!     \                   /
//!      +----close--------+--> Disconnected
//! ```
//!
//! The router never touches a socket. Each connection is represented by the
//! sending half of its outbound queue; the server owns the socket itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::game::state::PlayerId;
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::network::session::{SessionId, SessionRegistry};

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Reply to a join for a session that does not exist (or was just deleted).
pub const ERR_GAME_NOT_FOUND: &str = "game not found";

/// Reply to a join from a connection that is already bound.
pub const ERR_ALREADY_JOINED: &str = "already in a session";

/// Where a connection stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open, not bound to any session.
    Connected,
    /// Bound to one player in one session.
    Joined {
        /// Session the connection joined.
        session_id: SessionId,
        /// Player created for the connection.
        player_id: PlayerId,
    },
    /// Closed (terminal).
    Disconnected,
}

impl ConnectionState {
    /// Binding, if joined.
    pub fn binding(&self) -> Option<(&SessionId, &PlayerId)> {
        match self {
            Self::Joined { session_id, player_id } => Some((session_id, player_id)),
            _ => None,
        }
    }
}

struct ConnectionEntry {
    state: ConnectionState,
    sender: mpsc::Sender<ServerMessage>,
}

/// Routes client commands to sessions.
pub struct ConnectionRouter {
    registry: Arc<SessionRegistry>,
    connections: RwLock<BTreeMap<ConnectionId, ConnectionEntry>>,
    next_id: AtomicU64,
}

impl ConnectionRouter {
    /// Create a router over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            connections: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Session registry this router mutates.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a new connection in the `Connected` state.
    pub async fn register(&self, sender: mpsc::Sender<ServerMessage>) -> ConnectionId {
        let conn = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.write().await;
        connections.insert(conn, ConnectionEntry {
            state: ConnectionState::Connected,
            sender,
        });
        conn
    }

    /// Current state of a connection. Unknown ids read as `Disconnected`.
    pub async fn state_of(&self, conn: ConnectionId) -> ConnectionState {
        let connections = self.connections.read().await;
        connections
            .get(&conn)
            .map(|entry| entry.state.clone())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Get live connection count.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Outbound queues of every connection joined to `session_id`.
    ///
    /// Copied under the lock; sending happens after it is released.
    pub async fn members_of(&self, session_id: &str) -> Vec<(ConnectionId, mpsc::Sender<ServerMessage>)> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|(_, entry)| {
                matches!(&entry.state, ConnectionState::Joined { session_id: s, .. } if s == session_id)
            })
            .map(|(conn, entry)| (*conn, entry.sender.clone()))
            .collect()
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Handle a text frame. Malformed frames are logged and dropped.
    pub async fn handle_text(&self, conn: ConnectionId, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(msg) => self.handle(conn, msg).await,
            Err(e) => debug!("Dropping frame from connection {}: {}", conn, e),
        }
    }

    /// Handle a binary frame carrying JSON.
    pub async fn handle_bytes(&self, conn: ConnectionId, data: &[u8]) {
        match ClientMessage::from_bytes(data) {
            Ok(msg) => self.handle(conn, msg).await,
            Err(e) => debug!("Dropping binary frame from connection {}: {}", conn, e),
        }
    }

    /// Handle a decoded client message.
    pub async fn handle(&self, conn: ConnectionId, msg: ClientMessage) {
        let Some((state, sender)) = self.lookup(conn).await else {
            debug!("Message {} for unknown connection {}", msg.kind(), conn);
            return;
        };

        match msg {
            ClientMessage::List => {
                let games = self.registry.list().await;
                reply(conn, &sender, ServerMessage::Lobby { games }).await;
            }
            ClientMessage::Create { name } => {
                let session_id = self.registry.create(name.clone()).await;
                reply(conn, &sender, ServerMessage::Created { session_id, name }).await;
                self.broadcast_lobby().await;
            }
            ClientMessage::Join { session_id, player_name } => {
                self.handle_join(conn, state, &sender, session_id, player_name).await;
            }
            ClientMessage::Input { session_id, player_id, input } => {
                let bound = matches!(
                    state.binding(),
                    Some((s, p)) if *s == session_id && *p == player_id
                );
                if !bound {
                    debug!("Dropping input from connection {} for {}/{}", conn, session_id, player_id);
                    return;
                }
                if let Ok(session) = self.registry.get(&session_id).await {
                    session.apply_input(&player_id, &input).await;
                }
            }
            ClientMessage::Leave => {
                if self.release(conn).await {
                    self.broadcast_lobby().await;
                }
            }
            ClientMessage::Ping { timestamp } => {
                let server_time = Utc::now().timestamp_millis().max(0) as u64;
                reply(conn, &sender, ServerMessage::Pong { timestamp, server_time }).await;
            }
        }
    }

    async fn handle_join(
        &self,
        conn: ConnectionId,
        state: ConnectionState,
        sender: &mpsc::Sender<ServerMessage>,
        session_id: SessionId,
        player_name: String,
    ) {
        if state.binding().is_some() {
            reply(conn, sender, ServerMessage::error(ERR_ALREADY_JOINED)).await;
            return;
        }

        let session = match self.registry.get(&session_id).await {
            Ok(session) => session,
            Err(_) => {
                reply(conn, sender, ServerMessage::error(ERR_GAME_NOT_FOUND)).await;
                return;
            }
        };

        let player_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = session.add_player(player_id.clone(), player_name.clone()).await {
            debug!("Join to {} refused: {}", session_id, e);
            reply(conn, sender, ServerMessage::error(ERR_GAME_NOT_FOUND)).await;
            return;
        }

        {
            let mut connections = self.connections.write().await;
            if let Some(entry) = connections.get_mut(&conn) {
                entry.state = ConnectionState::Joined {
                    session_id: session_id.clone(),
                    player_id: player_id.clone(),
                };
            }
        }

        info!("Player {} ({}) joined session {}", player_name, player_id, session_id);
        reply(conn, sender, ServerMessage::Joined { session_id, player_id }).await;
        self.broadcast_lobby().await;
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Drop the connection's binding, if any, and return it to `Connected`.
    ///
    /// Removes the player and deletes the session if that left it abandoned.
    /// Returns true if the connection was joined.
    async fn release(&self, conn: ConnectionId) -> bool {
        let binding = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(&conn) {
                Some(entry) => std::mem::replace(&mut entry.state, ConnectionState::Connected),
                None => return false,
            }
        };

        match binding {
            ConnectionState::Joined { session_id, player_id } => {
                self.unbind(&session_id, &player_id).await;
                true
            }
            _ => false,
        }
    }

    async fn unbind(&self, session_id: &str, player_id: &str) {
        if let Ok(session) = self.registry.get(session_id).await {
            session.remove_player(player_id).await;
            info!("Player {} left session {}", player_id, session_id);
        }
        self.registry.delete_if_abandoned(session_id).await;
    }

    /// Connection closed: clean up its binding and tell everyone else.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let entry = {
            let mut connections = self.connections.write().await;
            connections.remove(&conn)
        };

        let Some(entry) = entry else {
            return;
        };

        if let ConnectionState::Joined { session_id, player_id } = entry.state {
            self.unbind(&session_id, &player_id).await;
        }

        // player counts changed even if no session was deleted
        self.broadcast_lobby().await;
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Push the current lobby to every live connection.
    pub async fn broadcast_lobby(&self) {
        let games = self.registry.list().await;
        let targets: Vec<(ConnectionId, mpsc::Sender<ServerMessage>)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .map(|(conn, entry)| (*conn, entry.sender.clone()))
                .collect()
        };

        let msg = ServerMessage::Lobby { games };
        for (conn, sender) in targets {
            push(conn, &sender, msg.clone());
        }
    }

    async fn lookup(&self, conn: ConnectionId) -> Option<(ConnectionState, mpsc::Sender<ServerMessage>)> {
        let connections = self.connections.read().await;
        connections
            .get(&conn)
            .map(|entry| (entry.state.clone(), entry.sender.clone()))
    }
}

/// Direct reply. Waits for queue space; only the replying connection waits.
async fn reply(conn: ConnectionId, sender: &mpsc::Sender<ServerMessage>, msg: ServerMessage) {
    if sender.send(msg).await.is_err() {
        debug!("Reply to connection {} dropped, connection closing", conn);
    }
}

/// Non-blocking fan-out send. A full or closed queue drops this one message
/// for this one connection. Returns true if the message was queued.
pub(crate) fn push(conn: ConnectionId, sender: &mpsc::Sender<ServerMessage>, msg: ServerMessage) -> bool {
    match sender.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            warn!("Outbound queue full for connection {}, dropped {}", conn, msg.kind());
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Connection {} closed, skipping send", conn);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::InputPatch;

    fn setup() -> (Arc<SessionRegistry>, ConnectionRouter) {
        let registry = Arc::new(SessionRegistry::new());
        let router = ConnectionRouter::new(registry.clone());
        (registry, router)
    }

    async fn connect(router: &ConnectionRouter) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (router.register(tx).await, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn create(router: &ConnectionRouter, conn: ConnectionId, rx: &mut mpsc::Receiver<ServerMessage>) -> SessionId {
        router.handle(conn, ClientMessage::create("Alpha")).await;
        match drain(rx).into_iter().next() {
            Some(ServerMessage::Created { session_id, .. }) => session_id,
            other => panic!("Expected created, got {:?}", other),
        }
    }

    async fn join(
        router: &ConnectionRouter,
        conn: ConnectionId,
        rx: &mut mpsc::Receiver<ServerMessage>,
        session_id: &str,
        name: &str,
    ) -> PlayerId {
        router.handle(conn, ClientMessage::join(session_id, name)).await;
        match drain(rx).into_iter().next() {
            Some(ServerMessage::Joined { player_id, .. }) => player_id,
            other => panic!("Expected joined, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_replies_with_lobby() {
        let (registry, router) = setup();
        registry.create("Alpha").await;
        let (conn, mut rx) = connect(&router).await;

        router.handle_text(conn, r#"{"type":"list"}"#).await;

        match drain(&mut rx).as_slice() {
            [ServerMessage::Lobby { games }] => {
                assert_eq!(games.len(), 1);
                assert_eq!(games[0].name, "Alpha");
            }
            other => panic!("Unexpected: {:?}", other),
        }
        assert_eq!(router.state_of(conn).await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_create_broadcasts_lobby_to_everyone() {
        let (_registry, router) = setup();
        let (a, mut rx_a) = connect(&router).await;
        let (_b, mut rx_b) = connect(&router).await;

        router.handle(a, ClientMessage::create("Alpha")).await;

        let to_a = drain(&mut rx_a);
        assert_eq!(to_a.len(), 2);
        assert_eq!(to_a[0].kind(), "created");
        assert_eq!(to_a[1].kind(), "lobby");

        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].kind(), "lobby");
    }

    #[tokio::test]
    async fn test_join_unknown_session() {
        let (_registry, router) = setup();
        let (conn, mut rx) = connect(&router).await;

        router.handle(conn, ClientMessage::join("missing", "P1")).await;

        assert_eq!(drain(&mut rx), vec![ServerMessage::error(ERR_GAME_NOT_FOUND)]);
        assert_eq!(router.state_of(conn).await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_join_binds_connection() {
        let (registry, router) = setup();
        let (conn, mut rx) = connect(&router).await;
        let session_id = create(&router, conn, &mut rx).await;

        let player_id = join(&router, conn, &mut rx, &session_id, "P1").await;

        assert_eq!(
            router.state_of(conn).await,
            ConnectionState::Joined { session_id: session_id.clone(), player_id: player_id.clone() }
        );
        let session = registry.get(&session_id).await.unwrap();
        assert_eq!(session.snapshot().await.player(&player_id).unwrap().name, "P1");
        assert_eq!(router.members_of(&session_id).await.len(), 1);

        // second join keeps the first binding
        router.handle(conn, ClientMessage::join(&session_id, "again")).await;
        assert_eq!(drain(&mut rx), vec![ServerMessage::error(ERR_ALREADY_JOINED)]);
        assert_eq!(session.player_count().await, 1);
    }

    #[tokio::test]
    async fn test_input_only_for_own_binding() {
        let (registry, router) = setup();
        let (a, mut rx_a) = connect(&router).await;
        let (b, mut rx_b) = connect(&router).await;
        let session_id = create(&router, a, &mut rx_a).await;
        let p1 = join(&router, a, &mut rx_a, &session_id, "P1").await;
        drain(&mut rx_b);
        let p2 = join(&router, b, &mut rx_b, &session_id, "P2").await;

        // b tries to move a's player
        router.handle(b, ClientMessage::input(&session_id, &p1, InputPatch::with_position(9.0, 9.0))).await;
        // a moves itself
        router.handle(a, ClientMessage::input(&session_id, &p1, InputPatch::with_position(5.0, 5.0))).await;

        let snapshot = registry.get(&session_id).await.unwrap().snapshot().await;
        assert_eq!(snapshot.player(&p1).unwrap().position(), (5.0, 5.0));
        assert_eq!(snapshot.player(&p2).unwrap().position(), (0.0, 0.0));
        assert_eq!(snapshot.player(&p2).unwrap().hp, 100);

        // input never gets a reply
        drain(&mut rx_a);
        router.handle(a, ClientMessage::input(&session_id, &p1, InputPatch::default())).await;
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_input_before_join_dropped() {
        let (registry, router) = setup();
        let (conn, mut rx) = connect(&router).await;
        let session_id = registry.create("Alpha").await;

        router.handle(conn, ClientMessage::input(&session_id, "p1", InputPatch::with_position(1.0, 1.0))).await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.get(&session_id).await.unwrap().player_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_frames_get_no_reply() {
        let (_registry, router) = setup();
        let (conn, mut rx) = connect(&router).await;

        router.handle_text(conn, "{not json").await;
        router.handle_text(conn, r#"{"type":"fly"}"#).await;
        router.handle_bytes(conn, &[0xc3, 0x28]).await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(router.state_of(conn).await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_deletes_session_when_last_player_leaves() {
        let (registry, router) = setup();
        let (a, mut rx_a) = connect(&router).await;
        let (b, mut rx_b) = connect(&router).await;
        let (watcher, mut rx_w) = connect(&router).await;

        let session_id = create(&router, a, &mut rx_a).await;
        join(&router, a, &mut rx_a, &session_id, "P1").await;
        drain(&mut rx_b);
        join(&router, b, &mut rx_b, &session_id, "P2").await;
        drain(&mut rx_w);

        router.disconnect(a).await;
        let session = registry.get(&session_id).await.unwrap();
        assert_eq!(session.player_count().await, 1);
        assert_eq!(router.state_of(a).await, ConnectionState::Disconnected);

        router.disconnect(b).await;
        assert!(registry.get(&session_id).await.is_err());
        assert_eq!(registry.session_count().await, 0);

        // the watcher saw both lobby updates, the last one empty
        let updates = drain(&mut rx_w);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1], ServerMessage::Lobby { games: vec![] });
        assert_eq!(router.connection_count().await, 1);
        let _ = watcher;
    }

    #[tokio::test]
    async fn test_disconnect_without_join_keeps_fresh_session() {
        let (registry, router) = setup();
        let (a, mut rx_a) = connect(&router).await;
        let session_id = create(&router, a, &mut rx_a).await;

        router.disconnect(a).await;

        assert!(registry.get(&session_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_leave_returns_to_connected() {
        let (registry, router) = setup();
        let (a, mut rx_a) = connect(&router).await;
        let session_id = create(&router, a, &mut rx_a).await;
        join(&router, a, &mut rx_a, &session_id, "P1").await;

        router.handle(a, ClientMessage::Leave).await;

        assert_eq!(router.state_of(a).await, ConnectionState::Connected);
        assert!(registry.get(&session_id).await.is_err());
        assert_eq!(drain(&mut rx_a), vec![ServerMessage::Lobby { games: vec![] }]);

        // joining a deleted session is refused
        router.handle(a, ClientMessage::join(&session_id, "P1")).await;
        assert_eq!(drain(&mut rx_a), vec![ServerMessage::error(ERR_GAME_NOT_FOUND)]);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (_registry, router) = setup();
        let (conn, mut rx) = connect(&router).await;

        router.handle(conn, ClientMessage::Ping { timestamp: 42 }).await;

        match drain(&mut rx).as_slice() {
            [ServerMessage::Pong { timestamp, server_time }] => {
                assert_eq!(*timestamp, 42);
                assert!(*server_time > 0);
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_lobby_broadcast() {
        let (_registry, router) = setup();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let slow = router.register(slow_tx).await;
        let (fast, mut rx_fast) = connect(&router).await;

        // fill the slow queue
        router.broadcast_lobby().await;
        router.broadcast_lobby().await;
        router.broadcast_lobby().await;

        assert_eq!(drain(&mut rx_fast).len(), 3);
        assert_eq!(router.state_of(slow).await, ConnectionState::Connected);
        let _ = fast;
    }
}
