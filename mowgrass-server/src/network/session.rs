//! Session Management
//!
//! A session is the authoritative state of one match: its player records,
//! the last tick time and whether anyone ever joined. Each session guards
//! its state with its own lock; the registry guards the id -> session map
//! with a separate one.
//!
//! Lock order is always registry -> session. Nothing holds a session lock
//! while waiting on the registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::game::state::{InputPatch, PlayerId, PlayerMap, PlayerState, Snapshot};
use crate::game::tick::{NoopSimulation, Simulation};
use crate::network::protocol::LobbyEntry;

/// Unique session identifier (UUID string).
pub type SessionId = String;

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session with this id.
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// Session was deleted while the caller still held it.
    #[error("Session closed")]
    Closed,
}

/// Mutable part of a session, behind the session lock.
struct SessionState {
    players: PlayerMap,
    last_tick: DateTime<Utc>,
    ever_had_players: bool,
    closed: bool,
    tick: u64,
    last_captured_at: i64,
}

/// A match session.
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Display name.
    pub name: String,
    /// When session was created.
    created_at: DateTime<Utc>,
    /// Creation order within the registry.
    seq: u64,
    state: Mutex<SessionState>,
    simulation: Arc<dyn Simulation>,
}

impl Session {
    /// Create a new, empty session.
    pub fn new(id: SessionId, name: impl Into<String>, simulation: Arc<dyn Simulation>) -> Self {
        Self::with_seq(id, name, simulation, 0)
    }

    fn with_seq(
        id: SessionId,
        name: impl Into<String>,
        simulation: Arc<dyn Simulation>,
        seq: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            created_at: now,
            seq,
            state: Mutex::new(SessionState {
                players: PlayerMap::new(),
                last_tick: now,
                ever_had_players: false,
                closed: false,
                tick: 0,
                last_captured_at: 0,
            }),
            simulation,
        }
    }

    /// Add a player at the default spawn.
    ///
    /// An id already present is overwritten with a fresh record.
    pub async fn add_player(
        &self,
        player_id: impl Into<PlayerId>,
        name: impl Into<String>,
    ) -> Result<PlayerState, SessionError> {
        let player = PlayerState::new(player_id, name);

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::Closed);
        }
        if state.players.insert(player.id.clone(), player.clone()).is_some() {
            debug!("Player {} rejoined session {}, record reset", player.id, self.id);
        }
        state.ever_had_players = true;

        Ok(player)
    }

    /// Remove a player. Returns false if it was not present.
    pub async fn remove_player(&self, player_id: &str) -> bool {
        let mut state = self.state.lock().await;
        state.players.remove(player_id).is_some()
    }

    /// Merge a partial update into a player's record.
    ///
    /// Input for a player that is not in the session is dropped and
    /// returns false.
    pub async fn apply_input(&self, player_id: &str, patch: &InputPatch) -> bool {
        let mut state = self.state.lock().await;
        match state.players.get_mut(player_id) {
            Some(player) => {
                player.apply(patch);
                true
            }
            None => false,
        }
    }

    /// Deep copy of the player map, tagged with the current tick and a
    /// capture time that never goes backwards for this session.
    pub async fn snapshot(&self) -> Snapshot {
        let mut state = self.state.lock().await;
        let captured_at = Utc::now().timestamp_millis().max(state.last_captured_at);
        state.last_captured_at = captured_at;
        Snapshot::new(state.tick, captured_at, state.players.clone())
    }

    /// Advance the session: stamp the tick time and run the simulation hook.
    pub async fn tick(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.last_tick = now;
        state.tick += 1;
        self.simulation.advance(&mut state.players, now);
    }

    /// Get player count.
    pub async fn player_count(&self) -> usize {
        self.state.lock().await.players.len()
    }

    /// Whether anyone ever joined.
    pub async fn ever_had_players(&self) -> bool {
        self.state.lock().await.ever_had_players
    }

    /// Deletion rule: someone joined at some point and nobody is left.
    pub async fn is_abandoned(&self) -> bool {
        let state = self.state.lock().await;
        Self::abandoned(&state)
    }

    fn abandoned(state: &SessionState) -> bool {
        state.ever_had_players && state.players.is_empty()
    }

    /// Time of the last tick (creation time before the first one).
    pub async fn last_tick(&self) -> DateTime<Utc> {
        self.state.lock().await.last_tick
    }

    /// Get current tick.
    pub async fn current_tick(&self) -> u64 {
        self.state.lock().await.tick
    }

    /// When the session was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the registry has deleted this session.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}

// =============================================================================
// SESSION REGISTRY
// =============================================================================

/// Process-wide map of live sessions.
pub struct SessionRegistry {
    /// Active sessions.
    sessions: RwLock<BTreeMap<SessionId, Arc<Session>>>,
    /// Hook handed to every new session.
    simulation: Arc<dyn Simulation>,
    next_seq: AtomicU64,
}

impl SessionRegistry {
    /// Create a registry whose sessions use the no-op simulation.
    pub fn new() -> Self {
        Self::with_simulation(Arc::new(NoopSimulation))
    }

    /// Create a registry whose sessions advance with `simulation`.
    pub fn with_simulation(simulation: Arc<dyn Simulation>) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            simulation,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Create a new session and return its id.
    pub async fn create(&self, name: impl Into<String>) -> SessionId {
        let id = uuid::Uuid::new_v4().to_string();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let session = Session::with_seq(id.clone(), name, self.simulation.clone(), seq);

        info!("Session created: id={} name={}", id, session.name);

        let mut sessions = self.sessions.write().await;
        sessions.insert(id.clone(), Arc::new(session));

        id
    }

    /// Lobby listing in creation order.
    pub async fn list(&self) -> Vec<LobbyEntry> {
        let sessions = self.sessions().await;

        let mut entries = Vec::with_capacity(sessions.len());
        for session in sessions {
            entries.push(LobbyEntry {
                id: session.id.clone(),
                name: session.name.clone(),
                players: session.player_count().await,
            });
        }
        entries
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Copy of the current session list, in creation order.
    ///
    /// The registry lock is released before this returns.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        let mut list: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };
        list.sort_by_key(|s| s.seq);
        list
    }

    /// Remove a session unconditionally. Returns false if it was unknown.
    ///
    /// Callers are expected to have checked the deletion rule; see
    /// [`SessionRegistry::delete_if_abandoned`] for the checked variant.
    pub async fn delete(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.remove(id) else {
            return false;
        };

        // closed before the registry lock goes, same as delete_if_abandoned
        session.close().await;
        drop(sessions);

        info!("Session removed: id={}", id);
        true
    }

    /// Delete the session if it had players and is now empty.
    ///
    /// The check and the removal happen under the registry lock, so a join
    /// cannot slip in between them unnoticed: a racing join sees the
    /// session closed and is refused.
    pub async fn delete_if_abandoned(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;

        let Some(session) = sessions.get(id).cloned() else {
            return false;
        };

        let mut state = session.state.lock().await;
        if !Session::abandoned(&state) {
            return false;
        }
        state.closed = true;
        drop(state);

        sessions.remove(id);
        info!("Session removed (empty): id={}", id);
        true
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
