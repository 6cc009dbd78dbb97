//! WebSocket network actor
//!
//! Owns one connection to the game server on a dedicated worker thread.
//! Callers enqueue commands and poll fields; nothing here blocks the caller
//! except `stop()`, which joins the worker.
//!
//! While connected, an outbound loop drains the command queue onto the socket
//! and an inbound loop dispatches server messages into shared fields. Either
//! loop ending drops the connection and hands control back to the retry
//! policy.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use mowgrass::game::state::{InputPatch, PlayerId, PlayerMap};
use mowgrass::network::protocol::{ClientMessage, LobbyEntry, ProtocolError, ServerMessage};
use mowgrass::network::session::SessionId;

use super::interpolation::{Interpolator, DEFAULT_HISTORY};
use super::retry::{ConnectionMachine, ConnectionPhase, RetryPolicy};

type WsError = tokio_tungstenite::tungstenite::Error;

/// Default server URL.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8765";

// =============================================================================
// CONFIG / ERRORS
// =============================================================================

/// Network actor configuration.
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Server URL.
    pub url: String,
    /// Connect attempts before giving up (0 = unlimited).
    pub max_retries: u32,
    /// Backoff unit between attempts.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// How often idle loops wake to check for `stop()`.
    pub poll_interval: Duration,
    /// Snapshots kept for interpolation.
    pub history_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            url: DEFAULT_URL.to_string(),
            max_retries: retry.max_retries,
            base_delay: retry.base_delay,
            max_delay: retry.max_delay,
            poll_interval: Duration::from_millis(50),
            history_capacity: DEFAULT_HISTORY,
        }
    }
}

impl ActorConfig {
    /// Defaults, pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the attempt limit (0 = unlimited).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff unit and cap.
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Set the stop-check interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the interpolation history length.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Retry policy described by this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_delay, self.max_delay)
    }
}

/// Network actor errors. Recorded in `last_error`, never returned to callers
/// of the command methods.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// WebSocket transport failure.
    #[error("WebSocket error: {0}")]
    Transport(#[from] WsError),

    /// Server sent something we could not decode.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Command could not be encoded.
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Worker thread or runtime could not be started.
    #[error("Failed to start network worker: {0}")]
    Runtime(#[from] std::io::Error),

    /// Server closed the connection.
    #[error("Connection closed by server")]
    Closed,

    /// Retry policy ran out. Terminal.
    #[error("Gave up after {attempts} connection attempts")]
    ExhaustedRetries {
        /// Attempts made.
        attempts: u32,
    },
}

// =============================================================================
// SHARED STATE
// =============================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Snapshot history plus what it belongs to.
struct History {
    interpolator: Interpolator,
    session_id: Option<SessionId>,
    newest_timestamp: Option<i64>,
}

impl History {
    fn reset_for(&mut self, session_id: &str) {
        if self.session_id.as_deref() != Some(session_id) {
            self.interpolator.clear();
            self.session_id = Some(session_id.to_string());
            self.newest_timestamp = None;
        }
    }

    fn unbind(&mut self) {
        self.interpolator.clear();
        self.session_id = None;
        self.newest_timestamp = None;
    }
}

/// Fields written by the worker and read by the caller. Each one is replaced
/// as a whole value under its own lock.
struct Shared {
    connected: AtomicBool,
    stopping: AtomicBool,
    attempts: AtomicU32,
    phase: Mutex<ConnectionPhase>,
    lobby: Mutex<Vec<LobbyEntry>>,
    latest_snapshot: Mutex<Option<PlayerMap>>,
    session_id: Mutex<Option<SessionId>>,
    player_id: Mutex<Option<PlayerId>>,
    last_created: Mutex<Option<SessionId>>,
    last_error: Mutex<Option<String>>,
    history: Mutex<History>,
}

impl Shared {
    fn new(history_capacity: usize) -> Self {
        Self {
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            phase: Mutex::new(ConnectionPhase::Disconnected),
            lobby: Mutex::new(Vec::new()),
            latest_snapshot: Mutex::new(None),
            session_id: Mutex::new(None),
            player_id: Mutex::new(None),
            last_created: Mutex::new(None),
            last_error: Mutex::new(None),
            history: Mutex::new(History {
                interpolator: Interpolator::new(history_capacity),
                session_id: None,
                newest_timestamp: None,
            }),
        }
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        *lock(&self.phase) = phase;
        self.connected.store(phase == ConnectionPhase::Connected, Ordering::SeqCst);
    }

    /// Forget everything tied to the old connection. The server starts a new
    /// connection unbound, so the caller has to join again.
    fn reset_connection_state(&self) {
        lock(&self.history).unbind();
        *lock(&self.latest_snapshot) = None;
        *lock(&self.session_id) = None;
        *lock(&self.player_id) = None;
        *lock(&self.last_created) = None;
        lock(&self.lobby).clear();
    }

    fn record_error(&self, err: &ClientError) {
        *lock(&self.last_error) = Some(err.to_string());
    }

    /// Apply one server message.
    fn dispatch(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Lobby { games } => {
                *lock(&self.lobby) = games;
            }
            ServerMessage::Created { session_id, name } => {
                info!("Session created: {} ({})", name, session_id);
                *lock(&self.last_created) = Some(session_id);
            }
            ServerMessage::Joined { session_id, player_id } => {
                info!("Joined session {} as {}", session_id, player_id);
                lock(&self.history).reset_for(&session_id);
                *lock(&self.session_id) = Some(session_id);
                *lock(&self.player_id) = Some(player_id);
            }
            ServerMessage::State { session_id, timestamp, snapshot, .. } => {
                {
                    let mut history = lock(&self.history);
                    history.reset_for(&session_id);
                    if let Some(newest) = history.newest_timestamp {
                        if timestamp < newest {
                            debug!("Discarding stale state ({} < {})", timestamp, newest);
                            return;
                        }
                    }
                    history.newest_timestamp = Some(timestamp);
                    history.interpolator.push(now_secs(), snapshot.clone());
                }
                *lock(&self.latest_snapshot) = Some(snapshot);
            }
            ServerMessage::Error { msg } => {
                warn!("Server error: {}", msg);
                *lock(&self.last_error) = Some(msg);
            }
            ServerMessage::Pong { timestamp, server_time } => {
                debug!("Pong: sent={} server={}", timestamp, server_time);
            }
        }
    }

    fn dispatch_text(&self, text: &str) {
        match ServerMessage::from_json(text) {
            Ok(msg) => self.dispatch(msg),
            Err(e) => debug!("Ignoring server frame: {}", e),
        }
    }
}

/// Wall-clock seconds; the time base for receipt stamps and render times.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// =============================================================================
// NETWORK ACTOR
// =============================================================================

/// Client-side owner of one server connection.
pub struct NetworkActor {
    config: ActorConfig,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<ClientMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkActor {
    /// Create an idle actor. Nothing connects until [`NetworkActor::start`].
    pub fn new(config: ActorConfig) -> Self {
        let (outbound, pending) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared::new(config.history_capacity)),
            config,
            outbound,
            pending: Mutex::new(Some(pending)),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker. Later calls do nothing; an actor runs at most once.
    pub fn start(&self) {
        let Some(rx) = lock(&self.pending).take() else {
            debug!("Network actor already started");
            return;
        };

        let config = self.config.clone();
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name("mowgrass-net".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to build network runtime: {}", e);
                        shared.record_error(&ClientError::Runtime(e));
                        shared.set_phase(ConnectionPhase::Exhausted);
                        return;
                    }
                };
                runtime.block_on(run_worker(config, shared, rx));
            });

        match spawned {
            Ok(handle) => *lock(&self.worker) = Some(handle),
            Err(e) => {
                error!("Failed to spawn network thread: {}", e);
                self.shared.record_error(&ClientError::Runtime(e));
                self.shared.set_phase(ConnectionPhase::Exhausted);
            }
        }
    }

    /// Signal the worker and wait for it. Safe to call repeatedly.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);

        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Network thread panicked");
            }
            info!("Network actor stopped");
        }
    }

    // ===== COMMANDS =====

    fn enqueue(&self, msg: ClientMessage) -> bool {
        let kind = msg.kind();
        if self.outbound.send(msg).is_err() {
            debug!("Network worker gone, dropped {}", kind);
            return false;
        }
        true
    }

    /// Queue a partial update for a player. Returns false if the worker is gone.
    pub fn send_input(&self, session_id: impl Into<SessionId>, player_id: impl Into<PlayerId>, input: InputPatch) -> bool {
        self.enqueue(ClientMessage::input(session_id, player_id, input))
    }

    /// Queue a lobby request.
    pub fn request_lobby(&self) -> bool {
        self.enqueue(ClientMessage::List)
    }

    /// Queue a create-session request.
    pub fn create_game(&self, name: impl Into<String>) -> bool {
        self.enqueue(ClientMessage::create(name))
    }

    /// Queue a join request.
    pub fn join_game(&self, session_id: impl Into<SessionId>, player_name: impl Into<String>) -> bool {
        self.enqueue(ClientMessage::join(session_id, player_name))
    }

    /// Queue a leave request.
    pub fn leave_game(&self) -> bool {
        self.enqueue(ClientMessage::Leave)
    }

    // ===== STATE =====

    /// Interpolated player records for `render_time` (seconds, same clock as
    /// [`now_secs`]).
    pub fn get_interpolated_snapshot(&self, render_time: f64) -> PlayerMap {
        lock(&self.shared.history).interpolator.sample(render_time)
    }

    /// Transport is up.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Bound to a session (ids received).
    pub fn is_joined(&self) -> bool {
        lock(&self.shared.player_id).is_some()
    }

    /// Current connection phase.
    pub fn phase(&self) -> ConnectionPhase {
        *lock(&self.shared.phase)
    }

    /// Connect attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Games from the most recent `lobby` push.
    pub fn latest_lobby(&self) -> Vec<LobbyEntry> {
        lock(&self.shared.lobby).clone()
    }

    /// Newest accepted snapshot, uninterpolated.
    pub fn latest_snapshot(&self) -> Option<PlayerMap> {
        lock(&self.shared.latest_snapshot).clone()
    }

    /// Session this actor is joined to.
    pub fn session_id(&self) -> Option<SessionId> {
        lock(&self.shared.session_id).clone()
    }

    /// Player id assigned by the last `joined` reply.
    pub fn player_id(&self) -> Option<PlayerId> {
        lock(&self.shared.player_id).clone()
    }

    /// Id from the most recent `created` reply.
    pub fn last_created(&self) -> Option<SessionId> {
        lock(&self.shared.last_created).clone()
    }

    /// Most recent error, from the server or the transport.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Configuration this actor was built with.
    pub fn config(&self) -> &ActorConfig {
        &self.config
    }
}

impl Drop for NetworkActor {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// WORKER
// =============================================================================

async fn run_worker(
    config: ActorConfig,
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    let mut machine = ConnectionMachine::new(config.retry_policy());

    while !shared.stopping() {
        let Some(attempt) = machine.begin_attempt() else {
            break;
        };
        shared.attempts.fetch_add(1, Ordering::SeqCst);
        shared.set_phase(ConnectionPhase::Connecting);
        info!("Connecting to {} (attempt {})", config.url, attempt);

        let connected = tokio::select! {
            result = connect_async(config.url.as_str()) => result,
            _ = wait_for_stop(&shared, config.poll_interval) => break,
        };

        let pause = match connected {
            Ok((ws, _)) => {
                machine.on_connected();
                shared.set_phase(ConnectionPhase::Connected);
                info!("Connected to {}", config.url);

                let (mut sink, mut stream) = ws.split();
                let result = tokio::select! {
                    r = pump_outbound(&mut sink, &mut rx, &shared, config.poll_interval) => r,
                    r = pump_inbound(&mut stream, &shared, config.poll_interval) => r,
                };

                shared.set_phase(ConnectionPhase::Disconnected);
                shared.reset_connection_state();
                if shared.stopping() {
                    break;
                }
                match result {
                    Ok(()) => info!("Connection closed"),
                    Err(e) => {
                        warn!("Connection lost: {}", e);
                        shared.record_error(&e);
                    }
                }
                machine.on_disconnect()
            }
            Err(e) => {
                let err = ClientError::from(e);
                warn!("Connection attempt {} failed: {}", attempt, err);
                shared.record_error(&err);

                match machine.on_failure() {
                    Some(delay) => {
                        shared.set_phase(ConnectionPhase::Disconnected);
                        delay
                    }
                    None => {
                        let exhausted = ClientError::ExhaustedRetries { attempts: attempt };
                        error!("{}", exhausted);
                        shared.record_error(&exhausted);
                        shared.set_phase(ConnectionPhase::Exhausted);
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = wait_for_stop(&shared, config.poll_interval) => break,
        }
    }

    if machine.phase() != ConnectionPhase::Exhausted {
        shared.set_phase(ConnectionPhase::Disconnected);
    }
}

/// Resolves once `stop()` has been called, checking every `poll`.
async fn wait_for_stop(shared: &Shared, poll: Duration) {
    while !shared.stopping() {
        tokio::time::sleep(poll).await;
    }
}

/// Drain queued commands onto the socket. Sends `list` first.
async fn pump_outbound<S>(
    sink: &mut S,
    rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shared: &Shared,
    poll: Duration,
) -> Result<(), ClientError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Text(ClientMessage::List.to_json()?)).await?;

    loop {
        if shared.stopping() {
            let _ = sink.close().await;
            return Ok(());
        }
        match timeout(poll, rx.recv()).await {
            Ok(Some(msg)) => {
                sink.send(Message::Text(msg.to_json()?)).await?;
            }
            // actor dropped
            Ok(None) => return Ok(()),
            Err(_) => {}
        }
    }
}

/// Read server frames and apply them to the shared fields.
async fn pump_inbound<S>(stream: &mut S, shared: &Shared, poll: Duration) -> Result<(), ClientError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let frame = match timeout(poll, stream.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                if shared.stopping() {
                    return Ok(());
                }
                continue;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => shared.dispatch_text(&text),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => shared.dispatch_text(text),
                Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
            Some(Err(e)) => return Err(e.into()),
            _ => {}
        }
    }
}
