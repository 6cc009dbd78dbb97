//! State Broadcaster
//!
//! Fixed-period loop: every cycle, tick each session, snapshot it and push
//! a `state` message to the connections joined to it.
//!
//! The session list is copied out of the registry before the cycle starts,
//! so a slow cycle never holds up `create` or `join`. Sends are non-blocking
//! per connection; one full or dead queue costs that connection one message
//! and nothing else.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::network::protocol::ServerMessage;
use crate::network::router::{push, ConnectionRouter};
use crate::network::session::SessionRegistry;

/// Default broadcast period.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(50);

/// Outcome of one broadcast cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Sessions ticked.
    pub sessions: usize,
    /// `state` messages queued.
    pub delivered: usize,
    /// `state` messages dropped (full or closed queue).
    pub dropped: usize,
}

/// Pushes session snapshots to member connections.
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    router: Arc<ConnectionRouter>,
    period: Duration,
}

impl Broadcaster {
    /// Create a broadcaster running every `period`.
    pub fn new(registry: Arc<SessionRegistry>, router: Arc<ConnectionRouter>, period: Duration) -> Self {
        Self { registry, router, period }
    }

    /// Broadcast period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run until `shutdown` fires (or its sender is dropped).
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Broadcaster running every {:?}", self.period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Broadcaster stopped");
                    break;
                }
            }
        }
    }

    /// One cycle over every live session.
    pub async fn tick_once(&self) -> BroadcastStats {
        let sessions = self.registry.sessions().await;
        let mut stats = BroadcastStats {
            sessions: sessions.len(),
            ..Default::default()
        };
        let mut summary = Vec::with_capacity(sessions.len());

        for session in sessions {
            session.tick().await;
            let snapshot = session.snapshot().await;
            summary.push(format!(
                "{}:{}p",
                session.id.get(..6).unwrap_or(session.id.as_str()),
                snapshot.player_count()
            ));

            let members = self.router.members_of(&session.id).await;
            if members.is_empty() {
                continue;
            }

            let msg = ServerMessage::state(session.id.clone(), snapshot);
            for (conn, sender) in members {
                if push(conn, &sender, msg.clone()) {
                    stats.delivered += 1;
                } else {
                    stats.dropped += 1;
                }
            }
        }

        if !summary.is_empty() {
            debug!("Broadcast: {}", summary.join(" "));
        }

        stats
    }
}
