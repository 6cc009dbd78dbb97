//! Simulation Tick
//!
//! World-advance hook run by the broadcaster once per cycle, before each
//! session's snapshot is taken. Game rules (AI, collisions, scoring) live
//! outside this crate and plug in through [`Simulation`].

use chrono::{DateTime, Utc};

use crate::game::state::PlayerMap;

/// Pluggable world-advance callback.
///
/// Called with the session lock held, so implementations must not block and
/// must not call back into the session.
pub trait Simulation: Send + Sync {
    /// Advance the world of one session.
    ///
    /// # Arguments
    ///
    /// * `players` - The session's player records (may be mutated)
    /// * `now` - Tick time
    fn advance(&self, players: &mut PlayerMap, now: DateTime<Utc>);
}

/// Simulation that leaves the world untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSimulation;

impl Simulation for NoopSimulation {
    fn advance(&self, _players: &mut PlayerMap, _now: DateTime<Utc>) {}
}

impl<F> Simulation for F
where
    F: Fn(&mut PlayerMap, DateTime<Utc>) + Send + Sync,
{
    fn advance(&self, players: &mut PlayerMap, now: DateTime<Utc>) {
        self(players, now)
    }
}
