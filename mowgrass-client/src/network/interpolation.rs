//! Snapshot interpolation
//!
//! Keeps the last few received snapshots with their receipt time and
//! blends the two newest for a render time. Only positions are blended;
//! every other field is taken whole from one sample.

use std::collections::VecDeque;

use mowgrass::game::state::{PlayerMap, PlayerState};

/// Default number of snapshots kept.
pub const DEFAULT_HISTORY: usize = 32;

/// Bounded history of `(receipt time, snapshot)` pairs.
#[derive(Debug, Clone)]
pub struct Interpolator {
    history: VecDeque<(f64, PlayerMap)>,
    capacity: usize,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl Interpolator {
    /// Create with room for `capacity` snapshots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a snapshot received at `time` (seconds), evicting the oldest
    /// when full.
    pub fn push(&mut self, time: f64, snapshot: PlayerMap) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back((time, snapshot));
    }

    /// Most recent snapshot.
    pub fn latest(&self) -> Option<&PlayerMap> {
        self.history.back().map(|(_, snapshot)| snapshot)
    }

    /// Snapshots held.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// True before the first push or after `clear`.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Maximum snapshots held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget everything (e.g. after switching sessions).
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Snapshot for `render_time`, blended from the two newest samples.
    ///
    /// `alpha` is clamped to `[0, 1]`, so times before the older sample give
    /// its records and times after the newer one give the newer records.
    /// A player found in only one of the two samples is returned as-is.
    ///
    /// At `alpha == 0` a player in both samples gets the older record whole,
    /// `hp` and `max_hp` included, so sampling at the older receipt time
    /// reproduces that snapshot exactly. For any larger alpha every field but
    /// `x` and `y` comes from the newer sample.
    pub fn sample(&self, render_time: f64) -> PlayerMap {
        let n = self.history.len();
        if n < 2 {
            return self.latest().cloned().unwrap_or_default();
        }

        let (t1, s1) = &self.history[n - 2];
        let (t2, s2) = &self.history[n - 1];
        if t2 <= t1 {
            return s2.clone();
        }

        let alpha = (render_time - t1) / (t2 - t1);
        let alpha = if alpha.is_nan() { 1.0 } else { alpha.clamp(0.0, 1.0) };

        let mut out = PlayerMap::new();
        for (id, p2) in s2 {
            let record = match s1.get(id) {
                Some(p1) => blend(p1, p2, alpha),
                None => p2.clone(),
            };
            out.insert(id.clone(), record);
        }
        for (id, p1) in s1 {
            if !s2.contains_key(id) {
                out.insert(id.clone(), p1.clone());
            }
        }
        out
    }
}

/// Position blended by `alpha`; everything else from the sample `alpha`
/// sits on, or from the newer one in between.
fn blend(p1: &PlayerState, p2: &PlayerState, alpha: f64) -> PlayerState {
    if alpha <= 0.0 {
        return p1.clone();
    }
    if alpha >= 1.0 {
        return p2.clone();
    }

    let mut out = p2.clone();
    out.x = p1.x * (1.0 - alpha) + p2.x * alpha;
    out.y = p1.y * (1.0 - alpha) + p2.y * alpha;
    out
}
