//! Player State Definitions
//!
//! Per-player records held by a session, the partial input patch merged into
//! them, and the immutable snapshot pushed to clients.
//! Uses BTreeMap so serialized snapshots have a stable key order.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Unique player identifier (UUID string assigned on join).
pub type PlayerId = String;

/// Players of one session keyed by id.
pub type PlayerMap = BTreeMap<PlayerId, PlayerState>;

/// Free-form equipment slots (slot name -> arbitrary JSON value).
pub type Equipment = BTreeMap<String, serde_json::Value>;

/// Health a player spawns with.
pub const DEFAULT_HP: i64 = 100;

fn default_hp() -> i64 {
    DEFAULT_HP
}

// =============================================================================
// PLAYER STATE
// =============================================================================

/// State of a single player in a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Unique player ID
    pub id: PlayerId,

    /// Display name chosen on join
    pub name: String,

    /// World position
    #[serde(default)]
    pub x: f64,
    /// World position
    #[serde(default)]
    pub y: f64,

    /// Current health
    #[serde(default = "default_hp")]
    pub hp: i64,
    /// Maximum health
    #[serde(default = "default_hp")]
    pub max_hp: i64,

    /// Accumulated score
    #[serde(default)]
    pub score: i64,

    /// Equipped items
    #[serde(default)]
    pub equipment: Equipment,
}

impl PlayerState {
    /// Create a player at the origin with full health and no equipment.
    pub fn new(id: impl Into<PlayerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            x: 0.0,
            y: 0.0,
            hp: DEFAULT_HP,
            max_hp: DEFAULT_HP,
            score: 0,
            equipment: Equipment::new(),
        }
    }

    /// Merge a partial update into this record.
    ///
    /// Only fields present in `patch` are overwritten. Equipment is merged
    /// slot by slot; slots absent from the patch keep their value.
    pub fn apply(&mut self, patch: &InputPatch) {
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(hp) = patch.hp {
            self.hp = hp;
        }
        if let Some(score) = patch.score {
            self.score = score;
        }
        if let Some(ref equipment) = patch.equipment {
            for (slot, value) in equipment {
                self.equipment.insert(slot.clone(), value.clone());
            }
        }
    }

    /// Position as a tuple.
    #[inline]
    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }
}

// =============================================================================
// INPUT PATCH
// =============================================================================

/// Partial player update carried by an `input` message.
///
/// Absent keys deserialize to `None` and leave the stored value untouched.
/// Unknown keys are ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputPatch {
    /// New x position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// New y position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// New health
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hp: Option<i64>,
    /// New score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    /// Slots to overwrite; others are kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<Equipment>,
}

impl InputPatch {
    /// Patch that only moves the player.
    pub fn with_position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Default::default()
        }
    }

    /// True if applying this patch would change nothing.
    pub fn is_empty(&self) -> bool {
        self.x.is_none()
            && self.y.is_none()
            && self.hp.is_none()
            && self.score.is_none()
            && self.equipment.is_none()
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Immutable copy of a session's players at one instant.
///
/// Produced by `Session::snapshot` and never mutated afterwards; fields are
/// only reachable through accessors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    tick: u64,
    captured_at: i64,
    players: PlayerMap,
}

impl Snapshot {
    /// Wrap an already-copied player map.
    pub fn new(tick: u64, captured_at: i64, players: PlayerMap) -> Self {
        Self { tick, captured_at, players }
    }

    /// Session tick the snapshot was taken on.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Capture time in unix milliseconds.
    pub fn captured_at(&self) -> i64 {
        self.captured_at
    }

    /// Player records.
    pub fn players(&self) -> &PlayerMap {
        &self.players
    }

    /// Look up one player.
    pub fn player(&self, id: &str) -> Option<&PlayerState> {
        self.players.get(id)
    }

    /// Number of players captured.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Consume the snapshot, keeping only the player map.
    pub fn into_players(self) -> PlayerMap {
        self.players
    }
}
