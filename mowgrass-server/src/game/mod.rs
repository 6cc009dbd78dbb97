//! Game State Module
//!
//! Data held by a session and the hook that advances it.
//!
//! ## Module Structure
//!
//! - `state`: Player records, input patches, snapshots
//! - `tick`: Injected world-advance hook

pub mod state;
pub mod tick;

// Re-export key types
pub use state::{PlayerState, PlayerId, PlayerMap, InputPatch, Snapshot, Equipment};
pub use tick::{Simulation, NoopSimulation};
