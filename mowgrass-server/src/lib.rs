//! # MowGrass Sync Server
//!
//! Authoritative multiplayer synchronization for MowGrass.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     MOWGRASS SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/            - Session data                             │
//! │  ├── state.rs     - Player records, input patches, snapshots │
//! │  └── tick.rs      - Injected simulation hook                 │
//! │                                                              │
//! │  network/         - Networking                               │
//! │  ├── protocol.rs  - Tagged wire messages                     │
//! │  ├── session.rs   - Session and session registry             │
//! │  ├── router.rs    - Per-connection state machine             │
//! │  ├── broadcaster.rs - Fixed-period state push                │
//! │  └── server.rs    - WebSocket accept loop                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! client command -> `ConnectionRouter` -> `Session` mutation ->
//! `Broadcaster` snapshot -> every connection joined to the session.
//!
//! The client crate reuses [`network::protocol`] and [`game::state`] so both
//! ends decode the same messages.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::state::{PlayerState, PlayerId, PlayerMap, InputPatch, Snapshot};
pub use game::tick::{Simulation, NoopSimulation};
pub use network::protocol::{ClientMessage, ServerMessage, LobbyEntry};
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
