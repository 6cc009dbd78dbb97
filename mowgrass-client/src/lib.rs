//! MowGrass network client
//!
//! Background network actor for the game client: connection lifecycle with
//! bounded retry, a fire-and-forget command queue, and interpolated
//! snapshots for rendering.
//!
//! ```no_run
//! use mowgrass_client::network::{ActorConfig, NetworkActor, now_secs};
//!
//! let actor = NetworkActor::new(ActorConfig::new("ws://127.0.0.1:8765"));
//! actor.start();
//! actor.create_game("Alpha");
//! // every frame:
//! let players = actor.get_interpolated_snapshot(now_secs() - 0.1);
//! # let _ = players;
//! actor.stop();
//! ```

#![deny(unsafe_code)]

pub mod network;

pub use network::{ActorConfig, NetworkActor};
