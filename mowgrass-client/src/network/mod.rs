//! Network module - WebSocket connection to game server
//!
//! - `retry`: backoff policy and connect state machine
//! - `interpolation`: render-time snapshot blending
//! - `client`: the network actor tying both to a live socket

pub mod retry;
pub mod interpolation;
pub mod client;

pub use retry::{RetryPolicy, ConnectionPhase, ConnectionMachine};
pub use interpolation::Interpolator;
pub use client::{NetworkActor, ActorConfig, ClientError, now_secs};
