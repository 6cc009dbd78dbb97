//! Network Layer
//!
//! WebSocket server, lobby and session bookkeeping.
//! Game rules stay out of this layer; they plug in through `game::tick`.

pub mod protocol;
pub mod session;
pub mod router;
pub mod broadcaster;
pub mod server;

pub use protocol::{ClientMessage, ServerMessage, LobbyEntry, ProtocolError};
pub use session::{Session, SessionId, SessionRegistry, SessionError};
pub use router::{ConnectionRouter, ConnectionState, ConnectionId};
pub use broadcaster::{Broadcaster, BroadcastStats};
pub use server::{GameServer, ServerConfig, GameServerError};
