//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is one JSON object tagged by a `"type"` field and decoded
//! into a sum type at the boundary; handlers never look at raw JSON.
//!
//! The older `game_id` spelling is accepted wherever `session_id` is read.

use serde::{Serialize, Deserialize};

use crate::game::state::{InputPatch, PlayerId, PlayerMap, Snapshot};
use crate::network::session::SessionId;

fn default_game_name() -> String {
    "Game".to_string()
}

fn default_player_name() -> String {
    "Player".to_string()
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request the current lobby.
    List,

    /// Create a new session.
    Create {
        #[serde(default = "default_game_name")]
        name: String,
    },

    /// Join an existing session.
    Join {
        #[serde(alias = "game_id")]
        session_id: SessionId,
        #[serde(default = "default_player_name")]
        player_name: String,
    },

    /// Partial state update for the sender's own player.
    Input {
        #[serde(alias = "game_id")]
        session_id: SessionId,
        player_id: PlayerId,
        #[serde(default)]
        input: InputPatch,
    },

    /// Leave the current session but keep the connection.
    Leave,

    /// Ping for latency measurement.
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}

impl ClientMessage {
    /// Create-session request.
    pub fn create(name: impl Into<String>) -> Self {
        Self::Create { name: name.into() }
    }

    /// Join request.
    pub fn join(session_id: impl Into<SessionId>, player_name: impl Into<String>) -> Self {
        Self::Join {
            session_id: session_id.into(),
            player_name: player_name.into(),
        }
    }

    /// Input for a bound player.
    pub fn input(
        session_id: impl Into<SessionId>,
        player_id: impl Into<PlayerId>,
        input: InputPatch,
    ) -> Self {
        Self::Input {
            session_id: session_id.into(),
            player_id: player_id.into(),
            input,
        }
    }

    /// Message kind, as written in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Create { .. } => "create",
            Self::Join { .. } => "join",
            Self::Input { .. } => "input",
            Self::Leave => "leave",
            Self::Ping { .. } => "ping",
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// One row of the lobby listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyEntry {
    /// Session identifier.
    pub id: SessionId,
    /// Session display name.
    pub name: String,
    /// Players currently in the session.
    pub players: usize,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Lobby listing (reply to `list`, and pushed on every lobby change).
    Lobby { games: Vec<LobbyEntry> },

    /// Session created.
    Created {
        #[serde(alias = "game_id")]
        session_id: SessionId,
        name: String,
    },

    /// Join accepted.
    Joined {
        #[serde(alias = "game_id")]
        session_id: SessionId,
        player_id: PlayerId,
    },

    /// Periodic session state.
    State {
        #[serde(alias = "game_id")]
        session_id: SessionId,
        /// Per-session tick counter.
        #[serde(default)]
        tick: u64,
        /// Capture time (unix ms), monotonic per session.
        #[serde(default)]
        timestamp: i64,
        snapshot: PlayerMap,
    },

    /// Request refused.
    Error { msg: String },

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },
}

impl ServerMessage {
    /// State push for one session.
    pub fn state(session_id: impl Into<SessionId>, snapshot: Snapshot) -> Self {
        Self::State {
            session_id: session_id.into(),
            tick: snapshot.tick(),
            timestamp: snapshot.captured_at(),
            snapshot: snapshot.into_players(),
        }
    }

    /// Error reply.
    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error { msg: msg.into() }
    }

    /// Message kind, as written in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Lobby { .. } => "lobby",
            Self::Created { .. } => "created",
            Self::Joined { .. } => "joined",
            Self::State { .. } => "state",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Frame could not be decoded. The frame is dropped; the connection stays up.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not valid JSON, unknown `type`, or a field of the wrong type.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Binary frame that is not UTF-8 text.
    #[error("Binary frame is not UTF-8")]
    NotUtf8,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Deserialize JSON carried in a binary frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
        Self::from_json(text)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::PlayerState;

    #[test]
    fn test_client_message_tags() {
        assert_eq!(
            ClientMessage::from_json(r#"{"type":"list"}"#).unwrap(),
            ClientMessage::List
        );

        let json = ClientMessage::create("Alpha").to_json().unwrap();
        assert!(json.contains(r#""type":"create""#));
        assert!(json.contains(r#""name":"Alpha""#));
    }

    #[test]
    fn test_defaults_for_missing_names() {
        let create = ClientMessage::from_json(r#"{"type":"create"}"#).unwrap();
        assert_eq!(create, ClientMessage::create("Game"));

        let join = ClientMessage::from_json(r#"{"type":"join","session_id":"s1"}"#).unwrap();
        assert_eq!(join, ClientMessage::join("s1", "Player"));
    }

    #[test]
    fn test_game_id_alias_accepted() {
        let msg = ClientMessage::from_json(
            r#"{"type":"input","game_id":"g1","player_id":"p1","input":{"x":5,"y":5}}"#,
        )
        .unwrap();

        match msg {
            ClientMessage::Input { session_id, player_id, input } => {
                assert_eq!(session_id, "g1");
                assert_eq!(player_id, "p1");
                assert_eq!(input.x, Some(5.0));
                assert_eq!(input.y, Some(5.0));
                assert!(input.hp.is_none());
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(
            ClientMessage::from_json("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"name":"no tag"}"#).is_err());
        assert!(ClientMessage::from_json(
            r#"{"type":"input","session_id":"s","player_id":"p","input":{"hp":"lots"}}"#
        )
        .is_err());
        assert!(matches!(
            ClientMessage::from_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::NotUtf8)
        ));
    }

    #[test]
    fn test_binary_frame_carries_json() {
        let msg = ClientMessage::from_bytes(br#"{"type":"leave"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Leave);
    }

    #[test]
    fn test_state_message_shape() {
        let mut players = PlayerMap::new();
        players.insert("p1".into(), PlayerState::new("p1", "Alice"));
        let msg = ServerMessage::state("s1", Snapshot::new(4, 1_700_000_000_000, players));

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "state");
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["tick"], 4);
        assert_eq!(value["snapshot"]["p1"]["hp"], 100);

        let parsed = ServerMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.kind(), "state");
    }

    #[test]
    fn test_lobby_and_error_shapes() {
        let lobby = ServerMessage::Lobby {
            games: vec![LobbyEntry { id: "s1".into(), name: "Alpha".into(), players: 2 }],
        };
        let json = lobby.to_json().unwrap();
        assert!(json.contains(r#""type":"lobby""#));
        assert!(json.contains(r#""players":2"#));

        let json = ServerMessage::error("game not found").to_json().unwrap();
        assert_eq!(json, r#"{"type":"error","msg":"game not found"}"#);
    }

    #[test]
    fn test_state_from_older_server_without_tick() {
        let msg = ServerMessage::from_json(
            r#"{"type":"state","game_id":"g1","snapshot":{"p1":{"id":"p1","name":"A","x":1.0,"y":2.0}}}"#,
        )
        .unwrap();

        match msg {
            ServerMessage::State { session_id, tick, timestamp, snapshot } => {
                assert_eq!(session_id, "g1");
                assert_eq!(tick, 0);
                assert_eq!(timestamp, 0);
                assert_eq!(snapshot["p1"].hp, 100);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }
}
