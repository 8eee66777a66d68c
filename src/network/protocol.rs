//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON objects tagged by `"type"`.

use serde::{Serialize, Deserialize};

use crate::game::engine::EngineError;
use crate::game::state::{MatchOutcome, MatchState, PlayerId, RoomId};
use crate::network::room::{RoomError, RoomPlayer};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a new room; the sender becomes its creator and first bowler.
    CreateRoom { player_id: PlayerId },

    /// Join (or rejoin) a room by id.
    JoinRoom { room_id: RoomId, player_id: PlayerId },

    /// Live field-rotation preview, relayed to the other player only.
    RotatePie {
        room_id: RoomId,
        player_id: PlayerId,
        rotation: f64,
    },

    /// Bowler commits the field rotation.
    FieldSet {
        player_id: PlayerId,
        room_id: RoomId,
        rotation: f64,
    },

    /// Batsman commits a shot choice.
    ShotPlayed {
        player_id: PlayerId,
        room_id: RoomId,
        choice: String,
    },

    /// Request current match state (for reconnection).
    SyncRequest { room_id: RoomId },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },

    /// Player is leaving the room.
    Leave,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Room created.
    RoomCreated { room_id: RoomId },

    /// Caller joined or rejoined a room.
    PlayerJoined { state: MatchState, player: RoomPlayer },

    /// No such room.
    RoomNotFound,

    /// Room already has two players.
    RoomFull,

    /// Both players present, first ball to be set.
    GameStarted { state: MatchState },

    /// Opponent's live rotation preview.
    RotationUpdate { state: MatchState, rotation: f64 },

    /// Field set, batsman to play.
    PlayShot { state: MatchState },

    /// Ball resolved, bowler to set the next field.
    SetField { state: MatchState },

    /// Match over.
    GameEnded { state: MatchState, outcome: Option<MatchOutcome> },

    /// A member left the room.
    PlayerLeft { player_id: PlayerId },

    /// A member's connection dropped.
    PlayerDisconnected { player_id: PlayerId },

    /// Current snapshot, in reply to a sync request.
    State { state: MatchState },

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Action rejected (sent only to the caller).
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Build an error payload.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed message or payload.
    InvalidInput,
    /// Room or match not found.
    RoomNotFound,
    /// Room id already in use.
    RoomExists,
    /// Room already has two players.
    RoomFull,
    /// Player already in match.
    DuplicatePlayer,
    /// Not this player's action to take.
    NotYourTurn,
    /// Action not legal in the current phase.
    WrongPhase,
    /// Match not ready to start.
    NotReady,
    /// Caller is not in a room.
    NotInRoom,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl From<&EngineError> for ErrorCode {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::NotFound(_) => ErrorCode::RoomNotFound,
            EngineError::DuplicateRoom(_) => ErrorCode::RoomExists,
            EngineError::DuplicatePlayer(_) => ErrorCode::DuplicatePlayer,
            EngineError::Capacity => ErrorCode::RoomFull,
            EngineError::Authorization { .. } => ErrorCode::NotYourTurn,
            EngineError::Validation(_) => ErrorCode::InvalidInput,
            EngineError::WrongPhase { .. } => ErrorCode::WrongPhase,
            EngineError::Precondition(_) => ErrorCode::NotReady,
        }
    }
}

impl From<&RoomError> for ErrorCode {
    fn from(err: &RoomError) -> Self {
        match err {
            RoomError::RoomNotFound => ErrorCode::RoomNotFound,
            RoomError::RoomExists => ErrorCode::RoomExists,
            RoomError::RoomFull => ErrorCode::RoomFull,
            RoomError::Match(inner) => inner.into(),
        }
    }
}

impl From<&EngineError> for ServerError {
    fn from(err: &EngineError) -> Self {
        ServerError::new(err.into(), err.to_string())
    }
}

impl From<&RoomError> for ServerError {
    fn from(err: &RoomError) -> Self {
        ServerError::new(err.into(), err.to_string())
    }
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
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Snapshot carried by this message, if any.
    pub fn state(&self) -> Option<&MatchState> {
        match self {
            ServerMessage::PlayerJoined { state, .. }
            | ServerMessage::GameStarted { state }
            | ServerMessage::RotationUpdate { state, .. }
            | ServerMessage::PlayShot { state }
            | ServerMessage::SetField { state }
            | ServerMessage::GameEnded { state, .. }
            | ServerMessage::State { state } => Some(state),
            _ => None,
        }
    }
}
