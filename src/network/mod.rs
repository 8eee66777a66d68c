//! Network Layer
//!
//! WebSocket server and room membership.
//! Match rules live in `game/`; this layer only routes and broadcasts.

pub mod protocol;
pub mod room;
pub mod server;

pub use protocol::{ClientMessage, ServerMessage, ServerError, ErrorCode};
pub use room::{Room, RoomPlayer, RoomRegistry, RoomError, JoinOutcome};
pub use server::{GameServer, GameServerError};
