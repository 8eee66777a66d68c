//! # Spin Cricket Game Server
//!
//! Authoritative server for a two-player, turn-based cricket game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SPIN CRICKET SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Match rules (no I/O)                      │
//! │  ├── state.rs    - Match snapshot and outcome                │
//! │  ├── delivery.rs - Shot choices and ball resolution          │
//! │  ├── events.rs   - Per-ball events                           │
//! │  └── engine.rs   - Room to match store, action validation    │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── protocol.rs - Message types                             │
//! │  └── room.rs     - Room membership and reconnection          │
//! │                                                              │
//! │  config.rs       - Defaults and environment overrides        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Turn Flow
//!
//! The bowler sets a field rotation, the batsman answers with a shot
//! choice, and the ball resolves. Each innings ends on the ball quota or
//! the wicket quota; the second innings also ends as soon as the chase
//! passes the target.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::ServerConfig;
pub use game::delivery::ShotChoice;
pub use game::engine::{DeliveryEngine, EngineError};
pub use game::state::{MatchState, MatchRules, PlayerId, RoomId};
pub use network::server::GameServer;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Legal balls per innings unless configured otherwise
pub const DEFAULT_BALL_QUOTA: u32 = 6;

/// Wickets that close an innings unless configured otherwise
pub const DEFAULT_WICKET_QUOTA: u32 = 3;

/// Players per room
pub const MAX_PLAYERS: usize = 2;
