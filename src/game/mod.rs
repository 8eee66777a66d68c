//! Game Logic Module
//!
//! Match rules and turn flow. No I/O, no locking.
//!
//! ## Module Structure
//!
//! - `state`: Match snapshot, ids, phases, outcome
//! - `delivery`: Shot choices and ball resolution
//! - `events`: Events emitted per resolved ball
//! - `engine`: Per-room match store and action validation

pub mod state;
pub mod delivery;
pub mod events;
pub mod engine;

// Re-export key types
pub use state::{MatchState, MatchRules, MatchOutcome, PlayerId, RoomId, GamePhase, Innings};
pub use delivery::{ShotChoice, DeliveryResult, resolve_delivery};
pub use engine::{DeliveryEngine, EngineError, ValidationError, MatchLifecycle};
pub use events::GameEvent;
