//! Game Events
//!
//! Events generated while resolving deliveries, for logging and broadcast.

use serde::{Serialize, Deserialize};
use crate::game::delivery::ShotChoice;
use crate::game::state::{Innings, MatchOutcome, PlayerId};

/// Something notable that happened while resolving a delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEvent {
    /// A ball was resolved and scored
    DeliveryResolved {
        innings: Innings,
        ball_number: u32,
        choice: ShotChoice,
        innings_runs: u32,
        innings_wickets: u32,
    },

    /// First innings closed, roles swapped
    InningsChanged {
        bowler: PlayerId,
        target: u32,
    },

    /// Match over
    MatchFinished {
        outcome: MatchOutcome,
    },
}

impl GameEvent {
    /// Short label for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            GameEvent::DeliveryResolved { .. } => "delivery_resolved",
            GameEvent::InningsChanged { .. } => "innings_changed",
            GameEvent::MatchFinished { .. } => "match_finished",
        }
    }
}
