//! Delivery Resolution
//!
//! Classifies a batsman's shot and applies one delivery to the match:
//! history, score, extras, early win, innings switch and match end.

use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::game::events::GameEvent;
use crate::game::state::{DeliveryRecord, GamePhase, Innings, MatchState};

/// Highest run value a single shot can score.
pub const MAX_RUNS_PER_BALL: u8 = 6;

/// A batsman's shot choice.
///
/// Wire form is the original string code: `"W"`, `"WD"`, `"NB"` or `"0"`..`"6"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ShotChoice {
    /// Dismissal, counts toward the quota
    Wicket,
    /// Illegal delivery: one run, re-bowled
    Wide,
    /// Illegal delivery: one run, re-bowled
    NoBall,
    /// Runs off the bat (0-6), counts toward the quota
    Runs(u8),
}

impl ShotChoice {
    /// Wide or no-ball.
    #[inline]
    pub fn is_extra(self) -> bool {
        matches!(self, ShotChoice::Wide | ShotChoice::NoBall)
    }

    /// Runs this shot adds to the innings.
    pub fn runs(self) -> u32 {
        match self {
            ShotChoice::Wicket => 0,
            ShotChoice::Wide | ShotChoice::NoBall => 1,
            ShotChoice::Runs(n) => n as u32,
        }
    }
}

impl fmt::Display for ShotChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShotChoice::Wicket => f.write_str("W"),
            ShotChoice::Wide => f.write_str("WD"),
            ShotChoice::NoBall => f.write_str("NB"),
            ShotChoice::Runs(n) => write!(f, "{}", n),
        }
    }
}

/// Shot choice parse failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseShotError {
    /// Blank input.
    #[error("shot choice must not be empty")]
    Empty,
    /// Anything outside W, WD, NB, 0-6.
    #[error("invalid choice: {0:?}")]
    Invalid(String),
}

impl FromStr for ShotChoice {
    type Err = ParseShotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseShotError::Empty);
        }
        match s {
            "W" => Ok(ShotChoice::Wicket),
            "WD" => Ok(ShotChoice::Wide),
            "NB" => Ok(ShotChoice::NoBall),
            // Single ASCII digit only: rejects "+4", "04", " 4"
            _ if s.len() == 1 => match s.as_bytes()[0] {
                b @ b'0'..=b'9' if b - b'0' <= MAX_RUNS_PER_BALL => Ok(ShotChoice::Runs(b - b'0')),
                _ => Err(ParseShotError::Invalid(s.to_string())),
            },
            _ => Err(ParseShotError::Invalid(s.to_string())),
        }
    }
}

impl From<ShotChoice> for String {
    fn from(choice: ShotChoice) -> String {
        choice.to_string()
    }
}

impl TryFrom<String> for ShotChoice {
    type Error = ParseShotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Result of resolving one delivery.
#[derive(Debug, Default)]
pub struct DeliveryResult {
    /// Events generated by this delivery
    pub events: Vec<GameEvent>,
    /// Whether the innings switched on this ball
    pub innings_changed: bool,
    /// Whether the match ended on this ball
    pub match_ended: bool,
}

/// Resolve one delivery.
///
/// # Arguments
///
/// * `state` - The match state (will be mutated)
/// * `rotation` - The bowler's field rotation for this ball
/// * `choice` - The batsman's classified shot
/// * `timestamp` - Time recorded on the delivery record
///
/// Callers must have validated turn ownership and phase. This function
/// cannot fail, so a rejected action never reaches it.
pub fn resolve_delivery(
    state: &mut MatchState,
    rotation: f64,
    choice: ShotChoice,
    timestamp: DateTime<Utc>,
) -> DeliveryResult {
    let mut result = DeliveryResult::default();
    let innings = state.innings;
    let idx = innings.index();

    state.pending_shot_choice = Some(choice);

    // 1. Record the delivery before its runs are applied
    state.delivery_history.push(DeliveryRecord {
        ball_number: state.current_ball,
        innings,
        rotation,
        batsman_choice: choice,
        timestamp,
        runs_so_far: state.runs[idx],
    });

    // 2. Apply the outcome
    match choice {
        ShotChoice::Wicket => state.wickets[idx] += 1,
        ShotChoice::Wide | ShotChoice::NoBall => {
            state.runs[idx] += 1;
            state.total_balls_this_innings += 1;
        }
        ShotChoice::Runs(n) => state.runs[idx] += n as u32,
    }

    result.events.push(GameEvent::DeliveryResolved {
        innings,
        ball_number: state.current_ball,
        choice,
        innings_runs: state.runs[idx],
        innings_wickets: state.wickets[idx],
    });

    // 3. Chasing side passed the target
    let target_passed = innings == Innings::Second
        && state.runs[Innings::Second.index()] > state.runs[Innings::First.index()];

    if target_passed {
        finish(state, &mut result);
    } else {
        // 4. Innings over on quota or wickets
        let quota_reached = !choice.is_extra() && state.current_ball == state.total_balls_this_innings;
        let all_out = state.wickets[idx] >= state.wicket_quota;

        if quota_reached || all_out {
            match innings {
                Innings::Second => finish(state, &mut result),
                Innings::First => switch_innings(state, &mut result),
            }
        } else if !choice.is_extra() {
            state.current_ball += 1;
        }
    }

    // 5. Ready for the next ball
    state.pending_rotation = None;
    state.pending_shot_choice = None;
    if state.phase != GamePhase::Finished {
        state.phase = GamePhase::SettingField;
    }

    result
}

fn switch_innings(state: &mut MatchState, result: &mut DeliveryResult) {
    state.innings = Innings::Second;
    state.current_ball = 1;
    state.total_balls_this_innings = state.original_ball_quota;
    if let Some(next) = state.batsman().cloned() {
        state.bowler = next;
    }

    result.innings_changed = true;
    result.events.push(GameEvent::InningsChanged {
        bowler: state.bowler.clone(),
        target: state.runs[Innings::First.index()] + 1,
    });
}

fn finish(state: &mut MatchState, result: &mut DeliveryResult) {
    state.phase = GamePhase::Finished;
    result.match_ended = true;
    if let Some(outcome) = state.outcome() {
        result.events.push(GameEvent::MatchFinished { outcome });
    }
}
