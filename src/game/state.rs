//! Match State Definitions
//!
//! The authoritative record for one room's match: players, phase,
//! per-innings counters and the append-only delivery history.

use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::game::delivery::ShotChoice;
use crate::{DEFAULT_BALL_QUOTA, DEFAULT_WICKET_QUOTA, MAX_PLAYERS};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Player identifier as supplied by the client.
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    /// Create from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Room identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Create from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random room identifier (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// PHASE & INNINGS
// =============================================================================

/// Current phase of the match.
///
/// Together with [`MatchState::bowler`] this decides who may act next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    /// Waiting for the second player / match start
    #[default]
    Waiting,
    /// Bowler to submit a field rotation
    SettingField,
    /// Batsman to submit a shot choice
    Batting,
    /// Match over
    Finished,
}

impl fmt::Display for GamePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GamePhase::Waiting => "waiting",
            GamePhase::SettingField => "setting field",
            GamePhase::Batting => "batting",
            GamePhase::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// One of the two innings. Serialized as `1` or `2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum Innings {
    /// Creator bowls, second player bats
    #[default]
    First,
    /// Roles swapped, chasing the first-innings total
    Second,
}

impl Innings {
    /// Index into the per-innings counter arrays.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Innings::First => 0,
            Innings::Second => 1,
        }
    }

    /// 1-based innings number.
    #[inline]
    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }
}

impl From<Innings> for u8 {
    fn from(innings: Innings) -> u8 {
        innings.number()
    }
}

impl TryFrom<u8> for Innings {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Innings::First),
            2 => Ok(Innings::Second),
            other => Err(format!("innings must be 1 or 2, got {}", other)),
        }
    }
}

impl fmt::Display for Innings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

// =============================================================================
// RULES
// =============================================================================

/// Per-match quotas, fixed when the match is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRules {
    /// Legal deliveries per innings.
    pub ball_quota: u32,
    /// Wickets that end an innings.
    pub wicket_quota: u32,
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            ball_quota: DEFAULT_BALL_QUOTA,
            wicket_quota: DEFAULT_WICKET_QUOTA,
        }
    }
}

// =============================================================================
// DELIVERY RECORD
// =============================================================================

/// One resolved ball. Never modified after it is appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Ball number within its innings (extras repeat the number).
    pub ball_number: u32,
    /// Innings the ball belongs to.
    pub innings: Innings,
    /// Field rotation the bowler set.
    pub rotation: f64,
    /// Shot the batsman chose.
    pub batsman_choice: ShotChoice,
    /// When the ball was resolved.
    pub timestamp: DateTime<Utc>,
    /// Innings run total before this ball's runs were added.
    pub runs_so_far: u32,
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Result of a finished match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MatchOutcome {
    /// One side outscored the other.
    Winner {
        /// Winning player.
        player: PlayerId,
        /// Winner's run total.
        runs: u32,
        /// Winning margin in runs.
        margin: u32,
    },
    /// Both innings ended level.
    Tie {
        /// Shared run total.
        runs: u32,
    },
}

// =============================================================================
// MATCH STATE
// =============================================================================

/// Complete state of one room's match.
///
/// `players[0]` is the room creator and bowls the first innings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchState {
    /// Player ids in join order (at most two)
    pub players: Vec<PlayerId>,

    /// Current phase
    pub phase: GamePhase,

    /// Current innings (never reverts to First)
    pub innings: Innings,

    /// 1-based legal-ball counter for the current innings
    pub current_ball: u32,

    /// Deliveries needed to complete this innings (grows with extras)
    pub total_balls_this_innings: u32,

    /// Fixed ball quota, restored at the innings switch
    pub original_ball_quota: u32,

    /// Wickets that end an innings
    pub wicket_quota: u32,

    /// Player currently bowling
    pub bowler: PlayerId,

    /// Bowler's rotation for the ball in progress
    pub pending_rotation: Option<f64>,

    /// Batsman's choice for the ball in progress
    pub pending_shot_choice: Option<ShotChoice>,

    /// Runs per innings, indexed by [`Innings::index`]
    pub runs: [u32; 2],

    /// Wickets per innings, indexed by [`Innings::index`]
    pub wickets: [u32; 2],

    /// Every resolved ball across both innings, oldest first
    pub delivery_history: Vec<DeliveryRecord>,
}

impl MatchState {
    /// Create a new match with the creator as first bowler.
    pub fn new(creator: PlayerId, rules: MatchRules) -> Self {
        Self {
            players: vec![creator.clone()],
            phase: GamePhase::Waiting,
            innings: Innings::First,
            current_ball: 1,
            total_balls_this_innings: rules.ball_quota,
            original_ball_quota: rules.ball_quota,
            wicket_quota: rules.wicket_quota,
            bowler: creator,
            pending_rotation: None,
            pending_shot_choice: None,
            runs: [0; 2],
            wickets: [0; 2],
            delivery_history: Vec::new(),
        }
    }

    /// Is this player part of the match?
    pub fn has_player(&self, id: &PlayerId) -> bool {
        self.players.contains(id)
    }

    /// Does the match hold its maximum number of players?
    pub fn is_full(&self) -> bool {
        self.players.len() >= MAX_PLAYERS
    }

    /// The player who is not `id`, if both have joined.
    pub fn opponent_of(&self, id: &PlayerId) -> Option<&PlayerId> {
        self.players.iter().find(|p| *p != id)
    }

    /// Player currently batting.
    pub fn batsman(&self) -> Option<&PlayerId> {
        self.opponent_of(&self.bowler)
    }

    /// Runs scored so far in the current innings.
    pub fn innings_runs(&self) -> u32 {
        self.runs[self.innings.index()]
    }

    /// Wickets fallen so far in the current innings.
    pub fn innings_wickets(&self) -> u32 {
        self.wickets[self.innings.index()]
    }

    /// Runs the chasing side needs to win, once the second innings is under way.
    pub fn target(&self) -> Option<u32> {
        match self.innings {
            Innings::First => None,
            Innings::Second => Some(self.runs[Innings::First.index()] + 1),
        }
    }

    /// Legal deliveries still to be bowled in this innings.
    pub fn balls_remaining(&self) -> u32 {
        if self.phase == GamePhase::Finished {
            return 0;
        }
        self.total_balls_this_innings.saturating_sub(self.current_ball) + 1
    }

    /// Check if the match has ended.
    pub fn is_finished(&self) -> bool {
        self.phase == GamePhase::Finished
    }

    /// Winner (or tie) once the match is finished.
    ///
    /// The first innings is batted by `players[1]`, the second by `players[0]`.
    pub fn outcome(&self) -> Option<MatchOutcome> {
        if !self.is_finished() {
            return None;
        }

        let first = self.runs[Innings::First.index()];
        let second = self.runs[Innings::Second.index()];
        let first_batter = self.players.get(1)?;
        let second_batter = self.players.first()?;

        let outcome = match first.cmp(&second) {
            std::cmp::Ordering::Greater => MatchOutcome::Winner {
                player: first_batter.clone(),
                runs: first,
                margin: first - second,
            },
            std::cmp::Ordering::Less => MatchOutcome::Winner {
                player: second_batter.clone(),
                runs: second,
                margin: second - first,
            },
            std::cmp::Ordering::Equal => MatchOutcome::Tie { runs: first },
        };
        Some(outcome)
    }
}

// =============================================================================
// TESTS
// =============================================================================
