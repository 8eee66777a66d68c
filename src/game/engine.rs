//! Delivery Engine
//!
//! Owns one [`MatchState`] per room and is the only code that mutates it.
//! Every operation validates fully before touching state, so a rejected
//! action leaves the match exactly as it was.

use std::collections::BTreeMap;
use chrono::Utc;
use tracing::{debug, info};

use crate::game::delivery::{resolve_delivery, ParseShotError, ShotChoice};
use crate::game::events::GameEvent;
use crate::game::state::{GamePhase, MatchRules, MatchState, PlayerId, RoomId};
use crate::MAX_PLAYERS;

/// Malformed or premature action payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Shot submitted before the bowler set the field.
    #[error("Field rotation must be set before a shot is played")]
    FieldNotSet,
    /// Blank shot choice.
    #[error("Shot choice must not be empty")]
    EmptyChoice,
    /// Shot choice outside W, WD, NB, 0-6.
    #[error("Invalid choice: {0:?}")]
    InvalidChoice(String),
    /// NaN or infinite rotation.
    #[error("Field rotation must be a finite number")]
    InvalidRotation,
}

impl From<ParseShotError> for ValidationError {
    fn from(err: ParseShotError) -> Self {
        match err {
            ParseShotError::Empty => ValidationError::EmptyChoice,
            ParseShotError::Invalid(s) => ValidationError::InvalidChoice(s),
        }
    }
}

/// Engine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// No match for this room.
    #[error("No match found for room {0}")]
    NotFound(RoomId),

    /// Match already created for this room.
    #[error("Match already exists for room {0}")]
    DuplicateRoom(RoomId),

    /// Player already part of the match.
    #[error("Player {0} already in match")]
    DuplicatePlayer(PlayerId),

    /// Match already has two players.
    #[error("Match already has maximum players")]
    Capacity,

    /// Wrong player acting for the current phase.
    #[error("Player {player} may not act: {reason}")]
    Authorization {
        /// Offending player.
        player: PlayerId,
        /// What they are not allowed to do.
        reason: &'static str,
    },

    /// Bad payload or missing prerequisite.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Action not legal in the current phase.
    #[error("Action requires phase '{expected}', match is in '{actual}'")]
    WrongPhase {
        /// Phase the action needs.
        expected: GamePhase,
        /// Phase the match is in.
        actual: GamePhase,
    },

    /// Match cannot start yet.
    #[error("Precondition failed: {0}")]
    Precondition(&'static str),
}

/// Match lifecycle capability used by the room layer.
///
/// The room registry drives match creation and teardown through this trait
/// only, so either side can be tested without the other.
pub trait MatchLifecycle {
    /// Create the room's match with `creator` as first bowler.
    fn open_match(&mut self, creator: &PlayerId, room: &RoomId) -> Result<MatchState, EngineError>;

    /// Add the second player to the room's match.
    fn admit_player(&mut self, player: &PlayerId, room: &RoomId) -> Result<MatchState, EngineError>;

    /// Start play once both players are present.
    fn begin_match(&mut self, room: &RoomId) -> Result<MatchState, EngineError>;

    /// Latest snapshot, for resynchronising a returning player.
    fn snapshot(&self, room: &RoomId) -> Option<MatchState>;

    /// Take a player out of a match that has not started yet.
    fn release_player(&mut self, player: &PlayerId, room: &RoomId) -> Result<MatchState, EngineError>;

    /// Drop all match state for the room. Idempotent.
    fn close_match(&mut self, room: &RoomId);
}

/// The delivery engine: one match per room.
#[derive(Debug, Default)]
pub struct DeliveryEngine {
    /// Rules applied to newly created matches.
    rules: MatchRules,
    /// Active matches, keyed by room.
    matches: BTreeMap<RoomId, MatchState>,
}

impl DeliveryEngine {
    /// Create an engine with default rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine with custom quotas.
    pub fn with_rules(rules: MatchRules) -> Self {
        Self {
            rules,
            matches: BTreeMap::new(),
        }
    }

    /// Rules applied to new matches.
    pub fn rules(&self) -> MatchRules {
        self.rules
    }

    /// Create the match for a new room.
    pub fn initialize(&mut self, player: &PlayerId, room: &RoomId) -> Result<MatchState, EngineError> {
        if self.matches.contains_key(room) {
            return Err(EngineError::DuplicateRoom(room.clone()));
        }

        let state = MatchState::new(player.clone(), self.rules);
        self.matches.insert(room.clone(), state.clone());

        info!(room = %room, bowler = %player, "Match created");
        Ok(state)
    }

    /// Add the second player to a room's match.
    pub fn admit_second_player(&mut self, player: &PlayerId, room: &RoomId) -> Result<MatchState, EngineError> {
        let state = self.match_mut(room)?;

        if state.has_player(player) {
            return Err(EngineError::DuplicatePlayer(player.clone()));
        }
        if state.is_full() {
            return Err(EngineError::Capacity);
        }

        state.players.push(player.clone());

        debug!(room = %room, player = %player, "Second player admitted");
        Ok(state.clone())
    }

    /// Move a two-player match from waiting to setting the field.
    pub fn start(&mut self, room: &RoomId) -> Result<MatchState, EngineError> {
        let state = self.match_mut(room)?;

        if state.phase != GamePhase::Waiting || state.players.len() != MAX_PLAYERS {
            return Err(EngineError::Precondition("room not ready"));
        }

        state.phase = GamePhase::SettingField;

        info!(room = %room, bowler = %state.bowler, "Match started");
        Ok(state.clone())
    }

    /// Record the bowler's field rotation for the next ball.
    pub fn submit_field_rotation(
        &mut self,
        player: &PlayerId,
        room: &RoomId,
        rotation: f64,
    ) -> Result<MatchState, EngineError> {
        let state = self.match_mut(room)?;

        if state.bowler != *player {
            return Err(EngineError::Authorization {
                player: player.clone(),
                reason: "only the bowler may set the field",
            });
        }
        if state.phase != GamePhase::SettingField {
            return Err(EngineError::WrongPhase {
                expected: GamePhase::SettingField,
                actual: state.phase,
            });
        }
        if !rotation.is_finite() {
            return Err(ValidationError::InvalidRotation.into());
        }

        state.pending_rotation = Some(rotation);
        state.phase = GamePhase::Batting;

        debug!(room = %room, ball = state.current_ball, rotation, "Field set");
        Ok(state.clone())
    }

    /// Record the batsman's shot and resolve the delivery.
    pub fn submit_shot_choice(
        &mut self,
        player: &PlayerId,
        room: &RoomId,
        choice: &str,
    ) -> Result<MatchState, EngineError> {
        let state = self.match_mut(room)?;

        if !state.has_player(player) || state.bowler == *player {
            return Err(EngineError::Authorization {
                player: player.clone(),
                reason: "only the batsman may play a shot",
            });
        }
        if matches!(state.phase, GamePhase::Waiting | GamePhase::Finished) {
            return Err(EngineError::WrongPhase {
                expected: GamePhase::Batting,
                actual: state.phase,
            });
        }
        let rotation = state.pending_rotation.ok_or(ValidationError::FieldNotSet)?;
        let shot: ShotChoice = choice.parse().map_err(ValidationError::from)?;

        let result = resolve_delivery(state, rotation, shot, Utc::now());
        log_events(room, &result.events);

        if result.innings_changed {
            info!(room = %room, bowler = %state.bowler, target = ?state.target(), "Innings changed");
        }
        if result.match_ended {
            info!(room = %room, outcome = ?state.outcome(), "Match finished");
        }

        Ok(state.clone())
    }

    /// Remove a player from a match still waiting to start.
    ///
    /// The remaining player becomes the first bowler.
    pub fn release_player(&mut self, player: &PlayerId, room: &RoomId) -> Result<MatchState, EngineError> {
        let state = self.match_mut(room)?;

        if !state.has_player(player) {
            return Err(EngineError::Authorization {
                player: player.clone(),
                reason: "player is not in this match",
            });
        }
        if state.phase != GamePhase::Waiting {
            return Err(EngineError::WrongPhase {
                expected: GamePhase::Waiting,
                actual: state.phase,
            });
        }

        state.players.retain(|p| p != player);
        if state.bowler == *player {
            if let Some(next) = state.players.first() {
                state.bowler = next.clone();
            }
        }

        debug!(room = %room, player = %player, "Player released");
        Ok(state.clone())
    }

    /// Current snapshot for a room.
    pub fn query(&self, room: &RoomId) -> Option<&MatchState> {
        self.matches.get(room)
    }

    /// Remove all state for a room. Idempotent.
    pub fn teardown(&mut self, room: &RoomId) {
        if self.matches.remove(room).is_some() {
            debug!(room = %room, "Match state removed");
        }
    }

    /// Number of live matches.
    pub fn room_count(&self) -> usize {
        self.matches.len()
    }

    fn match_mut(&mut self, room: &RoomId) -> Result<&mut MatchState, EngineError> {
        self.matches
            .get_mut(room)
            .ok_or_else(|| EngineError::NotFound(room.clone()))
    }
}

fn log_events(room: &RoomId, events: &[GameEvent]) {
    for event in events {
        if let GameEvent::DeliveryResolved { innings, ball_number, choice, innings_runs, innings_wickets } = event {
            debug!(
                room = %room,
                innings = %innings,
                ball = ball_number,
                choice = %choice,
                runs = innings_runs,
                wickets = innings_wickets,
                "Delivery resolved"
            );
        }
    }
}

impl MatchLifecycle for DeliveryEngine {
    fn open_match(&mut self, creator: &PlayerId, room: &RoomId) -> Result<MatchState, EngineError> {
        self.initialize(creator, room)
    }

    fn admit_player(&mut self, player: &PlayerId, room: &RoomId) -> Result<MatchState, EngineError> {
        self.admit_second_player(player, room)
    }

    fn begin_match(&mut self, room: &RoomId) -> Result<MatchState, EngineError> {
        self.start(room)
    }

    fn snapshot(&self, room: &RoomId) -> Option<MatchState> {
        self.query(room).cloned()
    }

    fn release_player(&mut self, player: &PlayerId, room: &RoomId) -> Result<MatchState, EngineError> {
        DeliveryEngine::release_player(self, player, room)
    }

    fn close_match(&mut self, room: &RoomId) {
        self.teardown(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::Innings;

    fn p1() -> PlayerId {
        PlayerId::from("p1")
    }

    fn p2() -> PlayerId {
        PlayerId::from("p2")
    }

    fn room() -> RoomId {
        RoomId::from("room-1")
    }

    fn started_engine() -> DeliveryEngine {
        let mut engine = DeliveryEngine::new();
        engine.initialize(&p1(), &room()).unwrap();
        engine.admit_second_player(&p2(), &room()).unwrap();
        engine.start(&room()).unwrap();
        engine
    }

    fn snapshot(engine: &DeliveryEngine) -> MatchState {
        engine.query(&room()).cloned().unwrap()
    }

    #[test]
    fn test_initialize_rejects_duplicate_room() {
        let mut engine = DeliveryEngine::new();
        engine.initialize(&p1(), &room()).unwrap();

        let result = engine.initialize(&p2(), &room());
        assert_eq!(result, Err(EngineError::DuplicateRoom(room())));
        assert_eq!(engine.query(&room()).unwrap().players, vec![p1()]);
    }

    #[test]
    fn test_admit_errors() {
        let mut engine = DeliveryEngine::new();
        assert_eq!(
            engine.admit_second_player(&p2(), &room()),
            Err(EngineError::NotFound(room()))
        );

        engine.initialize(&p1(), &room()).unwrap();
        assert_eq!(
            engine.admit_second_player(&p1(), &room()),
            Err(EngineError::DuplicatePlayer(p1()))
        );

        engine.admit_second_player(&p2(), &room()).unwrap();
        assert_eq!(
            engine.admit_second_player(&PlayerId::from("p3"), &room()),
            Err(EngineError::Capacity)
        );
        assert_eq!(engine.query(&room()).unwrap().players, vec![p1(), p2()]);
    }

    #[test]
    fn test_start_requires_two_waiting_players() {
        let mut engine = DeliveryEngine::new();
        assert_eq!(engine.start(&room()), Err(EngineError::NotFound(room())));

        engine.initialize(&p1(), &room()).unwrap();
        assert_eq!(engine.start(&room()), Err(EngineError::Precondition("room not ready")));

        engine.admit_second_player(&p2(), &room()).unwrap();
        let state = engine.start(&room()).unwrap();
        assert_eq!(state.phase, GamePhase::SettingField);
        assert_eq!(state.bowler, p1());

        // A second start must not rewind a match in progress
        assert_eq!(engine.start(&room()), Err(EngineError::Precondition("room not ready")));
    }

    #[test]
    fn test_release_before_start() {
        let mut engine = DeliveryEngine::new();
        engine.initialize(&p1(), &room()).unwrap();
        engine.admit_second_player(&p2(), &room()).unwrap();

        let state = engine.release_player(&p1(), &room()).unwrap();
        assert_eq!(state.players, vec![p2()]);
        assert_eq!(state.bowler, p2());

        // Freed seat can be taken again
        engine.admit_second_player(&p1(), &room()).unwrap();
        let state = engine.start(&room()).unwrap();
        assert_eq!(state.players, vec![p2(), p1()]);
        assert_eq!(state.bowler, p2());
    }

    #[test]
    fn test_release_rejected_once_started() {
        let mut engine = started_engine();
        let before = snapshot(&engine);

        assert_eq!(
            engine.release_player(&p2(), &room()),
            Err(EngineError::WrongPhase { expected: GamePhase::Waiting, actual: GamePhase::SettingField })
        );
        assert!(matches!(
            engine.release_player(&PlayerId::from("stranger"), &room()),
            Err(EngineError::Authorization { .. })
        ));
        assert_eq!(snapshot(&engine), before);
    }

    #[test]
    fn test_field_rotation_by_bowler() {
        let mut engine = started_engine();
        let state = engine.submit_field_rotation(&p1(), &room(), 1.2).unwrap();

        assert_eq!(state.phase, GamePhase::Batting);
        assert_eq!(state.pending_rotation, Some(1.2));
        assert!(state.delivery_history.is_empty());
    }

    #[test]
    fn test_field_rotation_by_batsman_rejected() {
        let mut engine = started_engine();
        let before = snapshot(&engine);

        let result = engine.submit_field_rotation(&p2(), &room(), 1.2);
        assert!(matches!(result, Err(EngineError::Authorization { .. })));
        assert_eq!(snapshot(&engine), before);
    }

    #[test]
    fn test_field_rotation_twice_rejected() {
        let mut engine = started_engine();
        engine.submit_field_rotation(&p1(), &room(), 1.2).unwrap();
        let before = snapshot(&engine);

        let result = engine.submit_field_rotation(&p1(), &room(), 2.0);
        assert_eq!(
            result,
            Err(EngineError::WrongPhase { expected: GamePhase::SettingField, actual: GamePhase::Batting })
        );
        assert_eq!(snapshot(&engine), before);
    }

    #[test]
    fn test_field_rotation_must_be_finite() {
        let mut engine = started_engine();
        let result = engine.submit_field_rotation(&p1(), &room(), f64::NAN);
        assert_eq!(result, Err(EngineError::Validation(ValidationError::InvalidRotation)));
        assert_eq!(snapshot(&engine).phase, GamePhase::SettingField);
    }

    #[test]
    fn test_shot_by_bowler_rejected() {
        let mut engine = started_engine();
        engine.submit_field_rotation(&p1(), &room(), 1.2).unwrap();
        let before = snapshot(&engine);

        let result = engine.submit_shot_choice(&p1(), &room(), "4");
        assert!(matches!(result, Err(EngineError::Authorization { .. })));
        assert_eq!(snapshot(&engine), before);
    }

    #[test]
    fn test_shot_by_outsider_rejected() {
        let mut engine = started_engine();
        engine.submit_field_rotation(&p1(), &room(), 1.2).unwrap();

        let result = engine.submit_shot_choice(&PlayerId::from("stranger"), &room(), "4");
        assert!(matches!(result, Err(EngineError::Authorization { .. })));
    }

    #[test]
    fn test_shot_before_field_set() {
        let mut engine = started_engine();
        let before = snapshot(&engine);

        let result = engine.submit_shot_choice(&p2(), &room(), "4");
        assert_eq!(result, Err(EngineError::Validation(ValidationError::FieldNotSet)));
        assert_eq!(snapshot(&engine), before);
    }

    #[test]
    fn test_invalid_and_empty_choice() {
        let mut engine = started_engine();
        engine.submit_field_rotation(&p1(), &room(), 1.2).unwrap();
        let before = snapshot(&engine);

        assert_eq!(
            engine.submit_shot_choice(&p2(), &room(), "7"),
            Err(EngineError::Validation(ValidationError::InvalidChoice("7".to_string())))
        );
        assert_eq!(
            engine.submit_shot_choice(&p2(), &room(), ""),
            Err(EngineError::Validation(ValidationError::EmptyChoice))
        );
        assert_eq!(snapshot(&engine), before);
    }

    #[test]
    fn test_shot_resolves_delivery() {
        let mut engine = started_engine();
        engine.submit_field_rotation(&p1(), &room(), 1.2).unwrap();

        let state = engine.submit_shot_choice(&p2(), &room(), "4").unwrap();
        assert_eq!(state.runs, [4, 0]);
        assert_eq!(state.current_ball, 2);
        assert_eq!(state.phase, GamePhase::SettingField);
        assert_eq!(state.delivery_history.len(), 1);
        assert_eq!(state.delivery_history[0].batsman_choice, ShotChoice::Runs(4));
    }

    #[test]
    fn test_no_actions_after_finish() {
        let rules = MatchRules { ball_quota: 1, wicket_quota: 1 };
        let mut engine = DeliveryEngine::with_rules(rules);
        engine.initialize(&p1(), &room()).unwrap();
        engine.admit_second_player(&p2(), &room()).unwrap();
        engine.start(&room()).unwrap();

        engine.submit_field_rotation(&p1(), &room(), 0.1).unwrap();
        let state = engine.submit_shot_choice(&p2(), &room(), "1").unwrap();
        assert_eq!(state.innings, Innings::Second);
        assert_eq!(state.bowler, p2());

        engine.submit_field_rotation(&p2(), &room(), 0.2).unwrap();
        let state = engine.submit_shot_choice(&p1(), &room(), "0").unwrap();
        assert_eq!(state.phase, GamePhase::Finished);

        assert!(matches!(
            engine.submit_field_rotation(&p2(), &room(), 0.3),
            Err(EngineError::WrongPhase { actual: GamePhase::Finished, .. })
        ));
        assert!(matches!(
            engine.submit_shot_choice(&p1(), &room(), "4"),
            Err(EngineError::WrongPhase { actual: GamePhase::Finished, .. })
        ));
    }

    #[test]
    fn test_teardown_idempotent() {
        let mut engine = started_engine();
        assert_eq!(engine.room_count(), 1);

        engine.teardown(&room());
        engine.teardown(&room());
        assert_eq!(engine.room_count(), 0);
        assert!(engine.query(&room()).is_none());
        assert_eq!(
            engine.submit_field_rotation(&p1(), &room(), 1.0),
            Err(EngineError::NotFound(room()))
        );
    }

    #[test]
    fn test_rooms_are_independent() {
        let mut engine = started_engine();
        let other = RoomId::from("room-2");
        engine.initialize(&PlayerId::from("a"), &other).unwrap();

        engine.submit_field_rotation(&p1(), &room(), 1.0).unwrap();
        assert_eq!(engine.query(&other).unwrap().phase, GamePhase::Waiting);
        assert_eq!(engine.room_count(), 2);
    }
}
