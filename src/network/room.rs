//! Room Registry
//!
//! Tracks room membership and player connectivity. Match state lives in the
//! engine; the registry reaches it only through [`MatchLifecycle`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::{debug, info};

use crate::game::engine::{EngineError, MatchLifecycle};
use crate::game::state::{GamePhase, MatchState, PlayerId, RoomId};
use crate::MAX_PLAYERS;

/// A player's seat in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomPlayer {
    /// Player identifier.
    pub id: PlayerId,
    /// Room the player belongs to.
    pub room_id: RoomId,
    /// Is the player's connection live.
    pub connected: bool,
    /// Did this player create the room.
    pub is_room_creator: bool,
    /// When the player last dropped (None while connected).
    #[serde(skip)]
    pub disconnected_at: Option<Instant>,
}

impl RoomPlayer {
    fn new(id: PlayerId, room_id: RoomId, is_room_creator: bool) -> Self {
        Self {
            id,
            room_id,
            connected: true,
            is_room_creator,
            disconnected_at: None,
        }
    }
}

/// A game room.
#[derive(Debug, Clone)]
pub struct Room {
    /// Room identifier.
    pub id: RoomId,
    /// Players in join order.
    pub players: Vec<RoomPlayer>,
    /// Seat limit.
    pub max_players: usize,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Creator's id.
    pub room_creator: PlayerId,
}

impl Room {
    /// Look up a member.
    pub fn player(&self, id: &PlayerId) -> Option<&RoomPlayer> {
        self.players.iter().find(|p| p.id == *id)
    }

    /// Every seat taken.
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }

    /// True if no member has been connected within `timeout` of `now`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.players.iter().all(|p| match p.disconnected_at {
            Some(since) => !p.connected && now.saturating_duration_since(since) > timeout,
            None => false,
        })
    }
}

/// Room left behind when a player departs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Room the player left.
    pub room_id: RoomId,
    /// The room and its match no longer exist.
    pub room_closed: bool,
}

/// Result of creating a room.
#[derive(Debug, Clone)]
pub struct Created {
    /// The creator's seat.
    pub player: RoomPlayer,
    /// Fresh match snapshot.
    pub state: MatchState,
    /// Room the creator was moved out of, if any.
    pub vacated: Option<Departure>,
}

/// Result of a join request.
#[derive(Debug, Clone)]
pub enum JoinOutcome {
    /// New member admitted to the room and its match.
    Joined {
        /// The new seat.
        player: RoomPlayer,
        /// Match snapshot after admission.
        state: MatchState,
        /// Both seats are now filled.
        room_ready: bool,
        /// Room the player was moved out of, if any.
        vacated: Option<Departure>,
    },
    /// Existing member came back; match state untouched.
    Rejoined {
        /// The restored seat.
        player: RoomPlayer,
        /// Latest match snapshot.
        state: MatchState,
    },
}

/// Room errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// No such room.
    #[error("Room not found")]
    RoomNotFound,

    /// Room id already taken.
    #[error("Room already exists")]
    RoomExists,

    /// Both seats taken.
    #[error("Room is full")]
    RoomFull,

    /// Match state rejected the membership change.
    #[error("Match error: {0}")]
    Match(#[from] EngineError),
}

/// In-memory registry of rooms and their members.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    /// Rooms by id.
    rooms: BTreeMap<RoomId, Room>,
    /// Player to room mapping.
    player_rooms: BTreeMap<PlayerId, RoomId>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room and its match, with `player` as creator.
    ///
    /// A player still seated elsewhere is moved out of that room first.
    pub fn create_room<L: MatchLifecycle>(
        &mut self,
        player: &PlayerId,
        room_id: &RoomId,
        lifecycle: &mut L,
    ) -> Result<Created, RoomError> {
        if self.rooms.contains_key(room_id) {
            return Err(RoomError::RoomExists);
        }

        let state = lifecycle.open_match(player, room_id)?;
        let vacated = self.vacate_other(player, room_id, lifecycle);
        let seat = RoomPlayer::new(player.clone(), room_id.clone(), true);

        self.rooms.insert(room_id.clone(), Room {
            id: room_id.clone(),
            players: vec![seat.clone()],
            max_players: MAX_PLAYERS,
            created: Utc::now(),
            room_creator: player.clone(),
        });
        self.player_rooms.insert(player.clone(), room_id.clone());

        info!(room = %room_id, creator = %player, "Room created");
        Ok(Created { player: seat, state, vacated })
    }

    /// Join an existing room, or rejoin it as a returning member.
    pub fn join_room<L: MatchLifecycle>(
        &mut self,
        player: &PlayerId,
        room_id: &RoomId,
        lifecycle: &mut L,
    ) -> Result<JoinOutcome, RoomError> {
        let room = self.rooms.get(room_id).ok_or(RoomError::RoomNotFound)?;

        if room.player(player).is_some() {
            let state = lifecycle.snapshot(room_id).ok_or(RoomError::RoomNotFound)?;
            let room = self.rooms.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
            let Some(seat) = room.players.iter_mut().find(|p| p.id == *player) else {
                return Err(RoomError::RoomNotFound);
            };
            seat.connected = true;
            seat.disconnected_at = None;
            let seat = seat.clone();
            self.player_rooms.insert(player.clone(), room_id.clone());

            debug!(room = %room_id, player = %player, "Player rejoined");
            return Ok(JoinOutcome::Rejoined { player: seat, state });
        }

        if room.is_full() {
            return Err(RoomError::RoomFull);
        }

        let state = lifecycle.admit_player(player, room_id)?;
        let seat = RoomPlayer::new(player.clone(), room_id.clone(), false);
        let room_ready = match self.rooms.get_mut(room_id) {
            Some(room) => {
                room.players.push(seat.clone());
                room.is_full()
            }
            None => return Err(RoomError::RoomNotFound),
        };
        let vacated = self.vacate_other(player, room_id, lifecycle);
        self.player_rooms.insert(player.clone(), room_id.clone());

        info!(room = %room_id, player = %player, "Player joined");
        Ok(JoinOutcome::Joined { player: seat, state, room_ready, vacated })
    }

    /// Mark a player's connection as dropped. Membership and match are kept.
    pub fn mark_disconnected(&mut self, player: &PlayerId, now: Instant) -> Option<RoomId> {
        let room_id = self.player_rooms.get(player)?.clone();
        let room = self.rooms.get_mut(&room_id)?;
        let seat = room.players.iter_mut().find(|p| p.id == *player)?;

        seat.connected = false;
        seat.disconnected_at = Some(now);
        Some(room_id)
    }

    /// Remove a player from their room.
    ///
    /// Before the match starts the seat is released in both the room and the
    /// match. Once it has started, or when the last player goes, the room is
    /// deleted along with its match.
    pub fn remove_player<L: MatchLifecycle>(&mut self, player: &PlayerId, lifecycle: &mut L) -> Option<Departure> {
        let room_id = self.player_rooms.get(player)?.clone();

        let Some(room) = self.rooms.get(&room_id) else {
            self.player_rooms.remove(player);
            return Some(Departure { room_id, room_closed: true });
        };

        let others = room.players.iter().filter(|p| p.id != *player).count();
        let waiting = lifecycle
            .snapshot(&room_id)
            .map_or(false, |state| state.phase == GamePhase::Waiting);

        if others > 0 && waiting && lifecycle.release_player(player, &room_id).is_ok() {
            self.player_rooms.remove(player);
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.players.retain(|p| p.id != *player);
                if room.room_creator == *player {
                    if let Some(heir) = room.players.first_mut() {
                        heir.is_room_creator = true;
                        room.room_creator = heir.id.clone();
                    }
                }
            }

            info!(room = %room_id, player = %player, "Player left waiting room");
            return Some(Departure { room_id, room_closed: false });
        }

        self.delete_room(&room_id, lifecycle);
        Some(Departure { room_id, room_closed: true })
    }

    /// Leave whatever room `player` sits in, unless it is `keep`.
    fn vacate_other<L: MatchLifecycle>(
        &mut self,
        player: &PlayerId,
        keep: &RoomId,
        lifecycle: &mut L,
    ) -> Option<Departure> {
        match self.player_rooms.get(player) {
            Some(current) if current != keep => self.remove_player(player, lifecycle),
            _ => None,
        }
    }

    /// Delete a room, its memberships and its match.
    pub fn delete_room<L: MatchLifecycle>(&mut self, room_id: &RoomId, lifecycle: &mut L) {
        if let Some(room) = self.rooms.remove(room_id) {
            for player in &room.players {
                if self.player_rooms.get(&player.id) == Some(room_id) {
                    self.player_rooms.remove(&player.id);
                }
            }
            info!(room = %room_id, "Room deleted");
        }
        lifecycle.close_match(room_id);
    }

    /// Get room by id.
    pub fn room(&self, room_id: &RoomId) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    /// Room a player currently belongs to.
    pub fn player_room(&self, player: &PlayerId) -> Option<&RoomId> {
        self.player_rooms.get(player)
    }

    /// Look up a player's seat.
    pub fn player(&self, player: &PlayerId) -> Option<&RoomPlayer> {
        let room_id = self.player_rooms.get(player)?;
        self.rooms.get(room_id)?.player(player)
    }

    /// All rooms (for debugging).
    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    /// Number of rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Rooms whose every member has been disconnected longer than `timeout`.
    pub fn idle_rooms(&self, now: Instant, timeout: Duration) -> Vec<RoomId> {
        self.rooms
            .values()
            .filter(|room| room.is_idle(now, timeout))
            .map(|room| room.id.clone())
            .collect()
    }
}
