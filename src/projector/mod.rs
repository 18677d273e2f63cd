//! Game state projection.
//!
//! Folds the ordered, deduplicated event stream into one [`GameSnapshot`] per
//! game. A snapshot only moves forward: events at or below its last applied
//! key are no-ops, and once a game is finished or cancelled nothing changes
//! it again.
//!
//! ```text
//! Waiting ──NumberGenerated / MoveMade──▶ Active ──MoveMade*──▶ Active
//!    │                                      │
//!    └──────── GameFinished / GameCancelled / timeout limit ────▶ Finished | Cancelled
//! ```

use crate::events::{EventKind, EventPayload, GameEvent, OrderingKey};
use alloy::primitives::Address;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Waiting,
    Active,
    Finished,
    Cancelled,
}

impl GameStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, GameStatus::Finished | GameStatus::Cancelled)
    }
}

impl std::fmt::Display for GameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameStatus::Waiting => write!(f, "waiting"),
            GameStatus::Active => write!(f, "active"),
            GameStatus::Finished => write!(f, "finished"),
            GameStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Best known state of one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameSnapshot {
    pub game_id: u64,
    pub status: GameStatus,
    /// None until the contract generates the starting number.
    pub current_number: Option<u64>,
    /// Player whose turn it is.
    pub current_player: Option<Address>,
    /// Players in join order.
    pub players: Vec<Address>,
    pub timeouts_by_player: BTreeMap<Address, u32>,
    pub winner: Option<Address>,
    pub move_count: u32,
    /// Player behind the most recent move or timeout.
    pub last_mover: Option<Address>,
    pub last_applied: Option<OrderingKey>,
}

impl GameSnapshot {
    pub fn new(game_id: u64) -> Self {
        Self {
            game_id,
            status: GameStatus::Waiting,
            current_number: None,
            current_player: None,
            players: Vec::new(),
            timeouts_by_player: BTreeMap::new(),
            winner: None,
            move_count: 0,
            last_mover: None,
            last_applied: None,
        }
    }

    /// The other player in a two-player game, if known.
    pub fn opponent_of(&self, player: &Address) -> Option<Address> {
        self.players.iter().find(|p| *p != player).copied()
    }

    fn add_player(&mut self, player: Address) {
        if !self.players.contains(&player) {
            self.players.push(player);
        }
    }

    /// Turn holder once the players are known: the first to join before any
    /// move, otherwise whoever did not move last.
    fn resolve_turn(&mut self) {
        if self.current_player.is_some() || self.status.is_terminal() {
            return;
        }
        self.current_player = match self.last_mover {
            Some(mover) => self.opponent_of(&mover),
            None => self.players.first().copied(),
        };
    }
}

impl std::fmt::Display for GameSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Game({}, {}", self.game_id, self.status)?;
        if let Some(n) = self.current_number {
            write!(f, ", number={}", n)?;
        }
        if let Some(w) = self.winner {
            write!(f, ", winner={}", w)?;
        }
        write!(f, ", moves={})", self.move_count)
    }
}

/// Why an event was rejected after passing deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalTransition {
    pub game_id: u64,
    pub status: GameStatus,
    pub kind: EventKind,
    pub key: OrderingKey,
}

impl std::fmt::Display for TerminalTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {} arrived after game {} was {}",
            self.kind, self.key, self.game_id, self.status
        )
    }
}

/// What `apply` did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Fields updated and `last_applied` advanced.
    Applied,
    /// Key at or below `last_applied`; nothing changed.
    Stale,
    /// Game already terminal; nothing changed.
    Anomalous(TerminalTransition),
}

/// Result of applying one event: the outcome and the game's snapshot after it.
#[derive(Debug, Clone)]
pub struct Applied {
    pub outcome: Outcome,
    pub snapshot: GameSnapshot,
}

/// Owns every tracked game's snapshot.
#[derive(Debug)]
pub struct Projector {
    snapshots: HashMap<u64, GameSnapshot>,
    /// Timeouts a player may accumulate; reaching it forfeits the game.
    timeout_limit: u32,
}

impl Projector {
    pub fn new(timeout_limit: u32) -> Self {
        Self {
            snapshots: HashMap::new(),
            timeout_limit: timeout_limit.max(1),
        }
    }

    pub fn get(&self, game_id: u64) -> Option<&GameSnapshot> {
        self.snapshots.get(&game_id)
    }

    /// Stop tracking a game.
    pub fn remove(&mut self, game_id: u64) -> Option<GameSnapshot> {
        self.snapshots.remove(&game_id)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Fill in the player list from a read call. `players` is the contract's
    /// join order and takes precedence over the order events revealed them
    /// in, so seeding before or after the first events gives the same
    /// snapshot. Ordered fields are untouched.
    pub fn seed_players(&mut self, game_id: u64, players: &[Address]) {
        let snapshot = self
            .snapshots
            .entry(game_id)
            .or_insert_with(|| GameSnapshot::new(game_id));
        let mut ordered: Vec<Address> = Vec::with_capacity(players.len().max(snapshot.players.len()));
        for player in players.iter().chain(snapshot.players.iter()) {
            if !ordered.contains(player) {
                ordered.push(*player);
            }
        }
        snapshot.players = ordered;
        snapshot.resolve_turn();
    }

    /// Fold one event into its game's snapshot.
    pub fn apply(&mut self, event: &GameEvent) -> Applied {
        let timeout_limit = self.timeout_limit;
        let snapshot = self
            .snapshots
            .entry(event.game_id)
            .or_insert_with(|| GameSnapshot::new(event.game_id));

        if snapshot.last_applied.is_some_and(|last| event.key <= last) {
            debug!(
                game_id = event.game_id,
                key = %event.key,
                kind = %event.kind(),
                "stale event ignored"
            );
            return Applied {
                outcome: Outcome::Stale,
                snapshot: snapshot.clone(),
            };
        }

        if snapshot.status.is_terminal() {
            let rejected = TerminalTransition {
                game_id: event.game_id,
                status: snapshot.status,
                kind: event.kind(),
                key: event.key,
            };
            warn!(game_id = event.game_id, "{}", rejected);
            return Applied {
                outcome: Outcome::Anomalous(rejected),
                snapshot: snapshot.clone(),
            };
        }

        match &event.payload {
            EventPayload::PlayerJoined { player } => {
                snapshot.add_player(*player);
                snapshot.resolve_turn();
            }
            EventPayload::NumberGenerated { number } => {
                snapshot.current_number = Some(*number);
                snapshot.status = GameStatus::Active;
            }
            EventPayload::MoveMade {
                player, new_number, ..
            } => {
                snapshot.add_player(*player);
                snapshot.current_number = Some(*new_number);
                snapshot.current_player = snapshot.opponent_of(player);
                snapshot.last_mover = Some(*player);
                snapshot.move_count += 1;
                snapshot.status = GameStatus::Active;
            }
            EventPayload::TimeoutHandled { player } => {
                snapshot.add_player(*player);
                let count = {
                    let count = snapshot.timeouts_by_player.entry(*player).or_insert(0);
                    *count += 1;
                    *count
                };
                let forfeited = count >= timeout_limit;

                let opponent = snapshot.opponent_of(player);
                snapshot.current_player = opponent;
                snapshot.last_mover = Some(*player);
                match (forfeited, opponent) {
                    (true, Some(winner)) => {
                        snapshot.status = GameStatus::Finished;
                        snapshot.winner = Some(winner);
                    }
                    (true, None) => {
                        // Stays open until GameFinished names the winner
                        warn!(
                            game_id = event.game_id,
                            player = %player,
                            timeouts = count,
                            "timeout limit reached with opponent unknown"
                        );
                    }
                    (false, _) => {}
                }
            }
            EventPayload::GameFinished { winner, loser } => {
                snapshot.add_player(*winner);
                snapshot.add_player(*loser);
                snapshot.status = GameStatus::Finished;
                snapshot.winner = Some(*winner);
                snapshot.current_player = None;
            }
            EventPayload::GameCancelled => {
                snapshot.status = GameStatus::Cancelled;
                snapshot.current_player = None;
            }
        }

        snapshot.last_applied = Some(event.key);
        debug!(
            game_id = event.game_id,
            key = %event.key,
            kind = %event.kind(),
            via = %event.via,
            status = %snapshot.status,
            "event applied"
        );

        Applied {
            outcome: Outcome::Applied,
            snapshot: snapshot.clone(),
        }
    }
}
