//! Typed game events observed on the ZeroSum contract.
//!
//! Every log the adapter decodes becomes a [`GameEvent`]: a game id, the
//! `(blockNumber, logIndex)` ordering key, and a tagged payload with one
//! variant per contract event. Payloads are matched exhaustively by the
//! projector, so adding a contract event means adding a variant here.

use alloy::primitives::Address;
use serde::Serialize;

/// Position of a log in the chain: block number, then log index in the block.
///
/// Derived ordering is lexicographic, which is the chain's total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct OrderingKey {
    pub block_number: u64,
    pub log_index: u64,
}

impl OrderingKey {
    pub const fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

impl std::fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// Which path delivered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    Poll,
    Push,
}

impl std::fmt::Display for DeliveryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryPath::Poll => write!(f, "poll"),
            DeliveryPath::Push => write!(f, "push"),
        }
    }
}

/// Contract event kinds the sync layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EventKind {
    PlayerJoined,
    MoveMade,
    GameFinished,
    NumberGenerated,
    TimeoutHandled,
    GameCancelled,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::PlayerJoined,
        EventKind::MoveMade,
        EventKind::GameFinished,
        EventKind::NumberGenerated,
        EventKind::TimeoutHandled,
        EventKind::GameCancelled,
    ];

    /// Kinds that end a game.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::GameFinished | EventKind::GameCancelled)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::PlayerJoined => write!(f, "PlayerJoined"),
            EventKind::MoveMade => write!(f, "MoveMade"),
            EventKind::GameFinished => write!(f, "GameFinished"),
            EventKind::NumberGenerated => write!(f, "NumberGenerated"),
            EventKind::TimeoutHandled => write!(f, "TimeoutHandled"),
            EventKind::GameCancelled => write!(f, "GameCancelled"),
        }
    }
}

/// Kind-specific event fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventPayload {
    /// A player entered the game.
    PlayerJoined { player: Address },
    /// The contract drew the starting number.
    NumberGenerated { number: u64 },
    /// `player` subtracted `subtraction`, leaving `new_number`.
    MoveMade {
        player: Address,
        subtraction: u64,
        new_number: u64,
    },
    GameFinished { winner: Address, loser: Address },
    /// `player` let their turn clock run out.
    TimeoutHandled { player: Address },
    GameCancelled,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PlayerJoined { .. } => EventKind::PlayerJoined,
            EventPayload::NumberGenerated { .. } => EventKind::NumberGenerated,
            EventPayload::MoveMade { .. } => EventKind::MoveMade,
            EventPayload::GameFinished { .. } => EventKind::GameFinished,
            EventPayload::TimeoutHandled { .. } => EventKind::TimeoutHandled,
            EventPayload::GameCancelled => EventKind::GameCancelled,
        }
    }
}

/// A single observed contract event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameEvent {
    pub game_id: u64,
    pub key: OrderingKey,
    pub payload: EventPayload,
    pub via: DeliveryPath,
}

/// Uniqueness key of an event: the same log seen twice has the same identity
/// regardless of the path that delivered it.
pub type EventIdentity = (u64, OrderingKey, EventKind);

impl GameEvent {
    pub fn new(game_id: u64, key: OrderingKey, payload: EventPayload, via: DeliveryPath) -> Self {
        Self {
            game_id,
            key,
            payload,
            via,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn identity(&self) -> EventIdentity {
        (self.game_id, self.key, self.kind())
    }
}

impl std::fmt::Display for GameEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            EventPayload::PlayerJoined { player } => {
                write!(f, "PlayerJoined(game={}, player={}, at={})", self.game_id, player, self.key)
            }
            EventPayload::NumberGenerated { number } => {
                write!(f, "NumberGenerated(game={}, number={}, at={})", self.game_id, number, self.key)
            }
            EventPayload::MoveMade {
                subtraction,
                new_number,
                ..
            } => write!(
                f,
                "MoveMade(game={}, -{} -> {}, at={})",
                self.game_id, subtraction, new_number, self.key
            ),
            EventPayload::GameFinished { winner, .. } => {
                write!(f, "GameFinished(game={}, winner={}, at={})", self.game_id, winner, self.key)
            }
            EventPayload::TimeoutHandled { player } => {
                write!(f, "TimeoutHandled(game={}, player={}, at={})", self.game_id, player, self.key)
            }
            EventPayload::GameCancelled => {
                write!(f, "GameCancelled(game={}, at={})", self.game_id, self.key)
            }
        }
    }
}

/// A log that matched the filter but could not be turned into a [`GameEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLog {
    pub key: Option<OrderingKey>,
    pub reason: String,
}

impl std::fmt::Display for RejectedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.key {
            Some(key) => write!(f, "log at {}: {}", key, self.reason),
            None => write!(f, "log (pending): {}", self.reason),
        }
    }
}

/// A group of events delivered together by one path.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub via: DeliveryPath,
    pub events: Vec<GameEvent>,
    pub rejected: Vec<RejectedLog>,
    /// Lowest block the poller will ever request again, when known.
    /// Keys below it cannot recur through the poll path.
    pub fetch_floor: Option<u64>,
}

impl EventBatch {
    pub fn polled(events: Vec<GameEvent>, rejected: Vec<RejectedLog>, fetch_floor: u64) -> Self {
        Self {
            via: DeliveryPath::Poll,
            events,
            rejected,
            fetch_floor: Some(fetch_floor),
        }
    }

    pub fn pushed(events: Vec<GameEvent>, rejected: Vec<RejectedLog>) -> Self {
        Self {
            via: DeliveryPath::Push,
            events,
            rejected,
            fetch_floor: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.rejected.is_empty()
    }
}
