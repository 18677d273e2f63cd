//! Event deduplication across delivery paths.
//!
//! Both the poller and the push subscription can hand us the same log: the
//! poller re-reads ranges after a failed tick, and a reconnected socket may
//! replay recent logs. The deduplicator remembers which identities it has
//! admitted so each one reaches the projector at most once. It says nothing
//! about ordering; the projector owns that.

use crate::events::{EventKind, GameEvent, OrderingKey};
use std::collections::{BTreeSet, HashMap};

/// Remembers admitted `(game_id, key, kind)` identities.
#[derive(Debug)]
pub struct Deduplicator {
    /// game_id → admitted (key, kind) pairs, ordered so eviction is a split.
    seen: HashMap<u64, BTreeSet<(OrderingKey, EventKind)>>,
    /// Blocks below the fetch floor whose keys are still retained.
    retention_blocks: u64,
}

impl Deduplicator {
    pub fn new(retention_blocks: u64) -> Self {
        Self {
            seen: HashMap::new(),
            retention_blocks,
        }
    }

    /// Returns true the first time an identity is presented, false after.
    pub fn admit(&mut self, event: &GameEvent) -> bool {
        self.seen
            .entry(event.game_id)
            .or_default()
            .insert((event.key, event.kind()))
    }

    /// Drop keys that can no longer recur. The poller never requests blocks
    /// below `fetch_floor` again; keys older than the retention window below
    /// it are released. Returns the number of keys dropped.
    pub fn evict_before(&mut self, fetch_floor: u64) -> usize {
        let cutoff = fetch_floor.saturating_sub(self.retention_blocks);
        if cutoff == 0 {
            return 0;
        }
        let boundary = (OrderingKey::new(cutoff, 0), EventKind::PlayerJoined);

        let mut dropped = 0;
        for keys in self.seen.values_mut() {
            let kept = keys.split_off(&boundary);
            dropped += keys.len();
            *keys = kept;
        }
        self.seen.retain(|_, keys| !keys.is_empty());
        dropped
    }

    /// Forget everything about a game (its last watcher went away).
    pub fn forget_game(&mut self, game_id: u64) {
        self.seen.remove(&game_id);
    }

    /// Number of identities currently remembered.
    pub fn len(&self) -> usize {
        self.seen.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
