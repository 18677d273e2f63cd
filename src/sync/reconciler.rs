//! Batch reconciliation: deduplicate, project, and say who needs to hear
//! about it. Synchronous and owned by the sync service task.
//!
//! Every admitted event is kept per game. When one arrives below the game's
//! last applied key (push ran ahead of the poller, or a WebSocket reconnect
//! skipped blocks) the snapshot is rebuilt from that history in key order,
//! so the result never depends on which path delivered what first.

use crate::anomaly::{Anomaly, AnomalyKind, AnomalyLog};
use crate::dedup::Deduplicator;
use crate::events::{EventBatch, GameEvent, OrderingKey};
use crate::metrics::SyncMetrics;
use crate::projector::{GameSnapshot, Outcome, Projector, TerminalTransition};
use alloy::primitives::Address;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// What a watcher receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum GameUpdate {
    /// The game's state after an event was applied.
    Snapshot(GameSnapshot),
    /// Something that did not fit the game's state machine.
    Anomaly(Anomaly),
}

/// Admitted events and seeded players for one game, enough to rebuild its
/// snapshot from scratch.
#[derive(Debug, Default)]
struct GameHistory {
    events: BTreeMap<OrderingKey, GameEvent>,
    seeded: Vec<Address>,
    /// Keys already reported as terminal transitions.
    reported: BTreeSet<OrderingKey>,
}

pub struct Reconciler {
    dedup: Deduplicator,
    projector: Projector,
    histories: HashMap<u64, GameHistory>,
    metrics: SyncMetrics,
    anomalies: AnomalyLog,
}

impl Reconciler {
    pub fn new(timeout_limit: u32, dedup_retention_blocks: u64) -> Self {
        Self {
            dedup: Deduplicator::new(dedup_retention_blocks),
            projector: Projector::new(timeout_limit),
            histories: HashMap::new(),
            metrics: SyncMetrics::new(),
            anomalies: AnomalyLog::new(),
        }
    }

    /// Fold a batch into the projection. Returns per-game updates in the
    /// order they happened.
    pub fn ingest(&mut self, mut batch: EventBatch) -> Vec<(u64, GameUpdate)> {
        self.metrics.record_batch(batch.via, batch.rejected.len());

        for rejected in &batch.rejected {
            self.anomalies.record(Anomaly::new(
                AnomalyKind::UndecodableLog,
                None,
                format!("{} via {}", rejected, batch.via),
            ));
        }

        batch.events.sort_by_key(|e| e.key);
        let mut updates = Vec::new();

        for event in &batch.events {
            let history = self.histories.entry(event.game_id).or_default();
            // The history catches replays the deduplicator already evicted
            if !self.dedup.admit(event) || history.events.contains_key(&event.key) {
                self.metrics.record_duplicate();
                debug!(game_id = event.game_id, key = %event.key, via = %event.via, "duplicate event dropped");
                continue;
            }
            history.events.insert(event.key, event.clone());

            let behind = self
                .projector
                .get(event.game_id)
                .and_then(|s| s.last_applied)
                .is_some_and(|last| event.key < last);
            if behind {
                info!(game_id = event.game_id, key = %event.key, via = %event.via, "late event, rebuilding snapshot");
                let (snapshot, transitions) = self.refold(event.game_id);
                self.metrics.record_refold(transitions.len());
                for transition in transitions {
                    updates.push((event.game_id, GameUpdate::Anomaly(self.report(transition))));
                }
                if let Some(snapshot) = snapshot {
                    updates.push((event.game_id, GameUpdate::Snapshot(snapshot)));
                }
                continue;
            }

            let applied = self.projector.apply(event);
            self.metrics.record_outcome(&applied.outcome);

            match applied.outcome {
                Outcome::Applied => {
                    debug!(event = %event, via = %event.via, status = %applied.snapshot.status, "event applied");
                    updates.push((event.game_id, GameUpdate::Snapshot(applied.snapshot)));
                }
                Outcome::Stale => {}
                Outcome::Anomalous(transition) => {
                    history.reported.insert(transition.key);
                    updates.push((event.game_id, GameUpdate::Anomaly(self.report(transition))));
                }
            }
        }

        if let Some(floor) = batch.fetch_floor {
            let evicted = self.dedup.evict_before(floor);
            if evicted > 0 {
                debug!(floor, evicted, "dedup keys evicted");
            }
        }

        updates
    }

    /// Rebuild a game's snapshot from its seeded players and every admitted
    /// event in key order. Returns the new snapshot and any terminal
    /// transitions not reported before.
    fn refold(&mut self, game_id: u64) -> (Option<GameSnapshot>, Vec<TerminalTransition>) {
        let Some(history) = self.histories.get_mut(&game_id) else {
            return (self.projector.get(game_id).cloned(), Vec::new());
        };

        self.projector.remove(game_id);
        if !history.seeded.is_empty() {
            self.projector.seed_players(game_id, &history.seeded);
        }

        let mut fresh = Vec::new();
        for event in history.events.values() {
            if let Outcome::Anomalous(transition) = self.projector.apply(event).outcome {
                if history.reported.insert(transition.key) {
                    fresh.push(transition);
                }
            }
        }

        (self.projector.get(game_id).cloned(), fresh)
    }

    fn report(&mut self, transition: TerminalTransition) -> Anomaly {
        let anomaly = Anomaly::new(
            AnomalyKind::TerminalTransition,
            Some(transition.game_id),
            transition.to_string(),
        );
        self.anomalies.record(anomaly.clone());
        anomaly
    }

    pub fn snapshot(&self, game_id: u64) -> Option<GameSnapshot> {
        self.projector.get(game_id).cloned()
    }

    pub fn seed_players(&mut self, game_id: u64, players: &[Address]) -> Option<GameSnapshot> {
        self.histories.entry(game_id).or_default().seeded = players.to_vec();
        self.projector.seed_players(game_id, players);
        self.snapshot(game_id)
    }

    /// Drop everything held for a game.
    pub fn forget(&mut self, game_id: u64) {
        self.projector.remove(game_id);
        self.histories.remove(&game_id);
        self.dedup.forget_game(game_id);
    }

    pub fn record_anomaly(&mut self, anomaly: Anomaly) {
        self.anomalies.record(anomaly);
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut SyncMetrics {
        &mut self.metrics
    }

    pub fn anomalies(&self) -> &AnomalyLog {
        &self.anomalies
    }

    pub fn tracked_games(&self) -> usize {
        self.projector.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeliveryPath, EventPayload, GameEvent, OrderingKey, RejectedLog};
    use crate::projector::GameStatus;
    use std::time::Duration;

    fn alice() -> Address {
        Address::repeat_byte(0xa1)
    }

    fn bob() -> Address {
        Address::repeat_byte(0xb0)
    }

    fn event(block: u64, index: u64, payload: EventPayload, via: DeliveryPath) -> GameEvent {
        GameEvent::new(6, OrderingKey::new(block, index), payload, via)
    }

    fn opening(via: DeliveryPath) -> Vec<GameEvent> {
        vec![
            event(100, 0, EventPayload::PlayerJoined { player: alice() }, via),
            event(100, 1, EventPayload::PlayerJoined { player: bob() }, via),
            event(100, 2, EventPayload::NumberGenerated { number: 42 }, via),
            event(
                101,
                0,
                EventPayload::MoveMade {
                    player: alice(),
                    subtraction: 1,
                    new_number: 41,
                },
                via,
            ),
        ]
    }

    fn last_snapshot(updates: &[(u64, GameUpdate)]) -> Option<GameSnapshot> {
        updates.iter().rev().find_map(|(_, u)| match u {
            GameUpdate::Snapshot(s) => Some(s.clone()),
            GameUpdate::Anomaly(_) => None,
        })
    }

    #[test]
    fn test_opening_sequence_projects_active_game() {
        let mut r = Reconciler::new(3, 256);
        let updates = r.ingest(EventBatch::polled(opening(DeliveryPath::Poll), vec![], 102));

        assert_eq!(updates.len(), 4);
        let snapshot = last_snapshot(&updates).unwrap();
        assert_eq!(snapshot.status, GameStatus::Active);
        assert_eq!(snapshot.current_number, Some(41));
        assert_eq!(snapshot.current_player, Some(bob()));
        assert_eq!(r.snapshot(6), Some(snapshot));
    }

    #[test]
    fn test_replaying_a_batch_changes_nothing() {
        let mut r = Reconciler::new(3, 256);
        r.ingest(EventBatch::polled(opening(DeliveryPath::Poll), vec![], 102));
        let before = r.snapshot(6);

        let updates = r.ingest(EventBatch::polled(opening(DeliveryPath::Poll), vec![], 102));
        assert!(updates.is_empty());
        assert_eq!(r.snapshot(6), before);
        assert_eq!(r.metrics().summary(Duration::from_secs(60)).duplicates, 4);
    }

    #[test]
    fn test_same_log_from_both_paths_is_applied_once() {
        let mut r = Reconciler::new(3, 256);
        let mv = |via| {
            event(
                101,
                0,
                EventPayload::MoveMade {
                    player: alice(),
                    subtraction: 1,
                    new_number: 41,
                },
                via,
            )
        };

        let polled = r.ingest(EventBatch::polled(vec![mv(DeliveryPath::Poll)], vec![], 102));
        let pushed = r.ingest(EventBatch::pushed(vec![mv(DeliveryPath::Push)], vec![]));
        assert_eq!(polled.len(), 1);
        assert!(pushed.is_empty());
        assert_eq!(r.snapshot(6).unwrap().move_count, 1);

        let m = r.metrics().summary(Duration::from_secs(60));
        assert_eq!((m.admitted, m.duplicates), (1, 1));
        assert_eq!((m.polled_batches, m.pushed_batches), (1, 1));
    }

    #[test]
    fn test_out_of_order_batch_is_sorted_before_applying() {
        let mut r = Reconciler::new(3, 256);
        let mut events = opening(DeliveryPath::Push);
        events.reverse();
        r.ingest(EventBatch::pushed(events, vec![]));

        let snapshot = r.snapshot(6).unwrap();
        assert_eq!(snapshot.current_number, Some(41));
        assert_eq!(snapshot.players, vec![alice(), bob()]);
        assert_eq!(r.metrics().summary(Duration::from_secs(60)).stale, 0);
    }

    #[test]
    fn test_late_older_event_rebuilds_snapshot() {
        let mut in_order = Reconciler::new(3, 256);
        in_order.ingest(EventBatch::polled(opening(DeliveryPath::Poll), vec![], 102));

        let mut r = Reconciler::new(3, 256);
        r.ingest(EventBatch::pushed(opening(DeliveryPath::Push)[2..].to_vec(), vec![]));
        let updates = r.ingest(EventBatch::polled(opening(DeliveryPath::Poll)[..2].to_vec(), vec![], 102));

        assert_eq!(updates.len(), 2);
        assert_eq!(last_snapshot(&updates), in_order.snapshot(6));
        assert_eq!(r.snapshot(6).unwrap().players, vec![alice(), bob()]);

        let m = r.metrics().summary(Duration::from_secs(60));
        assert_eq!((m.refolds, m.stale, m.admitted), (2, 0, 4));
    }

    #[test]
    fn test_block_skipped_by_push_is_recovered_by_poll() {
        let timeout = event(102, 0, EventPayload::TimeoutHandled { player: bob() }, DeliveryPath::Poll);
        let next_move = |via| {
            event(
                103,
                0,
                EventPayload::MoveMade {
                    player: alice(),
                    subtraction: 2,
                    new_number: 39,
                },
                via,
            )
        };

        let mut r = Reconciler::new(3, 256);
        r.ingest(EventBatch::polled(opening(DeliveryPath::Poll), vec![], 102));
        // Push only saw block 103
        r.ingest(EventBatch::pushed(vec![next_move(DeliveryPath::Push)], vec![]));
        r.ingest(EventBatch::polled(vec![timeout, next_move(DeliveryPath::Poll)], vec![], 104));

        let snapshot = r.snapshot(6).unwrap();
        assert_eq!(snapshot.timeouts_by_player.get(&bob()), Some(&1));
        assert_eq!(snapshot.move_count, 2);
        assert_eq!(snapshot.current_number, Some(39));
        assert_eq!(snapshot.current_player, Some(bob()));
        assert_eq!(snapshot.last_applied, Some(OrderingKey::new(103, 0)));
    }

    #[test]
    fn test_rebuild_keeps_seeded_players() {
        let mv = |block, player, new_number| {
            event(
                block,
                0,
                EventPayload::MoveMade {
                    player,
                    subtraction: 1,
                    new_number,
                },
                DeliveryPath::Push,
            )
        };

        let mut r = Reconciler::new(3, 256);
        r.seed_players(6, &[alice(), bob()]);
        r.ingest(EventBatch::pushed(vec![mv(500, bob(), 10)], vec![]));
        r.ingest(EventBatch::polled(vec![mv(499, alice(), 11)], vec![], 501));

        let snapshot = r.snapshot(6).unwrap();
        assert_eq!(snapshot.players, vec![alice(), bob()]);
        assert_eq!(snapshot.move_count, 2);
        assert_eq!(snapshot.current_number, Some(10));
        assert_eq!(snapshot.current_player, Some(alice()));
    }

    fn full_game(via: DeliveryPath) -> Vec<GameEvent> {
        let mut events = opening(via);
        events.extend([
            event(102, 0, EventPayload::TimeoutHandled { player: bob() }, via),
            event(
                103,
                0,
                EventPayload::MoveMade {
                    player: alice(),
                    subtraction: 3,
                    new_number: 38,
                },
                via,
            ),
            event(
                104,
                3,
                EventPayload::MoveMade {
                    player: bob(),
                    subtraction: 2,
                    new_number: 36,
                },
                via,
            ),
            event(
                105,
                1,
                EventPayload::GameFinished {
                    winner: alice(),
                    loser: bob(),
                },
                via,
            ),
        ]);
        events
    }

    fn deliver(r: &mut Reconciler, via: DeliveryPath, picks: &[usize]) {
        let history = full_game(via);
        let events = picks.iter().map(|i| history[*i].clone()).collect();
        let batch = match via {
            DeliveryPath::Poll => EventBatch::polled(events, vec![], 106),
            DeliveryPath::Push => EventBatch::pushed(events, vec![]),
        };
        r.ingest(batch);
    }

    #[test]
    fn test_any_interleaving_matches_in_order_application() {
        use DeliveryPath::{Poll, Push};

        let mut reference = Reconciler::new(3, 256);
        reference.ingest(EventBatch::polled(full_game(Poll), vec![], 106));
        let expected = reference.snapshot(6).unwrap();
        assert_eq!(expected.status, GameStatus::Finished);
        assert_eq!(expected.winner, Some(alice()));
        assert_eq!(expected.move_count, 3);

        let schedules: Vec<Vec<(DeliveryPath, Vec<usize>)>> = vec![
            vec![(Push, vec![5, 6, 7]), (Poll, (0..8).collect())],
            vec![
                (Push, vec![3]),
                (Push, vec![7]),
                (Poll, vec![0, 1, 2]),
                (Push, vec![4, 5]),
                (Poll, vec![3, 4, 5, 6, 7]),
            ],
            vec![(Push, vec![7, 6, 5, 4, 3, 2, 1, 0])],
            vec![
                (Poll, vec![0, 1]),
                (Push, vec![6]),
                (Push, vec![2, 2]),
                (Poll, vec![2, 3, 4, 5]),
                (Push, vec![3, 7]),
                (Poll, vec![5, 6, 7]),
            ],
            vec![
                (Push, vec![4]),
                (Push, vec![1]),
                (Push, vec![7]),
                (Push, vec![0]),
                (Push, vec![6]),
                (Push, vec![3]),
                (Push, vec![5]),
                (Push, vec![2]),
                (Poll, (0..8).collect()),
            ],
        ];

        // Zero retention forces replays past the deduplicator
        for retention in [256, 0] {
            for (n, schedule) in schedules.iter().enumerate() {
                let mut r = Reconciler::new(3, retention);
                for (via, picks) in schedule {
                    deliver(&mut r, *via, picks);
                }
                assert_eq!(
                    r.snapshot(6).as_ref(),
                    Some(&expected),
                    "schedule {} with retention {}",
                    n,
                    retention
                );
                assert_eq!(r.anomalies().for_game(6).len(), 0, "schedule {}", n);
            }
        }
    }

    #[test]
    fn test_event_after_finish_is_reported_to_watchers() {
        let mut r = Reconciler::new(3, 256);
        r.ingest(EventBatch::polled(opening(DeliveryPath::Poll), vec![], 102));
        r.ingest(EventBatch::pushed(
            vec![event(
                102,
                0,
                EventPayload::GameFinished {
                    winner: bob(),
                    loser: alice(),
                },
                DeliveryPath::Push,
            )],
            vec![],
        ));
        let finished = r.snapshot(6).unwrap();

        let updates = r.ingest(EventBatch::pushed(
            vec![event(103, 0, EventPayload::NumberGenerated { number: 7 }, DeliveryPath::Push)],
            vec![],
        ));
        assert_eq!(updates.len(), 1);
        match &updates[0].1 {
            GameUpdate::Anomaly(a) => {
                assert_eq!(a.kind, AnomalyKind::TerminalTransition);
                assert_eq!(a.game_id, Some(6));
            }
            other => panic!("expected anomaly, got {:?}", other),
        }
        assert_eq!(r.snapshot(6), Some(finished));
        assert_eq!(r.anomalies().for_game(6).len(), 1);
    }

    #[test]
    fn test_rejected_logs_are_recorded() {
        let mut r = Reconciler::new(3, 256);
        let updates = r.ingest(EventBatch::polled(
            vec![],
            vec![RejectedLog {
                key: Some(OrderingKey::new(50, 3)),
                reason: "unrecognised event topic".to_string(),
            }],
            51,
        ));
        assert!(updates.is_empty());
        let recent = r.anomalies().recent(1);
        assert_eq!(recent[0].kind, AnomalyKind::UndecodableLog);
        assert_eq!(r.metrics().summary(Duration::from_secs(60)).rejected_logs, 1);
    }

    #[test]
    fn test_forget_drops_game_state() {
        let mut r = Reconciler::new(3, 256);
        r.ingest(EventBatch::polled(opening(DeliveryPath::Poll), vec![], 102));
        r.forget(6);
        assert!(r.snapshot(6).is_none());
        assert_eq!(r.tracked_games(), 0);

        // History is re-derived from scratch after a re-watch
        let updates = r.ingest(EventBatch::polled(opening(DeliveryPath::Poll), vec![], 102));
        assert_eq!(updates.len(), 4);
    }
}
