//! Sync service: the process-scoped owner of the reconciliation state.
//!
//! One task owns the deduplicator, projector, metrics, anomaly log and the
//! watcher registry. Everything reaches it through channels, so nothing is
//! locked. A single pipeline (poll loop plus push subscription) covers every
//! watched game; it is started by the first watcher, rebuilt with a new
//! filter when the watched set changes, and torn down with the last watcher.
//! Rebuilding swaps the batch channel, so batches still in flight from the
//! old pipeline are discarded with its receiver.
//!
//! Each watcher gets a bounded buffer (`watch.update_buffer`). A watcher that
//! stops draining loses updates once it is full; every snapshot is complete,
//! so `SyncHandle::snapshot` resynchronises it. Batch and notice channels stay
//! unbounded: the service drains them continuously and a poll tick emits at
//! most one batch per block chunk.
//!
//! Consumer API:
//! - `SyncHandle::watch_game` → `GameWatch`, unsubscribes on drop
//! - `SyncHandle::on_game_update` → `CallbackGuard`, same with a callback
//! - `SyncHandle::snapshot`, `metrics`, `anomalies` for point reads

pub mod reconciler;

pub use reconciler::{GameUpdate, Reconciler};

use crate::anomaly::Anomaly;
use crate::config::Config;
use crate::events::EventBatch;
use crate::metrics::MetricsSummary;
use crate::projector::GameSnapshot;
use crate::scheduler::{PipelineNotice, PollingScheduler, SchedulerConfig};
use crate::source::{EventFilter, EventSource, SourceError};
use crate::stats::StatsReader;
use alloy::primitives::Address;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync service is not running")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub scheduler: SchedulerConfig,
    pub timeout_limit: u32,
    pub dedup_retention_blocks: u64,
    /// Updates queued per watcher before new ones are dropped for it.
    pub update_buffer: usize,
}

impl From<&Config> for SyncSettings {
    fn from(config: &Config) -> Self {
        Self {
            scheduler: SchedulerConfig::from(&config.polling),
            timeout_limit: config.game.timeout_limit,
            dedup_retention_blocks: config.polling.dedup_retention_blocks,
            update_buffer: config.watch.update_buffer.max(1),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

enum Command {
    Watch {
        game_id: u64,
        watcher_id: u64,
        updates: mpsc::Sender<GameUpdate>,
    },
    Unwatch {
        game_id: u64,
        watcher_id: u64,
    },
    Snapshot {
        game_id: u64,
        reply: oneshot::Sender<Option<GameSnapshot>>,
    },
    Metrics {
        reply: oneshot::Sender<MetricsSummary>,
    },
    Anomalies {
        limit: usize,
        reply: oneshot::Sender<Vec<Anomaly>>,
    },
}

/// Cheap, cloneable handle to the sync service.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_watcher: Arc<AtomicU64>,
    update_buffer: usize,
}

impl SyncHandle {
    /// Start the service task. It stops once every handle and watch is dropped.
    pub fn spawn(
        source: Arc<dyn EventSource>,
        reader: Option<Arc<dyn StatsReader>>,
        settings: SyncSettings,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (seed_tx, seeds) = mpsc::unbounded_channel();
        let update_buffer = settings.update_buffer.max(1);

        let service = SyncService {
            reconciler: Reconciler::new(settings.timeout_limit, settings.dedup_retention_blocks),
            source,
            reader,
            settings,
            watchers: HashMap::new(),
            pipeline: None,
            commands,
            seed_tx,
            seeds,
        };
        let task = tokio::spawn(service.run());

        (
            SyncHandle {
                commands: commands_tx,
                next_watcher: Arc::new(AtomicU64::new(1)),
                update_buffer,
            },
            task,
        )
    }

    /// Follow a game. The current snapshot, if any, is delivered first.
    /// Updates that arrive while the watch's buffer is full are dropped.
    pub fn watch_game(&self, game_id: u64) -> Result<GameWatch, SyncError> {
        let watcher_id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        let (tx, updates) = mpsc::channel(self.update_buffer);
        self.commands
            .send(Command::Watch {
                game_id,
                watcher_id,
                updates: tx,
            })
            .map_err(|_| SyncError::Closed)?;

        Ok(GameWatch {
            game_id,
            watcher_id,
            updates,
            commands: self.commands.clone(),
        })
    }

    /// Call `callback` for every update of a game until the guard is dropped.
    pub fn on_game_update<F>(&self, game_id: u64, mut callback: F) -> Result<CallbackGuard, SyncError>
    where
        F: FnMut(GameUpdate) + Send + 'static,
    {
        let mut watch = self.watch_game(game_id)?;
        let task = tokio::spawn(async move {
            while let Some(update) = watch.recv().await {
                callback(update);
            }
        });
        Ok(CallbackGuard { task })
    }

    pub async fn snapshot(&self, game_id: u64) -> Result<Option<GameSnapshot>, SyncError> {
        self.request(|reply| Command::Snapshot { game_id, reply }).await
    }

    pub async fn metrics(&self) -> Result<MetricsSummary, SyncError> {
        self.request(|reply| Command::Metrics { reply }).await
    }

    pub async fn anomalies(&self, limit: usize) -> Result<Vec<Anomaly>, SyncError> {
        self.request(|reply| Command::Anomalies { limit, reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}

/// Subscription to one game's updates. Dropping it unsubscribes.
pub struct GameWatch {
    game_id: u64,
    watcher_id: u64,
    updates: mpsc::Receiver<GameUpdate>,
    commands: mpsc::UnboundedSender<Command>,
}

impl GameWatch {
    pub fn game_id(&self) -> u64 {
        self.game_id
    }

    /// Next update. `None` once the service has stopped.
    pub async fn recv(&mut self) -> Option<GameUpdate> {
        self.updates.recv().await
    }

    pub fn try_recv(&mut self) -> Option<GameUpdate> {
        self.updates.try_recv().ok()
    }
}

impl Drop for GameWatch {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unwatch {
            game_id: self.game_id,
            watcher_id: self.watcher_id,
        });
    }
}

/// Keeps an `on_game_update` callback registered.
pub struct CallbackGuard {
    task: JoinHandle<()>,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A running poll loop and push subscription for a set of games.
struct Pipeline {
    game_ids: Vec<u64>,
    batches: mpsc::UnboundedReceiver<EventBatch>,
    notices: mpsc::UnboundedReceiver<PipelineNotice>,
    task: JoinHandle<()>,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum PipelineEvent {
    Batch(EventBatch),
    Notice(PipelineNotice),
}

async fn next_pipeline_event(pipeline: &mut Option<Pipeline>) -> Option<PipelineEvent> {
    let Some(pipeline) = pipeline else {
        return std::future::pending().await;
    };
    tokio::select! {
        Some(batch) = pipeline.batches.recv() => Some(PipelineEvent::Batch(batch)),
        Some(notice) = pipeline.notices.recv() => Some(PipelineEvent::Notice(notice)),
        else => None,
    }
}

/// Catch up by polling first, then subscribe and keep polling alongside.
/// Pushes that skip blocks are repaired by the reconciler once the poller
/// delivers them.
async fn run_pipeline(
    source: Arc<dyn EventSource>,
    filter: EventFilter,
    config: SchedulerConfig,
    batches: mpsc::UnboundedSender<EventBatch>,
    notices: mpsc::UnboundedSender<PipelineNotice>,
) {
    let mut scheduler =
        PollingScheduler::new(source.clone(), filter.clone(), config, batches.clone(), notices);
    if !scheduler.catch_up().await {
        return;
    }

    let _subscription = match source.subscribe(filter, batches).await {
        Ok(subscription) => Some(subscription),
        Err(SourceError::PushUnsupported) => {
            info!("push delivery not available, running poll-only");
            None
        }
        Err(e) => {
            warn!(error = %e, "push subscription failed, running poll-only");
            None
        }
    };

    scheduler.run().await;
}

struct SyncService {
    reconciler: Reconciler,
    source: Arc<dyn EventSource>,
    reader: Option<Arc<dyn StatsReader>>,
    settings: SyncSettings,
    /// game id → watcher id → update channel
    watchers: HashMap<u64, HashMap<u64, mpsc::Sender<GameUpdate>>>,
    pipeline: Option<Pipeline>,
    commands: mpsc::UnboundedReceiver<Command>,
    seed_tx: mpsc::UnboundedSender<(u64, Vec<Address>)>,
    seeds: mpsc::UnboundedReceiver<(u64, Vec<Address>)>,
}

impl SyncService {
    async fn run(mut self) {
        info!(
            timeout_limit = self.settings.timeout_limit,
            lookback = self.settings.scheduler.lookback_blocks,
            "sync service started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = next_pipeline_event(&mut self.pipeline) => match event {
                    PipelineEvent::Batch(batch) => self.handle_batch(batch),
                    PipelineEvent::Notice(notice) => self.handle_notice(notice),
                },
                Some((game_id, players)) = self.seeds.recv() => self.handle_seed(game_id, players),
            }
        }

        self.pipeline = None;
        self.reconciler.metrics().log_summary();
        info!("sync service stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Watch {
                game_id,
                watcher_id,
                updates,
            } => self.watch(game_id, watcher_id, updates),
            Command::Unwatch {
                game_id,
                watcher_id,
            } => self.unwatch(game_id, watcher_id),
            Command::Snapshot { game_id, reply } => {
                let _ = reply.send(self.reconciler.snapshot(game_id));
            }
            Command::Metrics { reply } => {
                let _ = reply.send(self.reconciler.metrics().summary(Duration::from_secs(300)));
            }
            Command::Anomalies { limit, reply } => {
                let _ = reply.send(self.reconciler.anomalies().recent(limit));
            }
        }
    }

    fn watch(&mut self, game_id: u64, watcher_id: u64, updates: mpsc::Sender<GameUpdate>) {
        if let Some(snapshot) = self.reconciler.snapshot(game_id) {
            let _ = updates.try_send(GameUpdate::Snapshot(snapshot));
        }

        let first = !self.watchers.contains_key(&game_id);
        self.watchers.entry(game_id).or_default().insert(watcher_id, updates);
        debug!(game_id, watcher_id, "watcher added");

        if first {
            info!(game_id, watched = self.watchers.len(), "game watched");
            self.request_players(game_id);
            self.rebuild_pipeline();
        }
    }

    fn unwatch(&mut self, game_id: u64, watcher_id: u64) {
        let Some(game_watchers) = self.watchers.get_mut(&game_id) else {
            return;
        };
        game_watchers.remove(&watcher_id);
        debug!(game_id, watcher_id, "watcher removed");

        if game_watchers.is_empty() {
            self.watchers.remove(&game_id);
            self.reconciler.forget(game_id);
            info!(game_id, watched = self.watchers.len(), "game no longer watched");
            self.rebuild_pipeline();
        }
    }

    /// Replace the pipeline with one covering exactly the watched games.
    fn rebuild_pipeline(&mut self) {
        if let Some(old) = self.pipeline.take() {
            debug!(games = ?old.game_ids, "pipeline stopped");
        }

        let mut game_ids: Vec<u64> = self.watchers.keys().copied().collect();
        if game_ids.is_empty() {
            info!("no watched games, pipeline idle");
            return;
        }
        game_ids.sort_unstable();

        let (batch_tx, batches) = mpsc::unbounded_channel();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_pipeline(
            self.source.clone(),
            EventFilter::all_kinds(game_ids.clone()),
            self.settings.scheduler.clone(),
            batch_tx,
            notice_tx,
        ));

        info!(games = ?game_ids, "pipeline started");
        self.pipeline = Some(Pipeline {
            game_ids,
            batches,
            notices,
            task,
        });
    }

    /// Ask the contract for a game's players in the background. Covers games
    /// whose joins are older than the lookback window.
    fn request_players(&self, game_id: u64) {
        let Some(reader) = self.reader.clone() else {
            return;
        };
        let seed_tx = self.seed_tx.clone();
        tokio::spawn(async move {
            match reader.players(game_id).await {
                Ok(players) if !players.is_empty() => {
                    let _ = seed_tx.send((game_id, players));
                }
                Ok(_) => {}
                Err(e) => warn!(game_id, error = %e, "failed to read game players"),
            }
        });
    }

    fn handle_seed(&mut self, game_id: u64, players: Vec<Address>) {
        if !self.watchers.contains_key(&game_id) {
            return;
        }
        if let Some(snapshot) = self.reconciler.seed_players(game_id, &players) {
            debug!(game_id, players = snapshot.players.len(), "players seeded");
            self.dispatch(game_id, GameUpdate::Snapshot(snapshot));
        }
    }

    fn handle_batch(&mut self, mut batch: EventBatch) {
        batch.events.retain(|e| self.watchers.contains_key(&e.game_id));
        for (game_id, update) in self.reconciler.ingest(batch) {
            self.dispatch(game_id, update);
        }
    }

    fn handle_notice(&mut self, notice: PipelineNotice) {
        match notice {
            PipelineNotice::TickCompleted { elapsed, .. } => {
                self.reconciler.metrics_mut().record_tick(elapsed);
            }
            PipelineNotice::TickFailed { .. } => {
                self.reconciler.metrics_mut().record_tick_failure();
            }
            PipelineNotice::Anomaly(anomaly) => {
                self.reconciler.record_anomaly(anomaly.clone());
                let game_ids: Vec<u64> = self.watchers.keys().copied().collect();
                for game_id in game_ids {
                    self.dispatch(game_id, GameUpdate::Anomaly(anomaly.clone()));
                }
            }
        }
    }

    fn dispatch(&mut self, game_id: u64, update: GameUpdate) {
        let Some(game_watchers) = self.watchers.get_mut(&game_id) else {
            return;
        };
        let mut dropped = 0;
        game_watchers.retain(|watcher_id, tx| match tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(game_id, watcher_id, "watcher lagging, update dropped");
                dropped += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        for _ in 0..dropped {
            self.reconciler.metrics_mut().record_dropped_update();
        }
    }
}
