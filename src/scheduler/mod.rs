//! Polling scheduler.
//!
//! On a fixed period, asks the event source for every event since the last
//! confirmed block and hands them to the sync service, independently of any
//! push subscription. The cursor only moves past a block range once that
//! range was fetched successfully, so a failed tick is retried from the same
//! block on the next one (at-least-once; ranges are never skipped).
//!
//! The first tick starts `lookback_blocks` behind the head. Anything older is
//! not recoverable through this path.

use crate::anomaly::{Anomaly, AnomalyKind};
use crate::config::PollingConfig;
use crate::events::EventBatch;
use crate::source::{EventFilter, EventSource, SourceError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Watermark of blocks already fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    last_confirmed_block: Option<u64>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_confirmed_block(&self) -> Option<u64> {
        self.last_confirmed_block
    }

    /// Move forward to `block`. Never moves backwards.
    fn advance(&mut self, block: u64) {
        self.last_confirmed_block = Some(self.last_confirmed_block.map_or(block, |b| b.max(block)));
    }

    /// Explicit rewind (or clear, with `None`). The only way the cursor goes back.
    pub fn reset(&mut self, block: Option<u64>) {
        self.last_confirmed_block = block;
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub lookback_blocks: u64,
    pub max_block_range: u64,
    pub max_backoff: Duration,
}

impl From<&PollingConfig> for SchedulerConfig {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: config.interval().max(MIN_RETRY_DELAY),
            lookback_blocks: config.lookback_blocks,
            max_block_range: config.max_block_range.max(1),
            max_backoff: config.max_backoff(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

#[derive(Error, Debug)]
pub enum TickError {
    #[error(transparent)]
    Source(#[from] SourceError),
    /// The consumer went away; the loop should stop.
    #[error("event sink closed")]
    SinkClosed,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    /// Fetched `from_block..=to_block`.
    Fetched {
        from_block: u64,
        to_block: u64,
        events: usize,
        rejected: usize,
    },
    /// Head has not moved past the cursor.
    UpToDate { head: u64 },
    /// Head is below the cursor. Reported, cursor left alone.
    HeadRegressed { head: u64, cursor: u64 },
}

/// Side-channel from the poll loop to the sync service.
#[derive(Debug, Clone)]
pub enum PipelineNotice {
    TickCompleted { report: TickReport, elapsed: Duration },
    TickFailed { error: String, consecutive_failures: u32 },
    Anomaly(Anomaly),
}

/// Shortest wait between two fetch attempts.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Exponential backoff from `base`, doubling per consecutive failure, capped at `max`.
/// Never shorter than [`MIN_RETRY_DELAY`].
pub fn backoff_delay(base: Duration, consecutive_failures: u32, max: Duration) -> Duration {
    let base = base.max(MIN_RETRY_DELAY);
    let factor = 1u32 << consecutive_failures.min(16);
    base.saturating_mul(factor).min(max.max(base))
}

/// Drives periodic fetches for one event filter.
pub struct PollingScheduler {
    source: Arc<dyn EventSource>,
    filter: EventFilter,
    config: SchedulerConfig,
    cursor: Cursor,
    sink: mpsc::UnboundedSender<EventBatch>,
    notices: mpsc::UnboundedSender<PipelineNotice>,
    consecutive_failures: u32,
}

impl PollingScheduler {
    pub fn new(
        source: Arc<dyn EventSource>,
        filter: EventFilter,
        config: SchedulerConfig,
        sink: mpsc::UnboundedSender<EventBatch>,
        notices: mpsc::UnboundedSender<PipelineNotice>,
    ) -> Self {
        Self {
            source,
            filter,
            config,
            cursor: Cursor::new(),
            sink,
            notices,
            consecutive_failures: 0,
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    /// One poll: fetch everything between the cursor and the head, in
    /// `max_block_range` chunks, forwarding each chunk as a batch. The cursor
    /// moves past a chunk only after it was fetched and handed off.
    pub async fn tick(&mut self) -> Result<TickReport, TickError> {
        let head = self.source.chain_head().await?;

        let last = match self.cursor.last_confirmed_block() {
            Some(block) => block,
            None => {
                let start = head.saturating_sub(self.config.lookback_blocks);
                self.cursor.advance(start);
                info!(head, start, lookback = self.config.lookback_blocks, "poll cursor initialized");
                start
            }
        };

        if head < last {
            warn!(head, cursor = last, "chain head is behind the poll cursor");
            let anomaly = Anomaly::new(
                AnomalyKind::HeadRegression,
                None,
                format!("head {} below confirmed block {}", head, last),
            );
            let _ = self.notices.send(PipelineNotice::Anomaly(anomaly));
            return Ok(TickReport::HeadRegressed { head, cursor: last });
        }
        if head == last {
            return Ok(TickReport::UpToDate { head });
        }

        let first = last + 1;
        let mut from = first;
        let mut events = 0;
        let mut rejected = 0;

        while from <= head {
            let to = head.min(from.saturating_add(self.config.max_block_range.max(1) - 1));
            let fetched = self.source.fetch_events(&self.filter, from, to).await?;

            events += fetched.events.len();
            rejected += fetched.rejected.len();
            let batch = EventBatch::polled(fetched.events, fetched.rejected, to + 1);
            if self.sink.send(batch).is_err() {
                return Err(TickError::SinkClosed);
            }

            self.cursor.advance(to);
            from = to + 1;
        }

        debug!(from_block = first, to_block = head, events, rejected, "poll tick complete");
        Ok(TickReport::Fetched {
            from_block: first,
            to_block: head,
            events,
            rejected,
        })
    }

    /// Tick once and report the result on the notice channel. Returns the
    /// delay before the next tick, or `None` once the sink is closed.
    async fn step(&mut self) -> Option<(bool, Duration)> {
        let started = Instant::now();
        match self.tick().await {
            Ok(report) => {
                self.consecutive_failures = 0;
                let _ = self.notices.send(PipelineNotice::TickCompleted {
                    report,
                    elapsed: started.elapsed(),
                });
                Some((true, self.config.interval))
            }
            Err(TickError::SinkClosed) => None,
            Err(TickError::Source(e)) => {
                self.consecutive_failures += 1;
                let delay = backoff_delay(
                    self.config.interval,
                    self.consecutive_failures,
                    self.config.max_backoff,
                );
                warn!(
                    error = %e,
                    failures = self.consecutive_failures,
                    retry_in_ms = delay.as_millis() as u64,
                    cursor = ?self.cursor.last_confirmed_block(),
                    "poll tick failed"
                );
                let _ = self.notices.send(PipelineNotice::TickFailed {
                    error: e.to_string(),
                    consecutive_failures: self.consecutive_failures,
                });
                Some((false, delay))
            }
        }
    }

    /// Tick until one succeeds, backing off between failures. Returns false
    /// if the sink closed first.
    pub async fn catch_up(&mut self) -> bool {
        loop {
            match self.step().await {
                Some((true, _)) => return true,
                Some((false, delay)) => tokio::time::sleep(delay).await,
                None => return false,
            }
        }
    }

    /// Tick forever: `interval` between successful ticks, exponential
    /// backoff after failures. Returns once the sink is closed.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            games = ?self.filter.game_ids,
            "polling scheduler started"
        );

        loop {
            let delay = match self.step().await {
                Some((_, delay)) => delay,
                None => break,
            };
            if self.sink.is_closed() {
                break;
            }
            tokio::time::sleep(delay).await;
        }
        info!("event sink closed, polling scheduler stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeliveryPath, EventPayload, GameEvent, OrderingKey};
    use crate::source::mock::MockSource;

    fn config(lookback: u64, max_range: u64) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(3),
            lookback_blocks: lookback,
            max_block_range: max_range,
            max_backoff: Duration::from_secs(60),
        }
    }

    fn number(game_id: u64, block: u64) -> GameEvent {
        GameEvent::new(
            game_id,
            OrderingKey::new(block, 0),
            EventPayload::NumberGenerated { number: 42 },
            DeliveryPath::Poll,
        )
    }

    struct Harness {
        scheduler: PollingScheduler,
        batches: mpsc::UnboundedReceiver<EventBatch>,
        notices: mpsc::UnboundedReceiver<PipelineNotice>,
    }

    fn harness(source: Arc<MockSource>, config: SchedulerConfig) -> Harness {
        let (tx, batches) = mpsc::unbounded_channel();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let scheduler =
            PollingScheduler::new(source, EventFilter::all_kinds(vec![6]), config, tx, notice_tx);
        Harness {
            scheduler,
            batches,
            notices,
        }
    }

    #[tokio::test]
    async fn test_first_tick_starts_lookback_behind_head() {
        let source = MockSource::new(1_000);
        source.add_event(number(6, 850));
        source.add_event(number(6, 950));
        let mut h = harness(source.clone(), config(100, 2_000));

        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(
            report,
            TickReport::Fetched { from_block: 901, to_block: 1_000, events: 1, rejected: 0 }
        );
        assert_eq!(source.fetches(), vec![(901, 1_000)]);
        assert_eq!(h.scheduler.cursor().last_confirmed_block(), Some(1_000));

        let batch = h.batches.try_recv().unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].key.block_number, 950);
        assert_eq!(batch.fetch_floor, Some(1_001));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_cursor_and_retries_same_range() {
        let source = MockSource::new(200);
        let mut h = harness(source.clone(), config(100, 2_000));
        h.scheduler.tick().await.unwrap();
        assert_eq!(h.scheduler.cursor().last_confirmed_block(), Some(200));

        source.set_head(250);
        source.add_event(number(6, 220));
        source.fail_next_fetches(1);

        let err = h.scheduler.tick().await.unwrap_err();
        assert!(matches!(err, TickError::Source(SourceError::Unavailable(_))));
        assert_eq!(h.scheduler.cursor().last_confirmed_block(), Some(200));

        h.scheduler.tick().await.unwrap();
        assert_eq!(source.fetches(), vec![(101, 200), (201, 250), (201, 250)]);
        assert_eq!(h.scheduler.cursor().last_confirmed_block(), Some(250));

        let delivered: Vec<EventBatch> = std::iter::from_fn(|| h.batches.try_recv().ok()).collect();
        let events: usize = delivered.iter().map(|b| b.events.len()).sum();
        assert_eq!(events, 1);
    }

    #[tokio::test]
    async fn test_head_failure_leaves_cursor() {
        let source = MockSource::new(500);
        let mut h = harness(source.clone(), config(10, 2_000));
        h.scheduler.tick().await.unwrap();

        source.fail_head(true);
        source.set_head(600);
        assert!(h.scheduler.tick().await.is_err());
        assert_eq!(h.scheduler.cursor().last_confirmed_block(), Some(500));
    }

    #[tokio::test]
    async fn test_large_gaps_are_fetched_in_chunks() {
        let source = MockSource::new(1_000);
        let mut h = harness(source.clone(), config(250, 100));
        h.scheduler.tick().await.unwrap();
        assert_eq!(source.fetches(), vec![(751, 850), (851, 950), (951, 1_000)]);
        assert_eq!(h.batches.try_recv().unwrap().fetch_floor, Some(851));
    }

    #[tokio::test]
    async fn test_partial_chunk_failure_keeps_completed_progress() {
        let source = MockSource::new(1_000);
        let mut h = harness(source.clone(), config(0, 100));
        h.scheduler.tick().await.unwrap();
        assert_eq!(h.scheduler.cursor().last_confirmed_block(), Some(1_000));

        source.set_head(1_300);
        source.fail_from_block(Some(1_101));
        assert!(h.scheduler.tick().await.is_err());
        assert_eq!(h.scheduler.cursor().last_confirmed_block(), Some(1_100));

        source.fail_from_block(None);
        h.scheduler.tick().await.unwrap();
        assert_eq!(
            source.fetches(),
            vec![(1_001, 1_100), (1_101, 1_200), (1_101, 1_200), (1_201, 1_300)]
        );
        assert_eq!(h.scheduler.cursor().last_confirmed_block(), Some(1_300));
    }

    #[tokio::test]
    async fn test_head_regression_is_reported_not_rewound() {
        let source = MockSource::new(500);
        let mut h = harness(source.clone(), config(10, 2_000));
        h.scheduler.tick().await.unwrap();

        source.set_head(480);
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report, TickReport::HeadRegressed { head: 480, cursor: 500 });
        assert_eq!(h.scheduler.cursor().last_confirmed_block(), Some(500));

        match h.notices.try_recv().unwrap() {
            PipelineNotice::Anomaly(a) => assert_eq!(a.kind, AnomalyKind::HeadRegression),
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_up_to_date_fetches_nothing() {
        let source = MockSource::new(500);
        let mut h = harness(source.clone(), config(10, 2_000));
        h.scheduler.tick().await.unwrap();
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report, TickReport::UpToDate { head: 500 });
        assert_eq!(source.fetches().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_sink_stops_tick() {
        let source = MockSource::new(500);
        let mut h = harness(source, config(10, 2_000));
        drop(h.batches);
        assert!(matches!(h.scheduler.tick().await, Err(TickError::SinkClosed)));
        assert_eq!(h.scheduler.cursor().last_confirmed_block(), Some(490));
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_retries_until_success() {
        let source = MockSource::new(300);
        source.fail_next_fetches(2);
        let mut h = harness(source.clone(), config(100, 2_000));

        assert!(h.scheduler.catch_up().await);
        assert_eq!(source.fetches(), vec![(201, 300), (201, 300), (201, 300)]);

        let mut failed = 0;
        let mut completed = 0;
        while let Ok(notice) = h.notices.try_recv() {
            match notice {
                PipelineNotice::TickFailed { .. } => failed += 1,
                PipelineNotice::TickCompleted { .. } => completed += 1,
                PipelineNotice::Anomaly(_) => {}
            }
        }
        assert_eq!((failed, completed), (2, 1));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(3);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, 0, max), Duration::from_secs(3));
        assert_eq!(backoff_delay(base, 1, max), Duration::from_secs(6));
        assert_eq!(backoff_delay(base, 3, max), Duration::from_secs(24));
        assert_eq!(backoff_delay(base, 5, max), max);
        assert_eq!(backoff_delay(base, 40, max), max);
    }

    #[test]
    fn test_zero_interval_still_waits_between_retries() {
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(Duration::ZERO, 0, max), MIN_RETRY_DELAY);
        assert_eq!(backoff_delay(Duration::ZERO, 2, max), MIN_RETRY_DELAY * 4);
        assert_eq!(backoff_delay(Duration::ZERO, 1, Duration::ZERO), MIN_RETRY_DELAY);
    }
}
