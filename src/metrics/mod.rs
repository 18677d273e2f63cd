//! Sync pipeline metrics.
//!
//! Counts what came through each delivery path and what the deduplicator
//! and projector made of it, plus poll tick latency over a rolling window.

use crate::events::DeliveryPath;
use crate::projector::Outcome;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::info;

/// Maximum tick latency samples kept.
const MAX_HISTORY: usize = 1000;

#[derive(Debug, Clone)]
struct TickSample {
    latency: Duration,
    recorded_at: Instant,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub polled_batches: u64,
    pub pushed_batches: u64,
    pub admitted: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub refolds: u64,
    pub anomalous: u64,
    pub rejected_logs: u64,
    pub tick_failures: u64,
    pub dropped_updates: u64,
    pub ticks: usize,
    pub avg_tick_ms: f64,
    pub max_tick_ms: f64,
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    polled_batches: u64,
    pushed_batches: u64,
    admitted: u64,
    duplicates: u64,
    stale: u64,
    refolds: u64,
    anomalous: u64,
    rejected_logs: u64,
    tick_failures: u64,
    dropped_updates: u64,
    ticks: VecDeque<TickSample>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&mut self, via: DeliveryPath, rejected: usize) {
        match via {
            DeliveryPath::Poll => self.polled_batches += 1,
            DeliveryPath::Push => self.pushed_batches += 1,
        }
        self.rejected_logs += rejected as u64;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates += 1;
    }

    /// Count an admitted event by what the projector did with it.
    pub fn record_outcome(&mut self, outcome: &Outcome) {
        self.admitted += 1;
        match outcome {
            Outcome::Applied => {}
            Outcome::Stale => self.stale += 1,
            Outcome::Anomalous(_) => self.anomalous += 1,
        }
    }

    /// An admitted event landed below its game's last applied key and the
    /// snapshot was rebuilt. `anomalies` counts transitions the rebuild
    /// newly uncovered.
    pub fn record_refold(&mut self, anomalies: usize) {
        self.admitted += 1;
        self.refolds += 1;
        self.anomalous += anomalies as u64;
    }

    /// A watcher's buffer was full and an update was not delivered.
    pub fn record_dropped_update(&mut self) {
        self.dropped_updates += 1;
    }

    pub fn record_tick(&mut self, latency: Duration) {
        if self.ticks.len() >= MAX_HISTORY {
            self.ticks.pop_front();
        }
        self.ticks.push_back(TickSample {
            latency,
            recorded_at: Instant::now(),
        });
    }

    pub fn record_tick_failure(&mut self) {
        self.tick_failures += 1;
    }

    /// Counters plus tick latency over the last `window`.
    pub fn summary(&self, window: Duration) -> MetricsSummary {
        let cutoff = Instant::now().checked_sub(window);
        let recent: Vec<f64> = self
            .ticks
            .iter()
            .filter(|t| cutoff.is_none_or(|c| t.recorded_at >= c))
            .map(|t| t.latency.as_secs_f64() * 1000.0)
            .collect();

        let avg_tick_ms = if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<f64>() / recent.len() as f64
        };
        let max_tick_ms = recent.iter().copied().fold(0.0, f64::max);

        MetricsSummary {
            polled_batches: self.polled_batches,
            pushed_batches: self.pushed_batches,
            admitted: self.admitted,
            duplicates: self.duplicates,
            stale: self.stale,
            refolds: self.refolds,
            anomalous: self.anomalous,
            rejected_logs: self.rejected_logs,
            tick_failures: self.tick_failures,
            dropped_updates: self.dropped_updates,
            ticks: recent.len(),
            avg_tick_ms,
            max_tick_ms,
        }
    }

    /// Log a summary (called periodically).
    pub fn log_summary(&self) {
        let m = self.summary(Duration::from_secs(300));
        info!(
            polled = m.polled_batches,
            pushed = m.pushed_batches,
            admitted = m.admitted,
            duplicates = m.duplicates,
            stale = m.stale,
            refolds = m.refolds,
            anomalous = m.anomalous,
            rejected = m.rejected_logs,
            tick_failures = m.tick_failures,
            dropped_updates = m.dropped_updates,
            tick_latency_5m = format!("{:.1}ms", m.avg_tick_ms),
            "sync metrics"
        );
    }
}
