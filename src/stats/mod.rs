//! Per-player stats cache.
//!
//! Wins, losses, native balance and staked amount are read in parallel on
//! each refresh. A refresh either replaces an entry wholesale or leaves it
//! alone: a partial failure never mixes fresh and old values, it only
//! records the attempt. Runs on its own timer, unrelated to event polling.

pub mod reader;

pub use reader::{RpcStatsReader, StatsReader};

use crate::anomaly::{Anomaly, AnomalyKind, AnomalyLog};
use crate::source::SourceError;
use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsValues {
    pub wins: u64,
    pub losses: u64,
    pub balance: U256,
    pub staked_amount: U256,
}

/// Last known stats for one address.
#[derive(Debug, Clone, Serialize)]
pub struct StatsCache {
    pub subject: Address,
    pub values: StatsValues,
    /// When `values` were read.
    pub fetched_at: DateTime<Utc>,
    /// Last refresh attempt, successful or not.
    pub last_attempt_at: DateTime<Utc>,
    pub last_failure: Option<String>,
}

impl StatsCache {
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.fetched_at) > threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatsField {
    Wins,
    Losses,
    Balance,
    StakedAmount,
}

impl std::fmt::Display for StatsField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsField::Wins => write!(f, "wins"),
            StatsField::Losses => write!(f, "losses"),
            StatsField::Balance => write!(f, "balance"),
            StatsField::StakedAmount => write!(f, "staked_amount"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsFailure {
    pub field: StatsField,
    pub error: SourceError,
}

/// Result of one refresh.
#[derive(Debug, Clone)]
pub struct StatsReport {
    /// The entry after the refresh. `None` if the address was never read
    /// successfully.
    pub cache: Option<StatsCache>,
    /// Reads that failed this time. Empty on success.
    pub failures: Vec<StatsFailure>,
    /// True when `cache` holds values from an earlier refresh.
    pub stale: bool,
}

impl StatsReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Shared stats cache backed by a [`StatsReader`].
#[derive(Clone)]
pub struct StatsAggregator {
    reader: Arc<dyn StatsReader>,
    entries: Arc<DashMap<Address, StatsCache>>,
    anomalies: Arc<Mutex<AnomalyLog>>,
}

impl StatsAggregator {
    pub fn new(reader: Arc<dyn StatsReader>) -> Self {
        Self {
            reader,
            entries: Arc::new(DashMap::new()),
            anomalies: Arc::new(Mutex::new(AnomalyLog::new())),
        }
    }

    /// Cached entry for `subject`, if any refresh ever succeeded.
    pub fn get(&self, subject: &Address) -> Option<StatsCache> {
        self.entries.get(subject).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn recent_anomalies(&self, limit: usize) -> Vec<Anomaly> {
        self.anomalies.lock().await.recent(limit)
    }

    /// Read all four values and update the cache. Never fails; failed reads
    /// are listed in the report and the previous entry is kept.
    pub async fn refresh(&self, subject: Address) -> StatsReport {
        let (wins, losses, balance, staked) = tokio::join!(
            self.reader.wins(subject),
            self.reader.losses(subject),
            self.reader.balance(subject),
            self.reader.staked_amount(subject),
        );
        let now = Utc::now();

        let mut failures = Vec::new();
        let mut note = |field: StatsField, err: SourceError| {
            failures.push(StatsFailure { field, error: err });
        };
        let wins = wins.map_err(|e| note(StatsField::Wins, e)).ok();
        let losses = losses.map_err(|e| note(StatsField::Losses, e)).ok();
        let balance = balance.map_err(|e| note(StatsField::Balance, e)).ok();
        let staked_amount = staked.map_err(|e| note(StatsField::StakedAmount, e)).ok();

        if let (Some(wins), Some(losses), Some(balance), Some(staked_amount)) =
            (wins, losses, balance, staked_amount)
        {
            let entry = StatsCache {
                subject,
                values: StatsValues {
                    wins,
                    losses,
                    balance,
                    staked_amount,
                },
                fetched_at: now,
                last_attempt_at: now,
                last_failure: None,
            };
            self.entries.insert(subject, entry.clone());
            debug!(player = %subject, wins, losses, balance = %balance, "stats refreshed");
            return StatsReport {
                cache: Some(entry),
                failures: Vec::new(),
                stale: false,
            };
        }

        let summary = failures
            .iter()
            .map(|f| format!("{}: {}", f.field, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        warn!(player = %subject, failed = failures.len(), error = %summary, "stats refresh incomplete, keeping previous values");

        self.anomalies.lock().await.record(Anomaly::new(
            AnomalyKind::StatsReadFailure,
            None,
            format!("{}: {}", subject, summary),
        ));

        let cache = self.entries.get_mut(&subject).map(|mut entry| {
            entry.last_attempt_at = now;
            entry.last_failure = Some(summary);
            entry.clone()
        });

        StatsReport {
            cache,
            failures,
            stale: true,
        }
    }

    /// Refresh every subject on a fixed period until the handle is aborted.
    /// A zero period is raised to one second.
    pub fn spawn(&self, subjects: Vec<Address>, interval: Duration) -> JoinHandle<()> {
        let aggregator = self.clone();
        let interval = if interval.is_zero() {
            warn!("stats refresh interval is zero, using 1s");
            Duration::from_secs(1)
        } else {
            interval
        };
        tokio::spawn(async move {
            info!(players = subjects.len(), interval_secs = interval.as_secs(), "stats refresh loop started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                join_all(subjects.iter().map(|s| aggregator.refresh(*s))).await;
            }
        })
    }
}
