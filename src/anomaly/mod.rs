//! Anomaly reporting for the sync pipeline.
//!
//! Anomalies are conditions the pipeline recovers from locally but that a
//! caller may want to see:
//!
//! - **Terminal transition**: an event arrived for a game that already ended
//! - **Head regression**: the chain head moved below the poll cursor (likely reorg)
//! - **Undecodable log**: a log matched the filter but could not be normalized
//! - **Stats read failure**: one or more stats reads failed during a refresh

use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Maximum anomalies retained in the log.
const MAX_HISTORY: usize = 500;

/// Types of anomaly the pipeline reports.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum AnomalyKind {
    TerminalTransition,
    HeadRegression,
    UndecodableLog,
    StatsReadFailure,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyKind::TerminalTransition => write!(f, "TERMINAL_TRANSITION"),
            AnomalyKind::HeadRegression => write!(f, "HEAD_REGRESSION"),
            AnomalyKind::UndecodableLog => write!(f, "UNDECODABLE_LOG"),
            AnomalyKind::StatsReadFailure => write!(f, "STATS_READ_FAILURE"),
        }
    }
}

/// Severity level for an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MED"),
            Severity::High => write!(f, "HIGH"),
        }
    }
}

/// A single reported anomaly.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    /// Game the anomaly concerns, if it concerns one.
    pub game_id: Option<u64>,
    pub detail: String,
    pub detected_at: String,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, game_id: Option<u64>, detail: impl Into<String>) -> Self {
        let severity = match kind {
            AnomalyKind::TerminalTransition => Severity::Medium,
            AnomalyKind::HeadRegression => Severity::High,
            AnomalyKind::UndecodableLog => Severity::Medium,
            AnomalyKind::StatsReadFailure => Severity::Low,
        };
        Self {
            kind,
            severity,
            game_id,
            detail: detail.into(),
            detected_at: Utc::now().to_rfc3339(),
        }
    }
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.game_id {
            Some(id) => write!(f, "[{}] {} game={}: {}", self.severity, self.kind, id, self.detail),
            None => write!(f, "[{}] {}: {}", self.severity, self.kind, self.detail),
        }
    }
}

/// Bounded history of recent anomalies.
#[derive(Debug, Default)]
pub struct AnomalyLog {
    entries: VecDeque<Anomaly>,
    total: u64,
}

impl AnomalyLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an anomaly, logging it at a level matching its severity.
    pub fn record(&mut self, anomaly: Anomaly) {
        match anomaly.severity {
            Severity::Low => debug!(
                kind = %anomaly.kind,
                game_id = ?anomaly.game_id,
                detail = %anomaly.detail,
                "anomaly"
            ),
            Severity::Medium | Severity::High => warn!(
                kind = %anomaly.kind,
                severity = %anomaly.severity,
                game_id = ?anomaly.game_id,
                detail = %anomaly.detail,
                "anomaly"
            ),
        }

        if self.entries.len() >= MAX_HISTORY {
            self.entries.pop_front();
        }
        self.entries.push_back(anomaly);
        self.total += 1;
    }

    /// Most recent anomalies, newest last.
    pub fn recent(&self, limit: usize) -> Vec<Anomaly> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn for_game(&self, game_id: u64) -> Vec<Anomaly> {
        self.entries
            .iter()
            .filter(|a| a.game_id == Some(game_id))
            .cloned()
            .collect()
    }

    /// Anomalies recorded since start, including ones evicted from history.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
