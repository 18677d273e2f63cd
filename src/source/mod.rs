//! Event source adapter for the ZeroSum contract.
//!
//! Wraps the two ways logs reach us, a one-shot range query (`eth_getLogs`)
//! and a live subscription (`eth_subscribe`), behind one trait that yields
//! already-normalized [`GameEvent`]s.
//!
//! Architecture:
//! - `EventSource`: the trait the scheduler and sync service depend on
//! - `rpc::RpcEventSource`: alloy-backed implementation (HTTP for queries,
//!   WebSocket for push with automatic reconnection)
//! - `decode`: raw `Log` → `GameEvent` translation, shared by both paths
//! - `PushSubscription`: scoped handle; dropping it stops delivery

pub mod abi;
pub mod decode;
pub mod rpc;

#[cfg(test)]
pub(crate) mod mock;

use crate::events::{EventBatch, EventKind, GameEvent, RejectedLog};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use rpc::RpcEventSource;

#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// RPC unreachable or returned an error. Retry with backoff.
    #[error("event source unavailable: {0}")]
    Unavailable(String),
    #[error("failed to decode log: {0}")]
    Decode(String),
    #[error("push delivery not configured")]
    PushUnsupported,
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// Which events a query or subscription selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub kinds: Vec<EventKind>,
    /// Games to follow. Empty = every game.
    pub game_ids: Vec<u64>,
}

impl EventFilter {
    pub fn all_kinds(game_ids: Vec<u64>) -> Self {
        Self {
            kinds: EventKind::ALL.to_vec(),
            game_ids,
        }
    }

    pub fn matches(&self, event: &GameEvent) -> bool {
        self.kinds.contains(&event.kind())
            && (self.game_ids.is_empty() || self.game_ids.contains(&event.game_id))
    }
}

/// Result of one range query: decoded events plus logs that failed to decode.
#[derive(Debug, Clone, Default)]
pub struct FetchedLogs {
    pub events: Vec<GameEvent>,
    pub rejected: Vec<RejectedLog>,
}

/// Live log delivery. Stops when dropped or unsubscribed.
#[derive(Debug)]
pub struct PushSubscription {
    task: Option<JoinHandle<()>>,
}

impl PushSubscription {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A source of ZeroSum contract events.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Current chain head block number.
    async fn chain_head(&self) -> Result<u64, SourceError>;

    /// All matching events in `from_block..=to_block`.
    async fn fetch_events(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<FetchedLogs, SourceError>;

    /// Start delivering matching events to `sink` as they are mined.
    /// Delivery continues until the returned handle is dropped.
    async fn subscribe(
        &self,
        filter: EventFilter,
        sink: mpsc::UnboundedSender<EventBatch>,
    ) -> Result<PushSubscription, SourceError>;
}
