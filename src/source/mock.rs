//! In-memory event source for tests.

use crate::events::{DeliveryPath, EventBatch, GameEvent, RejectedLog};
use crate::source::{EventFilter, EventSource, FetchedLogs, PushSubscription, SourceError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct MockState {
    head: u64,
    events: Vec<GameEvent>,
    rejected: Vec<RejectedLog>,
    fail_fetches: usize,
    fail_head: bool,
    fail_from: Option<u64>,
    push_enabled: bool,
    fetches: Vec<(u64, u64)>,
    push_sinks: Vec<(EventFilter, mpsc::UnboundedSender<EventBatch>)>,
}

pub struct MockSource {
    state: Mutex<MockState>,
}

impl MockSource {
    pub fn new(head: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                head,
                ..Default::default()
            }),
        })
    }

    pub fn with_push(head: u64) -> Arc<Self> {
        let source = Self::new(head);
        source.state.lock().unwrap().push_enabled = true;
        source
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn add_event(&self, event: GameEvent) {
        self.state.lock().unwrap().events.push(event);
    }

    pub fn add_rejected(&self, rejected: RejectedLog) {
        self.state.lock().unwrap().rejected.push(rejected);
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.state.lock().unwrap().fail_fetches = count;
    }

    /// Fail every fetch starting at or above `block` until cleared.
    pub fn fail_from_block(&self, block: Option<u64>) {
        self.state.lock().unwrap().fail_from = block;
    }

    pub fn fail_head(&self, fail: bool) {
        self.state.lock().unwrap().fail_head = fail;
    }

    /// Every `(from, to)` range requested so far.
    pub fn fetches(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().fetches.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.push_sinks.iter().filter(|(_, tx)| !tx.is_closed()).count()
    }

    /// Deliver events to every live subscriber whose filter matches.
    /// Returns how many subscribers received something.
    pub fn push(&self, events: Vec<GameEvent>) -> usize {
        let state = self.state.lock().unwrap();
        let mut delivered = 0;
        for (filter, tx) in &state.push_sinks {
            let matching: Vec<GameEvent> = events
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .map(|mut e| {
                    e.via = DeliveryPath::Push;
                    e
                })
                .collect();
            if !matching.is_empty() && tx.send(EventBatch::pushed(matching, Vec::new())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl EventSource for MockSource {
    async fn chain_head(&self) -> Result<u64, SourceError> {
        let state = self.state.lock().unwrap();
        if state.fail_head {
            return Err(SourceError::Unavailable("head unavailable".to_string()));
        }
        Ok(state.head)
    }

    async fn fetch_events(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<FetchedLogs, SourceError> {
        let mut state = self.state.lock().unwrap();
        state.fetches.push((from_block, to_block));
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(SourceError::Unavailable("connection refused".to_string()));
        }
        if state.fail_from.is_some_and(|block| from_block >= block) {
            return Err(SourceError::Unavailable("range unavailable".to_string()));
        }

        let in_range = |block: u64| block >= from_block && block <= to_block;
        let mut events: Vec<GameEvent> = state
            .events
            .iter()
            .filter(|e| in_range(e.key.block_number) && filter.matches(e))
            .cloned()
            .map(|mut e| {
                e.via = DeliveryPath::Poll;
                e
            })
            .collect();
        events.sort_by_key(|e| e.key);
        let rejected = state
            .rejected
            .iter()
            .filter(|r| r.key.is_some_and(|k| in_range(k.block_number)))
            .cloned()
            .collect();

        Ok(FetchedLogs { events, rejected })
    }

    async fn subscribe(
        &self,
        filter: EventFilter,
        sink: mpsc::UnboundedSender<EventBatch>,
    ) -> Result<PushSubscription, SourceError> {
        let mut state = self.state.lock().unwrap();
        if !state.push_enabled {
            return Err(SourceError::PushUnsupported);
        }
        let keepalive = sink.clone();
        state.push_sinks.push((filter, sink));
        // The task stands in for a live socket; aborting it drops the clone.
        let task = tokio::spawn(async move {
            let _sink = keepalive;
            std::future::pending::<()>().await
        });
        Ok(PushSubscription::new(task))
    }
}
