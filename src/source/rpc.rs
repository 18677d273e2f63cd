//! alloy-backed event source.
//!
//! Range queries and the chain head go over HTTP. Live delivery uses a
//! WebSocket log subscription in a background task that reconnects with
//! backoff, rotating through the primary and fallback endpoints. The task
//! lives exactly as long as the [`PushSubscription`] handle it returns.

use crate::events::{DeliveryPath, EventBatch};
use crate::source::abi;
use crate::source::decode::decode_logs;
use crate::source::{EventFilter, EventSource, FetchedLogs, PushSubscription, SourceError};

use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::Filter;
use alloy::transports::TransportError;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

impl From<TransportError> for SourceError {
    fn from(e: TransportError) -> Self {
        SourceError::Unavailable(e.to_string())
    }
}

/// Event source talking to a JSON-RPC node.
pub struct RpcEventSource {
    provider: DynProvider,
    contract: Address,
    ws_urls: Vec<String>,
    max_backoff: Duration,
}

impl RpcEventSource {
    /// Connect the HTTP provider. WebSocket endpoints are dialed lazily on
    /// `subscribe`.
    pub async fn connect(
        rpc_url: &str,
        contract: Address,
        ws_urls: Vec<String>,
        max_backoff: Duration,
    ) -> anyhow::Result<Self> {
        let provider = ProviderBuilder::new().connect(rpc_url).await?.erased();
        info!(rpc = %rpc_url, contract = %contract, ws_endpoints = ws_urls.len(), "event source connected");
        Ok(Self {
            provider,
            contract,
            ws_urls,
            max_backoff,
        })
    }

    /// The HTTP provider, shared with the stats reader.
    pub fn provider(&self) -> DynProvider {
        self.provider.clone()
    }
}

/// Build the log filter for a contract and event filter.
pub fn build_filter(contract: Address, filter: &EventFilter) -> Filter {
    let topics: Vec<B256> = filter.kinds.iter().map(|k| abi::topic_for(*k)).collect();
    let mut log_filter = Filter::new().address(contract).event_signature(topics);

    if !filter.game_ids.is_empty() {
        let game_topics: Vec<B256> = filter
            .game_ids
            .iter()
            .map(|id| B256::from(U256::from(*id).to_be_bytes::<32>()))
            .collect();
        log_filter = log_filter.topic1(game_topics);
    }

    log_filter
}

#[async_trait]
impl EventSource for RpcEventSource {
    async fn chain_head(&self) -> Result<u64, SourceError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn fetch_events(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<FetchedLogs, SourceError> {
        let log_filter = build_filter(self.contract, filter)
            .from_block(from_block)
            .to_block(to_block);
        let logs = self.provider.get_logs(&log_filter).await?;
        let (events, rejected) = decode_logs(&logs, DeliveryPath::Poll);

        debug!(
            from_block,
            to_block,
            logs = logs.len(),
            events = events.len(),
            rejected = rejected.len(),
            "fetched contract logs"
        );

        Ok(FetchedLogs { events, rejected })
    }

    async fn subscribe(
        &self,
        filter: EventFilter,
        sink: mpsc::UnboundedSender<EventBatch>,
    ) -> Result<PushSubscription, SourceError> {
        if self.ws_urls.is_empty() {
            return Err(SourceError::PushUnsupported);
        }

        let task = PushTask {
            urls: self.ws_urls.clone(),
            filter: build_filter(self.contract, &filter),
            sink,
            max_backoff: self.max_backoff,
        };
        Ok(PushSubscription::new(tokio::spawn(task.run_forever())))
    }
}

/// Background WebSocket subscription.
struct PushTask {
    urls: Vec<String>,
    filter: Filter,
    sink: mpsc::UnboundedSender<EventBatch>,
    max_backoff: Duration,
}

/// How a WebSocket session ended.
enum SessionEnd {
    /// Stream closed by the node; reconnect.
    StreamClosed,
    /// Nobody is listening any more; stop for good.
    SinkClosed,
}

impl PushTask {
    /// Connect, subscribe, forward logs, reconnect on failure. Rotates
    /// through the endpoints on consecutive failures.
    async fn run_forever(self) {
        let mut url_index = 0;
        let mut consecutive_failures: usize = 0;

        loop {
            let url = &self.urls[url_index];
            info!(url = %url, provider = url_index + 1, total = self.urls.len(), "connecting log subscription");

            match self.run_session(url).await {
                Ok(SessionEnd::SinkClosed) => {
                    info!("log subscription consumer gone, stopping");
                    return;
                }
                Ok(SessionEnd::StreamClosed) => {
                    info!("log subscription stream ended cleanly");
                    consecutive_failures = 0;
                }
                Err(e) => {
                    let err_str = e.to_string();
                    let is_rate_limited = err_str.contains("429") || err_str.contains("Too Many Requests");
                    if is_rate_limited {
                        warn!(url = %url, "provider rate limited, rotating");
                    } else {
                        error!(url = %url, error = %e, "log subscription session error");
                    }
                    consecutive_failures += 1;
                    url_index = (url_index + 1) % self.urls.len();
                }
            }

            if self.sink.is_closed() {
                return;
            }

            // Untried endpoints in this rotation are tried quickly; once every
            // endpoint has failed, back off exponentially.
            let backoff = if consecutive_failures == 0 {
                Duration::from_secs(1)
            } else if consecutive_failures < self.urls.len() {
                Duration::from_secs(2)
            } else {
                let cycle = consecutive_failures / self.urls.len();
                let secs = 2u64.pow(cycle.min(6) as u32).min(self.max_backoff.as_secs().max(1));
                Duration::from_secs(secs)
            };

            info!(
                backoff_secs = backoff.as_secs(),
                next_url = %self.urls[url_index],
                failures = consecutive_failures,
                "reconnecting log subscription"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn run_session(&self, url: &str) -> anyhow::Result<SessionEnd> {
        let provider = ProviderBuilder::new().connect_ws(WsConnect::new(url)).await?;
        let sub = provider.subscribe_logs(&self.filter).await?;
        let mut stream = sub.into_stream();
        info!(url = %url, "subscribed to contract logs");

        while let Some(log) = stream.next().await {
            let (events, rejected) = decode_logs(std::slice::from_ref(&log), DeliveryPath::Push);
            if events.is_empty() && rejected.is_empty() {
                continue;
            }
            if self.sink.send(EventBatch::pushed(events, rejected)).is_err() {
                return Ok(SessionEnd::SinkClosed);
            }
        }

        Ok(SessionEnd::StreamClosed)
    }
}
