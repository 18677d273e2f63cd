use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zerosum_sync::config::Config;
use zerosum_sync::source::{EventSource, RpcEventSource};
use zerosum_sync::stats::{RpcStatsReader, StatsAggregator, StatsReader};
use zerosum_sync::{GameUpdate, GameWatch, SyncHandle, SyncSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config_path = Path::new("zerosum.toml");
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("zerosum-sync v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_path.exists() {
        info!("no zerosum.toml found, using env-only config");
    }

    let contract = match config.contract_address() {
        Ok(address) => address,
        Err(e) => {
            error!(error = %e, "invalid contract configuration (set ZEROSUM_CONTRACT)");
            return Err(e.into());
        }
    };
    let players = config.stats.player_addresses()?;

    // --- Event Source ---
    let ws_urls = config.ws_urls();
    if ws_urls.is_empty() {
        warn!("no WebSocket endpoint configured - running poll-only");
    }
    let source = RpcEventSource::connect(
        &config.chain.rpc_url,
        contract,
        ws_urls,
        config.polling.max_backoff(),
    )
    .await?;

    match source.chain_head().await {
        Ok(head) => info!(head, "chain reachable"),
        Err(e) => warn!(error = %e, "chain head unavailable, polling will retry"),
    }

    let reader: Arc<dyn StatsReader> = Arc::new(RpcStatsReader::new(source.provider(), contract));
    match reader.game_count().await {
        Ok(count) => info!(games = count, contract = %contract, "contract reachable"),
        Err(e) => warn!(error = %e, "gameCounter read failed"),
    }

    // --- Sync Service ---
    let (sync, sync_task) = SyncHandle::spawn(
        Arc::new(source),
        Some(reader.clone()),
        SyncSettings::from(&config),
    );

    let (update_tx, mut update_rx) = mpsc::unbounded_channel::<(u64, GameUpdate)>();
    for game_id in &config.watch.game_ids {
        let watch = sync.watch_game(*game_id)?;
        tokio::spawn(forward_updates(watch, update_tx.clone()));
    }
    drop(update_tx);
    if config.watch.game_ids.is_empty() {
        warn!("no games to watch (set watch.game_ids in zerosum.toml)");
    }

    // --- Stats Aggregator ---
    let stats = StatsAggregator::new(reader);
    let stats_task = if players.is_empty() {
        info!("no players configured for stats refresh");
        None
    } else {
        Some(stats.spawn(players.clone(), config.stats.refresh_interval()))
    };

    // --- Periodic Tasks ---

    // Metrics and stats summary every 60s
    let sync_for_summary = sync.clone();
    let stats_for_summary = stats.clone();
    let stale_after = config.stats.stale_after();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            match sync_for_summary.metrics().await {
                Ok(m) => info!(
                    polled = m.polled_batches,
                    pushed = m.pushed_batches,
                    admitted = m.admitted,
                    duplicates = m.duplicates,
                    stale = m.stale,
                    refolds = m.refolds,
                    anomalous = m.anomalous,
                    dropped_updates = m.dropped_updates,
                    tick_failures = m.tick_failures,
                    avg_tick_ms = format!("{:.1}", m.avg_tick_ms),
                    "sync metrics"
                ),
                Err(_) => return,
            }

            let now = Utc::now();
            for player in &players {
                match stats_for_summary.get(player) {
                    Some(entry) => info!(
                        player = %player,
                        wins = entry.values.wins,
                        losses = entry.values.losses,
                        balance = %entry.values.balance,
                        staked = %entry.values.staked_amount,
                        stale = entry.is_stale(stale_after, now),
                        last_failure = ?entry.last_failure,
                        "player stats"
                    ),
                    None => warn!(player = %player, "no stats read yet"),
                }
            }
        }
    });

    // --- Main Event Loop ---
    info!("entering main event loop - press Ctrl+C to stop");

    loop {
        tokio::select! {
            Some((game_id, update)) = update_rx.recv() => {
                match update {
                    GameUpdate::Snapshot(snapshot) => {
                        info!("{}", snapshot);
                        if let Ok(json) = serde_json::to_string(&snapshot) {
                            debug!(game_id, snapshot = %json, "snapshot json");
                        }
                    }
                    GameUpdate::Anomaly(anomaly) => {
                        warn!(game_id, kind = %anomaly.kind, detail = %anomaly.detail, "game anomaly");
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    if let Some(task) = stats_task {
        task.abort();
    }
    sync_task.abort();
    Ok(())
}

async fn forward_updates(mut watch: GameWatch, tx: mpsc::UnboundedSender<(u64, GameUpdate)>) {
    let game_id = watch.game_id();
    while let Some(update) = watch.recv().await {
        if tx.send((game_id, update)).is_err() {
            break;
        }
    }
}
