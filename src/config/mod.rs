use alloy::primitives::Address;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid address for {field}: {value}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub game: GameRulesConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// HTTP JSON-RPC endpoint used for eth_getLogs and read calls.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// WebSocket endpoint for live log delivery. Empty = poll only.
    #[serde(default)]
    pub ws_url: String,
    /// Extra WebSocket endpoints tried in order when the primary fails.
    #[serde(default)]
    pub fallback_ws_urls: Vec<String>,
    /// ZeroSum game contract address - loaded from env ZEROSUM_CONTRACT
    #[serde(default)]
    pub contract_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Interval between move-event polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Blocks behind the head the first poll starts from.
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
    /// Largest block span requested in one eth_getLogs call.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// Upper bound on retry backoff after failed ticks, in seconds.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Blocks below the fetch floor for which dedup keys are still kept.
    #[serde(default = "default_dedup_retention_blocks")]
    pub dedup_retention_blocks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameRulesConfig {
    /// Timeouts a single player may accumulate before forfeiting.
    #[serde(default = "default_timeout_limit")]
    pub timeout_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_refresh_secs")]
    pub refresh_interval_secs: u64,
    /// Age after which a cached stats entry counts as stale.
    #[serde(default = "default_stats_stale_secs")]
    pub stale_after_secs: u64,
    /// Player addresses whose stats are refreshed on the timer.
    #[serde(default)]
    pub players: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Game ids the binary follows on startup.
    #[serde(default)]
    pub game_ids: Vec<u64>,
    /// Updates buffered per watcher before new ones are dropped for it.
    #[serde(default = "default_update_buffer")]
    pub update_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_update_buffer() -> usize {
    256
}
fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}
fn default_poll_interval_ms() -> u64 {
    3_000
}
fn default_lookback_blocks() -> u64 {
    1_000
}
fn default_max_block_range() -> u64 {
    2_000
}
fn default_max_backoff_secs() -> u64 {
    60
}
fn default_dedup_retention_blocks() -> u64 {
    256
}
fn default_timeout_limit() -> u32 {
    3
}
fn default_stats_refresh_secs() -> u64 {
    30
}
fn default_stats_stale_secs() -> u64 {
    90
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            ws_url: String::new(),
            fallback_ws_urls: Vec::new(),
            contract_address: String::new(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            lookback_blocks: default_lookback_blocks(),
            max_block_range: default_max_block_range(),
            max_backoff_secs: default_max_backoff_secs(),
            dedup_retention_blocks: default_dedup_retention_blocks(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl Default for GameRulesConfig {
    fn default() -> Self {
        Self {
            timeout_limit: default_timeout_limit(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_stats_refresh_secs(),
            stale_after_secs: default_stats_stale_secs(),
            players: Vec::new(),
        }
    }
}

impl StatsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Parse the configured player list. Fails on the first bad entry.
    pub fn player_addresses(&self) -> Result<Vec<Address>, ConfigError> {
        self.players
            .iter()
            .map(|p| {
                Address::from_str(p.trim()).map_err(|_| ConfigError::InvalidAddress {
                    field: "stats.players",
                    value: p.clone(),
                })
            })
            .collect()
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            game_ids: Vec::new(),
            update_buffer: default_update_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            polling: PollingConfig::default(),
            game: GameRulesConfig::default(),
            stats: StatsConfig::default(),
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse TOML text and overlay environment variables.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;

        if let Ok(url) = std::env::var("ZEROSUM_RPC_URL") {
            config.chain.rpc_url = url;
        }
        if let Ok(url) = std::env::var("ZEROSUM_WS_URL") {
            config.chain.ws_url = url;
        }
        if let Ok(addr) = std::env::var("ZEROSUM_CONTRACT") {
            config.chain.contract_address = addr;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a default config from environment variables only (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config {
            chain: ChainConfig {
                rpc_url: std::env::var("ZEROSUM_RPC_URL").unwrap_or_else(|_| default_rpc_url()),
                ws_url: std::env::var("ZEROSUM_WS_URL").unwrap_or_default(),
                fallback_ws_urls: Vec::new(),
                contract_address: std::env::var("ZEROSUM_CONTRACT").unwrap_or_default(),
            },
            ..Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or spin the background loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &'static str, &'static str); 4] = [
            (self.polling.interval_ms == 0, "polling.interval_ms", "must be greater than zero"),
            (self.polling.max_block_range == 0, "polling.max_block_range", "must be at least 1"),
            (
                self.stats.refresh_interval_secs == 0,
                "stats.refresh_interval_secs",
                "must be greater than zero",
            ),
            (self.watch.update_buffer == 0, "watch.update_buffer", "must be at least 1"),
        ];
        match checks.into_iter().find(|(failed, _, _)| *failed) {
            Some((_, field, reason)) => Err(ConfigError::Invalid { field, reason }),
            None => Ok(()),
        }
    }

    /// The validated game contract address. A missing or malformed address is
    /// the one error this crate reports at construction time.
    pub fn contract_address(&self) -> Result<Address, ConfigError> {
        let raw = self.chain.contract_address.trim();
        if raw.is_empty() {
            return Err(ConfigError::Missing("chain.contract_address"));
        }
        Address::from_str(raw).map_err(|_| ConfigError::InvalidAddress {
            field: "chain.contract_address",
            value: raw.to_string(),
        })
    }

    /// WebSocket URLs to rotate through: primary first, then fallbacks.
    pub fn ws_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        if !self.chain.ws_url.is_empty() {
            urls.push(self.chain.ws_url.clone());
        }
        for url in &self.chain.fallback_ws_urls {
            if !url.is_empty() && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}
