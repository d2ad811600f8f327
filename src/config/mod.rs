//! Configuration management module
//!
//! Handles loading, validation, and management of collector configuration.
//! Configuration comes from a TOML file with `BOOKSTREAM_*` environment
//! variable overrides applied on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

use crate::exchange::ExchangeId;

/// Data streams a collector subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Orderbook,
    Trade,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// One collector per (exchange, market) venue
    pub collectors: Vec<CollectorConfig>,

    /// REST rate limiting shared by snapshot fetches per exchange
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Optional outbound proxy for REST requests
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Downstream NATS connection and JetStream settings
    #[serde(default)]
    pub nats: NatsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,

    /// Optional rolling log file; empty means stdout only
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Venue this collector attaches to
    pub exchange: ExchangeId,

    /// Exchange-native symbols to subscribe (e.g. BTCUSDT, BTC-USDT-SWAP)
    pub symbols: Vec<String>,

    /// Streams to collect
    #[serde(default = "default_data_types")]
    pub data_types: Vec<DataType>,

    /// REST snapshot depth, capped per venue
    #[serde(default = "default_snapshot_depth")]
    pub snapshot_depth: usize,

    /// Depth of the WebSocket book channel
    #[serde(default = "default_websocket_depth")]
    pub websocket_depth: usize,

    /// Truncation applied to published books
    #[serde(default = "default_publish_depth", alias = "nats_publish_depth")]
    pub publish_depth: usize,

    /// Periodic snapshot reconciliation in seconds; 0 disables
    #[serde(default, alias = "snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Client heartbeat interval
    #[serde(default = "default_ping_interval", alias = "ping_interval")]
    pub ping_interval_secs: u64,

    /// Reconnect if no frame arrives within this window
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Initial reconnect delay; doubles up to `max_backoff_secs`
    #[serde(default = "default_reconnect_delay", alias = "reconnect_delay")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// 0 means reconnect forever
    #[serde(default)]
    pub max_reconnect_attempts: u32,

    /// Pre-sync update buffer bound per symbol
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Inbound message queue bound per symbol
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Minimum spacing between REST snapshots of one symbol
    #[serde(default = "default_snapshot_spacing")]
    pub min_snapshot_spacing_secs: u64,

    /// Endpoint overrides, primarily for tests
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
    pub cooldown_secs: u64,
    /// Request weight budget inside a 60s sliding window (Binance)
    pub weight_per_minute: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub http_url: Option<String>,
    pub https_url: Option<String>,
    pub socks_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    pub enabled: bool,
    pub servers: Vec<String>,
    pub client_name: String,
    pub max_retries: u32,
    pub publish_timeout_secs: u64,
    /// Bound of the publish handoff queue
    pub queue_capacity: usize,
    pub jetstream: JetStreamSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JetStreamSettings {
    pub enabled: bool,
    /// Subject prefixes published through JetStream; everything else goes
    /// over core NATS fire-and-forget
    pub subject_prefixes: Vec<String>,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_msgs: i64,
    pub max_bytes: i64,
    pub max_age_secs: u64,
    pub duplicate_window_secs: u64,
}

fn default_data_types() -> Vec<DataType> {
    vec![DataType::Orderbook]
}

fn default_snapshot_depth() -> usize {
    400
}

fn default_websocket_depth() -> usize {
    400
}

fn default_publish_depth() -> usize {
    400
}

fn default_ping_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    300
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_snapshot_spacing() -> u64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            collectors: vec![CollectorConfig::default_for(ExchangeId::BinanceSpot)],
            rate_limit: RateLimitConfig::default(),
            proxy: ProxyConfig::default(),
            nats: NatsSettings::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
        }
    }
}

impl CollectorConfig {
    /// A collector with defaults for the given venue
    pub fn default_for(exchange: ExchangeId) -> Self {
        Self {
            exchange,
            symbols: vec![],
            data_types: default_data_types(),
            snapshot_depth: default_snapshot_depth(),
            websocket_depth: default_websocket_depth(),
            publish_depth: default_publish_depth(),
            snapshot_interval_secs: 0,
            ping_interval_secs: default_ping_interval(),
            idle_timeout_secs: default_idle_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            max_backoff_secs: default_max_backoff(),
            max_reconnect_attempts: 0,
            buffer_capacity: default_buffer_capacity(),
            queue_capacity: default_queue_capacity(),
            min_snapshot_spacing_secs: default_snapshot_spacing(),
            rest_url: None,
            ws_url: None,
        }
    }

    pub fn rest_base_url(&self) -> String {
        self.rest_url
            .clone()
            .unwrap_or_else(|| self.exchange.rest_base_url().to_string())
    }

    pub fn collects(&self, data_type: DataType) -> bool {
        self.data_types.contains(&data_type)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 600,
            burst: 10,
            cooldown_secs: 60,
            weight_per_minute: 1000,
        }
    }
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: vec!["nats://localhost:4222".to_string()],
            client_name: "bookstream-collector".to_string(),
            max_retries: 3,
            publish_timeout_secs: 10,
            queue_capacity: 8192,
            jetstream: JetStreamSettings::default(),
        }
    }
}

impl Default for JetStreamSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            subject_prefixes: vec!["orderbook-data".to_string()],
            stream: StreamSettings::default(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: "MARKET_DATA".to_string(),
            subjects: vec![
                "orderbook-data.>".to_string(),
                "trade-data.>".to_string(),
                "funding-rate.>".to_string(),
                "open-interest.>".to_string(),
                "liquidation-orders.>".to_string(),
                "kline-data.>".to_string(),
            ],
            max_msgs: 5_000_000,
            max_bytes: 2_147_483_648,
            max_age_secs: 172_800,
            duplicate_window_secs: 120,
        }
    }
}

impl Config {
    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        // BOOKSTREAM_SYMBOLS - comma-separated list applied to every collector
        if let Ok(symbols) = env::var("BOOKSTREAM_SYMBOLS") {
            let symbols: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                for collector in &mut self.collectors {
                    collector.symbols = symbols.clone();
                }
            }
        }

        // BOOKSTREAM_LOG_LEVEL - logging level
        if let Ok(level) = env::var("BOOKSTREAM_LOG_LEVEL") {
            self.log.level = level;
        }

        // BOOKSTREAM_LOG_FILE_PATH - rolling log file destination
        if let Ok(file_path) = env::var("BOOKSTREAM_LOG_FILE_PATH") {
            if !file_path.trim().is_empty() {
                self.log.file_path = Some(file_path);
            }
        }

        // BOOKSTREAM_NATS_SERVERS - comma-separated NATS server list
        if let Ok(servers) = env::var("BOOKSTREAM_NATS_SERVERS") {
            let servers: Vec<String> = servers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !servers.is_empty() {
                self.nats.servers = servers;
            }
        }

        // BOOKSTREAM_NATS_CLIENT_NAME - client connection name
        if let Ok(name) = env::var("BOOKSTREAM_NATS_CLIENT_NAME") {
            self.nats.client_name = name;
        }

        // BOOKSTREAM_PROXY_HTTPS_URL / BOOKSTREAM_PROXY_HTTP_URL
        if let Ok(url) = env::var("BOOKSTREAM_PROXY_HTTPS_URL") {
            self.proxy.https_url = Some(url);
        }
        if let Ok(url) = env::var("BOOKSTREAM_PROXY_HTTP_URL") {
            self.proxy.http_url = Some(url);
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load_from_file(path).unwrap_or_else(|err| {
            tracing::warn!("Failed to load config: {}, using defaults", err);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.collectors.is_empty() {
            anyhow::bail!("At least one collector must be configured");
        }

        for collector in &self.collectors {
            let exchange = collector.exchange;
            if collector.symbols.is_empty() {
                anyhow::bail!("Collector {} has no symbols", exchange);
            }
            for symbol in &collector.symbols {
                if symbol.len() < 3 {
                    anyhow::bail!("Invalid symbol format: {}", symbol);
                }
                if exchange.is_okx() && !symbol.contains('-') {
                    anyhow::bail!(
                        "OKX symbols must be instrument ids like BTC-USDT, got {}",
                        symbol
                    );
                }
            }
            if collector.data_types.is_empty() {
                anyhow::bail!("Collector {} has no data types", exchange);
            }
            if collector.snapshot_depth == 0 || collector.publish_depth == 0 {
                anyhow::bail!("Depths must be greater than 0 for {}", exchange);
            }
            if collector.snapshot_depth > exchange.max_snapshot_depth() {
                anyhow::bail!(
                    "snapshot_depth {} exceeds {} cap {}",
                    collector.snapshot_depth,
                    exchange,
                    exchange.max_snapshot_depth()
                );
            }
            if collector.buffer_capacity == 0 || collector.queue_capacity == 0 {
                anyhow::bail!("Buffer and queue capacities must be greater than 0");
            }
            if collector.max_backoff_secs == 0 || collector.reconnect_delay_secs == 0 {
                anyhow::bail!("Reconnect delays must be greater than 0");
            }
        }

        if self.rate_limit.requests_per_minute == 0 || self.rate_limit.burst == 0 {
            anyhow::bail!("Rate limit must allow at least one request");
        }

        if self.nats.enabled && self.nats.servers.is_empty() {
            anyhow::bail!("NATS is enabled but no servers are configured");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log.level.as_str()) {
            anyhow::bail!("Invalid log level: {}", self.log.level);
        }

        Ok(())
    }
}
