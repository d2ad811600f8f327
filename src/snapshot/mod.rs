//! REST depth snapshot client
//!
//! One snapshotter per collector shares a single HTTP session, a GCRA rate
//! limiter, a 60s request-weight window, and the exchange ban state. All
//! snapshot paths (initial sync, resync, periodic reconciliation) go
//! through `fetch`.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{CollectorConfig, ProxyConfig, RateLimitConfig};
use crate::exchange::{ExchangeId, binance, okx};
use crate::metrics::CollectorMetrics;
use crate::normalizer;
use crate::orderbook::PriceLevel;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const QUEUE_TIMEOUT: Duration = Duration::from_secs(30);
const BAN_GRACE_MS: u64 = 30_000;
const MAX_BACKOFF_FACTOR: f64 = 8.0;

/// Errors surfaced by snapshot fetches
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("IP banned until {until_ms}ms epoch")]
    Banned { until_ms: u64 },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected HTTP status {status}")]
    Http { status: u16 },
}

/// Canonical depth snapshot
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Binance `lastUpdateId`; OKX `seqId` when present, else `ts`
    pub last_update_id: u64,
    pub timestamp_ms: u64,
}

struct WeightWindow {
    used: u32,
    window_start: Instant,
}

/// GCRA limiter plus a 60s request-weight window
pub struct RestRateLimiter {
    limiter: GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    weight_limit: u32,
    weight: Mutex<WeightWindow>,
}

impl RestRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute.max(1))
            .expect("validated requests_per_minute is non-zero");
        let burst = NonZeroU32::new(config.burst.max(1)).expect("validated burst is non-zero");
        let quota = Quota::per_minute(per_minute).allow_burst(burst);

        Self {
            limiter: GovernorRateLimiter::direct(quota),
            weight_limit: config.weight_per_minute.max(1),
            weight: Mutex::new(WeightWindow {
                used: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Wait for request permission, accounting `weight` against the window
    pub async fn acquire(&self, weight: u32) -> Result<(), SnapshotError> {
        // Weight window first so a heavy request cannot sneak past the
        // budget between two light ones
        {
            let mut window = self.weight.lock().await;
            if window.window_start.elapsed() >= Duration::from_secs(60) {
                window.used = 0;
                window.window_start = Instant::now();
            }
            if window.used + weight > self.weight_limit {
                let retry_after =
                    Duration::from_secs(60).saturating_sub(window.window_start.elapsed());
                return Err(SnapshotError::RateLimited {
                    retry_after_secs: retry_after.as_secs().max(1),
                });
            }
            window.used += weight;
        }

        let wait = timeout(QUEUE_TIMEOUT, async {
            loop {
                if self.limiter.check().is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        if wait.is_err() {
            warn!("rate limit queue timeout after {}s", QUEUE_TIMEOUT.as_secs());
            return Err(SnapshotError::RateLimited {
                retry_after_secs: QUEUE_TIMEOUT.as_secs(),
            });
        }
        Ok(())
    }
}

/// REST snapshot fetcher for one venue
pub struct Snapshotter {
    exchange: ExchangeId,
    base_url: String,
    snapshot_depth: usize,
    client: reqwest::Client,
    limiter: RestRateLimiter,
    ban_until_ms: AtomicU64,
    cooldown_until_ms: AtomicU64,
    cooldown: Duration,
    backoff_factor: Mutex<f64>,
    min_spacing: Duration,
    last_fetch: Mutex<HashMap<String, Instant>>,
    metrics: Arc<CollectorMetrics>,
}

impl Snapshotter {
    pub fn new(
        collector: &CollectorConfig,
        rate_limit: &RateLimitConfig,
        proxy: &ProxyConfig,
        metrics: Arc<CollectorMetrics>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT);

        if let Some(url) = proxy
            .https_url
            .as_ref()
            .or(proxy.http_url.as_ref())
            .or(proxy.socks_url.as_ref())
        {
            builder = builder.proxy(reqwest::Proxy::all(url)?);
        }

        Ok(Self {
            exchange: collector.exchange,
            base_url: collector.rest_base_url(),
            snapshot_depth: collector.snapshot_depth,
            client: builder.build()?,
            limiter: RestRateLimiter::new(rate_limit),
            ban_until_ms: AtomicU64::new(0),
            cooldown_until_ms: AtomicU64::new(0),
            cooldown: Duration::from_secs(rate_limit.cooldown_secs.max(1)),
            backoff_factor: Mutex::new(1.0),
            min_spacing: Duration::from_secs(collector.min_snapshot_spacing_secs),
            last_fetch: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    /// Current error backoff multiplier: doubled on bans, ×1.5 on 429,
    /// decays by 0.8 per successful fetch
    pub async fn backoff_factor(&self) -> f64 {
        *self.backoff_factor.lock().await
    }

    /// Fetch a depth snapshot. `force` skips the per-symbol spacing gate
    /// (used by resync); ban and rate-limit windows are never skipped.
    pub async fn fetch(&self, symbol: &str, force: bool) -> Result<Snapshot, SnapshotError> {
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;

        let ban_until = self.ban_until_ms.load(Ordering::Relaxed);
        if ban_until > now_ms {
            return Err(SnapshotError::Banned { until_ms: ban_until });
        }

        let cooldown_until = self.cooldown_until_ms.load(Ordering::Relaxed);
        if cooldown_until > now_ms {
            return Err(SnapshotError::RateLimited {
                retry_after_secs: (cooldown_until - now_ms) / 1000 + 1,
            });
        }

        if !force {
            let last_fetch = self.last_fetch.lock().await;
            if let Some(last) = last_fetch.get(symbol) {
                if last.elapsed() < self.min_spacing {
                    let retry = self.min_spacing - last.elapsed();
                    return Err(SnapshotError::RateLimited {
                        retry_after_secs: retry.as_secs().max(1),
                    });
                }
            }
        }

        let limit = self.exchange.clamp_snapshot_limit(self.snapshot_depth);
        let weight = if self.exchange.is_binance() {
            binance::snapshot_weight(self.exchange, limit)
        } else {
            1
        };
        self.limiter.acquire(weight).await?;

        debug!(
            exchange = %self.exchange,
            symbol,
            limit,
            "fetching depth snapshot"
        );

        let result = if self.exchange.is_binance() {
            self.fetch_binance(symbol, limit).await
        } else {
            self.fetch_okx(symbol, limit).await
        };

        match &result {
            Ok(snapshot) => {
                self.metrics.record_snapshot_fetched();
                self.last_fetch
                    .lock()
                    .await
                    .insert(symbol.to_string(), Instant::now());
                let mut factor = self.backoff_factor.lock().await;
                *factor = (*factor * 0.8).max(1.0);
                info!(
                    exchange = %self.exchange,
                    symbol,
                    last_update_id = snapshot.last_update_id,
                    bid_levels = snapshot.bids.len(),
                    ask_levels = snapshot.asks.len(),
                    "depth snapshot fetched"
                );
            }
            Err(err) => {
                self.metrics.record_snapshot_error();
                match err {
                    SnapshotError::Banned { until_ms } => {
                        error!(
                            exchange = %self.exchange,
                            symbol,
                            until_ms,
                            "REST access banned"
                        );
                    }
                    _ => warn!(exchange = %self.exchange, symbol, error = %err, "snapshot fetch failed"),
                }
            }
        }

        result
    }

    async fn fetch_binance(&self, symbol: &str, limit: usize) -> Result<Snapshot, SnapshotError> {
        let url = binance::snapshot_url(self.exchange, &self.base_url, symbol, limit);
        let response = self.client.get(&url).send().await.map_err(map_reqwest)?;
        let status = response.status().as_u16();

        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(self.handle_http_error(status, &body).await);
        }

        let body: binance::DepthSnapshotResponse =
            response.json().await.map_err(|e| SnapshotError::Parse(e.to_string()))?;

        Ok(Snapshot {
            bids: normalizer::parse_binance_levels(&body.bids)
                .map_err(|e| SnapshotError::Parse(e.to_string()))?,
            asks: normalizer::parse_binance_levels(&body.asks)
                .map_err(|e| SnapshotError::Parse(e.to_string()))?,
            last_update_id: body.last_update_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
        })
    }

    async fn fetch_okx(&self, symbol: &str, limit: usize) -> Result<Snapshot, SnapshotError> {
        let url = okx::snapshot_url(&self.base_url, symbol, limit);
        let response = self.client.get(&url).send().await.map_err(map_reqwest)?;
        let status = response.status().as_u16();

        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(self.handle_http_error(status, &body).await);
        }

        let body: okx::RestResponse =
            response.json().await.map_err(|e| SnapshotError::Parse(e.to_string()))?;
        if body.code != "0" {
            return Err(SnapshotError::Parse(format!(
                "OKX error code {}: {}",
                body.code, body.msg
            )));
        }
        let book = body
            .data
            .first()
            .ok_or_else(|| SnapshotError::Parse("empty OKX snapshot data".to_string()))?;

        let timestamp_ms = normalizer::parse_timestamp_ms(&book.ts)
            .map_err(|e| SnapshotError::Parse(e.to_string()))?;
        let last_update_id = match book.seq_id {
            Some(seq) if seq >= 0 => seq as u64,
            _ => timestamp_ms,
        };

        Ok(Snapshot {
            bids: normalizer::parse_okx_levels(&book.bids)
                .map_err(|e| SnapshotError::Parse(e.to_string()))?,
            asks: normalizer::parse_okx_levels(&book.asks)
                .map_err(|e| SnapshotError::Parse(e.to_string()))?,
            last_update_id,
            timestamp_ms,
        })
    }

    async fn handle_http_error(&self, status: u16, body: &str) -> SnapshotError {
        match status {
            418 => {
                let now_ms = chrono::Utc::now().timestamp_millis() as u64;
                let until_ms = parse_ban_deadline(body)
                    .map(|deadline| deadline + BAN_GRACE_MS)
                    .unwrap_or(now_ms + 300_000);
                self.ban_until_ms.store(until_ms, Ordering::Relaxed);
                let mut factor = self.backoff_factor.lock().await;
                *factor = (*factor * 2.0).min(MAX_BACKOFF_FACTOR);
                SnapshotError::Banned { until_ms }
            }
            429 => {
                let now_ms = chrono::Utc::now().timestamp_millis() as u64;
                self.cooldown_until_ms
                    .store(now_ms + self.cooldown.as_millis() as u64, Ordering::Relaxed);
                let mut factor = self.backoff_factor.lock().await;
                *factor = (*factor * 1.5).min(MAX_BACKOFF_FACTOR);
                SnapshotError::RateLimited {
                    retry_after_secs: self.cooldown.as_secs(),
                }
            }
            _ => SnapshotError::Http { status },
        }
    }
}

fn map_reqwest(err: reqwest::Error) -> SnapshotError {
    if err.is_timeout() {
        SnapshotError::Timeout
    } else {
        SnapshotError::Network(err.to_string())
    }
}

/// Extract the millisecond deadline from a Binance 418 body like
/// `{"code":-1003,"msg":"Way too much request weight used; IP banned until 1700000000000. ..."}`
pub fn parse_ban_deadline(body: &str) -> Option<u64> {
    let idx = body.find("banned until ")?;
    let digits: String = body[idx + "banned until ".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
