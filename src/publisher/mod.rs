//! NATS publication pipeline
//!
//! Book views and trades are serialized once, handed to a dedicated
//! publish task over a bounded channel, and sent to NATS with retries.
//! Subjects follow `{datatype}-data.{exchange}.{market_type}.{symbol}`.
//! Prefixes listed in the JetStream settings publish acked through the
//! `MARKET_DATA` stream; everything else is core fire-and-forget. The
//! symbol workers never block on publication: a full channel drops the
//! message and bumps a counter.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{JetStreamSettings, NatsSettings, StreamSettings};
use crate::exchange::{ExchangeId, MarketType};
use crate::metrics::CollectorMetrics;
use crate::normalizer::{NormalizedTrade, TradeSide, standardize_symbol};
use crate::orderbook::{OrderBook, UpdateType};

pub const STANDARDIZATION_VERSION: &str = "2.0";

/// Base delay for publish retry backoff
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("NATS connect failed: {0}")]
    Connect(String),
    #[error("stream setup failed: {0}")]
    Stream(String),
    #[error("serialization failed: {0}")]
    Serialize(String),
    #[error("publish failed after retries: {0}")]
    Transport(String),
}

/// Publish counters, shared with the status report
#[derive(Debug, Default)]
pub struct PublishStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    last_publish_ms: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishStatsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub dropped: u64,
    pub last_publish_ms: u64,
}

impl PublishStats {
    pub fn snapshot(&self) -> PublishStatsSnapshot {
        PublishStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            last_publish_ms: self.last_publish_ms.load(Ordering::Relaxed),
        }
    }
}

/// Published order book payload. Level rows are 2-string arrays carrying
/// the exchange decimal form verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookMessage {
    pub exchange_name: ExchangeId,
    pub market_type: MarketType,
    pub symbol: String,
    pub update_type: UpdateType,
    pub last_update_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_update_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_update_id: Option<u64>,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
    pub depth_levels: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<i32>,
    /// Event time from the exchange in epoch milliseconds
    pub timestamp: u64,
    pub publisher: String,
    pub standardized_at: String,
    pub standardization_version: &'static str,
}

impl OrderBookMessage {
    /// Truncated view of a book ready for publication
    pub fn from_book(book: &OrderBook, update_type: UpdateType, publish_depth: usize) -> Self {
        let bids: Vec<[String; 2]> = book
            .bid_levels(publish_depth)
            .iter()
            .map(|l| [l.price.to_string(), l.quantity.to_string()])
            .collect();
        let asks: Vec<[String; 2]> = book
            .ask_levels(publish_depth)
            .iter()
            .map(|l| [l.price.to_string(), l.quantity.to_string()])
            .collect();
        let depth_levels = bids.len() + asks.len();

        Self {
            exchange_name: book.exchange,
            market_type: book.market_type,
            symbol: standardize_symbol(&book.symbol),
            update_type,
            last_update_id: book.last_update_id,
            first_update_id: None,
            prev_update_id: None,
            bids,
            asks,
            depth_levels,
            checksum: book.checksum,
            timestamp: book.timestamp_ms,
            publisher: "bookstream-collector".to_string(),
            standardized_at: chrono::Utc::now().to_rfc3339(),
            standardization_version: STANDARDIZATION_VERSION,
        }
    }

    pub fn subject(&self) -> String {
        format!(
            "orderbook-data.{}.{}.{}",
            self.exchange_name, self.market_type, self.symbol
        )
    }
}

/// Published trade payload
#[derive(Debug, Clone, Serialize)]
pub struct TradeMessage {
    pub exchange_name: ExchangeId,
    pub market_type: MarketType,
    pub symbol: String,
    pub trade_id: String,
    pub price: String,
    pub quantity: String,
    pub side: TradeSide,
    pub timestamp: u64,
    pub publisher: String,
    pub standardized_at: String,
    pub standardization_version: &'static str,
}

impl TradeMessage {
    pub fn from_trade(trade: &NormalizedTrade) -> Self {
        Self {
            exchange_name: trade.exchange,
            market_type: trade.market_type,
            symbol: standardize_symbol(&trade.symbol),
            trade_id: trade.trade_id.clone(),
            price: trade.price.to_string(),
            quantity: trade.quantity.to_string(),
            side: trade.side,
            timestamp: trade.timestamp_ms,
            publisher: "bookstream-collector".to_string(),
            standardized_at: chrono::Utc::now().to_rfc3339(),
            standardization_version: STANDARDIZATION_VERSION,
        }
    }

    pub fn subject(&self) -> String {
        format!(
            "trade-data.{}.{}.{}",
            self.exchange_name, self.market_type, self.symbol
        )
    }
}

struct PublishJob {
    subject: String,
    payload: Bytes,
}

/// Connected NATS publisher
pub struct NatsPublisher {
    client: async_nats::Client,
    jetstream: Option<async_nats::jetstream::Context>,
    jetstream_prefixes: Vec<String>,
    max_retries: u32,
    publish_timeout: Duration,
    stats: Arc<PublishStats>,
}

impl NatsPublisher {
    pub async fn connect(settings: &NatsSettings) -> Result<Self, PublishError> {
        let servers = settings.servers.join(",");
        let client = async_nats::ConnectOptions::new()
            .name(settings.client_name.as_str())
            .connect(servers.as_str())
            .await
            .map_err(|e| PublishError::Connect(e.to_string()))?;
        info!(servers = %servers, client_name = %settings.client_name, "connected to NATS");

        let jetstream = if settings.jetstream.enabled {
            let context = async_nats::jetstream::new(client.clone());
            ensure_stream(&context, &settings.jetstream.stream).await?;
            Some(context)
        } else {
            None
        };

        Ok(Self {
            client,
            jetstream,
            jetstream_prefixes: settings.jetstream.subject_prefixes.clone(),
            max_retries: settings.max_retries,
            publish_timeout: Duration::from_secs(settings.publish_timeout_secs),
            stats: Arc::new(PublishStats::default()),
        })
    }

    fn uses_jetstream(&self, subject: &str) -> bool {
        self.jetstream.is_some()
            && self
                .jetstream_prefixes
                .iter()
                .any(|prefix| subject.starts_with(prefix.as_str()))
    }

    /// Publish with exponential retry. At-least-once on JetStream subjects
    /// (server ack awaited), fire-and-forget on the rest.
    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), PublishError> {
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        let attempts = self.max_retries.saturating_add(1);
        let acked = self.uses_jetstream(&subject);

        for attempt in 0..attempts {
            let result = if acked {
                self.publish_jetstream(&subject, payload.clone()).await
            } else {
                self.publish_core(&subject, payload.clone()).await
            };

            match result {
                Ok(()) => {
                    self.stats.successful.fetch_add(1, Ordering::Relaxed);
                    self.stats.last_publish_ms.store(
                        chrono::Utc::now().timestamp_millis() as u64,
                        Ordering::Relaxed,
                    );
                    debug!(subject = %subject, acked, "published");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        subject = %subject,
                        attempt = attempt + 1,
                        max = attempts,
                        error = %err,
                        "publish failed, retrying"
                    );
                    if attempt + 1 < attempts {
                        let delay = RETRY_BASE_DELAY * (1u32 << attempt.min(10));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        error!(subject = %subject, "publish failed after all retries, dropping message");
        Err(PublishError::Transport(subject))
    }

    async fn publish_jetstream(&self, subject: &str, payload: Bytes) -> Result<(), PublishError> {
        let jetstream = self
            .jetstream
            .as_ref()
            .expect("jetstream checked by uses_jetstream");
        let publish = async {
            let ack = jetstream
                .publish(subject.to_string(), payload)
                .await
                .map_err(|e| PublishError::Transport(e.to_string()))?;
            ack.await
                .map_err(|e| PublishError::Transport(e.to_string()))?;
            Ok(())
        };
        timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| PublishError::Transport("publish timeout".to_string()))?
    }

    async fn publish_core(&self, subject: &str, payload: Bytes) -> Result<(), PublishError> {
        let publish = async {
            self.client
                .publish(subject.to_string(), payload)
                .await
                .map_err(|e| PublishError::Transport(e.to_string()))
        };
        timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| PublishError::Transport("publish timeout".to_string()))?
    }

    /// Spawn the publish worker and return the non-blocking handle
    pub fn start(
        self,
        queue_capacity: usize,
        metrics: Arc<CollectorMetrics>,
    ) -> (PublisherHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<PublishJob>(queue_capacity);
        let stats = Arc::clone(&self.stats);
        let worker_metrics = Arc::clone(&metrics);

        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match self.publish(job.subject, job.payload).await {
                    Ok(()) => worker_metrics.record_published(),
                    Err(_) => worker_metrics.record_publish_failure(),
                }
            }
            if let Err(err) = self.client.flush().await {
                warn!(error = %err, "final NATS flush failed");
            }
        });

        (
            PublisherHandle {
                tx: Some(tx),
                stats,
                metrics,
            },
            task,
        )
    }
}

async fn ensure_stream(
    context: &async_nats::jetstream::Context,
    settings: &StreamSettings,
) -> Result<(), PublishError> {
    use async_nats::jetstream::stream::{Config, DiscardPolicy, RetentionPolicy, StorageType};

    let config = Config {
        name: settings.name.clone(),
        subjects: settings.subjects.iter().map(|s| s.clone().into()).collect(),
        retention: RetentionPolicy::Limits,
        max_messages: settings.max_msgs,
        max_bytes: settings.max_bytes,
        max_age: Duration::from_secs(settings.max_age_secs),
        storage: StorageType::File,
        discard: DiscardPolicy::Old,
        duplicate_window: Duration::from_secs(settings.duplicate_window_secs),
        num_replicas: 1,
        ..Default::default()
    };

    context
        .get_or_create_stream(config)
        .await
        .map_err(|e| PublishError::Stream(e.to_string()))?;
    info!(stream = %settings.name, "JetStream stream ready");
    Ok(())
}

/// Cheap-to-clone handle used by symbol workers and routers.
///
/// `disabled()` produces a no-op handle for runs without NATS.
#[derive(Clone)]
pub struct PublisherHandle {
    tx: Option<mpsc::Sender<PublishJob>>,
    stats: Arc<PublishStats>,
    metrics: Arc<CollectorMetrics>,
}

impl PublisherHandle {
    pub fn disabled(metrics: Arc<CollectorMetrics>) -> Self {
        Self {
            tx: None,
            stats: Arc::new(PublishStats::default()),
            metrics,
        }
    }

    pub fn stats(&self) -> PublishStatsSnapshot {
        self.stats.snapshot()
    }

    /// Enqueue an order book view. Never blocks: a full queue drops the
    /// message and bumps counters.
    pub fn publish_orderbook(&self, message: &OrderBookMessage) {
        self.enqueue(message.subject(), message);
    }

    pub fn publish_trade(&self, message: &TradeMessage) {
        self.enqueue(message.subject(), message);
    }

    fn enqueue<T: Serialize>(&self, subject: String, message: &T) {
        let Some(tx) = &self.tx else {
            return;
        };

        let payload = match serde_json::to_vec(message) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                error!(subject = %subject, error = %err, "payload serialization failed");
                self.metrics.record_publish_failure();
                return;
            }
        };

        if tx.try_send(PublishJob { subject, payload }).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_publish_dropped();
        }
    }
}
