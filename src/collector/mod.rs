//! Collector service wiring
//!
//! Builds the publisher and one order book manager per configured venue,
//! then supervises them until shutdown. Venue failures are isolated: only
//! an exhausted reconnect budget bubbles up as fatal.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::exchange::ExchangeId;
use crate::metrics::{CollectorMetrics, MetricsSnapshot};
use crate::orderbook::manager::{OrderBookManager, SymbolStatus};
use crate::publisher::{NatsPublisher, PublishStatsSnapshot, PublisherHandle};

/// Drain budget for managers and the publisher on shutdown
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Aggregated service status
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollectorStats {
    pub venues: Vec<VenueStats>,
    pub metrics: MetricsSnapshot,
    pub publish: PublishStatsSnapshot,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VenueStats {
    pub exchange: ExchangeId,
    pub symbols: Vec<SymbolStatus>,
}

pub struct Collector {
    managers: Vec<OrderBookManager>,
    publisher: PublisherHandle,
    publisher_task: Option<JoinHandle<()>>,
    metrics: Arc<CollectorMetrics>,
    shutdown_tx: watch::Sender<bool>,
    fatal_rx: mpsc::Receiver<String>,
}

impl Collector {
    /// Connect downstream and start every configured venue
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(CollectorMetrics::new());

        let (publisher, publisher_task) = if config.nats.enabled {
            let nats = NatsPublisher::connect(&config.nats)
                .await
                .context("connecting to NATS")?;
            let (handle, task) = nats.start(config.nats.queue_capacity, Arc::clone(&metrics));
            (handle, Some(task))
        } else {
            warn!("NATS publication disabled, collected data is discarded");
            (PublisherHandle::disabled(Arc::clone(&metrics)), None)
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::channel(8);

        let mut managers = Vec::with_capacity(config.collectors.len());
        for collector_config in &config.collectors {
            let manager = OrderBookManager::start(
                collector_config.clone(),
                &config.rate_limit,
                &config.proxy,
                publisher.clone(),
                Arc::clone(&metrics),
                shutdown_rx.clone(),
                fatal_tx.clone(),
            )
            .with_context(|| format!("starting {} collector", collector_config.exchange))?;
            managers.push(manager);
        }

        info!(venues = managers.len(), "collector started");

        Ok(Self {
            managers,
            publisher,
            publisher_task,
            metrics,
            shutdown_tx,
            fatal_rx,
        })
    }

    /// Block until ctrl-c or a fatal venue failure
    pub async fn run_until_shutdown(&mut self) -> anyhow::Result<()> {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "ctrl-c handler failed, shutting down");
                }
                info!("shutdown signal received");
                Ok(())
            }
            reason = self.fatal_rx.recv() => {
                let reason = reason.unwrap_or_else(|| "collector channel closed".to_string());
                error!(reason = %reason, "unrecoverable failure");
                anyhow::bail!(reason)
            }
        }
    }

    /// Current per-venue sync state plus counters
    pub async fn stats(&self) -> CollectorStats {
        let mut venues = Vec::with_capacity(self.managers.len());
        for manager in &self.managers {
            venues.push(VenueStats {
                exchange: manager.exchange,
                symbols: manager.status().await,
            });
        }
        CollectorStats {
            venues,
            metrics: self.metrics.snapshot(),
            publish: self.publisher.stats(),
        }
    }

    /// Signal every task, drain with a deadline, and report final stats
    pub async fn stop(mut self) -> CollectorStats {
        let stats = self.stats().await;
        let _ = self.shutdown_tx.send(true);

        for manager in self.managers.drain(..) {
            let exchange = manager.exchange;
            if timeout(STOP_DEADLINE, manager.join()).await.is_err() {
                warn!(exchange = %exchange, "manager did not drain before deadline");
            }
        }

        // Dropping the last publisher handle closes the channel and lets
        // the worker flush
        drop(self.publisher);
        if let Some(task) = self.publisher_task.take() {
            if timeout(STOP_DEADLINE, task).await.is_err() {
                warn!("publisher did not flush before deadline");
            }
        }

        info!(
            published = stats.publish.successful,
            publish_failures = stats.publish.failed,
            resyncs = stats.metrics.resyncs,
            "collector stopped"
        );
        stats
    }
}
