//! Order book orchestration
//!
//! One `OrderBookManager` runs per configured (exchange, market) venue. It
//! owns the WebSocket connection, a router that fans frames out to
//! per-symbol queues, and one serial worker per symbol that executes the
//! whole validate → mutate → publish path. Workers are the only writers of
//! their symbol's state; auxiliary tasks (reconciliation, resync requests)
//! go through the same queue or the per-symbol mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{CollectorConfig, DataType, ProxyConfig, RateLimitConfig};
use crate::exchange::{ExchangeId, SymbolKey, binance, okx};
use crate::metrics::CollectorMetrics;
use crate::normalizer;
use crate::orderbook::sequence::{self, RESYNC_ERROR_THRESHOLD, Validation};
use crate::orderbook::state::{OrderBookState, SyncStage};
use crate::orderbook::{
    BinanceDepthUpdate, BookUpdate, OkxBookUpdate, OrderBook, OrderBookError, UpdateType, checksum,
};
use crate::publisher::{OrderBookMessage, PublisherHandle, TradeMessage};
use crate::snapshot::{Snapshot, SnapshotError, Snapshotter};
use crate::websocket::{self, WsConfig, WsEvent};

/// How long updates are cached before the first snapshot attempt
const SNAPSHOT_CACHE_WINDOW: Duration = Duration::from_secs(2);
/// Total grace for stale snapshots before the buffer restarts
const SNAPSHOT_GRACE: Duration = Duration::from_secs(30);
/// Worker tick when the queue is idle, drives sync progress
const IDLE_TICK: Duration = Duration::from_millis(250);
/// Divergence tolerance for periodic reconciliation (fraction of price)
const RECONCILE_TOLERANCE: f64 = 0.005;

/// Work delivered to a symbol worker
#[derive(Debug)]
pub enum WorkItem {
    Update { update: BookUpdate, retried: bool },
    ForceResync(&'static str),
}

/// Bounded per-symbol queue with drop-oldest overflow.
///
/// Single consumer (the symbol worker); producers are the router and the
/// reconciliation task.
pub struct SymbolQueue {
    inner: StdMutex<VecDeque<WorkItem>>,
    notify: Notify,
    capacity: usize,
}

impl SymbolQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push an item, evicting the oldest entry when full. Returns true if
    /// an eviction happened.
    pub fn push(&self, item: WorkItem) -> bool {
        let evicted = {
            let mut queue = self.inner.lock().expect("queue lock");
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Re-queue an item at the front (single-shot gap retry)
    pub fn push_front(&self, item: WorkItem) {
        {
            let mut queue = self.inner.lock().expect("queue lock");
            queue.push_front(item);
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> WorkItem {
        loop {
            if let Some(item) = self.inner.lock().expect("queue lock").pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time view of one symbol's sync state
#[derive(Debug, Clone, serde::Serialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub is_synced: bool,
    pub last_update_id: u64,
    pub last_seq_id: i64,
    pub retry_count: u32,
    pub maintenance_resets: u64,
}

pub struct OrderBookManager {
    pub exchange: ExchangeId,
    states: HashMap<String, Arc<Mutex<OrderBookState>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl OrderBookManager {
    /// Wire up the venue: WebSocket, router, one worker per symbol, and
    /// the optional reconciliation task.
    pub fn start(
        config: CollectorConfig,
        rate_limit: &RateLimitConfig,
        proxy: &ProxyConfig,
        publisher: PublisherHandle,
        metrics: Arc<CollectorMetrics>,
        shutdown: watch::Receiver<bool>,
        fatal_tx: mpsc::Sender<String>,
    ) -> anyhow::Result<Self> {
        let exchange = config.exchange;
        let snapshotter = Arc::new(Snapshotter::new(
            &config,
            rate_limit,
            proxy,
            Arc::clone(&metrics),
        )?);
        let config = Arc::new(config);

        let ws_handle = websocket::spawn(
            build_ws_config(&config),
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        let ws_commands = ws_handle.commands.clone();

        let mut states = HashMap::new();
        let mut queues = HashMap::new();
        let mut tasks = vec![ws_handle.task];

        for symbol in &config.symbols {
            let key = SymbolKey::new(exchange, symbol.clone());
            let state = Arc::new(Mutex::new(OrderBookState::new(
                key,
                config.buffer_capacity,
            )));
            let queue = Arc::new(SymbolQueue::new(config.queue_capacity));
            states.insert(symbol.clone(), Arc::clone(&state));
            queues.insert(symbol.clone(), Arc::clone(&queue));

            let worker = SymbolWorker {
                symbol: symbol.clone(),
                state,
                queue,
                config: Arc::clone(&config),
                snapshotter: Arc::clone(&snapshotter),
                publisher: publisher.clone(),
                metrics: Arc::clone(&metrics),
                ws_commands: ws_commands.clone(),
                shutdown: shutdown.clone(),
                cache_started: None,
                snapshot_wait_started: None,
                snapshot_retry_at: None,
            };
            tasks.push(spawn_supervised(worker));
        }

        let router = Router {
            exchange,
            config: Arc::clone(&config),
            queues: Arc::new(queues.clone()),
            publisher: publisher.clone(),
            metrics: Arc::clone(&metrics),
            fatal_tx,
        };
        tasks.push(tokio::spawn(router.run(ws_handle.events, shutdown.clone())));

        if config.snapshot_interval_secs > 0 {
            let reconciler = Reconciler {
                config: Arc::clone(&config),
                snapshotter,
                states: states.clone(),
                queues,
            };
            tasks.push(tokio::spawn(reconciler.run(shutdown)));
        }

        info!(
            exchange = %exchange,
            symbols = config.symbols.len(),
            "order book manager started"
        );

        Ok(Self {
            exchange,
            states,
            tasks,
        })
    }

    /// Per-symbol sync status for the stats report
    pub async fn status(&self) -> Vec<SymbolStatus> {
        let mut statuses = Vec::with_capacity(self.states.len());
        for state in self.states.values() {
            let state = state.lock().await;
            statuses.push(SymbolStatus {
                symbol: state.key.symbol.clone(),
                is_synced: state.is_synced,
                last_update_id: state.last_update_id,
                last_seq_id: state.last_seq_id,
                retry_count: state.retry_count,
                maintenance_resets: state.maintenance_resets,
            });
        }
        statuses
    }

    /// Wait for all venue tasks to wind down
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Optional background cross-check of local books against fresh REST
/// snapshots. Disabled unless `snapshot_interval_secs` is set.
struct Reconciler {
    config: Arc<CollectorConfig>,
    snapshotter: Arc<Snapshotter>,
    states: HashMap<String, Arc<Mutex<OrderBookState>>>,
    queues: HashMap<String, Arc<SymbolQueue>>,
}

impl Reconciler {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.snapshot_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = interval.tick() => {}
            }

            for (symbol, state) in &self.states {
                let snapshot = match self.snapshotter.fetch(symbol, false).await {
                    Ok(snapshot) => snapshot,
                    // Spacing and quota rejections are expected here
                    Err(SnapshotError::RateLimited { .. }) => continue,
                    Err(err) => {
                        debug!(symbol = %symbol, error = %err, "reconciliation snapshot failed");
                        continue;
                    }
                };

                let diverged = {
                    let state = state.lock().await;
                    if !state.is_synced {
                        continue;
                    }
                    match state.book.as_ref() {
                        Some(book) => {
                            book_diverged(book, &snapshot, self.config.exchange.is_binance())
                        }
                        None => continue,
                    }
                };

                if diverged {
                    warn!(symbol = %symbol, "reconciliation divergence, forcing resync");
                    if let Some(queue) = self.queues.get(symbol) {
                        queue.push(WorkItem::ForceResync("reconciliation divergence"));
                    }
                }
            }
        }
    }
}

/// Divergence test: the local book fell behind the REST view, or the top
/// of book drifted beyond tolerance.
fn book_diverged(book: &OrderBook, snapshot: &Snapshot, compare_ids: bool) -> bool {
    use rust_decimal::prelude::ToPrimitive;

    if compare_ids && snapshot.last_update_id > book.last_update_id {
        return true;
    }

    let pairs = [
        (book.best_bid(), snapshot.bids.first().cloned()),
        (book.best_ask(), snapshot.asks.first().cloned()),
    ];
    for (local, remote) in pairs {
        let (Some(local), Some(remote)) = (local, remote) else {
            continue;
        };
        let local_price = local.price.to_f64().unwrap_or(0.0);
        let remote_price = remote.price.to_f64().unwrap_or(0.0);
        if remote_price > 0.0 {
            let drift = ((local_price - remote_price) / remote_price).abs();
            if drift > RECONCILE_TOLERANCE {
                return true;
            }
        }
    }
    false
}

fn build_ws_config(config: &CollectorConfig) -> WsConfig {
    let exchange = config.exchange;
    let (url, subscribe_frames, text_ping) = if exchange.is_binance() {
        let mut streams = Vec::new();
        for symbol in &config.symbols {
            if config.collects(DataType::Orderbook) {
                streams.push(binance::depth_stream_name(symbol));
            }
            if config.collects(DataType::Trade) {
                streams.push(binance::trade_stream_name(symbol));
            }
        }
        let base = config
            .ws_url
            .clone()
            .unwrap_or_else(|| exchange.ws_url().to_string());
        let url = format!("{}/stream?streams={}", base, streams.join("/"));
        (url, vec![], false)
    } else {
        let mut channels = Vec::new();
        if config.collects(DataType::Orderbook) {
            channels.push("books");
        }
        if config.collects(DataType::Trade) {
            channels.push("trades");
        }
        let url = config
            .ws_url
            .clone()
            .unwrap_or_else(|| exchange.ws_url().to_string());
        let frame = okx::subscribe_frame(&channels, &config.symbols);
        (url, vec![frame], true)
    };

    WsConfig {
        url,
        subscribe_frames,
        ping_interval: Duration::from_secs(config.ping_interval_secs),
        idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        initial_backoff: Duration::from_secs(config.reconnect_delay_secs),
        max_backoff: Duration::from_secs(config.max_backoff_secs),
        max_reconnect_attempts: config.max_reconnect_attempts,
        text_ping,
    }
}

fn spawn_supervised(worker: SymbolWorker) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let run = worker.clone();
            let handle = tokio::spawn(run.run());
            match handle.await {
                Ok(()) => break,
                Err(err) if err.is_panic() => {
                    error!(
                        symbol = %worker.symbol,
                        "symbol worker panicked, restarting"
                    );
                    // Fresh epoch after a crash; siblings are unaffected
                    worker.state.lock().await.reset_for_resync();
                    worker.metrics.record_resync();
                }
                Err(_) => break,
            }
        }
    })
}

/// Routes frames from the connection to per-symbol queues and publishes
/// stateless trades directly.
struct Router {
    exchange: ExchangeId,
    config: Arc<CollectorConfig>,
    queues: Arc<HashMap<String, Arc<SymbolQueue>>>,
    publisher: PublisherHandle,
    metrics: Arc<CollectorMetrics>,
    fatal_tx: mpsc::Sender<String>,
}

impl Router {
    async fn run(self, mut events: mpsc::Receiver<WsEvent>, mut shutdown: watch::Receiver<bool>) {
        // Consecutive evictions per symbol; a full window of losses means
        // the worker cannot keep up and must rebuild from snapshot
        let mut eviction_streaks: HashMap<String, usize> = HashMap::new();

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event {
                WsEvent::Frame(text) => {
                    self.metrics.record_message_received();
                    if self.exchange.is_binance() {
                        self.route_binance_frame(&text, &mut eviction_streaks);
                    } else {
                        self.route_okx_frame(&text, &mut eviction_streaks);
                    }
                }
                WsEvent::Resubscribed => {
                    info!(exchange = %self.exchange, "resubscribed, forcing resync of all symbols");
                    for queue in self.queues.values() {
                        queue.push(WorkItem::ForceResync("websocket resubscribed"));
                    }
                }
                WsEvent::Failed => {
                    let _ = self
                        .fatal_tx
                        .send(format!("{} websocket permanently failed", self.exchange))
                        .await;
                    return;
                }
            }
        }
    }

    fn route_binance_frame(&self, text: &str, eviction_streaks: &mut HashMap<String, usize>) {
        let envelope: binance::StreamEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.metrics.record_parse_error();
                warn!(exchange = %self.exchange, error = %err, "malformed frame dropped");
                return;
            }
        };

        if envelope.stream.contains("@depth") {
            let event: binance::DepthUpdateEvent = match serde_json::from_value(envelope.data) {
                Ok(event) => event,
                Err(err) => {
                    self.metrics.record_parse_error();
                    warn!(stream = %envelope.stream, error = %err, "bad depth payload dropped");
                    return;
                }
            };
            let symbol = event.symbol.clone();
            match BinanceDepthUpdate::from_event(&event) {
                Ok(update) => {
                    self.enqueue(&symbol, BookUpdate::Binance(update), eviction_streaks)
                }
                Err(err) => {
                    self.metrics.record_parse_error();
                    warn!(symbol = %symbol, error = %err, "depth update normalization failed");
                }
            }
        } else if envelope.stream.contains("@trade") {
            let event: binance::TradeEvent = match serde_json::from_value(envelope.data) {
                Ok(event) => event,
                Err(err) => {
                    self.metrics.record_parse_error();
                    warn!(stream = %envelope.stream, error = %err, "bad trade payload dropped");
                    return;
                }
            };
            match normalizer::normalize_binance_trade(self.exchange, &event) {
                Ok(trade) => self.publisher.publish_trade(&TradeMessage::from_trade(&trade)),
                Err(err) => {
                    self.metrics.record_parse_error();
                    warn!(symbol = %event.symbol, error = %err, "trade normalization failed");
                }
            }
        }
    }

    fn route_okx_frame(&self, text: &str, eviction_streaks: &mut HashMap<String, usize>) {
        if let Ok(event) = serde_json::from_str::<okx::EventMessage>(text) {
            if event.event == "error" {
                warn!(
                    exchange = %self.exchange,
                    code = event.code.as_deref().unwrap_or(""),
                    msg = event.msg.as_deref().unwrap_or(""),
                    "subscription error"
                );
            } else {
                debug!(exchange = %self.exchange, event = %event.event, "channel event");
            }
            return;
        }

        let push: okx::PushMessage = match serde_json::from_str(text) {
            Ok(push) => push,
            Err(err) => {
                self.metrics.record_parse_error();
                warn!(exchange = %self.exchange, error = %err, "malformed frame dropped");
                return;
            }
        };

        match push.arg.channel.as_str() {
            "books" => {
                let action = push.action.as_deref().unwrap_or("update");
                for value in &push.data {
                    let data: okx::BookData = match serde_json::from_value(value.clone()) {
                        Ok(data) => data,
                        Err(err) => {
                            self.metrics.record_parse_error();
                            warn!(symbol = %push.arg.inst_id, error = %err, "bad book payload dropped");
                            continue;
                        }
                    };
                    match OkxBookUpdate::from_data(action, &data) {
                        Ok(update) => self.enqueue(
                            &push.arg.inst_id,
                            BookUpdate::Okx(update),
                            eviction_streaks,
                        ),
                        Err(err) => {
                            self.metrics.record_parse_error();
                            warn!(symbol = %push.arg.inst_id, error = %err, "book normalization failed");
                        }
                    }
                }
            }
            "trades" => {
                for value in &push.data {
                    let data: okx::TradeData = match serde_json::from_value(value.clone()) {
                        Ok(data) => data,
                        Err(err) => {
                            self.metrics.record_parse_error();
                            warn!(symbol = %push.arg.inst_id, error = %err, "bad trade payload dropped");
                            continue;
                        }
                    };
                    match normalizer::normalize_okx_trade(self.exchange, &data) {
                        Ok(trade) => {
                            self.publisher.publish_trade(&TradeMessage::from_trade(&trade))
                        }
                        Err(err) => {
                            self.metrics.record_parse_error();
                            warn!(symbol = %data.inst_id, error = %err, "trade normalization failed");
                        }
                    }
                }
            }
            other => {
                debug!(channel = %other, "unhandled channel");
            }
        }
    }

    fn enqueue(
        &self,
        symbol: &str,
        update: BookUpdate,
        eviction_streaks: &mut HashMap<String, usize>,
    ) {
        let Some(queue) = self.queues.get(symbol) else {
            debug!(symbol = %symbol, "frame for untracked symbol dropped");
            return;
        };

        let evicted = queue.push(WorkItem::Update {
            update,
            retried: false,
        });
        if evicted {
            self.metrics.record_message_dropped();
            let streak = eviction_streaks.entry(symbol.to_string()).or_insert(0);
            *streak += 1;
            warn!(symbol = %symbol, streak = *streak, "queue full, oldest message dropped");
            if *streak >= self.config.queue_capacity {
                queue.push(WorkItem::ForceResync("persistent queue overflow"));
                *streak = 0;
            }
        } else {
            eviction_streaks.remove(symbol);
        }
    }
}

/// Serial processor owning one symbol end-to-end
#[derive(Clone)]
struct SymbolWorker {
    symbol: String,
    state: Arc<Mutex<OrderBookState>>,
    queue: Arc<SymbolQueue>,
    config: Arc<CollectorConfig>,
    snapshotter: Arc<Snapshotter>,
    publisher: PublisherHandle,
    metrics: Arc<CollectorMetrics>,
    ws_commands: mpsc::Sender<String>,
    shutdown: watch::Receiver<bool>,
    // Sync bookkeeping for the current epoch, reset on resync
    cache_started: Option<Instant>,
    snapshot_wait_started: Option<Instant>,
    snapshot_retry_at: Option<Instant>,
}

impl SymbolWorker {
    async fn run(mut self) {
        debug!(symbol = %self.symbol, "symbol worker started");

        loop {
            if *self.shutdown.borrow() {
                debug!(symbol = %self.symbol, "symbol worker stopping");
                return;
            }

            let item = timeout(IDLE_TICK, self.queue.pop()).await;
            match item {
                Ok(WorkItem::ForceResync(reason)) => {
                    self.resync(reason).await;
                }
                Ok(WorkItem::Update { update, retried }) => {
                    self.handle_update(update, retried).await;
                }
                Err(_) => {} // idle tick
            }

            if self.config.exchange.is_binance() {
                self.maybe_sync_binance().await;
            }
        }
    }

    async fn handle_update(&mut self, update: BookUpdate, retried: bool) {
        match update {
            BookUpdate::Binance(update) => self.handle_binance_update(update, retried).await,
            BookUpdate::Okx(update) => self.handle_okx_update(update, retried).await,
        }
    }

    async fn handle_binance_update(&mut self, update: BinanceDepthUpdate, retried: bool) {
        // Lock through a clone so epoch fields on self stay assignable
        let state_mutex = Arc::clone(&self.state);
        let mut state = state_mutex.lock().await;

        if !state.is_synced {
            if self.cache_started.is_none() {
                self.cache_started = Some(Instant::now());
            }
            if state.buffer_update(BookUpdate::Binance(update)) {
                self.metrics.record_message_dropped();
            } else {
                self.metrics.record_update_buffered();
            }
            return;
        }

        let outcome = sequence::validate_binance(&mut state, &update);
        match outcome {
            Validation::Accept => {
                let timestamp = update.event_time_ms;
                let first = update.first_update_id;
                let prev = update.prev_final_update_id;
                if let Err(err) = self.apply_levels(&mut state, &update.bids, &update.asks, timestamp)
                {
                    drop(state);
                    self.fail_and_resync(err).await;
                    return;
                }
                self.metrics.record_update_applied();
                self.publish_book(&state, UpdateType::Update, Some(first), prev);
            }
            Validation::Stale => {
                debug!(symbol = %self.symbol, "stale update dropped");
            }
            Validation::Invalid(err) => {
                drop(state);
                self.handle_sequence_failure(BookUpdate::Binance(update), retried, err)
                    .await;
            }
            // OKX-only outcomes never come from the Binance validator
            Validation::Snapshot | Validation::Heartbeat | Validation::MaintenanceReset => {}
        }
    }

    async fn handle_okx_update(&mut self, update: OkxBookUpdate, retried: bool) {
        let mut state = self.state.lock().await;

        let outcome = sequence::validate_okx(&mut state, &update);
        match outcome {
            Validation::Snapshot => {
                let key = state.key.clone();
                let mut book = OrderBook::new(&key);
                let seq = update.seq_id.max(0) as u64;
                book.install_snapshot(&update.bids, &update.asks, seq, update.timestamp_ms);
                book.checksum = update.checksum;
                state.snapshot_last_update_id = seq;
                state.book = Some(book);
                state.mark_synced(seq);
                state.last_update_time_ms = update.timestamp_ms;

                if let (Some(received), Some(book)) = (update.checksum, state.book.as_ref()) {
                    if let Err(err) = checksum::verify(book, received) {
                        drop(state);
                        self.metrics.record_checksum_failure();
                        self.fail_and_resync(err).await;
                        return;
                    }
                }

                info!(symbol = %self.symbol, seq_id = update.seq_id, "book rebuilt from channel snapshot");
                self.publish_book(&state, UpdateType::Snapshot, None, None);
            }
            Validation::Accept | Validation::MaintenanceReset => {
                if matches!(outcome, Validation::MaintenanceReset) {
                    self.metrics.record_maintenance_reset();
                    info!(
                        symbol = %self.symbol,
                        seq_id = update.seq_id,
                        prev_seq_id = update.prev_seq_id,
                        "sequence maintenance reset"
                    );
                }
                if !state.is_synced || state.book.is_none() {
                    // Updates preceding the channel snapshot cannot chain
                    // onto anything; the snapshot will replace them
                    debug!(symbol = %self.symbol, "pre-snapshot update dropped");
                    return;
                }

                let prev = if update.prev_seq_id >= 0 {
                    Some(update.prev_seq_id as u64)
                } else {
                    None
                };
                if let Err(err) =
                    self.apply_levels(&mut state, &update.bids, &update.asks, update.timestamp_ms)
                {
                    drop(state);
                    self.fail_and_resync(err).await;
                    return;
                }
                let seq = update.seq_id.max(0) as u64;
                state.last_update_id = seq;
                if let Some(book) = state.book.as_mut() {
                    book.last_update_id = seq;
                    book.checksum = update.checksum;
                }

                if let (Some(received), Some(book)) = (update.checksum, state.book.as_ref()) {
                    if let Err(err) = checksum::verify(book, received) {
                        drop(state);
                        self.metrics.record_checksum_failure();
                        self.fail_and_resync(err).await;
                        return;
                    }
                }

                self.metrics.record_update_applied();
                self.publish_book(&state, UpdateType::Update, None, prev);
            }
            Validation::Heartbeat => {
                state.last_update_time_ms = update.timestamp_ms;
            }
            Validation::Stale => {}
            Validation::Invalid(err) => {
                drop(state);
                self.handle_sequence_failure(BookUpdate::Okx(update), retried, err)
                    .await;
            }
        }
    }

    /// Apply delta levels and re-check book invariants
    fn apply_levels(
        &self,
        state: &mut OrderBookState,
        bids: &[crate::orderbook::PriceLevel],
        asks: &[crate::orderbook::PriceLevel],
        timestamp_ms: u64,
    ) -> Result<(), OrderBookError> {
        let last_update_id = state.last_update_id;
        let book = state.book.as_mut().ok_or(OrderBookError::NotSynced)?;
        book.apply_levels(bids, asks);
        book.last_update_id = last_update_id;
        book.timestamp_ms = timestamp_ms;
        state.last_update_time_ms = timestamp_ms;
        book.validate_consistency()
    }

    async fn handle_sequence_failure(
        &mut self,
        update: BookUpdate,
        retried: bool,
        err: OrderBookError,
    ) {
        self.metrics.record_sequence_error();
        warn!(symbol = %self.symbol, error = %err, "sequence validation failed");

        let errors = self.state.lock().await.consecutive_sequence_errors;
        if errors >= RESYNC_ERROR_THRESHOLD {
            self.resync("sequence error threshold reached").await;
            return;
        }

        // A single out-of-order delivery gets one retry after the next
        // message has been processed
        if !retried {
            self.queue.push_front(WorkItem::Update {
                update,
                retried: true,
            });
        }
    }

    async fn fail_and_resync(&mut self, err: OrderBookError) {
        warn!(symbol = %self.symbol, error = %err, "book validation failed");
        if err.requires_resync() {
            self.resync("book validation failure").await;
        }
    }

    /// Resync policy: drop local state, back off exponentially, then
    /// re-enter SUBSCRIBING. OKX symbols are resubscribed so the server
    /// sends a fresh channel snapshot; Binance refetches over REST via the
    /// normal sync path.
    async fn resync(&mut self, reason: &str) {
        self.metrics.record_resync();

        let retry_count = {
            let mut state = self.state.lock().await;
            state.reset_for_resync();
            state.retry_count
        };

        let delay = resync_delay(retry_count);
        info!(
            symbol = %self.symbol,
            reason,
            retry_count,
            delay_secs = delay.as_secs(),
            "resyncing order book"
        );

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }

        if self.config.exchange.is_okx() {
            let unsubscribe = okx::unsubscribe_frame("books", &self.symbol);
            let channels: Vec<&str> = vec!["books"];
            let subscribe = okx::subscribe_frame(&channels, std::slice::from_ref(&self.symbol));
            if self.ws_commands.send(unsubscribe).await.is_err()
                || self.ws_commands.send(subscribe).await.is_err()
            {
                warn!(symbol = %self.symbol, "resubscribe frames not sent, connection is down");
            }
        }

        let mut state = self.state.lock().await;
        state.sync_in_progress = false;
        state.stage = SyncStage::Subscribing;
        drop(state);

        self.cache_started = None;
        self.snapshot_wait_started = None;
        self.snapshot_retry_at = None;
    }

    /// Binance initialization: once updates have been cached for the cache
    /// window, fetch a snapshot and reconcile it against the buffer.
    async fn maybe_sync_binance(&mut self) {
        {
            let state = self.state.lock().await;
            if state.is_synced || state.stage != SyncStage::Subscribing {
                return;
            }
            if state.update_buffer.is_empty() {
                return;
            }
        }

        let Some(started) = self.cache_started else {
            return;
        };
        if started.elapsed() < SNAPSHOT_CACHE_WINDOW {
            return;
        }
        if let Some(retry_at) = self.snapshot_retry_at {
            if Instant::now() < retry_at {
                return;
            }
        }

        let snapshot = match self.snapshotter.fetch(&self.symbol, true).await {
            Ok(snapshot) => snapshot,
            Err(SnapshotError::Banned { until_ms }) => {
                let now_ms = chrono::Utc::now().timestamp_millis() as u64;
                let wait = Duration::from_millis(until_ms.saturating_sub(now_ms).max(1_000));
                self.snapshot_retry_at = Some(Instant::now() + wait);
                return;
            }
            Err(SnapshotError::RateLimited { retry_after_secs }) => {
                self.snapshot_retry_at =
                    Some(Instant::now() + Duration::from_secs(retry_after_secs));
                return;
            }
            Err(_) => {
                self.snapshot_retry_at = Some(Instant::now() + Duration::from_secs(2));
                return;
            }
        };

        let state_mutex = Arc::clone(&self.state);
        let mut state = state_mutex.lock().await;
        let first_buffered = state.first_buffered_update_id;
        let last_buffered = state.last_buffered_final_id().unwrap_or(0);

        if snapshot.last_update_id < first_buffered {
            // Snapshot predates the cache; wait within the grace window
            let waited = *self.snapshot_wait_started.get_or_insert(started);
            if waited.elapsed() > SNAPSHOT_GRACE {
                warn!(
                    symbol = %self.symbol,
                    snapshot_id = snapshot.last_update_id,
                    first_buffered,
                    "snapshot stale beyond grace, restarting buffer"
                );
                state.update_buffer.clear();
                state.first_buffered_update_id = 0;
                self.cache_started = None;
                self.snapshot_wait_started = None;
            } else {
                info!(
                    symbol = %self.symbol,
                    snapshot_id = snapshot.last_update_id,
                    first_buffered,
                    "snapshot too old, retrying"
                );
                self.snapshot_retry_at = Some(Instant::now() + Duration::from_secs(1));
            }
            return;
        }

        self.install_snapshot(&mut state, &snapshot);

        if snapshot.last_update_id > last_buffered {
            // Snapshot is ahead of everything cached. Go live on the
            // snapshot alone: the validator stale-drops the cached window
            // and accepts the first event covering S+1 as the stream
            // catches up; a real hole trips the sequence threshold.
            info!(
                symbol = %self.symbol,
                snapshot_id = snapshot.last_update_id,
                last_buffered,
                "snapshot ahead of buffer, waiting for stream"
            );
            state.mark_synced(snapshot.last_update_id);
            self.cache_started = None;
            self.snapshot_wait_started = None;
            self.snapshot_retry_at = None;
            self.publish_book(&state, UpdateType::Snapshot, None, None);
            return;
        }

        // Replay the cached window through the canonical validator
        let buffered: Vec<BookUpdate> = state.update_buffer.drain(..).collect();
        let mut applied = 0usize;
        for update in buffered {
            let BookUpdate::Binance(update) = update else {
                continue;
            };
            match sequence::validate_binance(&mut state, &update) {
                Validation::Accept => {
                    if let Err(err) = self.apply_levels(
                        &mut state,
                        &update.bids,
                        &update.asks,
                        update.event_time_ms,
                    ) {
                        drop(state);
                        self.fail_and_resync(err).await;
                        return;
                    }
                    applied += 1;
                }
                Validation::Stale => {}
                Validation::Invalid(err) => {
                    warn!(symbol = %self.symbol, error = %err, "gap inside cached window");
                    drop(state);
                    self.resync("gap while replaying buffer").await;
                    return;
                }
                _ => {}
            }
        }

        let last = state.last_update_id;
        state.mark_synced(last);
        self.cache_started = None;
        self.snapshot_wait_started = None;
        self.snapshot_retry_at = None;
        info!(
            symbol = %self.symbol,
            snapshot_id = snapshot.last_update_id,
            applied,
            last_update_id = last,
            "book synchronized"
        );
        self.publish_book(&state, UpdateType::Snapshot, None, None);
    }

    fn install_snapshot(&self, state: &mut OrderBookState, snapshot: &Snapshot) {
        let key = state.key.clone();
        let mut book = OrderBook::new(&key);
        book.install_snapshot(
            &snapshot.bids,
            &snapshot.asks,
            snapshot.last_update_id,
            snapshot.timestamp_ms,
        );
        state.book = Some(book);
        state.snapshot_last_update_id = snapshot.last_update_id;
        state.last_update_id = snapshot.last_update_id;
        state.last_snapshot_time_ms = chrono::Utc::now().timestamp_millis() as u64;
    }

    fn publish_book(
        &self,
        state: &OrderBookState,
        update_type: UpdateType,
        first_update_id: Option<u64>,
        prev_update_id: Option<u64>,
    ) {
        let Some(book) = state.book.as_ref() else {
            return;
        };
        let mut message =
            OrderBookMessage::from_book(book, update_type, self.config.publish_depth);
        message.first_update_id = first_update_id;
        message.prev_update_id = prev_update_id;
        self.publisher.publish_orderbook(&message);
    }
}

/// Exponential resync delay: `min(10 * 2^retries, 120)` seconds
pub fn resync_delay(retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(8);
    Duration::from_secs((10u64 << exponent).min(120))
}
