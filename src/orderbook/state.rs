//! Per-symbol synchronization state
//!
//! One `OrderBookState` exists per `(exchange, market_type, symbol)` and is
//! owned by that symbol's serial worker. All fields are declared up front;
//! nothing is attached dynamically during the lifecycle.

use std::collections::VecDeque;

use crate::exchange::SymbolKey;

use super::{BookUpdate, OrderBook};

/// Default bound of the pre-sync update buffer
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Initialization stage of a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Subscribed, caching raw updates until a snapshot is taken
    Subscribing,
    /// Snapshot fetched but not yet reconciled with the buffer
    Syncing,
    /// Book is live; updates validate and apply directly
    Running,
}

#[derive(Debug)]
pub struct OrderBookState {
    pub key: SymbolKey,
    pub book: Option<OrderBook>,
    pub stage: SyncStage,

    /// Raw updates cached while not synced; bounded, oldest dropped
    pub update_buffer: VecDeque<BookUpdate>,
    pub buffer_capacity: usize,
    pub buffered_dropped: u64,

    /// First `U` seen after (re)subscribing, used for snapshot arbitration
    pub first_buffered_update_id: u64,
    pub last_update_id: u64,
    pub last_seq_id: i64,
    pub snapshot_last_update_id: u64,

    pub is_synced: bool,
    pub sync_in_progress: bool,

    pub error_count: u32,
    pub retry_count: u32,
    pub consecutive_sequence_errors: u32,
    pub maintenance_resets: u64,

    pub last_snapshot_time_ms: u64,
    pub last_update_time_ms: u64,
}

impl OrderBookState {
    pub fn new(key: SymbolKey, buffer_capacity: usize) -> Self {
        Self {
            key,
            book: None,
            stage: SyncStage::Subscribing,
            update_buffer: VecDeque::with_capacity(buffer_capacity.min(1024)),
            buffer_capacity,
            buffered_dropped: 0,
            first_buffered_update_id: 0,
            last_update_id: 0,
            last_seq_id: 0,
            snapshot_last_update_id: 0,
            is_synced: false,
            sync_in_progress: false,
            error_count: 0,
            retry_count: 0,
            consecutive_sequence_errors: 0,
            maintenance_resets: 0,
            last_snapshot_time_ms: 0,
            last_update_time_ms: 0,
        }
    }

    /// Buffer a pre-sync update, dropping the oldest entry on overflow.
    /// Returns true when an old entry had to be evicted.
    pub fn buffer_update(&mut self, update: BookUpdate) -> bool {
        if let BookUpdate::Binance(binance) = &update {
            if self.first_buffered_update_id == 0 || self.update_buffer.is_empty() {
                self.first_buffered_update_id = binance.first_update_id;
            }
        }

        let mut evicted = false;
        if self.update_buffer.len() >= self.buffer_capacity {
            self.update_buffer.pop_front();
            self.buffered_dropped += 1;
            evicted = true;
            // The oldest cached id is gone; recompute the window start
            if let Some(BookUpdate::Binance(front)) = self.update_buffer.front() {
                self.first_buffered_update_id = front.first_update_id;
            }
        }
        self.update_buffer.push_back(update);
        evicted
    }

    /// Final update id of the newest buffered Binance event, if any
    pub fn last_buffered_final_id(&self) -> Option<u64> {
        self.update_buffer.iter().rev().find_map(|u| match u {
            BookUpdate::Binance(b) => Some(b.final_update_id),
            BookUpdate::Okx(_) => None,
        })
    }

    /// Mark the symbol synced after snapshot install and buffer replay
    pub fn mark_synced(&mut self, last_update_id: u64) {
        self.stage = SyncStage::Running;
        self.is_synced = true;
        self.sync_in_progress = false;
        self.last_update_id = last_update_id;
        self.consecutive_sequence_errors = 0;
        self.retry_count = 0;
        self.update_buffer.clear();
        self.first_buffered_update_id = 0;
    }

    /// Drop local state ahead of a resync. The buffer starts a new id epoch,
    /// so stale entries are cleared rather than retained.
    pub fn reset_for_resync(&mut self) {
        self.stage = SyncStage::Subscribing;
        self.book = None;
        self.is_synced = false;
        self.sync_in_progress = true;
        self.last_update_id = 0;
        self.last_seq_id = 0;
        self.snapshot_last_update_id = 0;
        self.first_buffered_update_id = 0;
        self.update_buffer.clear();
        self.consecutive_sequence_errors = 0;
        self.retry_count = self.retry_count.saturating_add(1);
    }
}
