//! Order book core: price levels, the per-symbol book, and normalized
//! depth updates
//!
//! Book sides live in `BTreeMap<Decimal, Decimal>` keyed by price, which
//! keeps bids/asks strictly ordered with unique prices by construction.
//! Decimals are parsed straight from the exchange strings so their display
//! form round-trips into checksum payloads and published JSON.

pub mod checksum;
pub mod manager;
pub mod sequence;
pub mod state;

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::exchange::binance::DepthUpdateEvent;
use crate::exchange::okx::BookData;
use crate::exchange::{ExchangeId, MarketType, SymbolKey};
use crate::normalizer::{self, NormalizeError};

/// A single price level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Whether a published book view is a full snapshot or an incremental state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Snapshot,
    Update,
}

/// Normalized Binance depth diff
#[derive(Debug, Clone)]
pub struct BinanceDepthUpdate {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub prev_final_update_id: Option<u64>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub event_time_ms: u64,
}

impl BinanceDepthUpdate {
    pub fn from_event(event: &DepthUpdateEvent) -> Result<Self, NormalizeError> {
        Ok(Self {
            first_update_id: event.first_update_id,
            final_update_id: event.final_update_id,
            prev_final_update_id: event.prev_final_update_id,
            bids: normalizer::parse_binance_levels(&event.bids)?,
            asks: normalizer::parse_binance_levels(&event.asks)?,
            event_time_ms: event.event_time,
        })
    }
}

/// OKX `books` push action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OkxAction {
    Snapshot,
    Update,
}

/// Normalized OKX book message
#[derive(Debug, Clone)]
pub struct OkxBookUpdate {
    pub action: OkxAction,
    pub seq_id: i64,
    pub prev_seq_id: i64,
    pub checksum: Option<i32>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp_ms: u64,
}

impl OkxBookUpdate {
    pub fn from_data(action: &str, data: &BookData) -> Result<Self, NormalizeError> {
        Ok(Self {
            action: if action == "snapshot" {
                OkxAction::Snapshot
            } else {
                OkxAction::Update
            },
            seq_id: data.seq_id,
            prev_seq_id: data.prev_seq_id.unwrap_or(-1),
            checksum: data.checksum.map(|c| c as i32),
            bids: normalizer::parse_okx_levels(&data.bids)?,
            asks: normalizer::parse_okx_levels(&data.asks)?,
            timestamp_ms: normalizer::parse_timestamp_ms(&data.ts)?,
        })
    }
}

/// A buffered or in-flight depth update from either venue family
#[derive(Debug, Clone)]
pub enum BookUpdate {
    Binance(BinanceDepthUpdate),
    Okx(OkxBookUpdate),
}

impl BookUpdate {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            BookUpdate::Binance(u) => u.event_time_ms,
            BookUpdate::Okx(u) => u.timestamp_ms,
        }
    }

    pub fn levels(&self) -> (&[PriceLevel], &[PriceLevel]) {
        match self {
            BookUpdate::Binance(u) => (&u.bids, &u.asks),
            BookUpdate::Okx(u) => (&u.bids, &u.asks),
        }
    }
}

/// Errors raised by book mutation and validation
#[derive(Debug, thiserror::Error)]
pub enum OrderBookError {
    #[error("stale update: u={final_update_id} <= last_update_id={last_update_id}")]
    StaleUpdate {
        final_update_id: u64,
        last_update_id: u64,
    },
    #[error(
        "sequence gap: expected first_update_id {expected}, got U={first_update_id} u={final_update_id}"
    )]
    SequenceGap {
        expected: u64,
        first_update_id: u64,
        final_update_id: u64,
    },
    #[error("prev-id mismatch: pu={prev_update_id}, expected {expected}")]
    PrevIdMismatch { expected: u64, prev_update_id: u64 },
    #[error("derivatives update is missing the pu field")]
    MissingPrevId,
    #[error(
        "seq discontinuity: prevSeqId={prev_seq_id} seqId={seq_id}, expected prevSeqId {expected_prev}"
    )]
    SeqDiscontinuity {
        expected_prev: i64,
        prev_seq_id: i64,
        seq_id: i64,
    },
    #[error("checksum mismatch: received {received}, computed {computed}")]
    ChecksumMismatch { received: i32, computed: i32 },
    #[error("crossed book: best_bid {best_bid} >= best_ask {best_ask}")]
    CrossedBook {
        best_bid: Decimal,
        best_ask: Decimal,
    },
    #[error("invalid level: {0}")]
    InvalidLevel(String),
    #[error("book not synced")]
    NotSynced,
}

impl OrderBookError {
    /// True when processing can continue without touching the book
    pub fn is_recoverable(&self) -> bool {
        matches!(self, OrderBookError::StaleUpdate { .. })
    }

    /// True when the symbol must be rebuilt from a fresh snapshot
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            OrderBookError::SequenceGap { .. }
                | OrderBookError::PrevIdMismatch { .. }
                | OrderBookError::MissingPrevId
                | OrderBookError::SeqDiscontinuity { .. }
                | OrderBookError::ChecksumMismatch { .. }
                | OrderBookError::CrossedBook { .. }
                | OrderBookError::InvalidLevel(_)
        )
    }
}

/// Full-depth local book for one `(exchange, market_type, symbol)`
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub exchange: ExchangeId,
    pub market_type: MarketType,
    pub symbol: String,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    pub last_update_id: u64,
    pub timestamp_ms: u64,
    pub checksum: Option<i32>,
}

impl OrderBook {
    pub fn new(key: &SymbolKey) -> Self {
        Self {
            exchange: key.exchange,
            market_type: key.market_type,
            symbol: key.symbol.clone(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            timestamp_ms: 0,
            checksum: None,
        }
    }

    /// Replace the whole book with snapshot levels
    pub fn install_snapshot(
        &mut self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        last_update_id: u64,
        timestamp_ms: u64,
    ) {
        self.bids.clear();
        self.asks.clear();
        for level in bids {
            if level.quantity > Decimal::ZERO {
                self.bids.insert(level.price, level.quantity);
            }
        }
        for level in asks {
            if level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }
        self.last_update_id = last_update_id;
        self.timestamp_ms = timestamp_ms;
    }

    /// Apply delta levels: quantity zero removes the price, anything else
    /// sets it. Ordering is structural in the maps.
    pub fn apply_levels(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        for level in bids {
            if level.quantity.is_zero() {
                self.bids.remove(&level.price);
            } else {
                self.bids.insert(level.price, level.quantity);
            }
        }
        for level in asks {
            if level.quantity.is_zero() {
                self.asks.remove(&level.price);
            } else {
                self.asks.insert(level.price, level.quantity);
            }
        }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.iter().next_back().map(|(p, q)| PriceLevel {
            price: *p,
            quantity: *q,
        })
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.iter().next().map(|(p, q)| PriceLevel {
            price: *p,
            quantity: *q,
        })
    }

    /// Top `limit` bids, price descending. `usize::MAX` yields the full side.
    pub fn bid_levels(&self, limit: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .take(limit)
            .map(|(p, q)| PriceLevel {
                price: *p,
                quantity: *q,
            })
            .collect()
    }

    /// Top `limit` asks, price ascending
    pub fn ask_levels(&self, limit: usize) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(limit)
            .map(|(p, q)| PriceLevel {
                price: *p,
                quantity: *q,
            })
            .collect()
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_count(&self) -> usize {
        self.asks.len()
    }

    pub fn depth_levels(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    /// Invariants that must hold on a synced book: positive spread and no
    /// zero-quantity levels.
    pub fn validate_consistency(&self) -> Result<(), OrderBookError> {
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid.price >= ask.price {
                return Err(OrderBookError::CrossedBook {
                    best_bid: bid.price,
                    best_ask: ask.price,
                });
            }
        }

        for (price, quantity) in self.bids.iter().chain(self.asks.iter()) {
            if *quantity <= Decimal::ZERO {
                return Err(OrderBookError::InvalidLevel(format!(
                    "non-positive quantity {} at price {}",
                    quantity, price
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, quantity: Decimal) -> PriceLevel {
        PriceLevel { price, quantity }
    }

    fn test_book() -> OrderBook {
        let key = SymbolKey::new(ExchangeId::BinanceSpot, "BTCUSDT");
        let mut book = OrderBook::new(&key);
        book.install_snapshot(
            &[level(dec!(100.0), dec!(1.0)), level(dec!(99.5), dec!(2.0))],
            &[level(dec!(100.5), dec!(0.8)), level(dec!(101.0), dec!(2.3))],
            10,
            1_000,
        );
        book
    }

    #[test]
    fn test_snapshot_install_orders_sides() {
        let book = test_book();
        assert_eq!(book.best_bid().unwrap().price, dec!(100.0));
        assert_eq!(book.best_ask().unwrap().price, dec!(100.5));
        assert_eq!(book.depth_levels(), 4);
    }

    #[test]
    fn test_snapshot_install_is_idempotent() {
        let mut book = test_book();
        let bids = book.bid_levels(usize::MAX);
        let asks = book.ask_levels(usize::MAX);
        book.install_snapshot(&bids, &asks, book.last_update_id, book.timestamp_ms);

        assert_eq!(book.bid_levels(usize::MAX), bids);
        assert_eq!(book.ask_levels(usize::MAX), asks);
        assert_eq!(book.last_update_id, 10);
    }

    #[test]
    fn test_zero_quantity_deletes_level() {
        let mut book = test_book();
        book.apply_levels(&[level(dec!(100.0), dec!(0))], &[]);
        assert_eq!(book.best_bid().unwrap().price, dec!(99.5));
        book.apply_levels(&[], &[level(dec!(100.5), dec!(0))]);
        assert_eq!(book.best_ask().unwrap().price, dec!(101.0));
    }

    #[test]
    fn test_apply_levels_replaces_quantity() {
        let mut book = test_book();
        book.apply_levels(&[level(dec!(100.0), dec!(5.5))], &[]);
        assert_eq!(book.best_bid().unwrap().quantity, dec!(5.5));
    }

    #[test]
    fn test_consistency_detects_crossed_book() {
        let mut book = test_book();
        book.apply_levels(&[level(dec!(100.6), dec!(1.0))], &[]);
        let err = book.validate_consistency().unwrap_err();
        assert!(matches!(err, OrderBookError::CrossedBook { .. }));
        assert!(err.requires_resync());
    }

    #[test]
    fn test_truncated_views() {
        let book = test_book();
        let bids = book.bid_levels(1);
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].price, dec!(100.0));
        let asks = book.ask_levels(1);
        assert_eq!(asks[0].price, dec!(100.5));
    }

    #[test]
    fn test_stale_error_is_recoverable() {
        let err = OrderBookError::StaleUpdate {
            final_update_id: 5,
            last_update_id: 10,
        };
        assert!(err.is_recoverable());
        assert!(!err.requires_resync());
    }
}
