//! Payload normalization helpers
//!
//! Pure functions converting raw exchange payloads into canonical symbols,
//! decimal price levels and trades. Prices and quantities are parsed with
//! `rust_decimal`, which keeps the scale of the exchange string so the
//! original form survives for checksum computation and publication.

use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

use crate::exchange::{ExchangeId, MarketType};
use crate::orderbook::PriceLevel;

/// Quote assets recognized when splitting concatenated Binance symbols,
/// longest first so `BTCUSDT` resolves to `BTC-USDT` and not `BTCUSD-T`.
const QUOTE_ASSETS: &[&str] = &[
    "FDUSD", "USDT", "USDC", "TUSD", "BUSD", "USD", "BTC", "ETH", "BNB", "EUR", "TRY", "DAI",
];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid price '{0}'")]
    InvalidPrice(String),
    #[error("invalid quantity '{0}'")]
    InvalidQuantity(String),
    #[error("level row has fewer than two fields")]
    ShortLevelRow,
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Standardize a symbol to `BASE-QUOTE` form.
///
/// `BTCUSDT` becomes `BTC-USDT`; `BTC-USDT-SWAP` becomes `BTC-USDT`. The
/// market type is carried separately in config and state keys, never
/// re-derived from the symbol.
pub fn standardize_symbol(raw: &str) -> String {
    let upper = raw.to_uppercase();

    if let Some(stripped) = upper.strip_suffix("-SWAP") {
        return stripped.to_string();
    }
    if upper.contains('-') {
        return upper;
    }

    for quote in QUOTE_ASSETS {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{}-{}", base, quote);
            }
        }
    }

    upper
}

/// Parse a price string, rejecting non-positive values
pub fn parse_price(raw: &str) -> Result<Decimal, NormalizeError> {
    let price =
        Decimal::from_str(raw).map_err(|_| NormalizeError::InvalidPrice(raw.to_string()))?;
    if price <= Decimal::ZERO {
        return Err(NormalizeError::InvalidPrice(raw.to_string()));
    }
    Ok(price)
}

/// Parse a quantity string, rejecting negative values. Zero is legal and
/// encodes level deletion inside updates.
pub fn parse_quantity(raw: &str) -> Result<Decimal, NormalizeError> {
    let quantity =
        Decimal::from_str(raw).map_err(|_| NormalizeError::InvalidQuantity(raw.to_string()))?;
    if quantity < Decimal::ZERO {
        return Err(NormalizeError::InvalidQuantity(raw.to_string()));
    }
    Ok(quantity)
}

/// Convert Binance `[price, qty]` rows to price levels
pub fn parse_binance_levels(rows: &[[String; 2]]) -> Result<Vec<PriceLevel>, NormalizeError> {
    rows.iter()
        .map(|row| {
            Ok(PriceLevel {
                price: parse_price(&row[0])?,
                quantity: parse_quantity(&row[1])?,
            })
        })
        .collect()
}

/// Convert OKX `[price, qty, liquidated, count]` rows to price levels.
/// Only the first two fields participate in the book.
pub fn parse_okx_levels(rows: &[Vec<String>]) -> Result<Vec<PriceLevel>, NormalizeError> {
    rows.iter()
        .map(|row| {
            if row.len() < 2 {
                return Err(NormalizeError::ShortLevelRow);
            }
            Ok(PriceLevel {
                price: parse_price(&row[0])?,
                quantity: parse_quantity(&row[1])?,
            })
        })
        .collect()
}

/// Parse an OKX millisecond timestamp string
pub fn parse_timestamp_ms(raw: &str) -> Result<u64, NormalizeError> {
    raw.parse::<u64>()
        .map_err(|_| NormalizeError::InvalidTimestamp(raw.to_string()))
}

/// Trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Canonical trade record published on `trade-data.*` subjects
#[derive(Debug, Clone)]
pub struct NormalizedTrade {
    pub exchange: ExchangeId,
    pub market_type: MarketType,
    pub symbol: String,
    pub trade_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: TradeSide,
    pub timestamp_ms: u64,
}

/// Normalize a Binance trade event
pub fn normalize_binance_trade(
    exchange: ExchangeId,
    event: &crate::exchange::binance::TradeEvent,
) -> Result<NormalizedTrade, NormalizeError> {
    Ok(NormalizedTrade {
        exchange,
        market_type: exchange.market_type(),
        symbol: event.symbol.clone(),
        trade_id: event.trade_id.to_string(),
        price: parse_price(&event.price)?,
        quantity: parse_quantity(&event.quantity)?,
        // On Binance `m = true` means the buyer is the maker, so the
        // aggressor side is sell.
        side: if event.is_buyer_maker {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        },
        timestamp_ms: event.trade_time,
    })
}

/// Normalize an OKX trade entry
pub fn normalize_okx_trade(
    exchange: ExchangeId,
    trade: &crate::exchange::okx::TradeData,
) -> Result<NormalizedTrade, NormalizeError> {
    Ok(NormalizedTrade {
        exchange,
        market_type: exchange.market_type(),
        symbol: trade.inst_id.clone(),
        trade_id: trade.trade_id.clone(),
        price: parse_price(&trade.price)?,
        quantity: parse_quantity(&trade.size)?,
        side: if trade.side == "buy" {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        },
        timestamp_ms: parse_timestamp_ms(&trade.ts)?,
    })
}
