//! Exchange identifiers, market types and per-venue constants

pub mod binance;
pub mod okx;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Market type of a collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Perpetual,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Perpetual => "perpetual",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported (exchange, market) venues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeId {
    BinanceSpot,
    BinanceDerivatives,
    OkxSpot,
    OkxDerivatives,
}

impl ExchangeId {
    pub fn name(&self) -> &'static str {
        match self {
            ExchangeId::BinanceSpot => "binance_spot",
            ExchangeId::BinanceDerivatives => "binance_derivatives",
            ExchangeId::OkxSpot => "okx_spot",
            ExchangeId::OkxDerivatives => "okx_derivatives",
        }
    }

    /// Market type is fixed per venue; collectors never infer it from symbols
    pub fn market_type(&self) -> MarketType {
        match self {
            ExchangeId::BinanceSpot | ExchangeId::OkxSpot => MarketType::Spot,
            ExchangeId::BinanceDerivatives | ExchangeId::OkxDerivatives => MarketType::Perpetual,
        }
    }

    pub fn is_binance(&self) -> bool {
        matches!(self, ExchangeId::BinanceSpot | ExchangeId::BinanceDerivatives)
    }

    pub fn is_okx(&self) -> bool {
        matches!(self, ExchangeId::OkxSpot | ExchangeId::OkxDerivatives)
    }

    /// Public WebSocket endpoint
    pub fn ws_url(&self) -> &'static str {
        match self {
            ExchangeId::BinanceSpot => "wss://stream.binance.com:9443",
            ExchangeId::BinanceDerivatives => "wss://fstream.binance.com",
            ExchangeId::OkxSpot | ExchangeId::OkxDerivatives => {
                "wss://ws.okx.com:8443/ws/v5/public"
            }
        }
    }

    /// REST base endpoint for depth snapshots
    pub fn rest_base_url(&self) -> &'static str {
        match self {
            ExchangeId::BinanceSpot => "https://api.binance.com",
            ExchangeId::BinanceDerivatives => "https://fapi.binance.com",
            ExchangeId::OkxSpot | ExchangeId::OkxDerivatives => "https://www.okx.com",
        }
    }

    /// Maximum depth the venue serves in a single snapshot
    pub fn max_snapshot_depth(&self) -> usize {
        match self {
            ExchangeId::BinanceSpot => 5000,
            ExchangeId::BinanceDerivatives => 1000,
            // OKX books endpoint caps at 400; books-full extends to 5000
            ExchangeId::OkxSpot | ExchangeId::OkxDerivatives => 5000,
        }
    }

    /// Clamp a requested snapshot depth to a value the venue accepts
    pub fn clamp_snapshot_limit(&self, requested: usize) -> usize {
        match self {
            ExchangeId::BinanceSpot => {
                nearest_valid_limit(requested, &[5, 10, 20, 50, 100, 500, 1000, 5000])
            }
            ExchangeId::BinanceDerivatives => {
                nearest_valid_limit(requested, &[5, 10, 20, 50, 100, 500, 1000])
            }
            ExchangeId::OkxSpot | ExchangeId::OkxDerivatives => requested.clamp(1, 5000),
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pick the closest valid limit, preferring the first value that covers the request
fn nearest_valid_limit(requested: usize, valid: &[usize]) -> usize {
    for &limit in valid {
        if limit >= requested {
            return limit;
        }
    }
    *valid.last().expect("limit table is never empty")
}

/// Unique identity of a tracked book.
///
/// Every piece of per-symbol state is keyed on the full triple so that the
/// same instrument on different venues can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolKey {
    pub exchange: ExchangeId,
    pub market_type: MarketType,
    pub symbol: String,
}

impl SymbolKey {
    pub fn new(exchange: ExchangeId, symbol: impl Into<String>) -> Self {
        Self {
            exchange,
            market_type: exchange.market_type(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.exchange, self.market_type, self.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_names() {
        assert_eq!(ExchangeId::BinanceSpot.name(), "binance_spot");
        assert_eq!(ExchangeId::BinanceDerivatives.name(), "binance_derivatives");
        assert_eq!(ExchangeId::OkxSpot.name(), "okx_spot");
        assert_eq!(ExchangeId::OkxDerivatives.name(), "okx_derivatives");
    }

    #[test]
    fn test_market_type_per_venue() {
        assert_eq!(ExchangeId::BinanceSpot.market_type(), MarketType::Spot);
        assert_eq!(
            ExchangeId::OkxDerivatives.market_type(),
            MarketType::Perpetual
        );
    }

    #[test]
    fn test_snapshot_limit_clamping() {
        assert_eq!(ExchangeId::BinanceSpot.clamp_snapshot_limit(5000), 5000);
        assert_eq!(ExchangeId::BinanceSpot.clamp_snapshot_limit(400), 500);
        assert_eq!(ExchangeId::BinanceDerivatives.clamp_snapshot_limit(5000), 1000);
        assert_eq!(ExchangeId::BinanceDerivatives.clamp_snapshot_limit(777), 1000);
        assert_eq!(ExchangeId::OkxSpot.clamp_snapshot_limit(400), 400);
    }

    #[test]
    fn test_symbol_key_includes_market_type() {
        let spot = SymbolKey::new(ExchangeId::BinanceSpot, "BTCUSDT");
        let perp = SymbolKey::new(ExchangeId::BinanceDerivatives, "BTCUSDT");
        assert_ne!(spot, perp);
        assert_eq!(spot.to_string(), "binance_spot.spot.BTCUSDT");
    }

    #[test]
    fn test_config_name_round_trip() {
        let id: ExchangeId = serde_json::from_str("\"okx_derivatives\"").unwrap();
        assert_eq!(id, ExchangeId::OkxDerivatives);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"okx_derivatives\"");
    }
}
