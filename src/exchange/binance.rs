//! Binance wire payloads and stream helpers
//!
//! Covers the spot and USD-M futures depth diff streams plus the REST depth
//! snapshot endpoints. Field names follow the exchange payloads verbatim.

use serde::{Deserialize, Serialize};

use super::ExchangeId;

/// Combined-stream envelope: `{"stream":"btcusdt@depth@100ms","data":{...}}`
#[derive(Debug, Deserialize)]
pub struct StreamEnvelope {
    pub stream: String,
    pub data: serde_json::Value,
}

/// Depth diff event from the WebSocket stream.
///
/// `pu` is only present on USD-M futures streams and carries the final
/// update id of the previous event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DepthUpdateEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    #[serde(rename = "pu")]
    pub prev_final_update_id: Option<u64>,
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

/// Trade event from the `@trade` stream
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradeEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "t")]
    pub trade_id: u64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "T")]
    pub trade_time: u64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Depth snapshot from `GET /api/v3/depth` (spot) or `GET /fapi/v1/depth`
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshotResponse {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// Stream name for the depth diff feed of a symbol
pub fn depth_stream_name(symbol: &str) -> String {
    format!("{}@depth@100ms", symbol.to_lowercase())
}

/// Stream name for the trade feed of a symbol
pub fn trade_stream_name(symbol: &str) -> String {
    format!("{}@trade", symbol.to_lowercase())
}

/// Combined-stream connection URL multiplexing all requested streams
pub fn combined_stream_url(exchange: ExchangeId, streams: &[String]) -> String {
    format!("{}/stream?streams={}", exchange.ws_url(), streams.join("/"))
}

/// REST depth snapshot URL with a venue-valid limit
pub fn snapshot_url(exchange: ExchangeId, base_url: &str, symbol: &str, limit: usize) -> String {
    let path = match exchange {
        ExchangeId::BinanceDerivatives => "/fapi/v1/depth",
        _ => "/api/v3/depth",
    };
    format!(
        "{}{}?symbol={}&limit={}",
        base_url,
        path,
        symbol.to_uppercase(),
        exchange.clamp_snapshot_limit(limit)
    )
}

/// Documented request weight of a depth snapshot by limit
pub fn snapshot_weight(exchange: ExchangeId, limit: usize) -> u32 {
    match exchange {
        ExchangeId::BinanceDerivatives => match limit {
            0..=50 => 2,
            51..=100 => 5,
            101..=500 => 10,
            _ => 20,
        },
        _ => match limit {
            0..=100 => 5,
            101..=500 => 25,
            501..=1000 => 50,
            _ => 250,
        },
    }
}

/// Extract the symbol from a combined stream name (`btcusdt@depth@100ms`)
pub fn symbol_from_stream(stream: &str) -> Option<&str> {
    stream.split('@').next().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_update_deserialization() {
        let json = r#"{
            "e": "depthUpdate",
            "E": 1699999999123,
            "s": "BTCUSDT",
            "U": 1000,
            "u": 1005,
            "pu": 999,
            "b": [["67650.00", "1.23400"]],
            "a": [["67651.00", "0.98700"]]
        }"#;

        let update: DepthUpdateEvent = serde_json::from_str(json).unwrap();
        assert_eq!(update.event_type, "depthUpdate");
        assert_eq!(update.first_update_id, 1000);
        assert_eq!(update.final_update_id, 1005);
        assert_eq!(update.prev_final_update_id, Some(999));
        assert_eq!(update.bids[0][0], "67650.00");
    }

    #[test]
    fn test_spot_update_has_no_pu() {
        let json = r#"{
            "e": "depthUpdate", "E": 1, "s": "ETHUSDT",
            "U": 5, "u": 6, "b": [], "a": []
        }"#;
        let update: DepthUpdateEvent = serde_json::from_str(json).unwrap();
        assert_eq!(update.prev_final_update_id, None);
    }

    #[test]
    fn test_stream_names() {
        assert_eq!(depth_stream_name("BTCUSDT"), "btcusdt@depth@100ms");
        assert_eq!(trade_stream_name("ETHUSDT"), "ethusdt@trade");
        assert_eq!(symbol_from_stream("btcusdt@depth@100ms"), Some("btcusdt"));
    }

    #[test]
    fn test_combined_stream_url() {
        let streams = vec![depth_stream_name("BTCUSDT"), trade_stream_name("BTCUSDT")];
        let url = combined_stream_url(ExchangeId::BinanceSpot, &streams);
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@depth@100ms/btcusdt@trade"
        );
    }

    #[test]
    fn test_snapshot_url_clamps_limit() {
        let url = snapshot_url(
            ExchangeId::BinanceDerivatives,
            ExchangeId::BinanceDerivatives.rest_base_url(),
            "btcusdt",
            5000,
        );
        assert_eq!(url, "https://fapi.binance.com/fapi/v1/depth?symbol=BTCUSDT&limit=1000");
    }
}
