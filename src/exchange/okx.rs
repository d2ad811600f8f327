//! OKX v5 wire payloads and channel helpers
//!
//! The public `books` channel delivers a full snapshot on subscribe
//! (`action = "snapshot"`, `prevSeqId = -1`) followed by incremental
//! updates carrying `seqId`/`prevSeqId` continuity and a CRC32 checksum
//! over the top 25 levels.

use serde::{Deserialize, Serialize};

/// Push message on a subscribed channel
#[derive(Debug, Clone, Deserialize)]
pub struct PushMessage {
    pub arg: ChannelArg,
    /// Present on `books` pushes, absent on `trades`
    pub action: Option<String>,
    pub data: Vec<serde_json::Value>,
}

/// Channel/instrument pair identifying a subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelArg {
    pub channel: String,
    #[serde(rename = "instId")]
    pub inst_id: String,
}

/// Event acknowledgment (`subscribe`/`unsubscribe`/`error`)
#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub arg: Option<ChannelArg>,
    pub code: Option<String>,
    pub msg: Option<String>,
}

/// One `books` data entry. Level rows are
/// `[price, quantity, liquidated_orders, order_count]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BookData {
    pub bids: Vec<Vec<String>>,
    pub asks: Vec<Vec<String>>,
    pub ts: String,
    #[serde(rename = "seqId")]
    pub seq_id: i64,
    #[serde(rename = "prevSeqId")]
    pub prev_seq_id: Option<i64>,
    pub checksum: Option<i64>,
}

/// One `trades` data entry
#[derive(Debug, Clone, Deserialize)]
pub struct TradeData {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "tradeId")]
    pub trade_id: String,
    #[serde(rename = "px")]
    pub price: String,
    #[serde(rename = "sz")]
    pub size: String,
    pub side: String,
    pub ts: String,
}

/// REST response wrapper: `{"code":"0","msg":"","data":[...]}`
#[derive(Debug, Deserialize)]
pub struct RestResponse {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Vec<RestBookData>,
}

/// Depth book entry from `GET /api/v5/market/books` or `/books-full`
#[derive(Debug, Clone, Deserialize)]
pub struct RestBookData {
    pub bids: Vec<Vec<String>>,
    pub asks: Vec<Vec<String>>,
    pub ts: String,
    #[serde(rename = "seqId")]
    pub seq_id: Option<i64>,
}

/// Subscribe frame covering the given channels for a symbol set
pub fn subscribe_frame(channels: &[&str], symbols: &[String]) -> String {
    build_op_frame("subscribe", channels, symbols)
}

/// Unsubscribe frame for a single symbol's channel
pub fn unsubscribe_frame(channel: &str, symbol: &str) -> String {
    build_op_frame("unsubscribe", &[channel], std::slice::from_ref(&symbol.to_string()))
}

fn build_op_frame(op: &str, channels: &[&str], symbols: &[String]) -> String {
    let args: Vec<ChannelArg> = channels
        .iter()
        .flat_map(|channel| {
            symbols.iter().map(move |symbol| ChannelArg {
                channel: channel.to_string(),
                inst_id: symbol.clone(),
            })
        })
        .collect();

    serde_json::json!({ "op": op, "args": args }).to_string()
}

/// REST snapshot URL. Depths above the 400-level `books` cap route to
/// `books-full`.
pub fn snapshot_url(base_url: &str, symbol: &str, depth: usize) -> String {
    if depth > 400 {
        format!(
            "{}/api/v5/market/books-full?instId={}&sz={}",
            base_url,
            symbol,
            depth.min(5000)
        )
    } else {
        format!("{}/api/v5/market/books?instId={}&sz={}", base_url, symbol, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_books_update_deserialization() {
        let json = r#"{
            "arg": {"channel": "books", "instId": "BTC-USDT"},
            "action": "update",
            "data": [{
                "asks": [["8476.98", "415", "0", "13"]],
                "bids": [["8476.97", "256", "0", "12"]],
                "ts": "1597026383085",
                "checksum": -855196043,
                "prevSeqId": 123456,
                "seqId": 123457
            }]
        }"#;

        let msg: PushMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.arg.channel, "books");
        assert_eq!(msg.action.as_deref(), Some("update"));

        let book: BookData = serde_json::from_value(msg.data[0].clone()).unwrap();
        assert_eq!(book.seq_id, 123457);
        assert_eq!(book.prev_seq_id, Some(123456));
        assert_eq!(book.checksum, Some(-855196043));
        assert_eq!(book.asks[0][0], "8476.98");
    }

    #[test]
    fn test_snapshot_has_negative_prev_seq_id() {
        let json = r#"{
            "bids": [], "asks": [], "ts": "1597026383085",
            "prevSeqId": -1, "seqId": 10
        }"#;
        let book: BookData = serde_json::from_str(json).unwrap();
        assert_eq!(book.prev_seq_id, Some(-1));
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = subscribe_frame(&["books"], &["BTC-USDT".to_string(), "ETH-USDT".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0]["channel"], "books");
        assert_eq!(value["args"][1]["instId"], "ETH-USDT");
    }

    #[test]
    fn test_unsubscribe_frame_shape() {
        let frame = unsubscribe_frame("books", "BTC-USDT-SWAP");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["op"], "unsubscribe");
        assert_eq!(value["args"][0]["instId"], "BTC-USDT-SWAP");
    }

    #[test]
    fn test_snapshot_url_routes_by_depth() {
        assert_eq!(
            snapshot_url("https://www.okx.com", "BTC-USDT", 400),
            "https://www.okx.com/api/v5/market/books?instId=BTC-USDT&sz=400"
        );
        assert_eq!(
            snapshot_url("https://www.okx.com", "BTC-USDT", 5000),
            "https://www.okx.com/api/v5/market/books-full?instId=BTC-USDT&sz=5000"
        );
    }
}
