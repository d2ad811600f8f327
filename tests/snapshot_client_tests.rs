//! REST snapshot client behavior against a mock exchange

use std::sync::Arc;

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bookstream::config::{CollectorConfig, ProxyConfig, RateLimitConfig};
use bookstream::exchange::ExchangeId;
use bookstream::metrics::CollectorMetrics;
use bookstream::snapshot::{SnapshotError, Snapshotter, parse_ban_deadline};

fn collector_config(exchange: ExchangeId, base_url: &str) -> CollectorConfig {
    let mut config = CollectorConfig::default_for(exchange);
    config.symbols = vec!["BTCUSDT".to_string()];
    config.rest_url = Some(base_url.to_string());
    config
}

fn snapshotter(exchange: ExchangeId, base_url: &str) -> Snapshotter {
    Snapshotter::new(
        &collector_config(exchange, base_url),
        &RateLimitConfig::default(),
        &ProxyConfig::default(),
        Arc::new(CollectorMetrics::new()),
    )
    .expect("snapshotter builds")
}

#[tokio::test]
async fn binance_snapshot_parses_canonical_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/depth"))
        .and(query_param("symbol", "BTCUSDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "lastUpdateId": 1015,
            "bids": [["67650.00", "1.23400"], ["67649.50", "0.45600"]],
            "asks": [["67651.00", "0.98700"]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let snapshotter = snapshotter(ExchangeId::BinanceSpot, &server.uri());
    let snapshot = snapshotter.fetch("BTCUSDT", true).await.unwrap();

    assert_eq!(snapshot.last_update_id, 1015);
    assert_eq!(snapshot.bids.len(), 2);
    assert_eq!(snapshot.bids[0].price.to_string(), "67650.00");
    assert_eq!(snapshot.asks[0].quantity.to_string(), "0.98700");
}

#[tokio::test]
async fn okx_snapshot_uses_seq_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v5/market/books"))
        .and(query_param("instId", "BTC-USDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "code": "0",
            "msg": "",
            "data": [{
                "bids": [["30000.1", "1.5", "0", "3"]],
                "asks": [["30001.0", "1.2", "0", "1"]],
                "ts": "1700000000000",
                "seqId": 424242
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = collector_config(ExchangeId::OkxSpot, &server.uri());
    config.symbols = vec!["BTC-USDT".to_string()];
    let snapshotter = Snapshotter::new(
        &config,
        &RateLimitConfig::default(),
        &ProxyConfig::default(),
        Arc::new(CollectorMetrics::new()),
    )
    .unwrap();

    let snapshot = snapshotter.fetch("BTC-USDT", true).await.unwrap();
    assert_eq!(snapshot.last_update_id, 424242);
    assert_eq!(snapshot.timestamp_ms, 1_700_000_000_000);
    assert_eq!(snapshot.bids[0].price.to_string(), "30000.1");
}

#[tokio::test]
async fn ip_ban_blocks_further_requests_until_deadline() {
    let ban_until = chrono::Utc::now().timestamp_millis() as u64 + 3_600_000;
    let body = format!(
        "{{\"code\":-1003,\"msg\":\"Way too much request weight used; IP banned until {}.\"}}",
        ban_until
    );

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/depth"))
        .respond_with(ResponseTemplate::new(418).set_body_string(body))
        .expect(1) // the second fetch must not reach the server
        .mount(&server)
        .await;

    let snapshotter = snapshotter(ExchangeId::BinanceSpot, &server.uri());

    let err = snapshotter.fetch("BTCUSDT", true).await.unwrap_err();
    match err {
        SnapshotError::Banned { until_ms } => {
            // Unban deadline plus the 30s safety margin
            assert_eq!(until_ms, ban_until + 30_000);
        }
        other => panic!("expected ban, got {other:?}"),
    }

    // Ban window is enforced locally, REST stays quiet
    let err = snapshotter.fetch("BTCUSDT", true).await.unwrap_err();
    assert!(matches!(err, SnapshotError::Banned { .. }));
}

#[tokio::test]
async fn http_429_starts_cooldown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/depth"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let snapshotter = snapshotter(ExchangeId::BinanceSpot, &server.uri());

    let err = snapshotter.fetch("BTCUSDT", true).await.unwrap_err();
    assert!(matches!(err, SnapshotError::RateLimited { .. }));

    // Cooldown applies before any new request is issued
    let err = snapshotter.fetch("BTCUSDT", true).await.unwrap_err();
    assert!(matches!(err, SnapshotError::RateLimited { .. }));
}

#[tokio::test]
async fn snapshot_spacing_applies_to_unforced_fetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/depth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "lastUpdateId": 1,
            "bids": [["100.0", "1"]],
            "asks": [["101.0", "1"]]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let snapshotter = snapshotter(ExchangeId::BinanceSpot, &server.uri());

    assert!(snapshotter.fetch("BTCUSDT", false).await.is_ok());

    // Within the 120s minimum spacing only forced fetches pass
    let err = snapshotter.fetch("BTCUSDT", false).await.unwrap_err();
    assert!(matches!(err, SnapshotError::RateLimited { .. }));
    assert!(snapshotter.fetch("BTCUSDT", true).await.is_ok());
}

#[test]
fn ban_deadline_parsing() {
    assert_eq!(
        parse_ban_deadline("IP banned until 1700000000000. Please"),
        Some(1_700_000_000_000)
    );
    assert_eq!(parse_ban_deadline("teapot"), None);
}
