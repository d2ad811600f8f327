//! OKX sequence and checksum scenarios

use bookstream::exchange::{ExchangeId, SymbolKey};
use bookstream::normalizer::{parse_price, parse_quantity};
use bookstream::orderbook::checksum::{self, crc32_signed, payload_from_levels};
use bookstream::orderbook::sequence::{self, Validation};
use bookstream::orderbook::state::OrderBookState;
use bookstream::orderbook::{OkxAction, OkxBookUpdate, OrderBook, OrderBookError, PriceLevel};

fn level(price: &str, quantity: &str) -> PriceLevel {
    PriceLevel {
        price: parse_price(price).unwrap(),
        quantity: parse_quantity(quantity).unwrap(),
    }
}

fn okx_update(action: OkxAction, prev: i64, seq: i64) -> OkxBookUpdate {
    OkxBookUpdate {
        action,
        seq_id: seq,
        prev_seq_id: prev,
        checksum: None,
        bids: vec![],
        asks: vec![],
        timestamp_ms: 1_700_000_000_000,
    }
}

fn okx_state() -> OrderBookState {
    OrderBookState::new(SymbolKey::new(ExchangeId::OkxDerivatives, "BTC-USDT-SWAP"), 100)
}

#[test]
fn checksum_string_matches_spec_example() {
    // Top-2 bids and asks interleaved, joined by ':'
    let bids = vec![level("30000.1", "1.5"), level("30000.0", "2.0")];
    let asks = vec![level("30001.0", "1.2"), level("30001.1", "0.8")];

    let payload = payload_from_levels(&bids, &asks);
    assert_eq!(payload, "30000.1:1.5:30001.0:1.2:30000.0:2.0:30001.1:0.8");

    // Signed interpretation of the IEEE CRC32 over the UTF-8 bytes
    let expected = crc32_signed(&payload);
    let key = SymbolKey::new(ExchangeId::OkxSpot, "BTC-USDT");
    let mut book = OrderBook::new(&key);
    book.install_snapshot(&bids, &asks, 1, 0);
    assert!(checksum::verify(&book, expected).is_ok());
}

#[test]
fn checksum_verification_covers_applied_updates() {
    let key = SymbolKey::new(ExchangeId::OkxSpot, "BTC-USDT");
    let mut book = OrderBook::new(&key);
    book.install_snapshot(
        &[level("30000.1", "1.5"), level("30000.0", "2.0")],
        &[level("30001.0", "1.2"), level("30001.1", "0.8")],
        1,
        0,
    );

    // Delete the best bid, add a deeper ask
    book.apply_levels(
        &[level("30000.1", "0")],
        &[level("30001.2", "4")],
    );

    let payload = checksum::checksum_payload(&book);
    assert_eq!(
        payload,
        "30000.0:2.0:30001.0:1.2:30001.1:0.8:30001.2:4"
    );
    assert!(checksum::verify(&book, crc32_signed(&payload)).is_ok());

    let err = checksum::verify(&book, crc32_signed(&payload).wrapping_add(1)).unwrap_err();
    assert!(matches!(err, OrderBookError::ChecksumMismatch { .. }));
    assert!(err.requires_resync(), "checksum mismatch must force a resync");
}

#[test]
fn maintenance_reset_is_accepted_without_resync() {
    // Documented server behavior: prevSeqId=10000, seqId=1 after an
    // accepted seqId=10000 signals a sequence reset, not a gap
    let mut state = okx_state();
    state.last_seq_id = 10_000;

    let outcome = sequence::validate_okx(&mut state, &okx_update(OkxAction::Update, 10_000, 1));
    assert!(matches!(outcome, Validation::MaintenanceReset));
    assert_eq!(state.last_seq_id, 1);
    assert_eq!(state.maintenance_resets, 1);
    assert_eq!(state.consecutive_sequence_errors, 0);

    // The stream continues from the reset id
    let outcome = sequence::validate_okx(&mut state, &okx_update(OkxAction::Update, 1, 2));
    assert!(matches!(outcome, Validation::Accept));
    assert_eq!(state.last_seq_id, 2);
}

#[test]
fn prev_seq_id_chain_property() {
    // For accepted non-reset updates, each prevSeqId equals the previous seqId
    let mut state = okx_state();
    state.last_seq_id = 100;

    let chain = [(100, 105), (105, 110), (110, 112)];
    for (prev, seq) in chain {
        let outcome = sequence::validate_okx(&mut state, &okx_update(OkxAction::Update, prev, seq));
        assert!(matches!(outcome, Validation::Accept));
        assert_eq!(state.last_seq_id, seq);
    }

    // Broken chain is invalid and counts toward the threshold
    let outcome = sequence::validate_okx(&mut state, &okx_update(OkxAction::Update, 120, 125));
    assert!(outcome.is_invalid());
    assert_eq!(state.last_seq_id, 112);
    assert_eq!(state.consecutive_sequence_errors, 1);
}

#[test]
fn heartbeat_does_not_advance_sequence() {
    let mut state = okx_state();
    state.last_seq_id = 500;

    let outcome = sequence::validate_okx(&mut state, &okx_update(OkxAction::Update, 500, 500));
    assert!(matches!(outcome, Validation::Heartbeat));
    assert_eq!(state.last_seq_id, 500);
}

#[test]
fn snapshot_clears_error_counters() {
    let mut state = okx_state();
    state.last_seq_id = 50;
    state.consecutive_sequence_errors = 2;

    let outcome = sequence::validate_okx(&mut state, &okx_update(OkxAction::Snapshot, -1, 900));
    assert!(matches!(outcome, Validation::Snapshot));
    assert_eq!(state.last_seq_id, 900);
    assert_eq!(state.consecutive_sequence_errors, 0);
}
