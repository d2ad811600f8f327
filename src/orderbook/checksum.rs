//! OKX order-book checksum
//!
//! OKX signs each `books` update with a CRC32 over the top 25 levels of the
//! fully-applied book. Tokens are the exchange decimal strings: the top 25
//! bids and asks are interleaved row by row as
//! `bid_px:bid_qty:ask_px:ask_qty`, the remainder of the longer side is
//! appended, everything joined with `:`, and the IEEE CRC32 of the UTF-8
//! bytes is compared as a signed 32-bit integer.

use crate::orderbook::{OrderBook, OrderBookError, PriceLevel};

const CHECKSUM_DEPTH: usize = 25;

/// Build the checksum payload string for a book
pub fn checksum_payload(book: &OrderBook) -> String {
    let bids = book.bid_levels(CHECKSUM_DEPTH);
    let asks = book.ask_levels(CHECKSUM_DEPTH);
    payload_from_levels(&bids, &asks)
}

/// Payload from explicit top-of-book slices (bids descending, asks ascending)
pub fn payload_from_levels(bids: &[PriceLevel], asks: &[PriceLevel]) -> String {
    let paired = bids.len().min(asks.len());
    let mut tokens: Vec<String> = Vec::with_capacity((bids.len() + asks.len()) * 2);

    for i in 0..paired {
        tokens.push(bids[i].price.to_string());
        tokens.push(bids[i].quantity.to_string());
        tokens.push(asks[i].price.to_string());
        tokens.push(asks[i].quantity.to_string());
    }
    for level in &bids[paired..] {
        tokens.push(level.price.to_string());
        tokens.push(level.quantity.to_string());
    }
    for level in &asks[paired..] {
        tokens.push(level.price.to_string());
        tokens.push(level.quantity.to_string());
    }

    tokens.join(":")
}

/// CRC32 of the payload interpreted as a signed 32-bit integer
pub fn compute_checksum(book: &OrderBook) -> i32 {
    crc32_signed(&checksum_payload(book))
}

pub fn crc32_signed(payload: &str) -> i32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload.as_bytes());
    hasher.finalize() as i32
}

/// Verify a received checksum against the applied book
pub fn verify(book: &OrderBook, received: i32) -> Result<(), OrderBookError> {
    let computed = compute_checksum(book);
    if computed == received {
        Ok(())
    } else {
        Err(OrderBookError::ChecksumMismatch { received, computed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeId, SymbolKey};
    use crate::normalizer::{parse_price, parse_quantity};

    fn level(price: &str, quantity: &str) -> PriceLevel {
        PriceLevel {
            price: parse_price(price).unwrap(),
            quantity: parse_quantity(quantity).unwrap(),
        }
    }

    #[test]
    fn test_payload_interleaves_sides() {
        let bids = vec![level("30000.1", "1.5"), level("30000.0", "2.0")];
        let asks = vec![level("30001.0", "1.2"), level("30001.1", "0.8")];

        assert_eq!(
            payload_from_levels(&bids, &asks),
            "30000.1:1.5:30001.0:1.2:30000.0:2.0:30001.1:0.8"
        );
    }

    #[test]
    fn test_payload_appends_longer_side() {
        let bids = vec![level("100.5", "1"), level("100.4", "2"), level("100.3", "3")];
        let asks = vec![level("100.6", "4")];

        assert_eq!(
            payload_from_levels(&bids, &asks),
            "100.5:1:100.6:4:100.4:2:100.3:3"
        );
    }

    #[test]
    fn test_payload_preserves_exchange_strings() {
        // Scale carried by the wire string must survive into the payload
        let bids = vec![level("8476.97", "256")];
        let asks = vec![level("8476.98", "415")];
        assert_eq!(payload_from_levels(&bids, &asks), "8476.97:256:8476.98:415");
    }

    #[test]
    fn test_checksum_is_signed() {
        // CRC32 values >= 2^31 must map to negative i32
        let payload = "30000.1:1.5:30001.0:1.2:30000.0:2.0:30001.1:0.8";
        let unsigned = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(payload.as_bytes());
            hasher.finalize()
        };
        assert_eq!(crc32_signed(payload), unsigned as i32);
    }

    #[test]
    fn test_verify_against_book() {
        let key = SymbolKey::new(ExchangeId::OkxSpot, "BTC-USDT");
        let mut book = OrderBook::new(&key);
        book.install_snapshot(
            &[level("30000.1", "1.5"), level("30000.0", "2.0")],
            &[level("30001.0", "1.2"), level("30001.1", "0.8")],
            1,
            0,
        );

        let expected = crc32_signed("30000.1:1.5:30001.0:1.2:30000.0:2.0:30001.1:0.8");
        assert!(verify(&book, expected).is_ok());

        let err = verify(&book, expected.wrapping_add(1)).unwrap_err();
        assert!(matches!(err, OrderBookError::ChecksumMismatch { .. }));
        assert!(err.requires_resync());
    }

    #[test]
    fn test_checksum_uses_top_25_only() {
        let key = SymbolKey::new(ExchangeId::OkxSpot, "BTC-USDT");
        let mut book = OrderBook::new(&key);

        let bids: Vec<PriceLevel> = (0..30)
            .map(|i| level(&format!("{}", 1000 - i), "1"))
            .collect();
        let asks: Vec<PriceLevel> = (0..30)
            .map(|i| level(&format!("{}", 2000 + i), "1"))
            .collect();
        book.install_snapshot(&bids, &asks, 1, 0);

        let expected = payload_from_levels(&bids[..25], &asks[..25]);
        assert_eq!(checksum_payload(&book), expected);
    }
}
