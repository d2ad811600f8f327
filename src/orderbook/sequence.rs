//! Per-exchange sequence continuity validation
//!
//! One canonical validator per venue family. Validators mutate
//! `last_update_id`/`last_seq_id` only when a message is accepted, and
//! track consecutive failures for the manager's resync threshold.

use crate::exchange::MarketType;

use super::state::OrderBookState;
use super::{BinanceDepthUpdate, OkxAction, OkxBookUpdate, OrderBookError};

/// Sequence errors needed before the manager forces a resync
pub const RESYNC_ERROR_THRESHOLD: u32 = 3;

/// Outcome of validating one inbound message against symbol state
#[derive(Debug)]
pub enum Validation {
    /// Contiguous update; ids advanced, levels should be applied
    Accept,
    /// OKX snapshot-kind message; the book must be reinstalled from it
    Snapshot,
    /// OKX keepalive (`seqId == prevSeqId`); nothing to apply
    Heartbeat,
    /// OKX server-side sequence reset; ids rebased, levels apply
    MaintenanceReset,
    /// Already covered by the current book; drop silently
    Stale,
    /// Continuity violated
    Invalid(OrderBookError),
}

impl Validation {
    pub fn is_invalid(&self) -> bool {
        matches!(self, Validation::Invalid(_))
    }
}

/// Validate a Binance depth diff, dispatching on the collector's market type
pub fn validate_binance(state: &mut OrderBookState, update: &BinanceDepthUpdate) -> Validation {
    match state.key.market_type {
        MarketType::Spot => validate_binance_spot(state, update),
        MarketType::Perpetual => validate_binance_derivatives(state, update),
    }
}

/// Spot rule: first accepted event after snapshot `S` must satisfy
/// `U <= S+1 <= u`; afterwards `U == last_update_id + 1`.
fn validate_binance_spot(state: &mut OrderBookState, update: &BinanceDepthUpdate) -> Validation {
    let last = state.last_update_id;

    if update.final_update_id <= last {
        return Validation::Stale;
    }

    let expecting_first = last == state.snapshot_last_update_id;
    let valid = if expecting_first {
        update.first_update_id <= last + 1 && update.final_update_id >= last + 1
    } else {
        update.first_update_id == last + 1
    };

    if valid {
        state.last_update_id = update.final_update_id;
        state.consecutive_sequence_errors = 0;
        Validation::Accept
    } else {
        record_failure(state);
        Validation::Invalid(OrderBookError::SequenceGap {
            expected: last + 1,
            first_update_id: update.first_update_id,
            final_update_id: update.final_update_id,
        })
    }
}

/// USD-M futures rule: first accepted event must cover the snapshot id
/// (`U <= S <= u`); afterwards `pu` must equal the previous event's `u`.
fn validate_binance_derivatives(
    state: &mut OrderBookState,
    update: &BinanceDepthUpdate,
) -> Validation {
    let last = state.last_update_id;
    let expecting_first = last == state.snapshot_last_update_id;

    if expecting_first {
        if update.final_update_id < last {
            return Validation::Stale;
        }
        if update.first_update_id <= last && update.final_update_id >= last {
            state.last_update_id = update.final_update_id;
            state.consecutive_sequence_errors = 0;
            return Validation::Accept;
        }
        record_failure(state);
        return Validation::Invalid(OrderBookError::SequenceGap {
            expected: last,
            first_update_id: update.first_update_id,
            final_update_id: update.final_update_id,
        });
    }

    if update.final_update_id <= last {
        return Validation::Stale;
    }

    match update.prev_final_update_id {
        Some(pu) if pu == last => {
            state.last_update_id = update.final_update_id;
            state.consecutive_sequence_errors = 0;
            Validation::Accept
        }
        Some(pu) => {
            record_failure(state);
            Validation::Invalid(OrderBookError::PrevIdMismatch {
                expected: last,
                prev_update_id: pu,
            })
        }
        None => {
            record_failure(state);
            Validation::Invalid(OrderBookError::MissingPrevId)
        }
    }
}

/// OKX rule set: snapshots (`action=snapshot` or `prevSeqId == -1`) always
/// reset the sequence; `prevSeqId` must chain to the last `seqId` with
/// `seqId == prevSeqId` as heartbeat; a shrinking `seqId` is a documented
/// maintenance reset and is accepted.
pub fn validate_okx(state: &mut OrderBookState, update: &OkxBookUpdate) -> Validation {
    if update.action == OkxAction::Snapshot || update.prev_seq_id == -1 {
        state.last_seq_id = update.seq_id;
        state.consecutive_sequence_errors = 0;
        return Validation::Snapshot;
    }

    if update.prev_seq_id == state.last_seq_id {
        if update.seq_id == update.prev_seq_id {
            return Validation::Heartbeat;
        }
        let maintenance = update.seq_id < update.prev_seq_id;
        state.last_seq_id = update.seq_id;
        state.consecutive_sequence_errors = 0;
        if maintenance {
            state.maintenance_resets += 1;
            return Validation::MaintenanceReset;
        }
        return Validation::Accept;
    }

    if update.seq_id < update.prev_seq_id {
        state.last_seq_id = update.seq_id;
        state.consecutive_sequence_errors = 0;
        state.maintenance_resets += 1;
        return Validation::MaintenanceReset;
    }

    record_failure(state);
    Validation::Invalid(OrderBookError::SeqDiscontinuity {
        expected_prev: state.last_seq_id,
        prev_seq_id: update.prev_seq_id,
        seq_id: update.seq_id,
    })
}

fn record_failure(state: &mut OrderBookState) {
    state.consecutive_sequence_errors += 1;
    state.error_count = state.error_count.saturating_add(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeId, SymbolKey};

    fn spot_state(snapshot_id: u64) -> OrderBookState {
        let mut state =
            OrderBookState::new(SymbolKey::new(ExchangeId::BinanceSpot, "BTCUSDT"), 100);
        state.snapshot_last_update_id = snapshot_id;
        state.last_update_id = snapshot_id;
        state
    }

    fn perp_state(snapshot_id: u64) -> OrderBookState {
        let mut state = OrderBookState::new(
            SymbolKey::new(ExchangeId::BinanceDerivatives, "BTCUSDT"),
            100,
        );
        state.snapshot_last_update_id = snapshot_id;
        state.last_update_id = snapshot_id;
        state
    }

    fn okx_state(last_seq: i64) -> OrderBookState {
        let mut state =
            OrderBookState::new(SymbolKey::new(ExchangeId::OkxDerivatives, "BTC-USDT-SWAP"), 100);
        state.last_seq_id = last_seq;
        state
    }

    fn binance(first: u64, last: u64, pu: Option<u64>) -> BinanceDepthUpdate {
        BinanceDepthUpdate {
            first_update_id: first,
            final_update_id: last,
            prev_final_update_id: pu,
            bids: vec![],
            asks: vec![],
            event_time_ms: 0,
        }
    }

    fn okx(action: OkxAction, prev: i64, seq: i64) -> OkxBookUpdate {
        OkxBookUpdate {
            action,
            seq_id: seq,
            prev_seq_id: prev,
            checksum: None,
            bids: vec![],
            asks: vec![],
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_spot_first_update_covers_snapshot() {
        let mut state = spot_state(1015);
        assert!(matches!(
            validate_binance(&mut state, &binance(1010, 1019, None)),
            Validation::Accept
        ));
        assert_eq!(state.last_update_id, 1019);
    }

    #[test]
    fn test_spot_subsequent_requires_contiguity() {
        let mut state = spot_state(1015);
        validate_binance(&mut state, &binance(1010, 1019, None));

        assert!(matches!(
            validate_binance(&mut state, &binance(1020, 1030, None)),
            Validation::Accept
        ));
        assert!(validate_binance(&mut state, &binance(1040, 1050, None)).is_invalid());
        assert_eq!(state.last_update_id, 1030);
        assert_eq!(state.consecutive_sequence_errors, 1);
    }

    #[test]
    fn test_spot_stale_updates_dropped() {
        let mut state = spot_state(1015);
        assert!(matches!(
            validate_binance(&mut state, &binance(1000, 1010, None)),
            Validation::Stale
        ));
        assert_eq!(state.last_update_id, 1015);
        assert_eq!(state.consecutive_sequence_errors, 0);
    }

    #[test]
    fn test_derivatives_pu_continuity() {
        let mut state = perp_state(505);

        assert!(matches!(
            validate_binance(&mut state, &binance(500, 510, Some(490))),
            Validation::Accept
        ));
        assert!(matches!(
            validate_binance(&mut state, &binance(511, 520, Some(510))),
            Validation::Accept
        ));
        assert!(matches!(
            validate_binance(&mut state, &binance(521, 530, Some(520))),
            Validation::Accept
        ));

        let outcome = validate_binance(&mut state, &binance(540, 550, Some(525)));
        assert!(matches!(
            outcome,
            Validation::Invalid(OrderBookError::PrevIdMismatch { expected: 530, .. })
        ));
        assert_eq!(state.last_update_id, 530);
    }

    #[test]
    fn test_derivatives_missing_pu_is_invalid() {
        let mut state = perp_state(505);
        validate_binance(&mut state, &binance(500, 510, Some(490)));
        assert!(matches!(
            validate_binance(&mut state, &binance(511, 520, None)),
            Validation::Invalid(OrderBookError::MissingPrevId)
        ));
    }

    #[test]
    fn test_okx_snapshot_resets_sequence() {
        let mut state = okx_state(999);
        assert!(matches!(
            validate_okx(&mut state, &okx(OkxAction::Snapshot, -1, 1234)),
            Validation::Snapshot
        ));
        assert_eq!(state.last_seq_id, 1234);
    }

    #[test]
    fn test_okx_update_with_negative_prev_is_snapshot() {
        let mut state = okx_state(999);
        assert!(matches!(
            validate_okx(&mut state, &okx(OkxAction::Update, -1, 50)),
            Validation::Snapshot
        ));
        assert_eq!(state.last_seq_id, 50);
    }

    #[test]
    fn test_okx_heartbeat_keeps_sequence() {
        let mut state = okx_state(1000);
        assert!(matches!(
            validate_okx(&mut state, &okx(OkxAction::Update, 1000, 1000)),
            Validation::Heartbeat
        ));
        assert_eq!(state.last_seq_id, 1000);
    }

    #[test]
    fn test_okx_maintenance_reset_accepted() {
        let mut state = okx_state(10_000);
        assert!(matches!(
            validate_okx(&mut state, &okx(OkxAction::Update, 10_000, 1)),
            Validation::MaintenanceReset
        ));
        assert_eq!(state.last_seq_id, 1);
        assert_eq!(state.maintenance_resets, 1);
        assert_eq!(state.consecutive_sequence_errors, 0);
    }

    #[test]
    fn test_okx_discontinuity_counts_toward_threshold() {
        let mut state = okx_state(1000);
        for _ in 0..RESYNC_ERROR_THRESHOLD {
            let outcome = validate_okx(&mut state, &okx(OkxAction::Update, 2000, 2001));
            assert!(outcome.is_invalid());
        }
        assert_eq!(state.consecutive_sequence_errors, RESYNC_ERROR_THRESHOLD);
    }
}
