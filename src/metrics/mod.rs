//! Collector metrics
//!
//! Process-wide counters shared across symbol workers and the publisher.
//! Everything is a relaxed atomic; readers take a point-in-time snapshot
//! for the status report at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CollectorMetrics {
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    parse_errors: AtomicU64,
    updates_applied: AtomicU64,
    updates_buffered: AtomicU64,
    sequence_errors: AtomicU64,
    checksum_failures: AtomicU64,
    maintenance_resets: AtomicU64,
    resyncs: AtomicU64,
    snapshots_fetched: AtomicU64,
    snapshot_errors: AtomicU64,
    ws_reconnects: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    publish_dropped: AtomicU64,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub parse_errors: u64,
    pub updates_applied: u64,
    pub updates_buffered: u64,
    pub sequence_errors: u64,
    pub checksum_failures: u64,
    pub maintenance_resets: u64,
    pub resyncs: u64,
    pub snapshots_fetched: u64,
    pub snapshot_errors: u64,
    pub ws_reconnects: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub publish_dropped: u64,
}

impl CollectorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update_applied(&self) {
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update_buffered(&self) {
        self.updates_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sequence_error(&self) {
        self.sequence_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_maintenance_reset(&self) {
        self.maintenance_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_fetched(&self) {
        self.snapshots_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_error(&self) {
        self.snapshot_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ws_reconnect(&self) {
        self.ws_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_dropped(&self) {
        self.publish_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            updates_buffered: self.updates_buffered.load(Ordering::Relaxed),
            sequence_errors: self.sequence_errors.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            maintenance_resets: self.maintenance_resets.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            snapshots_fetched: self.snapshots_fetched.load(Ordering::Relaxed),
            snapshot_errors: self.snapshot_errors.load(Ordering::Relaxed),
            ws_reconnects: self.ws_reconnects.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            publish_dropped: self.publish_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = CollectorMetrics::new();
        metrics.record_message_received();
        metrics.record_message_received();
        metrics.record_resync();
        metrics.record_maintenance_reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.resyncs, 1);
        assert_eq!(snapshot.maintenance_resets, 1);
        assert_eq!(snapshot.published, 0);
    }
}
