//! Metrics for the partition resource manager
//!
//! Recorded through the `metrics` facade; the embedding process decides on
//! exposition. All series are labeled by topic and partition. The facade
//! has no deregistration, so dropping [`StmMetrics`] zeroes this
//! partition's gauges instead of leaving stale values behind.

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const FENCES_TOTAL: &str = "stablelog_fences_total";
pub const DEDUP_HITS_TOTAL: &str = "stablelog_sequence_dedup_hits_total";
pub const OUT_OF_ORDER_TOTAL: &str = "stablelog_out_of_order_rejected_total";
pub const TX_COMMITTED_TOTAL: &str = "stablelog_tx_committed_total";
pub const TX_ABORTED_TOTAL: &str = "stablelog_tx_aborted_total";
pub const TX_EXPIRED_TOTAL: &str = "stablelog_tx_expired_total";
pub const SNAPSHOTS_TAKEN_TOTAL: &str = "stablelog_snapshots_taken_total";
pub const ABORT_SEGMENTS_OFFLOADED_TOTAL: &str = "stablelog_abort_segments_offloaded_total";

pub const LAST_STABLE_OFFSET: &str = "stablelog_last_stable_offset";
pub const ONGOING_TXES: &str = "stablelog_ongoing_transactions";
pub const TRACKED_PRODUCERS: &str = "stablelog_tracked_producers";
pub const ABORTED_RANGES: &str = "stablelog_aborted_ranges_in_memory";

/// Register descriptions for every series this crate records.
///
/// Safe to call more than once; the facade keeps the first description.
pub fn register_metrics() {
    describe_counter!(FENCES_TOTAL, "Producer fence batches applied");
    describe_counter!(
        DEDUP_HITS_TOTAL,
        "Idempotent batches answered from the sequence cache without replication"
    );
    describe_counter!(
        OUT_OF_ORDER_TOTAL,
        "Batches rejected for out-of-order sequence numbers"
    );
    describe_counter!(TX_COMMITTED_TOTAL, "Transaction commit markers applied");
    describe_counter!(TX_ABORTED_TOTAL, "Transaction abort markers applied");
    describe_counter!(
        TX_EXPIRED_TOTAL,
        "Transactions auto-aborted after their timeout elapsed"
    );
    describe_counter!(SNAPSHOTS_TAKEN_TOTAL, "Local state machine snapshots taken");
    describe_counter!(
        ABORT_SEGMENTS_OFFLOADED_TOTAL,
        "Aborted-range chunks spilled to abort segment files"
    );
    describe_gauge!(
        LAST_STABLE_OFFSET,
        "Exclusive upper bound for read-committed consumers"
    );
    describe_gauge!(ONGOING_TXES, "Transactions with data in the log and no marker");
    describe_gauge!(TRACKED_PRODUCERS, "Producers with sequence state");
    describe_gauge!(ABORTED_RANGES, "Aborted ranges held in memory");
}

/// Per-partition metrics handle
#[derive(Debug, Clone)]
pub struct StmMetrics {
    topic: String,
    partition: String,
}

impl StmMetrics {
    pub fn new(topic: &str, partition: i32) -> Self {
        register_metrics();
        Self {
            topic: topic.to_string(),
            partition: partition.to_string(),
        }
    }

    pub fn fence_applied(&self) {
        counter!(FENCES_TOTAL, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .increment(1);
    }

    pub fn dedup_hit(&self) {
        counter!(DEDUP_HITS_TOTAL, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .increment(1);
    }

    pub fn out_of_order(&self) {
        counter!(OUT_OF_ORDER_TOTAL, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .increment(1);
    }

    pub fn tx_committed(&self) {
        counter!(TX_COMMITTED_TOTAL, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .increment(1);
    }

    pub fn tx_aborted(&self) {
        counter!(TX_ABORTED_TOTAL, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .increment(1);
    }

    pub fn tx_expired(&self) {
        counter!(TX_EXPIRED_TOTAL, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .increment(1);
    }

    pub fn snapshot_taken(&self) {
        counter!(SNAPSHOTS_TAKEN_TOTAL, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .increment(1);
    }

    pub fn abort_segment_offloaded(&self) {
        counter!(ABORT_SEGMENTS_OFFLOADED_TOTAL, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .increment(1);
    }

    pub fn set_last_stable_offset(&self, lso: i64) {
        gauge!(LAST_STABLE_OFFSET, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .set(lso as f64);
    }

    pub fn set_ongoing_txes(&self, count: usize) {
        gauge!(ONGOING_TXES, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .set(count as f64);
    }

    pub fn set_tracked_producers(&self, count: usize) {
        gauge!(TRACKED_PRODUCERS, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .set(count as f64);
    }

    pub fn set_aborted_ranges(&self, count: usize) {
        gauge!(ABORTED_RANGES, "topic" => self.topic.clone(), "partition" => self.partition.clone())
            .set(count as f64);
    }
}

impl Drop for StmMetrics {
    fn drop(&mut self) {
        for name in [
            LAST_STABLE_OFFSET,
            ONGOING_TXES,
            TRACKED_PRODUCERS,
            ABORTED_RANGES,
        ] {
            gauge!(name, "topic" => self.topic.clone(), "partition" => self.partition.clone())
                .set(0.0);
        }
    }
}
