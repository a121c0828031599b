//! Shared harness for resource manager integration tests
//!
//! Builds one partition worth of machinery: a single-node raft log, an
//! in-process coordinator wired back into the partition, and the state
//! machine itself. Auto mode runs the background applier the way the
//! broker does; manual mode leaves applies to the test for deterministic
//! interleavings.

#![allow(dead_code)]

use bytes::Bytes;
use stablelog::config::RmConfig;
use stablelog::coordinator::LoopbackCoordinator;
use stablelog::features::FeatureTable;
use stablelog::model::{BatchIdentity, ProducerIdentity, RecordBatch, TxRange};
use stablelog::raft::{CommittedBatch, DirectRaft, PartitionRaft, ReplicateOptions};
use stablelog::rm::RmStm;
use stablelog::translator::FixedDeltaTranslator;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct TestPartition {
    pub stm: Arc<RmStm>,
    pub raft: Arc<DirectRaft>,
    pub coordinator: Arc<LoopbackCoordinator>,
    committed: Option<Mutex<mpsc::UnboundedReceiver<CommittedBatch>>>,
    _dir: Option<tempfile::TempDir>,
}

pub struct TestPartitionBuilder {
    first_offset: i64,
    delta: i64,
    manual_apply: bool,
    data_dir: Option<PathBuf>,
    abort_interval_ms: u64,
    tx_timeout_delay_ms: u64,
    abort_index_segment_size: usize,
    autoabort: bool,
}

impl TestPartition {
    pub fn builder() -> TestPartitionBuilder {
        TestPartitionBuilder {
            first_offset: 0,
            delta: 0,
            manual_apply: false,
            data_dir: None,
            abort_interval_ms: 60_000,
            tx_timeout_delay_ms: 1_000,
            abort_index_segment_size: 50_000,
            autoabort: true,
        }
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }

    /// Apply every batch committed so far. Manual mode only.
    pub fn drain(&self) {
        let committed = self
            .committed
            .as_ref()
            .expect("drain requires manual apply mode");
        let mut rx = committed.lock().expect("committed stream lock poisoned");
        while let Ok(batch) = rx.try_recv() {
            self.stm.apply(batch);
        }
    }

    /// Wait for the background applier to catch up with the committed
    /// offset. Auto mode only.
    pub async fn wait_caught_up(&self) {
        let target = self.raft.committed_offset();
        assert!(
            wait_until(|| self.stm.last_applied() >= target, Duration::from_secs(5)).await,
            "applier did not catch up to offset {}",
            target
        );
    }
}

impl TestPartitionBuilder {
    pub fn first_offset(mut self, offset: i64) -> Self {
        self.first_offset = offset;
        self
    }

    pub fn delta(mut self, delta: i64) -> Self {
        self.delta = delta;
        self
    }

    pub fn manual_apply(mut self) -> Self {
        self.manual_apply = true;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn abort_interval_ms(mut self, ms: u64) -> Self {
        self.abort_interval_ms = ms;
        self
    }

    pub fn tx_timeout_delay_ms(mut self, ms: u64) -> Self {
        self.tx_timeout_delay_ms = ms;
        self
    }

    pub fn abort_index_segment_size(mut self, size: usize) -> Self {
        self.abort_index_segment_size = size;
        self
    }

    pub fn autoabort(mut self, enabled: bool) -> Self {
        self.autoabort = enabled;
        self
    }

    pub async fn build(self) -> TestPartition {
        let (dir_guard, data_dir) = match self.data_dir {
            Some(path) => (None, path),
            None => {
                let dir = tempfile::tempdir().expect("create temp dir");
                let path = dir.path().to_path_buf();
                (Some(dir), path)
            }
        };
        let cfg = RmConfig {
            data_dir,
            log_stats_interval_s: 0,
            abort_interval_ms: self.abort_interval_ms,
            tx_timeout_delay_ms: self.tx_timeout_delay_ms,
            abort_index_segment_size: self.abort_index_segment_size,
            is_autoabort_enabled: self.autoabort,
            ..Default::default()
        };
        let raft = DirectRaft::new(self.first_offset);
        let coordinator = LoopbackCoordinator::new();
        let stm = RmStm::new(
            "orders",
            0,
            cfg,
            raft.clone(),
            Arc::new(FixedDeltaTranslator::new(self.delta)),
            coordinator.clone(),
            Arc::new(FeatureTable::with_all_active()),
        )
        .expect("build state machine");
        coordinator.bind(&stm);

        let committed = if self.manual_apply {
            Some(Mutex::new(
                raft.take_committed_stream().expect("committed stream"),
            ))
        } else {
            stm.start().await.expect("start state machine");
            None
        };
        TestPartition {
            stm,
            raft,
            coordinator,
            committed,
            _dir: dir_guard,
        }
    }
}

pub async fn wait_until(f: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !f() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}

pub fn pid(id: i64, epoch: i16) -> ProducerIdentity {
    ProducerIdentity::new(id, epoch)
}

pub fn idempotent_batch(p: ProducerIdentity, first_seq: i32, last_seq: i32) -> RecordBatch {
    RecordBatch::data(
        BatchIdentity::new(p, first_seq, last_seq, false),
        Bytes::from_static(b"payload"),
    )
}

pub fn tx_batch(p: ProducerIdentity, first_seq: i32, last_seq: i32) -> RecordBatch {
    RecordBatch::data(
        BatchIdentity::new(p, first_seq, last_seq, true),
        Bytes::from_static(b"payload"),
    )
}

/// A non-idempotent batch occupying `records` offsets
pub fn filler_batch(records: i32) -> RecordBatch {
    RecordBatch::data(
        BatchIdentity {
            pid: pid(-1, 0),
            first_seq: -1,
            last_seq: -1,
            record_count: records,
            is_transactional: false,
        },
        Bytes::from_static(b"filler"),
    )
}

pub fn opts() -> ReplicateOptions {
    ReplicateOptions::default()
}

/// Invariant: `ongoing_set` equals the first offsets of `ongoing_map`
pub fn assert_ongoing_set_invariant(stm: &RmStm) {
    let mut firsts: Vec<i64> = stm.ongoing_ranges().iter().map(|r| r.first).collect();
    firsts.sort_unstable();
    assert_eq!(
        firsts,
        stm.ongoing_set(),
        "ongoing_set must mirror ongoing_map first offsets"
    );
}

/// Invariant: aborted ranges are pairwise disjoint per producer
pub fn assert_disjoint_aborted(ranges: &[TxRange]) {
    use std::collections::HashMap;
    let mut by_pid: HashMap<ProducerIdentity, Vec<(i64, i64)>> = HashMap::new();
    for range in ranges {
        by_pid
            .entry(range.pid)
            .or_default()
            .push((range.first, range.last));
    }
    for (p, mut spans) in by_pid {
        spans.sort_unstable();
        for window in spans.windows(2) {
            assert!(
                window[0].1 < window[1].0,
                "aborted ranges for {} overlap: {:?}",
                p,
                spans
            );
        }
    }
}
