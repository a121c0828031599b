//! Per-partition resource manager state machine
//!
//! One [`RmStm`] instance runs per partition replica, layered on the
//! partition's raft log. It tracks open transactions, fences stale
//! producer epochs, enforces sequence-number monotonicity with retry
//! deduplication, maintains the last stable offset that bounds
//! read-committed consumers, records aborted ranges for fetch-path
//! filtering, and auto-expires transactions whose owners vanished.
//!
//! State is split in two. Log-state is the durable view, advanced only by
//! applying committed batches in log order. Mem-state keeps the effect of
//! commands that were admitted but not yet applied and is wiped whole on
//! every term change; log-state survives. Letting both streams of change
//! touch one view would let a failed speculative command clobber durable
//! state, so reconciliation happens explicitly at apply time.

mod expiration;
mod log_state;
mod mem_state;
mod producer;
mod snapshot;

pub use expiration::{ExpirationInfo, ExpirationSnapshot};
pub use log_state::{FenceOutcome, LogState, TxData};
pub use mem_state::MemState;
pub use producer::{ProducerLocks, SeqCacheEntry, SeqEntry, SeqEntryWrapper, SEQ_CACHE_SIZE};
pub use snapshot::{
    AbortSegment, SnapshotStore, TxDataSnapshot, TxSnapshot, LOCAL_SNAPSHOT_FILE,
    SNAPSHOT_VERSION_V3, SNAPSHOT_VERSION_V4,
};

use crate::config::RmConfig;
use crate::coordinator::TxCoordinator;
use crate::error::{Result, StmError, TxError};
use crate::features::{Feature, FeatureTable};
use crate::metrics::StmMetrics;
use crate::model::{
    make_fence_batch_v1, make_fence_batch_v2, parse_control_batch, read_fence_batch,
    read_prepare_batch, AbortIndex, BatchIdentity, BatchType, ControlRecordType, KafkaOffset,
    LogOffset, PrepareMarker, ProducerEpoch, ProducerId, ProducerIdentity, RecordBatch, TxRange,
    TxSeq,
};
use crate::raft::{CommittedBatch, PartitionRaft, ReplicateOptions};
use crate::translator::OffsetTranslator;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, Notify, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Client-visible result of a replicated produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaResult {
    /// Translated base offset of the appended batch, as reported in
    /// produce responses
    pub base_offset: KafkaOffset,
}

/// Two-stage replication handle so callers can pipeline acknowledgements:
/// `enqueued` resolves once the request holds its slot in the raft
/// pipeline, `replicated` with the final result.
#[derive(Debug)]
pub struct KafkaStages {
    pub enqueued: oneshot::Receiver<()>,
    pub replicated: oneshot::Receiver<Result<KafkaResult>>,
}

/// Classification of a commit/abort request against the known transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOrigin {
    /// The request names the transaction we currently track
    Present,
    /// The request was issued for an already-finished transaction
    Past,
    /// The request runs ahead of anything we know
    Future,
    /// Nothing is known about the session
    Unknown,
}

/// Lifecycle stage of a tracked transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ongoing,
    Preparing,
    Prepared,
    Initiating,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Ongoing => "ongoing",
            TxStatus::Preparing => "preparing",
            TxStatus::Prepared => "prepared",
            TxStatus::Initiating => "initiating",
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Introspection record for one tracked transaction
#[derive(Debug, Clone, Copy)]
pub struct TransactionInfo {
    pub status: TxStatus,
    /// Offset bounding the LSO while this transaction stays open
    pub lso_bound: LogOffset,
    pub info: Option<ExpirationInfo>,
    pub seq: Option<i32>,
}

impl TransactionInfo {
    pub fn is_expired(&self, grace: Duration) -> bool {
        match self.info {
            Some(info) => info.is_expired(Instant::now(), grace),
            None => true,
        }
    }

    /// Time since the transaction's last activity, `None` once expired
    pub fn get_staleness(&self, grace: Duration) -> Option<Duration> {
        if self.is_expired(grace) {
            return None;
        }
        self.info
            .map(|info| Instant::now().saturating_duration_since(info.last_update))
    }

    pub fn get_timeout(&self, grace: Duration) -> Option<Duration> {
        if self.is_expired(grace) {
            return None;
        }
        self.info.map(|info| info.timeout)
    }
}

/// Point-in-time counters over mem-state, for tests and debugging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStateStats {
    pub term: i64,
    pub expected: usize,
    pub estimated: usize,
    pub tx_starts: usize,
    pub preparing: usize,
}

/// The per-partition resource manager state machine
pub struct RmStm {
    topic: String,
    partition: i32,
    cfg: RmConfig,
    raft: Arc<dyn PartitionRaft>,
    translator: Arc<dyn OffsetTranslator>,
    coordinator: Arc<dyn TxCoordinator>,
    features: Arc<FeatureTable>,
    /// Partition-wide lock: read side on admission, write side while
    /// draining for snapshots and leadership transfer
    state_lock: AsyncRwLock<()>,
    log_state: parking_lot::RwLock<LogState>,
    mem_state: parking_lot::RwLock<MemState>,
    tx_locks: ProducerLocks,
    applied_offset: AtomicI64,
    applied_notify: Notify,
    store: SnapshotStore,
    metrics: StmMetrics,
    expiration_wake: Notify,
    offload_lock: AsyncMutex<()>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    autoabort_enabled: AtomicBool,
    started: AtomicBool,
}

impl RmStm {
    /// Build a state machine for one partition replica. Call
    /// [`start`](RmStm::start) before feeding traffic.
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        cfg: RmConfig,
        raft: Arc<dyn PartitionRaft>,
        translator: Arc<dyn OffsetTranslator>,
        coordinator: Arc<dyn TxCoordinator>,
        features: Arc<FeatureTable>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let topic = topic.into();
        let store = SnapshotStore::new(cfg.data_dir.join(format!("{}-{}", topic, partition)));
        let metrics = StmMetrics::new(&topic, partition);
        let autoabort = cfg.is_autoabort_enabled;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            topic,
            partition,
            cfg,
            raft,
            translator,
            coordinator,
            features,
            state_lock: AsyncRwLock::new(()),
            log_state: parking_lot::RwLock::new(LogState::new()),
            mem_state: parking_lot::RwLock::new(MemState::new(-1)),
            tx_locks: ProducerLocks::new(),
            applied_offset: AtomicI64::new(-1),
            applied_notify: Notify::new(),
            store,
            metrics,
            expiration_wake: Notify::new(),
            offload_lock: AsyncMutex::new(()),
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
            autoabort_enabled: AtomicBool::new(autoabort),
            started: AtomicBool::new(false),
        }))
    }

    /// Bootstrap from the local snapshot and spawn the background tasks:
    /// the committed-batch applier, the expiration timer, and the stats
    /// logger. A snapshot that fails to decode is fatal for this replica.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.ensure_dir().await?;
        if let Some(local) = self.store.load_local().await? {
            info!(
                topic = %self.topic,
                partition = self.partition,
                offset = local.offset,
                "bootstrapping from local snapshot"
            );
            self.install_snapshot(local);
        }

        let mut tasks = Vec::new();
        if let Some(rx) = self.raft.take_committed_stream() {
            tasks.push(tokio::spawn(apply_loop(
                Arc::clone(self),
                rx,
                self.shutdown_tx.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(expiration::expiration_loop(
            Arc::clone(self),
            self.shutdown_tx.subscribe(),
        )));
        if self.cfg.log_stats_interval_s > 0 {
            tasks.push(tokio::spawn(stats_loop(
                Arc::clone(self),
                self.shutdown_tx.subscribe(),
            )));
        }
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Stop background tasks. Suspended operations observe the shutdown
    /// and return `ShuttingDown`.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.applied_notify.notify_waiters();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        debug!(topic = %self.topic, partition = self.partition, "resource manager stopped");
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub(crate) fn is_autoabort_enabled(&self) -> bool {
        self.autoabort_enabled.load(Ordering::Relaxed)
    }

    /// Disable the expiration scheduler. Test hook only.
    pub fn testing_only_disable_auto_abort(&self) {
        self.autoabort_enabled.store(false, Ordering::Relaxed);
    }

    /// Highest offset applied to log-state
    pub fn last_applied(&self) -> LogOffset {
        self.applied_offset.load(Ordering::Acquire)
    }

    // ======================== sync & term handling ========================

    /// Wait until this replica is the current-term leader and log-state has
    /// caught up with the committed offset. Clears mem-state when the term
    /// moved on; this is the only mechanism that discards it.
    pub async fn sync(&self, timeout: Duration) -> std::result::Result<i64, TxError> {
        if self.is_stopping() {
            return Err(TxError::ShuttingDown);
        }
        if !self.raft.is_leader() {
            return Err(TxError::NotCoordinator);
        }
        let committed = self.raft.committed_offset();
        if !self.wait_applied(committed, timeout).await {
            if self.is_stopping() {
                return Err(TxError::ShuttingDown);
            }
            return Err(TxError::Timeout);
        }
        let term = self.raft.term();
        {
            let mut mem = self.mem_state.write();
            if mem.term != term {
                debug!(
                    old_term = mem.term,
                    term, "term changed, clearing speculative state"
                );
                *mem = MemState::new(term);
            }
        }
        Ok(term)
    }

    async fn wait_applied(&self, target: LogOffset, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.last_applied() >= target {
                return true;
            }
            if self.is_stopping() {
                return false;
            }
            let notified = self.applied_notify.notified();
            tokio::pin!(notified);
            // register before the re-check so an apply landing in between
            // still wakes us
            notified.as_mut().enable();
            if self.last_applied() >= target {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.last_applied() >= target;
            }
        }
    }

    // ======================== transaction control ========================

    /// Declare a transaction for `pid`. Emits a fence batch through raft
    /// and returns the term the transaction belongs to.
    pub async fn begin_tx(
        &self,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        tx_timeout: Duration,
        tm_partition: i32,
    ) -> std::result::Result<i64, TxError> {
        let _state = self.state_lock.read().await;
        let term = self.sync(self.cfg.sync_timeout()).await?;
        let lock = self.tx_locks.get(pid.id);
        let _guard = lock.lock().await;

        if let Some(current) = self.fenced_below(pid) {
            debug!(%pid, current, "begin_tx from fenced epoch");
            return Err(TxError::Fenced);
        }
        {
            let log = self.log_state.read();
            if let Some(tx) = log.current_txes.get(&pid) {
                if tx.tx_seq == tx_seq {
                    debug!(%pid, tx_seq, "begin_tx retry for the declared transaction");
                    return Ok(term);
                }
                warn!(
                    %pid,
                    requested = tx_seq,
                    declared = tx.tx_seq,
                    "begin_tx with mismatched tx_seq"
                );
                return Err(TxError::InvalidTxnState);
            }
        }
        if self.mem_state.read().expected.get(&pid) == Some(&tx_seq) {
            debug!(%pid, tx_seq, "begin_tx retry while fence replicates");
            return Ok(term);
        }

        let timeout_ms = tx_timeout.as_millis() as i64;
        let batch = if self.features.is_active(Feature::TransactionPartitioning) {
            make_fence_batch_v2(pid, tx_seq, timeout_ms, tm_partition)
        } else {
            make_fence_batch_v1(pid, tx_seq, timeout_ms)
        };
        let opts = ReplicateOptions {
            timeout: self.cfg.sync_timeout(),
        };
        match self.raft.replicate(term, batch, opts).await {
            Ok(result) => {
                self.mem_state.write().expected.insert(pid, tx_seq);
                debug!(%pid, tx_seq, offset = result.last_offset, "fence batch replicated");
                Ok(term)
            }
            Err(e) => {
                warn!(%pid, tx_seq, error = %e, "failed to replicate fence batch");
                Err(replicate_tx_error(&e))
            }
        }
    }

    /// Commit the declared transaction of `pid`. Idempotent for
    /// transactions that already finished.
    pub async fn commit_tx(
        &self,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        timeout: Duration,
    ) -> std::result::Result<(), TxError> {
        let _state = self.state_lock.read().await;
        let term = self.sync(self.cfg.sync_timeout()).await?;
        let lock = self.tx_locks.get(pid.id);
        let _guard = lock.lock().await;

        if let Some(current) = self.fenced_below(pid) {
            debug!(%pid, current, "commit_tx from fenced epoch");
            return Err(TxError::Fenced);
        }
        let tx = self.log_state.read().current_txes.get(&pid).copied();
        match tx {
            Some(tx) if tx.tx_seq == tx_seq => {
                self.mem_state.write().preparing.insert(
                    pid,
                    PrepareMarker {
                        tm_partition: tx.tm_partition,
                        tx_seq,
                        pid,
                    },
                );
            }
            Some(tx) if tx.tx_seq > tx_seq => {
                debug!(%pid, tx_seq, declared = tx.tx_seq, "commit_tx for a finished transaction");
                return Ok(());
            }
            Some(tx) => {
                warn!(%pid, tx_seq, declared = tx.tx_seq, "commit_tx ahead of declared transaction");
                return Err(TxError::InvalidTxnState);
            }
            None => {
                debug!(%pid, tx_seq, "commit_tx for unknown transaction, treating as applied retry");
                return Ok(());
            }
        }

        let batch = RecordBatch::control(pid, ControlRecordType::TxCommit);
        let opts = ReplicateOptions { timeout };
        let result = match self.raft.replicate(term, batch, opts).await {
            Ok(result) => result,
            Err(e) => {
                self.mem_state.write().preparing.remove(&pid);
                warn!(%pid, tx_seq, error = %e, "failed to replicate commit marker");
                return Err(replicate_tx_error(&e));
            }
        };
        if !self.wait_applied(result.last_offset, timeout).await {
            if self.is_stopping() {
                return Err(TxError::ShuttingDown);
            }
            return Err(TxError::Timeout);
        }
        Ok(())
    }

    /// Abort the declared transaction of `pid`. Requests for transactions
    /// finished under a prior coordinator session succeed idempotently;
    /// far-future requests are rejected.
    pub async fn abort_tx(
        &self,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        timeout: Duration,
    ) -> std::result::Result<(), TxError> {
        let _state = self.state_lock.read().await;
        let term = self.sync(self.cfg.sync_timeout()).await?;
        let lock = self.tx_locks.get(pid.id);
        let _guard = lock.lock().await;

        if let Some(current) = self.fenced_below(pid) {
            debug!(%pid, current, "abort_tx from fenced epoch");
            return Err(TxError::Fenced);
        }
        match self.get_abort_origin(pid, tx_seq) {
            AbortOrigin::Present => {}
            AbortOrigin::Past | AbortOrigin::Unknown => {
                debug!(%pid, tx_seq, "abort_tx for a finished transaction");
                return Ok(());
            }
            AbortOrigin::Future => {
                warn!(%pid, tx_seq, "abort_tx ahead of anything known");
                return Err(TxError::RequestRejected);
            }
        }

        let batch = RecordBatch::control(pid, ControlRecordType::TxAbort);
        let opts = ReplicateOptions { timeout };
        let result = match self.raft.replicate(term, batch, opts).await {
            Ok(result) => result,
            Err(e) => {
                warn!(%pid, tx_seq, error = %e, "failed to replicate abort marker");
                return Err(replicate_tx_error(&e));
            }
        };
        if !self.wait_applied(result.last_offset, timeout).await {
            if self.is_stopping() {
                return Err(TxError::ShuttingDown);
            }
            return Err(TxError::Timeout);
        }
        Ok(())
    }

    fn get_abort_origin(&self, pid: ProducerIdentity, tx_seq: TxSeq) -> AbortOrigin {
        let expected = {
            let log = self.log_state.read();
            log.current_txes.get(&pid).map(|t| t.tx_seq)
        }
        .or_else(|| {
            let mem = self.mem_state.read();
            mem.expected
                .get(&pid)
                .copied()
                .or_else(|| mem.preparing.get(&pid).map(|m| m.tx_seq))
        });
        match expected {
            Some(e) if e == tx_seq => AbortOrigin::Present,
            Some(e) if e > tx_seq => AbortOrigin::Past,
            Some(_) => AbortOrigin::Future,
            None => AbortOrigin::Unknown,
        }
    }

    /// Epoch fencing check: `Some(current)` when `pid` is below the fence
    fn fenced_below(&self, pid: ProducerIdentity) -> Option<ProducerEpoch> {
        let log = self.log_state.read();
        match log.fence_pid_epoch.get(&pid.id).copied() {
            Some(current) if pid.epoch < current => Some(current),
            _ => None,
        }
    }

    fn is_known_session(&self, pid: ProducerIdentity) -> bool {
        {
            let mem = self.mem_state.read();
            if mem.estimated.contains_key(&pid)
                || mem.tx_start.contains_key(&pid)
                || mem.expected.contains_key(&pid)
            {
                return true;
            }
        }
        let log = self.log_state.read();
        log.ongoing_map.contains_key(&pid) || log.current_txes.contains_key(&pid)
    }

    // ======================== replicate paths ========================

    /// Replicate a produced batch, running it through fencing, sequence
    /// checks, and transactional bookkeeping as its identity demands.
    pub async fn replicate(
        self: &Arc<Self>,
        batch: RecordBatch,
        opts: ReplicateOptions,
    ) -> Result<KafkaResult> {
        self.do_replicate(batch, opts, None).await
    }

    /// Replicate with a pipelined admission signal: the first stage
    /// resolves once the batch holds its slot in the raft pipeline.
    pub fn replicate_in_stages(
        self: &Arc<Self>,
        batch: RecordBatch,
        opts: ReplicateOptions,
    ) -> KafkaStages {
        let (enq_tx, enq_rx) = oneshot::channel();
        let (rep_tx, rep_rx) = oneshot::channel();
        let stm = Arc::clone(self);
        tokio::spawn(async move {
            let result = stm.do_replicate(batch, opts, Some(enq_tx)).await;
            let _ = rep_tx.send(result);
        });
        KafkaStages {
            enqueued: enq_rx,
            replicated: rep_rx,
        }
    }

    async fn do_replicate(
        &self,
        batch: RecordBatch,
        opts: ReplicateOptions,
        mut enqueued: Option<oneshot::Sender<()>>,
    ) -> Result<KafkaResult> {
        if self.is_stopping() {
            return Err(StmError::ShuttingDown);
        }
        let bid = batch.identity;
        let _state = self.state_lock.read().await;
        let result = if bid.is_transactional {
            self.transactional_replicate(bid, batch, opts, &mut enqueued)
                .await
        } else if bid.is_idempotent() {
            self.idempotent_replicate(bid, batch, opts, &mut enqueued)
                .await
        } else {
            // no producer identity: raw passthrough
            if let Some(tx) = enqueued.take() {
                let _ = tx.send(());
            }
            let term = self.raft.term();
            let r = self.raft.replicate(term, batch, opts).await?;
            Ok(KafkaResult {
                base_offset: self.translator.log_to_kafka(r.base_offset),
            })
        };
        result
    }

    async fn transactional_replicate(
        &self,
        bid: BatchIdentity,
        batch: RecordBatch,
        opts: ReplicateOptions,
        enqueued: &mut Option<oneshot::Sender<()>>,
    ) -> Result<KafkaResult> {
        let term = self.sync_for_replicate().await?;
        let lock = self.tx_locks.get(bid.pid.id);
        let _guard = lock.lock().await;

        if let Some(current) = self.fenced_below(bid.pid) {
            return Err(StmError::InvalidProducerEpoch {
                current,
                received: bid.pid.epoch,
            });
        }
        if !self.is_known_session(bid.pid) {
            // transactional write outside a declared transaction
            return Err(StmError::Tx(TxError::InvalidProducerIdMapping));
        }
        if let Some(offset) = self.known_seq(&bid) {
            debug!(pid = %bid.pid, last_seq = bid.last_seq, offset, "transactional retry answered from cache");
            self.metrics.dedup_hit();
            if let Some(tx) = enqueued.take() {
                let _ = tx.send(());
            }
            return Ok(KafkaResult {
                base_offset: offset,
            });
        }
        self.check_seq(&bid, term)?;

        // before the first batch has an offset, the last applied offset
        // stands in as the LSO barrier
        let estimate = self.last_applied() + 1;
        {
            let has_ongoing = self.log_state.read().ongoing_map.contains_key(&bid.pid);
            let mut mem = self.mem_state.write();
            if !has_ongoing && !mem.tx_start.contains_key(&bid.pid) {
                mem.estimated.entry(bid.pid).or_insert(estimate);
            }
        }

        if let Some(tx) = enqueued.take() {
            let _ = tx.send(());
        }
        let result = match self.raft.replicate(term, batch, opts).await {
            Ok(result) => result,
            Err(e) => {
                self.reset_seq(&bid, term);
                let mut mem = self.mem_state.write();
                if !mem.tx_start.contains_key(&bid.pid) {
                    mem.estimated.remove(&bid.pid);
                }
                return Err(e);
            }
        };

        {
            let has_ongoing = self.log_state.read().ongoing_map.contains_key(&bid.pid);
            let mut mem = self.mem_state.write();
            if !has_ongoing
                && !mem.tx_start.contains_key(&bid.pid)
                && self.last_applied() < result.base_offset
            {
                mem.tx_start.insert(bid.pid, result.base_offset);
                mem.tx_starts.insert(result.base_offset);
            }
        }
        let kafka_base = self.translator.log_to_kafka(result.base_offset);
        self.set_seq(&bid, kafka_base);
        Ok(KafkaResult {
            base_offset: kafka_base,
        })
    }

    async fn idempotent_replicate(
        &self,
        bid: BatchIdentity,
        batch: RecordBatch,
        opts: ReplicateOptions,
        enqueued: &mut Option<oneshot::Sender<()>>,
    ) -> Result<KafkaResult> {
        let term = self.sync_for_replicate().await?;
        let lock = self.tx_locks.get(bid.pid.id);
        let _guard = lock.lock().await;

        if let Some(current) = self.fenced_below(bid.pid) {
            return Err(StmError::InvalidProducerEpoch {
                current,
                received: bid.pid.epoch,
            });
        }
        if let Some(offset) = self.known_seq(&bid) {
            debug!(pid = %bid.pid, last_seq = bid.last_seq, offset, "idempotent retry answered from cache");
            self.metrics.dedup_hit();
            if let Some(tx) = enqueued.take() {
                let _ = tx.send(());
            }
            return Ok(KafkaResult {
                base_offset: offset,
            });
        }
        self.check_seq(&bid, term)?;

        if let Some(tx) = enqueued.take() {
            let _ = tx.send(());
        }
        let result = match self.raft.replicate(term, batch, opts).await {
            Ok(result) => result,
            Err(e) => {
                self.reset_seq(&bid, term);
                return Err(e);
            }
        };
        let kafka_base = self.translator.log_to_kafka(result.base_offset);
        self.set_seq(&bid, kafka_base);
        Ok(KafkaResult {
            base_offset: kafka_base,
        })
    }

    async fn sync_for_replicate(&self) -> Result<i64> {
        self.sync(self.cfg.sync_timeout()).await.map_err(|e| match e {
            TxError::NotCoordinator => StmError::NotLeader,
            TxError::Timeout => StmError::Timeout,
            TxError::ShuttingDown => StmError::ShuttingDown,
            other => StmError::Tx(other),
        })
    }

    // ======================== sequence table ========================

    fn known_seq(&self, bid: &BatchIdentity) -> Option<KafkaOffset> {
        let log = self.log_state.read();
        log.seq_table
            .get(&bid.pid)
            .and_then(|w| w.entry.cached_offset(bid.last_seq))
    }

    /// Admit a batch's sequence range, optimistically advancing the table
    /// before replication. A failed replicate must call
    /// [`reset_seq`](Self::reset_seq) to roll the expectation back.
    fn check_seq(&self, bid: &BatchIdentity, term: i64) -> Result<()> {
        let rejected = {
            let mut log = self.log_state.write();
            let wrapper = log
                .seq_table
                .entry(bid.pid)
                .or_insert_with(|| SeqEntryWrapper::new(bid.pid));
            let expected = wrapper.entry.seq + 1;
            if bid.first_seq == expected {
                wrapper.entry.update(bid.last_seq, -1);
                wrapper.term = term;
                None
            } else {
                Some(expected.max(0))
            }
        };
        match rejected {
            None => Ok(()),
            Some(expected) => {
                debug!(
                    pid = %bid.pid,
                    expected,
                    received = bid.first_seq,
                    "out of order sequence"
                );
                self.metrics.out_of_order();
                Err(StmError::OutOfOrderSequence {
                    expected,
                    received: bid.first_seq,
                })
            }
        }
    }

    fn set_seq(&self, bid: &BatchIdentity, offset: KafkaOffset) {
        let mut log = self.log_state.write();
        if let Some(wrapper) = log.seq_table.get_mut(&bid.pid) {
            wrapper.entry.update(bid.last_seq, offset);
        }
    }

    fn reset_seq(&self, bid: &BatchIdentity, term: i64) {
        let mut log = self.log_state.write();
        let wrapper = log
            .seq_table
            .entry(bid.pid)
            .or_insert_with(|| SeqEntryWrapper::new(bid.pid));
        wrapper.entry.seq = bid.first_seq - 1;
        wrapper.entry.last_offset = -1;
        wrapper.term = term;
    }

    /// Forget a producer's sequence state when the external producer-state
    /// manager evicts it. Sessions with an open transaction stay tracked.
    pub fn cleanup_producer_state(&self, pid: ProducerIdentity) {
        {
            let mut log = self.log_state.write();
            if log.current_txes.contains_key(&pid) || log.ongoing_map.contains_key(&pid) {
                return;
            }
            log.seq_table.remove(&pid);
        }
        self.tx_locks.release(pid.id);
        debug!(%pid, "producer state evicted");
    }

    // ======================== apply path ========================

    /// Apply one committed batch. Invoked strictly in log order by the
    /// committed-batch stream; also safe for replay, which skips batches
    /// at or below the applied offset.
    pub fn apply(self: &Arc<Self>, committed: CommittedBatch) {
        if committed.last_offset <= self.last_applied() {
            return;
        }
        let batch = &committed.batch;
        match batch.batch_type {
            BatchType::TxFence => match read_fence_batch(batch) {
                Ok(data) => self.apply_fence_batch(&data),
                Err(e) => warn!(error = %e, "dropping undecodable fence batch"),
            },
            BatchType::TxPrepare => match read_prepare_batch(batch) {
                Ok(marker) => {
                    self.log_state.write().apply_prepare(marker);
                    self.mem_state.write().preparing.remove(&marker.pid);
                }
                Err(e) => warn!(error = %e, "dropping undecodable prepare marker"),
            },
            BatchType::Control => match parse_control_batch(batch) {
                Ok(kind) => self.apply_control_batch(batch.pid(), kind, committed.last_offset),
                Err(e) => warn!(error = %e, "dropping undecodable control batch"),
            },
            BatchType::Data => {
                let bid = batch.identity;
                if bid.is_idempotent() {
                    self.apply_data_batch(
                        &bid,
                        committed.base_offset,
                        committed.last_offset,
                        committed.term,
                    );
                }
            }
        }
        self.applied_offset
            .store(committed.last_offset, Ordering::Release);
        self.applied_notify.notify_waiters();
    }

    fn apply_fence_batch(&self, data: &crate::model::FenceBatchData) {
        let outcome = self.log_state.write().apply_fence(data);
        match outcome {
            FenceOutcome::Stale => {}
            FenceOutcome::Applied { fenced } => {
                self.metrics.fence_applied();
                {
                    let mut mem = self.mem_state.write();
                    if let Some(old) = fenced {
                        mem.forget(old);
                    }
                    mem.expected.remove(&data.pid);
                }
                if data.tx_seq.is_some() {
                    // a new deadline may be the earliest one
                    self.expiration_wake.notify_waiters();
                }
            }
        }
    }

    fn apply_data_batch(
        &self,
        bid: &BatchIdentity,
        base_offset: LogOffset,
        last_offset: LogOffset,
        term: i64,
    ) {
        let kafka_base = self.translator.log_to_kafka(base_offset);
        self.log_state
            .write()
            .apply_data(bid, base_offset, last_offset, kafka_base, term);
        if bid.is_transactional {
            let mut mem = self.mem_state.write();
            mem.estimated.remove(&bid.pid);
            if let Some(start) = mem.tx_start.remove(&bid.pid) {
                mem.tx_starts.remove(&start);
            }
        }
    }

    fn apply_control_batch(
        self: &Arc<Self>,
        pid: ProducerIdentity,
        kind: ControlRecordType,
        last_offset: LogOffset,
    ) {
        let aborted_len = {
            let mut log = self.log_state.write();
            log.apply_control(pid, kind);
            log.aborted.len()
        };
        {
            let mut mem = self.mem_state.write();
            mem.forget(pid);
            mem.last_end_tx = last_offset;
        }
        match kind {
            ControlRecordType::TxCommit => self.metrics.tx_committed(),
            ControlRecordType::TxAbort => {
                self.metrics.tx_aborted();
                if aborted_len >= self.cfg.abort_index_segment_size {
                    let stm = Arc::clone(self);
                    tokio::spawn(async move {
                        stm.reduce_aborted_list().await;
                    });
                }
            }
            ControlRecordType::Unknown => {}
        }
    }

    // ======================== LSO & aborted ranges ========================

    /// Exclusive upper bound on offsets visible to read-committed
    /// consumers. Non-decreasing within a term.
    pub fn last_stable_offset(&self) -> LogOffset {
        let mut first_bound = self.raft.committed_offset();
        if let Some(first) = self.log_state.read().first_ongoing() {
            first_bound = first_bound.min(first);
        }
        let mut mem = self.mem_state.write();
        if let Some(first) = mem.first_tx_start() {
            first_bound = first_bound.min(first);
        }
        if let Some(first) = mem.first_estimated() {
            first_bound = first_bound.min(first);
        }
        let lso = (first_bound - 1).max(-1);
        if lso < mem.last_lso {
            return mem.last_lso;
        }
        mem.last_lso = lso;
        drop(mem);
        self.metrics.set_last_stable_offset(lso);
        lso
    }

    /// Upper bound for log GC: everything at or below it is decided
    pub fn max_collectible_offset(&self) -> LogOffset {
        let lso = self.last_stable_offset();
        if lso < 0 {
            return 0;
        }
        (lso - 1).max(0)
    }

    /// Aborted transaction ranges overlapping `[from, to]`, merging the
    /// in-memory list with any offloaded segments whose envelope overlaps.
    /// Segment load failures are recoverable; retry later.
    pub async fn aborted_tx_ranges(
        &self,
        from: LogOffset,
        to: LogOffset,
    ) -> Result<Vec<TxRange>> {
        let (mut result, overlapping, last_snapshot) = {
            let log = self.log_state.read();
            let in_mem: Vec<TxRange> = log
                .aborted
                .iter()
                .filter(|r| r.overlaps(from, to))
                .copied()
                .collect();
            let indexes: Vec<AbortIndex> = log
                .abort_indexes
                .iter()
                .filter(|idx| idx.first <= to && idx.last >= from)
                .copied()
                .collect();
            (in_mem, indexes, log.last_abort_snapshot.clone())
        };
        for idx in overlapping {
            if let Some(snapshot) = last_snapshot.as_ref() {
                if snapshot.matches(idx) {
                    result.extend(snapshot.aborted.iter().filter(|r| r.overlaps(from, to)));
                    continue;
                }
            }
            let segment = self.store.load_abort_segment(idx).await?;
            result.extend(segment.aborted.iter().filter(|r| r.overlaps(from, to)));
        }
        Ok(result)
    }

    /// Offload the oldest chunk of aborted ranges to a segment file once
    /// the in-memory list crosses the configured threshold.
    pub async fn reduce_aborted_list(&self) {
        let Ok(_single_flight) = self.offload_lock.try_lock() else {
            return;
        };
        let chunk: Vec<TxRange> = {
            let log = self.log_state.read();
            if log.aborted.len() < self.cfg.abort_index_segment_size {
                return;
            }
            log.aborted[..self.cfg.abort_index_segment_size].to_vec()
        };
        let segment = AbortSegment::from_ranges(chunk);
        if let Err(e) = self.store.save_abort_segment(&segment).await {
            warn!(error = %e, "failed to offload abort segment");
            return;
        }
        {
            let mut log = self.log_state.write();
            log.aborted.drain(..segment.aborted.len());
            log.abort_indexes.push(segment.index());
            log.last_abort_snapshot = Some(segment);
        }
        self.metrics.abort_segment_offloaded();
        info!(
            threshold = self.cfg.abort_index_segment_size,
            "offloaded aborted ranges to segment file"
        );
    }

    // ======================== snapshots ========================

    /// Serialize the durable view at the current applied offset
    pub fn local_snapshot(&self) -> TxSnapshot {
        let log = self.log_state.read();
        let mut fenced: Vec<ProducerIdentity> = log
            .fence_pid_epoch
            .iter()
            .map(|(id, epoch)| ProducerIdentity::new(*id, *epoch))
            .collect();
        fenced.sort();
        let mut ongoing: Vec<TxRange> = log.ongoing_map.values().copied().collect();
        ongoing.sort_by_key(|r| (r.pid, r.first));
        let mut prepared: Vec<PrepareMarker> = log.prepared.values().copied().collect();
        prepared.sort_by_key(|m| m.pid);
        let mut seqs: Vec<SeqEntry> = log.seq_table.values().map(|w| w.entry.clone()).collect();
        seqs.sort_by_key(|e| e.pid);
        let mut tx_data: Vec<TxDataSnapshot> = log
            .current_txes
            .iter()
            .map(|(pid, tx)| TxDataSnapshot {
                pid: *pid,
                tx_seq: tx.tx_seq,
                tm_partition: tx.tm_partition,
            })
            .collect();
        tx_data.sort_by_key(|t| t.pid);
        let mut expiration: Vec<ExpirationSnapshot> = log
            .expiration
            .iter()
            .map(|(pid, exp)| ExpirationSnapshot {
                pid: *pid,
                timeout_ms: exp.timeout.as_millis() as i64,
            })
            .collect();
        expiration.sort_by_key(|e| e.pid);
        TxSnapshot {
            fenced,
            ongoing,
            prepared,
            aborted: log.aborted.clone(),
            abort_indexes: log.abort_indexes.clone(),
            offset: self.last_applied(),
            seqs,
            tx_data,
            expiration,
        }
    }

    /// Take and persist a local snapshot. Holds the write side of the
    /// state lock so admission drains and the snapshot is a consistent cut.
    pub async fn take_local_snapshot(&self) -> Result<()> {
        let _state = self.state_lock.write().await;
        let snapshot = self.local_snapshot();
        self.store.save_local(&snapshot).await?;
        self.metrics.snapshot_taken();
        Ok(())
    }

    /// Replace the durable view with a snapshot shipped by raft
    pub fn apply_raft_snapshot(&self, data: Bytes) -> Result<()> {
        let snapshot = TxSnapshot::decode(data)?;
        self.install_snapshot(snapshot);
        Ok(())
    }

    fn install_snapshot(&self, snapshot: TxSnapshot) {
        {
            let mut log = self.log_state.write();
            log.reset();
            for pid in &snapshot.fenced {
                let entry = log.fence_pid_epoch.entry(pid.id).or_insert(pid.epoch);
                if *entry < pid.epoch {
                    *entry = pid.epoch;
                }
            }
            for range in &snapshot.ongoing {
                log.ongoing_map.insert(range.pid, *range);
                log.ongoing_set.insert(range.first);
            }
            for marker in &snapshot.prepared {
                log.prepared.insert(marker.pid, *marker);
            }
            log.aborted = snapshot.aborted.clone();
            log.abort_indexes = snapshot.abort_indexes.clone();
            for entry in &snapshot.seqs {
                log.seq_table.insert(
                    entry.pid,
                    SeqEntryWrapper {
                        entry: entry.clone(),
                        term: -1,
                    },
                );
            }
            for tx in &snapshot.tx_data {
                log.current_txes.insert(
                    tx.pid,
                    TxData {
                        tx_seq: tx.tx_seq,
                        tm_partition: tx.tm_partition,
                    },
                );
            }
            for exp in &snapshot.expiration {
                log.expiration.insert(
                    exp.pid,
                    ExpirationInfo::new(Duration::from_millis(exp.timeout_ms.max(0) as u64)),
                );
            }
        }
        self.applied_offset
            .store(snapshot.offset, Ordering::Release);
        self.applied_notify.notify_waiters();
        self.expiration_wake.notify_waiters();
    }

    /// Size of the local snapshot file in bytes
    pub async fn get_local_snapshot_size(&self) -> u64 {
        self.store.local_size().await
    }

    /// Delete the local snapshot and every abort segment, e.g. when the
    /// partition is removed from this node
    pub async fn remove_persistent_state(&self) -> Result<()> {
        self.store.remove_all().await
    }

    /// Acquire the write side of the state lock so in-flight replicates
    /// drain before leadership moves away
    pub async fn prepare_transfer_leadership(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.state_lock.write().await
    }

    // ======================== introspection ========================

    /// Tracked transactions with their lifecycle stage and LSO bound.
    /// Leader-only: followers answer `NotCoordinator`.
    pub fn get_transactions(
        &self,
    ) -> std::result::Result<BTreeMap<ProducerIdentity, TransactionInfo>, TxError> {
        if !self.raft.is_leader() {
            return Err(TxError::NotCoordinator);
        }
        let log = self.log_state.read();
        let mem = self.mem_state.read();
        let mut out = BTreeMap::new();
        for pid in log.current_txes.keys() {
            let (status, lso_bound) = if let Some(range) = log.ongoing_map.get(pid) {
                (TxStatus::Ongoing, range.first)
            } else if log.prepared.contains_key(pid) {
                (TxStatus::Prepared, self.last_applied() + 1)
            } else if mem.preparing.contains_key(pid) {
                (TxStatus::Preparing, self.last_applied() + 1)
            } else {
                (
                    TxStatus::Initiating,
                    mem.estimated
                        .get(pid)
                        .copied()
                        .unwrap_or_else(|| self.last_applied() + 1),
                )
            };
            out.insert(
                *pid,
                TransactionInfo {
                    status,
                    lso_bound,
                    info: log.expiration.get(pid).copied(),
                    seq: log.tail_seq(*pid),
                },
            );
        }
        Ok(out)
    }

    /// Request expiration of a producer's transaction on the next timer
    /// tick, regardless of its deadline
    pub fn mark_expired(&self, pid: ProducerIdentity) -> std::result::Result<(), TxError> {
        {
            let mut log = self.log_state.write();
            if !log.current_txes.contains_key(&pid) {
                return Err(TxError::TxNotFound);
            }
            match log.expiration.get_mut(&pid) {
                Some(exp) => exp.is_expiration_requested = true,
                None => {
                    let mut exp = ExpirationInfo::new(Duration::ZERO);
                    exp.is_expiration_requested = true;
                    log.expiration.insert(pid, exp);
                }
            }
        }
        self.expiration_wake.notify_waiters();
        Ok(())
    }

    /// Observed epoch fence for a producer id
    pub fn fenced_epoch(&self, id: ProducerId) -> Option<ProducerEpoch> {
        self.log_state.read().fence_pid_epoch.get(&id).copied()
    }

    /// Whether `pid` has a declared open transaction
    pub fn has_current_tx(&self, pid: ProducerIdentity) -> bool {
        self.log_state.read().current_txes.contains_key(&pid)
    }

    /// Sequence state of a producer, if tracked
    pub fn seq_entry(&self, pid: ProducerIdentity) -> Option<SeqEntry> {
        self.log_state.read().seq_entry(pid).cloned()
    }

    /// Ordered first-offsets of ongoing transactions
    pub fn ongoing_set(&self) -> Vec<LogOffset> {
        self.log_state.read().ongoing_set.iter().copied().collect()
    }

    /// Ongoing transaction ranges by producer
    pub fn ongoing_ranges(&self) -> Vec<TxRange> {
        self.log_state.read().ongoing_map.values().copied().collect()
    }

    /// Counters over the speculative state, for tests and debugging
    pub fn mem_state_stats(&self) -> MemStateStats {
        let mem = self.mem_state.read();
        MemStateStats {
            term: mem.term,
            expected: mem.expected.len(),
            estimated: mem.estimated.len(),
            tx_starts: mem.tx_starts.len(),
            preparing: mem.preparing.len(),
        }
    }

    /// Expiration tracking of a producer's transaction
    pub fn get_expiration_info(&self, pid: ProducerIdentity) -> Option<ExpirationInfo> {
        self.log_state.read().expiration.get(&pid).copied()
    }

    // ======================== expiration plumbing ========================

    pub(crate) async fn expiration_wake_notified(&self) {
        self.expiration_wake.notified().await;
    }

    pub(crate) fn next_expiration_sleep(&self) -> Duration {
        let now = Instant::now();
        let grace = self.cfg.tx_timeout_delay();
        let earliest = {
            let log = self.log_state.read();
            log.expiration
                .values()
                .map(|exp| {
                    if exp.is_expiration_requested {
                        Duration::ZERO
                    } else {
                        (exp.deadline() + grace).saturating_duration_since(now)
                    }
                })
                .min()
        };
        earliest
            .map(|d| d.min(self.cfg.abort_interval()))
            .unwrap_or_else(|| self.cfg.abort_interval())
            .max(Duration::from_millis(10))
    }

    pub(crate) async fn abort_old_txes(&self) {
        let now = Instant::now();
        let grace = self.cfg.tx_timeout_delay();
        let expired: Vec<ProducerIdentity> = {
            let log = self.log_state.read();
            log.expiration
                .iter()
                .filter(|(_, exp)| exp.is_expired(now, grace))
                .map(|(pid, _)| *pid)
                .collect()
        };
        for pid in expired {
            if self.is_stopping() {
                return;
            }
            self.try_abort_old_tx(pid).await;
        }
    }

    /// Ask the coordinator to resolve one expired transaction. The
    /// per-producer mutex is deliberately not held here: the coordinator
    /// resolves by driving `abort_tx` back into this partition.
    async fn try_abort_old_tx(&self, pid: ProducerIdentity) {
        let tx = self.log_state.read().current_txes.get(&pid).copied();
        match tx {
            Some(tx) => {
                info!(%pid, tx_seq = tx.tx_seq, "transaction expired, requesting abort");
                let reply = self
                    .coordinator
                    .try_abort(tx.tm_partition, pid, tx.tx_seq, self.cfg.sync_timeout())
                    .await;
                if reply.is_resolved() {
                    self.metrics.tx_expired();
                } else {
                    debug!(%pid, ec = ?reply.ec, "expired transaction unresolved, retrying next tick");
                }
            }
            None => {
                // orphan entry without a declared transaction
                self.log_state.write().expiration.remove(&pid);
            }
        }
    }

    fn log_tx_stats(&self) {
        let (ongoing, producers, aborted, declared) = {
            let log = self.log_state.read();
            (
                log.ongoing_map.len(),
                log.seq_table.len(),
                log.aborted.len(),
                log.current_txes.len(),
            )
        };
        self.metrics.set_ongoing_txes(ongoing);
        self.metrics.set_tracked_producers(producers);
        self.metrics.set_aborted_ranges(aborted);
        info!(
            topic = %self.topic,
            partition = self.partition,
            ongoing,
            producers,
            aborted_ranges = aborted,
            declared_txes = declared,
            applied = self.last_applied(),
            "transaction state stats"
        );
    }
}

fn replicate_tx_error(e: &StmError) -> TxError {
    match e {
        StmError::NotLeader => TxError::LeaderNotFound,
        StmError::Timeout => TxError::Timeout,
        StmError::ShuttingDown => TxError::ShuttingDown,
        _ => TxError::UnknownServerError,
    }
}

async fn apply_loop(
    stm: Arc<RmStm>,
    mut rx: mpsc::UnboundedReceiver<CommittedBatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(batch) => stm.apply(batch),
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("apply loop stopped");
}

async fn stats_loop(stm: Arc<RmStm>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(stm.cfg.log_stats_interval_s.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        stm.log_tx_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_status_strings() {
        assert_eq!(TxStatus::Ongoing.as_str(), "ongoing");
        assert_eq!(TxStatus::Preparing.as_str(), "preparing");
        assert_eq!(TxStatus::Prepared.as_str(), "prepared");
        assert_eq!(TxStatus::Initiating.as_str(), "initiating");
        assert_eq!(TxStatus::Ongoing.to_string(), "ongoing");
    }

    #[test]
    fn test_transaction_info_without_expiration_is_expired() {
        let info = TransactionInfo {
            status: TxStatus::Ongoing,
            lso_bound: 10,
            info: None,
            seq: None,
        };
        assert!(info.is_expired(Duration::ZERO));
        assert!(info.get_staleness(Duration::ZERO).is_none());
        assert!(info.get_timeout(Duration::ZERO).is_none());
    }

    #[test]
    fn test_transaction_info_reports_timeout_while_live() {
        let info = TransactionInfo {
            status: TxStatus::Ongoing,
            lso_bound: 10,
            info: Some(ExpirationInfo::new(Duration::from_secs(3_600))),
            seq: Some(4),
        };
        assert!(!info.is_expired(Duration::ZERO));
        assert_eq!(info.get_timeout(Duration::ZERO), Some(Duration::from_secs(3_600)));
        assert!(info.get_staleness(Duration::ZERO).is_some());
    }

    #[test]
    fn test_replicate_error_mapping() {
        assert_eq!(
            replicate_tx_error(&StmError::NotLeader),
            TxError::LeaderNotFound
        );
        assert_eq!(replicate_tx_error(&StmError::Timeout), TxError::Timeout);
        assert_eq!(
            replicate_tx_error(&StmError::ShuttingDown),
            TxError::ShuttingDown
        );
        assert_eq!(
            replicate_tx_error(&StmError::Replication("quorum lost".to_string())),
            TxError::UnknownServerError
        );
    }
}
