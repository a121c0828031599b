//! Transaction coordinator frontend
//!
//! The resource manager never decides commit or abort on its own; when a
//! transaction expires it asks the coordinator to resolve it. The
//! coordinator then drives the abort back through the partition's
//! `abort_tx`. This module defines that seam plus the in-process wirings
//! used by tests and embedded deployments.

use crate::error::TxError;
use crate::model::{ProducerIdentity, TxSeq};
use crate::rm::RmStm;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of asking the coordinator to resolve a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryAbortReply {
    pub ec: Option<TxError>,
    pub committed: bool,
    pub aborted: bool,
}

impl TryAbortReply {
    pub fn aborted() -> Self {
        Self {
            ec: None,
            committed: false,
            aborted: true,
        }
    }

    pub fn committed() -> Self {
        Self {
            ec: None,
            committed: true,
            aborted: false,
        }
    }

    pub fn error(ec: TxError) -> Self {
        Self {
            ec: Some(ec),
            committed: false,
            aborted: false,
        }
    }

    /// The transaction reached a terminal state
    pub fn is_resolved(&self) -> bool {
        self.ec.is_none() && (self.committed || self.aborted)
    }
}

/// Client view of the transaction coordinator
#[async_trait]
pub trait TxCoordinator: Send + Sync {
    /// Ask the coordinator to abort the given transaction of `pid` on the
    /// coordinator partition `tm_partition`. The coordinator resolves the
    /// transaction (usually by replicating an abort marker back into this
    /// partition) and reports the terminal state.
    async fn try_abort(
        &self,
        tm_partition: i32,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        timeout: Duration,
    ) -> TryAbortReply;
}

/// Coordinator stub that never resolves anything. Used by tests that want
/// expired transactions to stay put.
#[derive(Debug, Default)]
pub struct NoopCoordinator;

#[async_trait]
impl TxCoordinator for NoopCoordinator {
    async fn try_abort(
        &self,
        _tm_partition: i32,
        _pid: ProducerIdentity,
        _tx_seq: TxSeq,
        _timeout: Duration,
    ) -> TryAbortReply {
        TryAbortReply::error(TxError::CoordinatorNotAvailable)
    }
}

/// In-process coordinator that resolves expired transactions by aborting
/// them directly on the owning partition, the way the embedded broker wires
/// the gateway. Bind the partition after construction with [`bind`].
///
/// [`bind`]: LoopbackCoordinator::bind
#[derive(Default)]
pub struct LoopbackCoordinator {
    partition: parking_lot::RwLock<Weak<RmStm>>,
}

impl LoopbackCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Point the coordinator at the partition it resolves transactions on
    pub fn bind(&self, stm: &Arc<RmStm>) {
        *self.partition.write() = Arc::downgrade(stm);
    }
}

#[async_trait]
impl TxCoordinator for LoopbackCoordinator {
    async fn try_abort(
        &self,
        _tm_partition: i32,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        timeout: Duration,
    ) -> TryAbortReply {
        let stm = match self.partition.read().upgrade() {
            Some(stm) => stm,
            None => {
                warn!(%pid, "try_abort with no bound partition");
                return TryAbortReply::error(TxError::CoordinatorNotAvailable);
            }
        };
        debug!(%pid, tx_seq, "coordinator resolving expired transaction");
        match stm.abort_tx(pid, tx_seq, timeout).await {
            Ok(()) => TryAbortReply::aborted(),
            Err(ec) => TryAbortReply::error(ec),
        }
    }
}
