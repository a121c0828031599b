//! Speculative state bound to the current raft term
//!
//! Mem-state absorbs the effect of requests before they are known to
//! commit, so read-committed fetches never observe data that may belong to
//! an eventually-aborted transaction. It is wiped whole on every term
//! change; log-state survives. The combination of the two is always up to
//! date once the log has caught up with the new term.

use crate::model::{LogOffset, PrepareMarker, ProducerIdentity, TxSeq};
use std::collections::{BTreeSet, HashMap};

/// Volatile, term-scoped view of in-flight transactional effects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemState {
    /// Term this view belongs to; a mismatch with raft's term invalidates
    /// the whole struct
    pub term: i64,
    /// Pre-replication LSO barrier: before the first batch of a
    /// transaction has an offset, the last seen offset stands in for it
    pub estimated: HashMap<ProducerIdentity, LogOffset>,
    /// First offsets of transactions whose data is replicated but not yet
    /// applied
    pub tx_start: HashMap<ProducerIdentity, LogOffset>,
    /// Ordered view over `tx_start` values
    pub tx_starts: BTreeSet<LogOffset>,
    /// Transactions whose fence batch is replicating but not yet applied
    pub expected: HashMap<ProducerIdentity, TxSeq>,
    /// Transactions moving toward commit; used to filter stale aborts
    pub preparing: HashMap<ProducerIdentity, PrepareMarker>,
    /// Offset of the most recent commit/abort marker
    pub last_end_tx: LogOffset,
    /// Explicitly remembered LSO so alternation between candidates never
    /// violates monotonicity within the term
    pub last_lso: LogOffset,
}

impl MemState {
    pub fn new(term: i64) -> Self {
        Self {
            term,
            estimated: HashMap::new(),
            tx_start: HashMap::new(),
            tx_starts: BTreeSet::new(),
            expected: HashMap::new(),
            preparing: HashMap::new(),
            last_end_tx: -1,
            last_lso: -1,
        }
    }

    /// Drop every trace of a producer session
    pub fn forget(&mut self, pid: ProducerIdentity) {
        self.expected.remove(&pid);
        self.estimated.remove(&pid);
        self.preparing.remove(&pid);
        if let Some(start) = self.tx_start.remove(&pid) {
            self.tx_starts.remove(&start);
        }
    }

    /// Earliest first-offset among replicated-but-unapplied transactions
    pub fn first_tx_start(&self) -> Option<LogOffset> {
        self.tx_starts.iter().next().copied()
    }

    /// Earliest estimated first-offset among pre-replication transactions
    pub fn first_estimated(&self) -> Option<LogOffset> {
        self.estimated.values().copied().min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: i64) -> ProducerIdentity {
        ProducerIdentity::new(id, 0)
    }

    #[test]
    fn test_fresh_state() {
        let mem = MemState::new(3);
        assert_eq!(mem.term, 3);
        assert_eq!(mem.last_end_tx, -1);
        assert_eq!(mem.last_lso, -1);
        assert!(mem.first_tx_start().is_none());
        assert!(mem.first_estimated().is_none());
    }

    #[test]
    fn test_forget_removes_tx_start_pair() {
        let mut mem = MemState::new(1);
        mem.tx_start.insert(pid(1), 100);
        mem.tx_starts.insert(100);
        mem.tx_start.insert(pid(2), 200);
        mem.tx_starts.insert(200);

        mem.forget(pid(1));
        assert!(!mem.tx_start.contains_key(&pid(1)));
        assert_eq!(mem.first_tx_start(), Some(200));
    }

    #[test]
    fn test_forget_clears_all_views() {
        let mut mem = MemState::new(1);
        mem.expected.insert(pid(3), 4);
        mem.estimated.insert(pid(3), 50);
        mem.preparing.insert(
            pid(3),
            PrepareMarker {
                tm_partition: 0,
                tx_seq: 4,
                pid: pid(3),
            },
        );

        mem.forget(pid(3));
        assert!(mem.expected.is_empty());
        assert!(mem.estimated.is_empty());
        assert!(mem.preparing.is_empty());
    }

    #[test]
    fn test_first_estimated_is_minimum() {
        let mut mem = MemState::new(1);
        mem.estimated.insert(pid(1), 300);
        mem.estimated.insert(pid(2), 150);
        mem.estimated.insert(pid(3), 400);
        assert_eq!(mem.first_estimated(), Some(150));
    }
}
