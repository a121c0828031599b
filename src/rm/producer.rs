//! Per-producer sequence tracking and admission locks
//!
//! Each producer session carries a current `(seq, last_offset)` pair plus a
//! small ring of recently committed `(seq, offset)` tuples so bounded retry
//! windows can be answered from cache without replication. A per-producer
//! mutex serializes admission for the same session; different sessions
//! proceed in parallel.

use crate::model::{KafkaOffset, ProducerId, ProducerIdentity};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Number of historical `(seq, offset)` tuples kept per producer
pub const SEQ_CACHE_SIZE: usize = 5;

/// A committed sequence remembered for retry detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqCacheEntry {
    pub seq: i32,
    pub offset: KafkaOffset,
}

/// Sequence state for one producer session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqEntry {
    pub pid: ProducerIdentity,
    /// Highest sequence accepted, -1 before the first batch
    pub seq: i32,
    /// Offset of the batch carrying `seq`, -1 while it is in flight
    pub last_offset: KafkaOffset,
    /// Ring of recently committed sequences, oldest first
    pub seq_cache: VecDeque<SeqCacheEntry>,
    /// Wall-clock ms of the last accepted write
    pub last_write_timestamp: i64,
}

impl SeqEntry {
    pub fn new(pid: ProducerIdentity) -> Self {
        Self {
            pid,
            seq: -1,
            last_offset: -1,
            seq_cache: VecDeque::with_capacity(SEQ_CACHE_SIZE),
            last_write_timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Advance to `new_seq`, shifting the previous pair into the cache.
    ///
    /// Lower sequences are ignored; an equal sequence only refreshes the
    /// offset (the in-flight slot getting its committed offset).
    pub fn update(&mut self, new_seq: i32, new_offset: KafkaOffset) {
        if new_seq < self.seq {
            return;
        }
        self.last_write_timestamp = chrono::Utc::now().timestamp_millis();
        if self.seq == new_seq {
            self.last_offset = new_offset;
            return;
        }
        if self.seq >= 0 && self.last_offset >= 0 {
            self.seq_cache.push_back(SeqCacheEntry {
                seq: self.seq,
                offset: self.last_offset,
            });
            while self.seq_cache.len() >= SEQ_CACHE_SIZE {
                self.seq_cache.pop_front();
            }
        }
        self.seq = new_seq;
        self.last_offset = new_offset;
    }

    /// Offset of a previously committed batch ending at `seq`, if still in
    /// the retry window
    pub fn cached_offset(&self, seq: i32) -> Option<KafkaOffset> {
        if self.seq == seq && self.last_offset >= 0 {
            return Some(self.last_offset);
        }
        self.seq_cache
            .iter()
            .find(|e| e.seq == seq)
            .map(|e| e.offset)
    }
}

/// Sequence entry bound to the raft term it was last written in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqEntryWrapper {
    pub entry: SeqEntry,
    pub term: i64,
}

impl SeqEntryWrapper {
    pub fn new(pid: ProducerIdentity) -> Self {
        Self {
            entry: SeqEntry::new(pid),
            term: -1,
        }
    }
}

/// Registry of per-producer admission mutexes.
///
/// Locks are keyed by producer id (not identity): a fenced epoch must not
/// race its successor through admission.
#[derive(Debug, Default)]
pub struct ProducerLocks {
    locks: DashMap<ProducerId, Arc<Mutex<()>>>,
}

impl ProducerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the admission lock for a producer
    pub fn get(&self, id: ProducerId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry if nobody holds it anymore
    pub fn release(&self, id: ProducerId) {
        self.locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> ProducerIdentity {
        ProducerIdentity::new(7, 0)
    }

    // ==================== Update Rule Tests ====================

    #[test]
    fn test_fresh_entry() {
        let entry = SeqEntry::new(pid());
        assert_eq!(entry.seq, -1);
        assert_eq!(entry.last_offset, -1);
        assert!(entry.seq_cache.is_empty());
    }

    #[test]
    fn test_update_advances_and_caches() {
        let mut entry = SeqEntry::new(pid());
        entry.update(4, 10);
        assert_eq!(entry.seq, 4);
        assert_eq!(entry.last_offset, 10);
        assert!(entry.seq_cache.is_empty());

        entry.update(9, 25);
        assert_eq!(entry.seq, 9);
        assert_eq!(entry.last_offset, 25);
        assert_eq!(
            entry.seq_cache.front(),
            Some(&SeqCacheEntry { seq: 4, offset: 10 })
        );
    }

    #[test]
    fn test_update_equal_seq_refreshes_offset() {
        let mut entry = SeqEntry::new(pid());
        entry.update(4, -1); // optimistic admission, offset unknown
        assert_eq!(entry.last_offset, -1);
        entry.update(4, 10); // commit fills it in
        assert_eq!(entry.seq, 4);
        assert_eq!(entry.last_offset, 10);
        assert!(entry.seq_cache.is_empty());
    }

    #[test]
    fn test_update_lower_seq_ignored() {
        let mut entry = SeqEntry::new(pid());
        entry.update(9, 25);
        entry.update(4, 99);
        assert_eq!(entry.seq, 9);
        assert_eq!(entry.last_offset, 25);
    }

    #[test]
    fn test_in_flight_pair_not_cached() {
        let mut entry = SeqEntry::new(pid());
        entry.update(4, -1);
        entry.update(9, 25);
        // the (4, -1) pair had no committed offset and must not pollute the cache
        assert!(entry.seq_cache.is_empty());
    }

    #[test]
    fn test_cache_bounded_at_five() {
        let mut entry = SeqEntry::new(pid());
        for i in 0..10 {
            entry.update(i, i64::from(i) * 100);
        }
        assert!(entry.seq_cache.len() < SEQ_CACHE_SIZE);
        // oldest entries were evicted
        assert!(entry.cached_offset(0).is_none());
        assert_eq!(entry.cached_offset(8), Some(800));
    }

    // ==================== Retry Window Tests ====================

    #[test]
    fn test_cached_offset_current() {
        let mut entry = SeqEntry::new(pid());
        entry.update(4, 10);
        assert_eq!(entry.cached_offset(4), Some(10));
    }

    #[test]
    fn test_cached_offset_history() {
        let mut entry = SeqEntry::new(pid());
        entry.update(4, 10);
        entry.update(9, 25);
        assert_eq!(entry.cached_offset(4), Some(10));
        assert_eq!(entry.cached_offset(9), Some(25));
    }

    #[test]
    fn test_cached_offset_unknown_seq() {
        let mut entry = SeqEntry::new(pid());
        entry.update(4, 10);
        assert!(entry.cached_offset(3).is_none());
        assert!(entry.cached_offset(5).is_none());
    }

    #[test]
    fn test_cached_offset_in_flight_not_reported() {
        let mut entry = SeqEntry::new(pid());
        entry.update(4, -1);
        assert!(entry.cached_offset(4).is_none());
    }

    // ==================== Lock Registry Tests ====================

    #[tokio::test]
    async fn test_same_producer_same_lock() {
        let locks = ProducerLocks::new();
        let a = locks.get(7);
        let b = locks.get(7);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_different_producers_different_locks() {
        let locks = ProducerLocks::new();
        let a = locks.get(7);
        let b = locks.get(8);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_release_only_when_unused() {
        let locks = ProducerLocks::new();
        let held = locks.get(7);
        locks.release(7);
        assert_eq!(locks.len(), 1, "held lock must survive release");
        drop(held);
        locks.release(7);
        assert!(locks.is_empty());
    }
}
