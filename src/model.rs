//! Core data model for the partition resource manager
//!
//! Producer identities, transaction ranges, batch identities, and the wire
//! codecs for the control batches the state machine replicates through the
//! partition log: fence batches (versions 0/1/2), prepare markers, and
//! commit/abort control records. Version determines which optional fields
//! are present on the wire.

use crate::error::{Result, StmError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Producer ID type (matches Kafka's long type)
pub type ProducerId = i64;

/// Producer epoch type (matches Kafka's short type)
pub type ProducerEpoch = i16;

/// Transaction sequence number, assigned by the coordinator per session
pub type TxSeq = i64;

/// Offset in the partition's raft log
pub type LogOffset = i64;

/// Offset in the client-visible (translated) offset space
pub type KafkaOffset = i64;

/// A producer session identity.
///
/// Two identities with equal `id` but different `epoch` belong to the same
/// logical producer across restarts; the higher epoch fences the lower.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ProducerIdentity {
    pub id: ProducerId,
    pub epoch: ProducerEpoch,
}

impl ProducerIdentity {
    pub fn new(id: ProducerId, epoch: ProducerEpoch) -> Self {
        Self { id, epoch }
    }
}

impl std::fmt::Display for ProducerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.id, self.epoch)
    }
}

/// The offset envelope of one transaction's data batches in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRange {
    pub pid: ProducerIdentity,
    pub first: LogOffset,
    pub last: LogOffset,
}

impl TxRange {
    pub fn new(pid: ProducerIdentity, first: LogOffset, last: LogOffset) -> Self {
        Self { pid, first, last }
    }

    /// Whether `[first, last]` intersects the query window `[from, to]`
    pub fn overlaps(&self, from: LogOffset, to: LogOffset) -> bool {
        self.first <= to && self.last >= from
    }
}

/// Offset envelope naming an abort segment file offloaded to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortIndex {
    pub first: LogOffset,
    pub last: LogOffset,
}

/// Identity of a produced record batch as seen by the admission path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchIdentity {
    pub pid: ProducerIdentity,
    pub first_seq: i32,
    pub last_seq: i32,
    pub record_count: i32,
    pub is_transactional: bool,
}

impl BatchIdentity {
    /// Identity for an idempotent (possibly transactional) data batch
    pub fn new(
        pid: ProducerIdentity,
        first_seq: i32,
        last_seq: i32,
        is_transactional: bool,
    ) -> Self {
        Self {
            pid,
            first_seq,
            last_seq,
            record_count: last_seq - first_seq + 1,
            is_transactional,
        }
    }

    /// True when the producer carries a valid id and sequence tracking applies
    pub fn is_idempotent(&self) -> bool {
        self.pid.id >= 0
    }
}

/// Kind of a replicated record batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchType {
    /// User data (idempotent and/or transactional)
    Data,
    /// Transaction fence batch (begin / epoch bump)
    TxFence,
    /// Legacy prepare marker
    TxPrepare,
    /// Commit or abort control record
    Control,
}

/// Transaction control record types carried by [`BatchType::Control`]
/// batches. Values follow the Kafka control record key schema: 0 = abort,
/// 1 = commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRecordType {
    TxAbort,
    TxCommit,
    Unknown,
}

/// Fence control record versions; the version gates which optional fields
/// are present in the payload.
pub const FENCE_VERSION_V0: u8 = 0;
pub const FENCE_VERSION_V1: u8 = 1;
pub const FENCE_VERSION_V2: u8 = 2;

/// Prepare marker payload version
pub const PREPARE_VERSION: u8 = 0;

/// A record batch as replicated through the partition log.
///
/// User payload is opaque to the state machine; fence/prepare/control
/// batches carry their marker encoded in `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub batch_type: BatchType,
    pub identity: BatchIdentity,
    pub payload: Bytes,
}

impl RecordBatch {
    /// A user data batch for the given identity
    pub fn data(identity: BatchIdentity, payload: Bytes) -> Self {
        Self {
            batch_type: BatchType::Data,
            identity,
            payload,
        }
    }

    /// A commit or abort control batch for `pid`
    pub fn control(pid: ProducerIdentity, record_type: ControlRecordType) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_i16(0); // control record key version
        buf.put_i16(match record_type {
            ControlRecordType::TxAbort => 0,
            ControlRecordType::TxCommit => 1,
            ControlRecordType::Unknown => -1,
        });
        Self {
            batch_type: BatchType::Control,
            identity: BatchIdentity {
                pid,
                first_seq: -1,
                last_seq: -1,
                record_count: 1,
                is_transactional: true,
            },
            payload: buf.freeze(),
        }
    }

    pub fn pid(&self) -> ProducerIdentity {
        self.identity.pid
    }
}

/// Parse the control record type out of a [`BatchType::Control`] batch.
///
/// Unknown types are reported as [`ControlRecordType::Unknown`] rather than
/// an error so that newer marker kinds pass through old replicas.
pub fn parse_control_batch(batch: &RecordBatch) -> Result<ControlRecordType> {
    let mut buf = batch.payload.clone();
    if buf.remaining() < 4 {
        return Err(StmError::InvalidRequest(
            "control record payload too short".to_string(),
        ));
    }
    let _version = buf.get_i16();
    Ok(match buf.get_i16() {
        0 => ControlRecordType::TxAbort,
        1 => ControlRecordType::TxCommit,
        _ => ControlRecordType::Unknown,
    })
}

/// Decoded fence batch contents; optional fields depend on the version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceBatchData {
    pub pid: ProducerIdentity,
    pub tx_seq: Option<TxSeq>,
    pub tx_timeout_ms: Option<i64>,
    pub tm_partition: Option<i32>,
}

/// Build a v0 fence batch: epoch bump only, no transaction metadata
pub fn make_fence_batch_v0(pid: ProducerIdentity) -> RecordBatch {
    let mut buf = BytesMut::with_capacity(1);
    buf.put_u8(FENCE_VERSION_V0);
    fence_batch(pid, buf.freeze())
}

/// Build a v1 fence batch carrying the transaction sequence and timeout
pub fn make_fence_batch_v1(pid: ProducerIdentity, tx_seq: TxSeq, tx_timeout_ms: i64) -> RecordBatch {
    let mut buf = BytesMut::with_capacity(17);
    buf.put_u8(FENCE_VERSION_V1);
    buf.put_i64(tx_seq);
    buf.put_i64(tx_timeout_ms);
    fence_batch(pid, buf.freeze())
}

/// Build a v2 fence batch, adding the coordinating tm partition
pub fn make_fence_batch_v2(
    pid: ProducerIdentity,
    tx_seq: TxSeq,
    tx_timeout_ms: i64,
    tm_partition: i32,
) -> RecordBatch {
    let mut buf = BytesMut::with_capacity(21);
    buf.put_u8(FENCE_VERSION_V2);
    buf.put_i64(tx_seq);
    buf.put_i64(tx_timeout_ms);
    buf.put_i32(tm_partition);
    fence_batch(pid, buf.freeze())
}

fn fence_batch(pid: ProducerIdentity, payload: Bytes) -> RecordBatch {
    RecordBatch {
        batch_type: BatchType::TxFence,
        identity: BatchIdentity {
            pid,
            first_seq: -1,
            last_seq: -1,
            record_count: 1,
            is_transactional: true,
        },
        payload,
    }
}

/// Decode a fence batch, dispatching on the version byte
pub fn read_fence_batch(batch: &RecordBatch) -> Result<FenceBatchData> {
    let mut buf = batch.payload.clone();
    if buf.remaining() < 1 {
        return Err(StmError::InvalidRequest(
            "fence batch payload too short".to_string(),
        ));
    }
    let version = buf.get_u8();
    let pid = batch.pid();
    match version {
        FENCE_VERSION_V0 => Ok(FenceBatchData {
            pid,
            tx_seq: None,
            tx_timeout_ms: None,
            tm_partition: None,
        }),
        FENCE_VERSION_V1 => {
            if buf.remaining() < 16 {
                return Err(StmError::InvalidRequest(
                    "fence v1 payload too short".to_string(),
                ));
            }
            Ok(FenceBatchData {
                pid,
                tx_seq: Some(buf.get_i64()),
                tx_timeout_ms: Some(buf.get_i64()),
                tm_partition: None,
            })
        }
        FENCE_VERSION_V2 => {
            if buf.remaining() < 20 {
                return Err(StmError::InvalidRequest(
                    "fence v2 payload too short".to_string(),
                ));
            }
            Ok(FenceBatchData {
                pid,
                tx_seq: Some(buf.get_i64()),
                tx_timeout_ms: Some(buf.get_i64()),
                tm_partition: Some(buf.get_i32()),
            })
        }
        v => Err(StmError::InvalidRequest(format!(
            "unknown fence batch version {}",
            v
        ))),
    }
}

/// Legacy prepare marker, recorded between commit intent and commit marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareMarker {
    /// Partition of the transaction coordinator responsible for this tx
    pub tm_partition: i32,
    pub tx_seq: TxSeq,
    pub pid: ProducerIdentity,
}

/// Build a prepare marker batch
pub fn make_prepare_batch(marker: PrepareMarker) -> RecordBatch {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_u8(PREPARE_VERSION);
    buf.put_i32(marker.tm_partition);
    buf.put_i64(marker.tx_seq);
    RecordBatch {
        batch_type: BatchType::TxPrepare,
        identity: BatchIdentity {
            pid: marker.pid,
            first_seq: -1,
            last_seq: -1,
            record_count: 1,
            is_transactional: true,
        },
        payload: buf.freeze(),
    }
}

/// Decode a prepare marker batch
pub fn read_prepare_batch(batch: &RecordBatch) -> Result<PrepareMarker> {
    let mut buf = batch.payload.clone();
    if buf.remaining() < 13 {
        return Err(StmError::InvalidRequest(
            "prepare marker payload too short".to_string(),
        ));
    }
    let version = buf.get_u8();
    if version != PREPARE_VERSION {
        return Err(StmError::InvalidRequest(format!(
            "unknown prepare marker version {}",
            version
        )));
    }
    Ok(PrepareMarker {
        tm_partition: buf.get_i32(),
        tx_seq: buf.get_i64(),
        pid: batch.pid(),
    })
}

/// Append an unsigned LEB128 varint
pub(crate) fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read an unsigned LEB128 varint
pub(crate) fn get_uvarint(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(StmError::snapshot_corrupted("uvarint", "truncated"));
        }
        if shift > 63 {
            return Err(StmError::snapshot_corrupted("uvarint", "overflow"));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: i64, epoch: i16) -> ProducerIdentity {
        ProducerIdentity::new(id, epoch)
    }

    // ==================== Identity Tests ====================

    #[test]
    fn test_producer_identity_ordering() {
        assert!(pid(7, 0) < pid(7, 1));
        assert!(pid(7, 5) < pid(8, 0));
    }

    #[test]
    fn test_producer_identity_display() {
        assert_eq!(pid(42, 3).to_string(), "42.3");
    }

    #[test]
    fn test_batch_identity_record_count() {
        let bid = BatchIdentity::new(pid(1, 0), 0, 4, false);
        assert_eq!(bid.record_count, 5);
        assert!(bid.is_idempotent());
    }

    #[test]
    fn test_batch_identity_non_idempotent() {
        let bid = BatchIdentity::new(pid(-1, 0), -1, -1, false);
        assert!(!bid.is_idempotent());
    }

    // ==================== Range Tests ====================

    #[test]
    fn test_tx_range_overlap() {
        let r = TxRange::new(pid(1, 0), 150, 180);
        assert!(r.overlaps(0, 1000));
        assert!(r.overlaps(180, 200));
        assert!(r.overlaps(100, 150));
        assert!(!r.overlaps(181, 200));
        assert!(!r.overlaps(0, 149));
    }

    // ==================== Fence Batch Tests ====================

    #[test]
    fn test_fence_v0_roundtrip() {
        let batch = make_fence_batch_v0(pid(7, 2));
        assert_eq!(batch.batch_type, BatchType::TxFence);
        let data = read_fence_batch(&batch).unwrap();
        assert_eq!(data.pid, pid(7, 2));
        assert_eq!(data.tx_seq, None);
        assert_eq!(data.tx_timeout_ms, None);
        assert_eq!(data.tm_partition, None);
    }

    #[test]
    fn test_fence_v1_roundtrip() {
        let batch = make_fence_batch_v1(pid(7, 0), 11, 30_000);
        let data = read_fence_batch(&batch).unwrap();
        assert_eq!(data.pid, pid(7, 0));
        assert_eq!(data.tx_seq, Some(11));
        assert_eq!(data.tx_timeout_ms, Some(30_000));
        assert_eq!(data.tm_partition, None);
    }

    #[test]
    fn test_fence_v2_roundtrip() {
        let batch = make_fence_batch_v2(pid(9, 1), 4, 60_000, 3);
        let data = read_fence_batch(&batch).unwrap();
        assert_eq!(data.pid, pid(9, 1));
        assert_eq!(data.tx_seq, Some(4));
        assert_eq!(data.tx_timeout_ms, Some(60_000));
        assert_eq!(data.tm_partition, Some(3));
    }

    #[test]
    fn test_fence_unknown_version_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        let batch = RecordBatch {
            batch_type: BatchType::TxFence,
            identity: BatchIdentity {
                pid: pid(1, 0),
                first_seq: -1,
                last_seq: -1,
                record_count: 1,
                is_transactional: true,
            },
            payload: buf.freeze(),
        };
        assert!(read_fence_batch(&batch).is_err());
    }

    #[test]
    fn test_fence_truncated_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FENCE_VERSION_V2);
        buf.put_i64(1);
        let batch = RecordBatch {
            batch_type: BatchType::TxFence,
            identity: BatchIdentity {
                pid: pid(1, 0),
                first_seq: -1,
                last_seq: -1,
                record_count: 1,
                is_transactional: true,
            },
            payload: buf.freeze(),
        };
        assert!(read_fence_batch(&batch).is_err());
    }

    // ==================== Control Batch Tests ====================

    #[test]
    fn test_control_commit_roundtrip() {
        let batch = RecordBatch::control(pid(5, 0), ControlRecordType::TxCommit);
        assert_eq!(
            parse_control_batch(&batch).unwrap(),
            ControlRecordType::TxCommit
        );
    }

    #[test]
    fn test_control_abort_roundtrip() {
        let batch = RecordBatch::control(pid(5, 0), ControlRecordType::TxAbort);
        assert_eq!(
            parse_control_batch(&batch).unwrap(),
            ControlRecordType::TxAbort
        );
    }

    #[test]
    fn test_control_unknown_type_passes_through() {
        let mut buf = BytesMut::new();
        buf.put_i16(0);
        buf.put_i16(7);
        let batch = RecordBatch {
            batch_type: BatchType::Control,
            identity: BatchIdentity {
                pid: pid(5, 0),
                first_seq: -1,
                last_seq: -1,
                record_count: 1,
                is_transactional: true,
            },
            payload: buf.freeze(),
        };
        assert_eq!(
            parse_control_batch(&batch).unwrap(),
            ControlRecordType::Unknown
        );
    }

    // ==================== Prepare Marker Tests ====================

    #[test]
    fn test_prepare_roundtrip() {
        let marker = PrepareMarker {
            tm_partition: 2,
            tx_seq: 8,
            pid: pid(3, 1),
        };
        let batch = make_prepare_batch(marker);
        assert_eq!(read_prepare_batch(&batch).unwrap(), marker);
    }

    // ==================== Varint Tests ====================

    #[test]
    fn test_uvarint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = BytesMut::new();
            put_uvarint(&mut buf, value);
            let mut frozen = buf.freeze();
            assert_eq!(get_uvarint(&mut frozen).unwrap(), value);
            assert!(!frozen.has_remaining());
        }
    }

    #[test]
    fn test_uvarint_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x80);
        let mut frozen = buf.freeze();
        assert!(get_uvarint(&mut frozen).is_err());
    }
}
