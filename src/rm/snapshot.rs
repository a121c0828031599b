//! Local state machine snapshots and abort segment files
//!
//! The local snapshot captures the durable view at an applied offset so a
//! restarting replica replays only the log suffix. Snapshot versions 3 and
//! 4 are readable, version 4 is always written; support for versions 0-2
//! was dropped and those files are refused at load. Aborted-range chunks
//! that outgrow memory are offloaded to abort segment files, each
//! content-addressed by its `(first, last)` offset envelope.
//!
//! All multi-byte integers are big-endian; collection counts and the body
//! length framing use unsigned LEB128 varints so records stay
//! forward-compatible.

use super::expiration::ExpirationSnapshot;
use super::producer::{SeqCacheEntry, SeqEntry};
use crate::error::{Result, StmError};
use crate::model::{
    get_uvarint, put_uvarint, AbortIndex, LogOffset, PrepareMarker, ProducerIdentity, TxRange,
    TxSeq,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Oldest readable snapshot version
pub const SNAPSHOT_VERSION_V3: u8 = 3;
/// Current snapshot version, always used for writes
pub const SNAPSHOT_VERSION_V4: u8 = 4;

/// File name of the local snapshot inside the partition data dir
pub const LOCAL_SNAPSHOT_FILE: &str = "tx.snapshot";

/// Declared-transaction metadata as persisted in v4 snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDataSnapshot {
    pub pid: ProducerIdentity,
    pub tx_seq: TxSeq,
    pub tm_partition: i32,
}

/// Serialized form of the durable state at a chosen offset
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxSnapshot {
    pub fenced: Vec<ProducerIdentity>,
    pub ongoing: Vec<TxRange>,
    pub prepared: Vec<PrepareMarker>,
    pub aborted: Vec<TxRange>,
    pub abort_indexes: Vec<AbortIndex>,
    /// Applied offset this snapshot corresponds to
    pub offset: LogOffset,
    pub seqs: Vec<SeqEntry>,
    pub tx_data: Vec<TxDataSnapshot>,
    pub expiration: Vec<ExpirationSnapshot>,
}

fn put_pid(buf: &mut BytesMut, pid: ProducerIdentity) {
    buf.put_i64(pid.id);
    buf.put_i16(pid.epoch);
}

fn get_pid(buf: &mut Bytes) -> Result<ProducerIdentity> {
    if buf.remaining() < 10 {
        return Err(StmError::snapshot_corrupted("pid", "truncated"));
    }
    Ok(ProducerIdentity::new(buf.get_i64(), buf.get_i16()))
}

fn get_count(buf: &mut Bytes, what: &str) -> Result<usize> {
    let count = get_uvarint(buf)?;
    usize::try_from(count)
        .map_err(|_| StmError::snapshot_corrupted(what, format!("count {} too large", count)))
}

fn need(buf: &Bytes, bytes: usize, what: &str) -> Result<()> {
    if buf.remaining() < bytes {
        return Err(StmError::snapshot_corrupted(what, "truncated"));
    }
    Ok(())
}

impl TxSnapshot {
    /// Encode at the current snapshot version
    pub fn encode(&self) -> Bytes {
        self.encode_versioned(SNAPSHOT_VERSION_V4)
            .unwrap_or_default()
    }

    /// Encode at a specific readable version. Version 3 drops the tm
    /// partition from the transaction metadata.
    pub fn encode_versioned(&self, version: u8) -> Result<Bytes> {
        if version != SNAPSHOT_VERSION_V3 && version != SNAPSHOT_VERSION_V4 {
            return Err(StmError::UnsupportedSnapshotVersion(version));
        }
        let mut body = BytesMut::new();

        put_uvarint(&mut body, self.fenced.len() as u64);
        for pid in &self.fenced {
            put_pid(&mut body, *pid);
        }

        put_uvarint(&mut body, self.ongoing.len() as u64);
        for range in &self.ongoing {
            put_pid(&mut body, range.pid);
            body.put_i64(range.first);
            body.put_i64(range.last);
        }

        put_uvarint(&mut body, self.prepared.len() as u64);
        for marker in &self.prepared {
            put_pid(&mut body, marker.pid);
            body.put_i32(marker.tm_partition);
            body.put_i64(marker.tx_seq);
        }

        put_uvarint(&mut body, self.aborted.len() as u64);
        for range in &self.aborted {
            put_pid(&mut body, range.pid);
            body.put_i64(range.first);
            body.put_i64(range.last);
        }

        put_uvarint(&mut body, self.abort_indexes.len() as u64);
        for idx in &self.abort_indexes {
            body.put_i64(idx.first);
            body.put_i64(idx.last);
        }

        put_uvarint(&mut body, self.seqs.len() as u64);
        for seq in &self.seqs {
            put_pid(&mut body, seq.pid);
            body.put_i32(seq.seq);
            body.put_i64(seq.last_offset);
            body.put_i64(seq.last_write_timestamp);
            put_uvarint(&mut body, seq.seq_cache.len() as u64);
            for cached in &seq.seq_cache {
                body.put_i32(cached.seq);
                body.put_i64(cached.offset);
            }
        }

        put_uvarint(&mut body, self.tx_data.len() as u64);
        for tx in &self.tx_data {
            put_pid(&mut body, tx.pid);
            body.put_i64(tx.tx_seq);
            if version == SNAPSHOT_VERSION_V4 {
                body.put_i32(tx.tm_partition);
            }
        }

        put_uvarint(&mut body, self.expiration.len() as u64);
        for exp in &self.expiration {
            put_pid(&mut body, exp.pid);
            body.put_i64(exp.timeout_ms);
        }

        let mut out = BytesMut::with_capacity(body.len() + 16);
        out.put_u8(version);
        out.put_u32(body.len() as u32);
        out.put_i64(self.offset);
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    /// Decode a snapshot, refusing versions 0-2 and anything newer than 4
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        need(&buf, 13, "header")?;
        let version = buf.get_u8();
        if version != SNAPSHOT_VERSION_V3 && version != SNAPSHOT_VERSION_V4 {
            return Err(StmError::UnsupportedSnapshotVersion(version));
        }
        let size = buf.get_u32() as usize;
        let offset = buf.get_i64();
        need(&buf, size, "body")?;

        let mut snapshot = TxSnapshot {
            offset,
            ..Default::default()
        };

        let count = get_count(&mut buf, "fenced")?;
        for _ in 0..count {
            snapshot.fenced.push(get_pid(&mut buf)?);
        }

        let count = get_count(&mut buf, "ongoing")?;
        for _ in 0..count {
            let pid = get_pid(&mut buf)?;
            need(&buf, 16, "ongoing")?;
            snapshot
                .ongoing
                .push(TxRange::new(pid, buf.get_i64(), buf.get_i64()));
        }

        let count = get_count(&mut buf, "prepared")?;
        for _ in 0..count {
            let pid = get_pid(&mut buf)?;
            need(&buf, 12, "prepared")?;
            snapshot.prepared.push(PrepareMarker {
                pid,
                tm_partition: buf.get_i32(),
                tx_seq: buf.get_i64(),
            });
        }

        let count = get_count(&mut buf, "aborted")?;
        for _ in 0..count {
            let pid = get_pid(&mut buf)?;
            need(&buf, 16, "aborted")?;
            snapshot
                .aborted
                .push(TxRange::new(pid, buf.get_i64(), buf.get_i64()));
        }

        let count = get_count(&mut buf, "abort_indexes")?;
        for _ in 0..count {
            need(&buf, 16, "abort_indexes")?;
            snapshot.abort_indexes.push(AbortIndex {
                first: buf.get_i64(),
                last: buf.get_i64(),
            });
        }

        let count = get_count(&mut buf, "seqs")?;
        for _ in 0..count {
            let pid = get_pid(&mut buf)?;
            need(&buf, 20, "seqs")?;
            let seq = buf.get_i32();
            let last_offset = buf.get_i64();
            let last_write_timestamp = buf.get_i64();
            let cache_len = get_count(&mut buf, "seq_cache")?;
            let mut seq_cache = VecDeque::with_capacity(cache_len);
            for _ in 0..cache_len {
                need(&buf, 12, "seq_cache")?;
                seq_cache.push_back(SeqCacheEntry {
                    seq: buf.get_i32(),
                    offset: buf.get_i64(),
                });
            }
            snapshot.seqs.push(SeqEntry {
                pid,
                seq,
                last_offset,
                seq_cache,
                last_write_timestamp,
            });
        }

        let count = get_count(&mut buf, "tx_data")?;
        for _ in 0..count {
            let pid = get_pid(&mut buf)?;
            need(&buf, 8, "tx_data")?;
            let tx_seq = buf.get_i64();
            let tm_partition = if version == SNAPSHOT_VERSION_V4 {
                need(&buf, 4, "tx_data")?;
                buf.get_i32()
            } else {
                0
            };
            snapshot.tx_data.push(TxDataSnapshot {
                pid,
                tx_seq,
                tm_partition,
            });
        }

        let count = get_count(&mut buf, "expiration")?;
        for _ in 0..count {
            let pid = get_pid(&mut buf)?;
            need(&buf, 8, "expiration")?;
            snapshot.expiration.push(ExpirationSnapshot {
                pid,
                timeout_ms: buf.get_i64(),
            });
        }

        Ok(snapshot)
    }
}

/// An offloaded chunk of aborted ranges with its offset envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortSegment {
    pub first: LogOffset,
    pub last: LogOffset,
    pub aborted: Vec<TxRange>,
}

impl AbortSegment {
    /// Build a segment from a chunk, deriving the envelope
    pub fn from_ranges(aborted: Vec<TxRange>) -> Self {
        let first = aborted.iter().map(|r| r.first).min().unwrap_or(-1);
        let last = aborted.iter().map(|r| r.last).max().unwrap_or(-1);
        Self {
            first,
            last,
            aborted,
        }
    }

    /// Whether this segment is the one named by `idx`
    pub fn matches(&self, idx: AbortIndex) -> bool {
        self.first == idx.first && self.last == idx.last
    }

    pub fn index(&self) -> AbortIndex {
        AbortIndex {
            first: self.first,
            last: self.last,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20 + self.aborted.len() * 26);
        buf.put_i64(self.first);
        buf.put_i64(self.last);
        buf.put_u32(self.aborted.len() as u32);
        for range in &self.aborted {
            buf.put_i64(range.pid.id);
            buf.put_i16(range.pid.epoch);
            buf.put_i64(range.first);
            buf.put_i64(range.last);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        need(&buf, 20, "abort segment header")?;
        let first = buf.get_i64();
        let last = buf.get_i64();
        let count = buf.get_u32() as usize;
        let mut aborted = Vec::with_capacity(count);
        for _ in 0..count {
            need(&buf, 26, "abort segment range")?;
            let pid = ProducerIdentity::new(buf.get_i64(), buf.get_i16());
            aborted.push(TxRange::new(pid, buf.get_i64(), buf.get_i64()));
        }
        Ok(Self {
            first,
            last,
            aborted,
        })
    }
}

/// Filesystem store for the local snapshot and abort segment files
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn local_path(&self) -> PathBuf {
        self.dir.join(LOCAL_SNAPSHOT_FILE)
    }

    fn segment_path(&self, idx: AbortIndex) -> PathBuf {
        self.dir
            .join(format!("abort.snapshot.{}_{}", idx.first, idx.last))
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Load the local snapshot, `None` when the partition has never
    /// snapshotted. Decode failures propagate: a replica must not open on
    /// top of a snapshot it cannot trust.
    pub async fn load_local(&self) -> Result<Option<TxSnapshot>> {
        match fs::read(self.local_path()).await {
            Ok(data) => {
                let snapshot = TxSnapshot::decode(Bytes::from(data))?;
                debug!(offset = snapshot.offset, "loaded local snapshot");
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the local snapshot atomically (write-then-rename)
    pub async fn save_local(&self, snapshot: &TxSnapshot) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", LOCAL_SNAPSHOT_FILE));
        fs::write(&tmp, snapshot.encode()).await?;
        fs::rename(&tmp, self.local_path()).await?;
        info!(offset = snapshot.offset, "saved local snapshot");
        Ok(())
    }

    /// Size of the local snapshot file in bytes, 0 when absent
    pub async fn local_size(&self) -> u64 {
        match fs::metadata(self.local_path()).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    }

    pub async fn save_abort_segment(&self, segment: &AbortSegment) -> Result<()> {
        let path = self.segment_path(segment.index());
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, segment.encode()).await?;
        fs::rename(&tmp, &path).await?;
        debug!(
            first = segment.first,
            last = segment.last,
            ranges = segment.aborted.len(),
            "saved abort segment"
        );
        Ok(())
    }

    /// Load an abort segment by its envelope. Failures here are
    /// recoverable: the caller reports them and may retry.
    pub async fn load_abort_segment(&self, idx: AbortIndex) -> Result<AbortSegment> {
        let data = fs::read(self.segment_path(idx))
            .await
            .map_err(|e| StmError::AbortSegment {
                first: idx.first,
                last: idx.last,
                detail: e.to_string(),
            })?;
        AbortSegment::decode(Bytes::from(data)).map_err(|e| StmError::AbortSegment {
            first: idx.first,
            last: idx.last,
            detail: e.to_string(),
        })
    }

    /// Delete the local snapshot and every abort segment
    pub async fn remove_all(&self) -> Result<()> {
        match fs::remove_file(self.local_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("abort.snapshot.") {
                    fs::remove_file(entry.path()).await?;
                }
            }
        }
        info!("removed persistent state");
        Ok(())
    }
}
