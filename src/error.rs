//! Error types for stablelog
//!
//! Two error layers cross this crate. [`TxError`] is the closed taxonomy
//! exchanged with the transaction coordinator: every coordinator-facing
//! operation (`begin_tx`, `commit_tx`, `abort_tx`, `mark_expired`) resolves
//! to one of its variants. [`StmError`] is the crate-wide error covering
//! the replicate paths, snapshot persistence, and I/O; it embeds `TxError`
//! and maps to Kafka protocol error codes for client responses.
//!
//! Raft and storage failures are converted into these types at the boundary
//! and never surfaced raw.

use thiserror::Error;

/// Result type alias for stablelog operations
pub type Result<T> = std::result::Result<T, StmError>;

/// Kafka protocol error codes relevant to the transactional produce path
/// See: <https://kafka.apache.org/protocol.html#protocol_error_codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum KafkaErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    UnknownServerError = -1,
    /// Not leader for partition
    NotLeaderOrFollower = 6,
    /// Request timed out
    RequestTimedOut = 7,
    /// Broker is shutting down or otherwise unavailable
    BrokerNotAvailable = 8,
    /// Coordinator not available
    CoordinatorNotAvailable = 15,
    /// Not coordinator for the transactional id
    NotCoordinator = 16,
    /// Rebalance in progress
    RebalanceInProgress = 27,
    /// Invalid request
    InvalidRequest = 42,
    /// Out of order sequence number
    OutOfOrderSequenceNumber = 45,
    /// Duplicate sequence number
    DuplicateSequenceNumber = 46,
    /// Invalid producer epoch
    InvalidProducerEpoch = 47,
    /// Invalid transaction state
    InvalidTxnState = 48,
    /// Invalid producer id mapping
    InvalidProducerIdMapping = 49,
    /// Concurrent transactions for the same producer
    ConcurrentTransactions = 51,
    /// Operation not attempted
    OperationNotAttempted = 55,
    /// Kafka storage error
    KafkaStorageError = 56,
    /// Producer fenced by a newer epoch
    ProducerFenced = 90,
    /// Transactional id not found
    TransactionalIdNotFound = 105,
}

impl KafkaErrorCode {
    /// Returns true if a client may transparently retry this error
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            KafkaErrorCode::NotLeaderOrFollower
                | KafkaErrorCode::RequestTimedOut
                | KafkaErrorCode::BrokerNotAvailable
                | KafkaErrorCode::CoordinatorNotAvailable
                | KafkaErrorCode::NotCoordinator
                | KafkaErrorCode::RebalanceInProgress
                | KafkaErrorCode::ConcurrentTransactions
                | KafkaErrorCode::KafkaStorageError
        )
    }

    /// Convert to the i16 error code used in the Kafka protocol
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

/// Closed error taxonomy for coordinator-facing transaction operations.
///
/// Success is expressed as `Ok(..)`; there is no `None` variant.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    #[error("partition leader not found")]
    LeaderNotFound,
    #[error("shard not found")]
    ShardNotFound,
    #[error("partition does not exist")]
    PartitionNotExists,
    #[error("this node is not the coordinator for the partition")]
    NotCoordinator,
    #[error("transaction coordinator is not available")]
    CoordinatorNotAvailable,
    #[error("coordinator is rebalancing")]
    PreparingRebalance,
    #[error("another transaction is in progress for this producer")]
    ConcurrentTransactions,
    #[error("conflicting transactional operation")]
    Conflict,
    #[error("unknown server error")]
    UnknownServerError,
    #[error("request rejected")]
    RequestRejected,
    #[error("invalid producer id mapping")]
    InvalidProducerIdMapping,
    #[error("invalid transaction state")]
    InvalidTxnState,
    #[error("producer fenced by a newer epoch")]
    Fenced,
    #[error("invalid producer epoch")]
    InvalidProducerEpoch,
    #[error("transaction not found")]
    TxNotFound,
    #[error("transactional id not found")]
    TxIdNotFound,
    #[error("partition is disabled")]
    PartitionDisabled,
    #[error("operation timed out")]
    Timeout,
    #[error("partition is shutting down")]
    ShuttingDown,
}

impl TxError {
    /// Convert to the corresponding Kafka protocol error code
    pub fn kafka_error_code(&self) -> KafkaErrorCode {
        match self {
            TxError::LeaderNotFound => KafkaErrorCode::NotLeaderOrFollower,
            TxError::ShardNotFound => KafkaErrorCode::NotCoordinator,
            TxError::PartitionNotExists => KafkaErrorCode::InvalidRequest,
            TxError::NotCoordinator => KafkaErrorCode::NotCoordinator,
            TxError::CoordinatorNotAvailable => KafkaErrorCode::CoordinatorNotAvailable,
            TxError::PreparingRebalance => KafkaErrorCode::RebalanceInProgress,
            TxError::ConcurrentTransactions => KafkaErrorCode::ConcurrentTransactions,
            TxError::Conflict => KafkaErrorCode::InvalidTxnState,
            TxError::UnknownServerError => KafkaErrorCode::UnknownServerError,
            TxError::RequestRejected => KafkaErrorCode::OperationNotAttempted,
            TxError::InvalidProducerIdMapping => KafkaErrorCode::InvalidProducerIdMapping,
            TxError::InvalidTxnState => KafkaErrorCode::InvalidTxnState,
            TxError::Fenced => KafkaErrorCode::ProducerFenced,
            TxError::InvalidProducerEpoch => KafkaErrorCode::InvalidProducerEpoch,
            TxError::TxNotFound => KafkaErrorCode::InvalidTxnState,
            TxError::TxIdNotFound => KafkaErrorCode::TransactionalIdNotFound,
            TxError::PartitionDisabled => KafkaErrorCode::InvalidRequest,
            TxError::Timeout => KafkaErrorCode::RequestTimedOut,
            TxError::ShuttingDown => KafkaErrorCode::BrokerNotAvailable,
        }
    }

    /// Returns true if a client may transparently retry this error
    pub fn is_retriable(&self) -> bool {
        self.kafka_error_code().is_retriable()
    }
}

/// Main error type for stablelog
#[derive(Debug, Error)]
pub enum StmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transaction error: {0}")]
    Tx(#[from] TxError),

    #[error("out of order sequence number: expected {expected}, received {received}")]
    OutOfOrderSequence { expected: i32, received: i32 },

    #[error("invalid producer epoch: current {current}, received {received}")]
    InvalidProducerEpoch { current: i16, received: i16 },

    #[error("not leader for partition")]
    NotLeader,

    #[error("replication failed: {0}")]
    Replication(String),

    #[error("snapshot version {0} is not supported")]
    UnsupportedSnapshotVersion(u8),

    #[error("snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    #[error("abort segment {first}..{last} unavailable: {detail}")]
    AbortSegment {
        first: i64,
        last: i64,
        detail: String,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("partition is shutting down")]
    ShuttingDown,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StmError {
    /// Create a replication error with operation context
    pub fn replication(operation: &str, detail: impl Into<String>) -> Self {
        StmError::Replication(format!("{}: {}", operation, detail.into()))
    }

    /// Create a snapshot corruption error with location context
    pub fn snapshot_corrupted(location: &str, detail: impl Into<String>) -> Self {
        StmError::SnapshotCorrupted(format!("{}: {}", location, detail.into()))
    }

    /// Convert this error to the corresponding Kafka protocol error code
    pub fn kafka_error_code(&self) -> KafkaErrorCode {
        match self {
            StmError::Io(_) => KafkaErrorCode::KafkaStorageError,
            StmError::Tx(e) => e.kafka_error_code(),
            StmError::OutOfOrderSequence { .. } => KafkaErrorCode::OutOfOrderSequenceNumber,
            StmError::InvalidProducerEpoch { .. } => KafkaErrorCode::InvalidProducerEpoch,
            StmError::NotLeader => KafkaErrorCode::NotLeaderOrFollower,
            StmError::Replication(_) => KafkaErrorCode::KafkaStorageError,
            StmError::UnsupportedSnapshotVersion(_) | StmError::SnapshotCorrupted(_) => {
                KafkaErrorCode::KafkaStorageError
            }
            StmError::AbortSegment { .. } => KafkaErrorCode::KafkaStorageError,
            StmError::Timeout => KafkaErrorCode::RequestTimedOut,
            StmError::ShuttingDown => KafkaErrorCode::BrokerNotAvailable,
            StmError::InvalidRequest(_) => KafkaErrorCode::InvalidRequest,
        }
    }

    /// Returns true if a client may transparently retry this error
    pub fn is_retriable(&self) -> bool {
        self.kafka_error_code().is_retriable()
    }
}

impl From<&StmError> for i16 {
    fn from(err: &StmError) -> i16 {
        err.kafka_error_code().as_i16()
    }
}
