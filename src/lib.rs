#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # stablelog
//!
//! Per-partition resource manager state machine for a Kafka-compatible log
//! broker. For each partition the state machine:
//!
//! - tracks open transactions and their offset ranges
//! - fences out stale producer epochs
//! - enforces per-producer sequence monotonicity and deduplicates retries
//! - maintains the Last Stable Offset bounding read-committed consumers
//! - records aborted transaction ranges for consumer-side filtering
//! - auto-expires transactions whose owners vanished
//!
//! The subsystem is replicated: every replica runs an identical state
//! machine fed by the partition's raft log. Consensus, offset translation,
//! the transaction coordinator, and feature gates are consumed through
//! traits, so the crate embeds into a broker or runs self-contained on the
//! in-process [`raft::DirectRaft`].
//!
//! ## Example
//!
//! ```no_run
//! use stablelog::config::RmConfig;
//! use stablelog::coordinator::LoopbackCoordinator;
//! use stablelog::features::FeatureTable;
//! use stablelog::model::{BatchIdentity, ProducerIdentity, RecordBatch};
//! use stablelog::raft::{DirectRaft, ReplicateOptions};
//! use stablelog::rm::RmStm;
//! use stablelog::translator::FixedDeltaTranslator;
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> stablelog::Result<()> {
//!     let raft = DirectRaft::new(0);
//!     let coordinator = LoopbackCoordinator::new();
//!     let stm = RmStm::new(
//!         "orders",
//!         0,
//!         RmConfig::default(),
//!         raft,
//!         Arc::new(FixedDeltaTranslator::identity()),
//!         coordinator.clone(),
//!         Arc::new(FeatureTable::with_all_active()),
//!     )?;
//!     coordinator.bind(&stm);
//!     stm.start().await?;
//!
//!     let pid = ProducerIdentity::new(1000, 0);
//!     let bid = BatchIdentity::new(pid, 0, 4, false);
//!     let batch = RecordBatch::data(bid, Bytes::from_static(b"records"));
//!     let result = stm.replicate(batch, ReplicateOptions::default()).await?;
//!     println!("appended at offset {}", result.base_offset);
//!
//!     stm.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod features;
pub mod metrics;
pub mod model;
pub mod raft;
pub mod rm;
pub mod translator;

pub use config::RmConfig;
pub use error::{KafkaErrorCode, Result, StmError, TxError};
pub use model::{
    AbortIndex, BatchIdentity, KafkaOffset, LogOffset, ProducerEpoch, ProducerId,
    ProducerIdentity, TxRange, TxSeq,
};
pub use rm::{KafkaResult, KafkaStages, RmStm, TransactionInfo, TxStatus};
