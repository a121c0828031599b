//! Cluster feature gates consumed by the state machine
//!
//! The broker's feature table activates capabilities once every node in the
//! cluster supports them. The state machine only reads gates; activation is
//! driven from the outside.

use parking_lot::RwLock;
use std::collections::HashSet;

/// Features the resource manager dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Transactions may span coordinator partitions; fence batches carry
    /// the coordinating tm partition (v2 encoding).
    TransactionPartitioning,
}

/// A set of active cluster features
#[derive(Debug, Default)]
pub struct FeatureTable {
    active: RwLock<HashSet<Feature>>,
}

impl FeatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with every known feature active (the common case on a
    /// fully-upgraded cluster)
    pub fn with_all_active() -> Self {
        let table = Self::new();
        table.activate(Feature::TransactionPartitioning);
        table
    }

    pub fn activate(&self, feature: Feature) {
        self.active.write().insert(feature);
    }

    pub fn deactivate(&self, feature: Feature) {
        self.active.write().remove(&feature);
    }

    pub fn is_active(&self, feature: Feature) -> bool {
        self.active.read().contains(&feature)
    }
}
