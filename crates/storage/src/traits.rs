use serde::Serialize;

use ordersync_core::{ids::RunId, key::NaturalKey, plan::WritePlan, row::PriorEntry};

use crate::error::StorageError;
use crate::snapshot::Snapshot;

/// Read access to previously persisted rows. Implementations never see writes
/// from the engine; only an `ExecutionSink` changes what they return.
pub trait PriorStateStore {
    fn lookup(&self, relation: &str, key: &NaturalKey) -> Result<Option<PriorEntry>, StorageError>;

    fn prefetch(&self, relation: &str, keys: &[NaturalKey]) -> Result<Vec<PriorEntry>, StorageError> {
        let mut found = Vec::new();
        for key in keys {
            if let Some(entry) = self.lookup(relation, key)? {
                found.push(entry);
            }
        }
        Ok(found)
    }

    /// Rows of `relation` whose parent key is one of `parent_keys`.
    fn children_of(
        &self,
        relation: &str,
        parent_keys: &[NaturalKey],
    ) -> Result<Vec<PriorEntry>, StorageError>;

    fn scan_relation(&self, relation: &str) -> Result<Vec<PriorEntry>, StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    Applied,
    Failed { error: String },
    /// Not attempted because an earlier batch failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub relation: String,
    pub op_count: usize,
    #[serde(flatten)]
    pub status: BatchStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub batches: Vec<BatchReport>,
}

impl ApplyReport {
    pub fn applied_ops(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.status == BatchStatus::Applied)
            .map(|b| b.op_count)
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchReport> {
        self.batches
            .iter()
            .filter(|b| matches!(b.status, BatchStatus::Failed { .. }))
    }

    pub fn is_complete(&self) -> bool {
        self.batches.iter().all(|b| b.status == BatchStatus::Applied)
    }
}

/// Applies a plan batch by batch, each batch in its own transaction. Batch
/// failures are reported, not retried.
pub trait ExecutionSink {
    fn apply(&mut self, run_id: RunId, plan: &WritePlan) -> Result<ApplyReport, StorageError>;
}

/// Persists normalized rows ahead of plan application, for recovery.
pub trait SnapshotStore {
    fn persist(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;
}
