use serde::{Deserialize, Serialize};

use crate::change::{ChangeKind, ChangeRecord, FieldChange};
use crate::error::CoreError;
use crate::ids::Fingerprint;
use crate::key::NaturalKey;
use crate::row::FlatRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    Insert,
    Update,
}

impl WriteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
        }
    }
}

/// Row-level upsert. Applying it leaves the store holding exactly `row`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOp {
    pub kind: WriteKind,
    pub row: FlatRow,
    pub fingerprint: Fingerprint,
    pub diff: Vec<FieldChange>,
}

impl WriteOp {
    /// `None` for unchanged records, which never reach a plan.
    pub fn from_change(change: &ChangeRecord) -> Option<Self> {
        let kind = match change.kind {
            ChangeKind::Insert => WriteKind::Insert,
            ChangeKind::Update => WriteKind::Update,
            ChangeKind::Unchanged => return None,
        };
        Some(Self {
            kind,
            row: change.row.clone(),
            fingerprint: change.fingerprint,
            diff: change.diff.clone(),
        })
    }

    pub fn key(&self) -> &NaturalKey {
        &self.row.key
    }
}

/// Operations on a single relation, applied in one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub relation: String,
    /// Relation every `row.parent_key` in this batch points into.
    pub parent_relation: Option<String>,
    pub ops: Vec<WriteOp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePlan {
    pub batches: Vec<WriteBatch>,
}

impl WritePlan {
    pub fn op_count(&self) -> usize {
        self.batches.iter().map(|b| b.ops.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|b| b.ops.is_empty())
    }

    /// All operations in application order.
    pub fn ops(&self) -> impl Iterator<Item = &WriteOp> {
        self.batches.iter().flat_map(|b| b.ops.iter())
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
