use serde::{Deserialize, Serialize};

use crate::field_value::FieldValue;
use crate::ids::Fingerprint;
use crate::key::NaturalKey;
use crate::row::FlatRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Unchanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Unchanged => "unchanged",
        }
    }

    pub fn needs_write(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: FieldValue,
    pub new: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub row: FlatRow,
    pub fingerprint: Fingerprint,
    /// Changed fields; empty unless `kind` is `Update`.
    pub diff: Vec<FieldChange>,
}

impl ChangeRecord {
    pub fn relation(&self) -> &str {
        &self.row.relation
    }

    pub fn key(&self) -> &NaturalKey {
        &self.row.key
    }
}

/// The same natural key appeared more than once in one batch. The last
/// occurrence was kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateKeyWarning {
    pub relation: String,
    pub key: NaturalKey,
    pub occurrences: usize,
    /// Positions (in traversal order) of the dropped occurrences.
    pub superseded: Vec<usize>,
    pub kept: usize,
    /// Positions of rows nested under a superseded occurrence. They are
    /// dropped along with it.
    #[serde(default)]
    pub dropped_descendants: Vec<usize>,
}

/// A previously persisted row that the incoming batch no longer contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingRow {
    pub relation: String,
    pub key: NaturalKey,
    pub parent_key: Option<NaturalKey>,
    /// The parent was sent with this collection present but empty.
    pub explicitly_cleared: bool,
}
