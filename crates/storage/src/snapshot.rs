use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use ordersync_core::{
    field_value::FieldValue, ids::RunId, key::NaturalKey, row::FlatRow, schema::SchemaForest,
};

use crate::error::StorageError;
use crate::traits::SnapshotStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub key: NaturalKey,
    pub parent_key: Option<NaturalKey>,
    pub synthetic_key: bool,
    pub values: Vec<FieldValue>,
}

/// Rows of one relation; `values` of every row line up with `fields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRows {
    pub relation: String,
    pub fields: Vec<String>,
    pub rows: Vec<SnapshotRow>,
}

/// Normalized rows of one page, captured before the plan is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id: RunId,
    pub region: String,
    pub page: usize,
    pub relations: Vec<RelationRows>,
}

impl Snapshot {
    /// Groups `rows` by relation in topological order, keeping traversal order
    /// within each relation.
    pub fn build(
        run_id: RunId,
        region: &str,
        page: usize,
        forest: &SchemaForest,
        rows: &[FlatRow],
    ) -> Result<Self, StorageError> {
        let mut relations = Vec::new();
        for relation in forest.relations() {
            let fields = relation.field_names();
            let mut out = Vec::new();
            for row in rows.iter().filter(|r| r.relation == relation.name) {
                let names: Vec<&str> = row.fields.iter().map(|(n, _)| n.as_str()).collect();
                if names != fields {
                    return Err(StorageError::Serialization(format!(
                        "row {}/{} does not follow the declared field order",
                        row.relation, row.key
                    )));
                }
                out.push(SnapshotRow {
                    key: row.key.clone(),
                    parent_key: row.parent_key.clone(),
                    synthetic_key: row.synthetic_key,
                    values: row.values().cloned().collect(),
                });
            }
            if !out.is_empty() {
                relations.push(RelationRows {
                    relation: relation.name.clone(),
                    fields,
                    rows: out,
                });
            }
        }
        Ok(Self {
            run_id,
            region: region.to_string(),
            page,
            relations,
        })
    }

    pub fn row_count(&self) -> usize {
        self.relations.iter().map(|r| r.rows.len()).sum()
    }

    pub fn into_rows(self) -> Vec<FlatRow> {
        let mut out = Vec::with_capacity(self.row_count());
        for relation in self.relations {
            for row in relation.rows {
                out.push(FlatRow {
                    relation: relation.relation.clone(),
                    key: row.key,
                    parent_key: row.parent_key,
                    synthetic_key: row.synthetic_key,
                    fields: relation.fields.iter().cloned().zip(row.values).collect(),
                });
            }
        }
        out
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, StorageError> {
        rmp_serde::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, StorageError> {
        rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

/// Writes one msgpack file per page under a backup directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: RunId, page: usize) -> PathBuf {
        self.dir.join(format!("backup_{run_id}_{page:05}.msgpack"))
    }

    pub fn read(path: &Path) -> Result<Snapshot, StorageError> {
        let bytes = fs::read(path)?;
        Snapshot::from_msgpack(&bytes)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn persist(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let path = self.path_for(snapshot.run_id, snapshot.page);
        let tmp = path.with_extension("msgpack.tmp");
        fs::write(&tmp, snapshot.to_msgpack()?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), rows = snapshot.row_count(), "snapshot written");
        Ok(())
    }
}
