//! Change classification against the prior-state snapshot.
//!
//! Each relation is classified independently, so relations can run on scoped
//! threads. Output is always assembled in topological order.

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use serde::Serialize;
use tracing::warn;

use ordersync_core::{
    change::{ChangeKind, ChangeRecord, DuplicateKeyWarning, FieldChange, MissingRow},
    field_value::FieldValue,
    key::NaturalKey,
    row::FlatRow,
    schema::{RelationSchema, SchemaForest},
};

use crate::config::MissingScope;
use crate::normalizer::ClearedParent;
use crate::prior::PriorState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelationClassification {
    pub relation: String,
    /// One record per distinct key, in traversal order of the kept occurrence.
    pub changes: Vec<ChangeRecord>,
    pub duplicates: Vec<DuplicateKeyWarning>,
    pub missing: Vec<MissingRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub relations: Vec<RelationClassification>,
}

impl Classification {
    pub fn changes(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.relations.iter().flat_map(|r| r.changes.iter())
    }

    pub fn duplicates(&self) -> impl Iterator<Item = &DuplicateKeyWarning> {
        self.relations.iter().flat_map(|r| r.duplicates.iter())
    }

    pub fn missing(&self) -> impl Iterator<Item = &MissingRow> {
        self.relations.iter().flat_map(|r| r.missing.iter())
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes().filter(|c| c.kind == kind).count()
    }

    /// Insert and Update records only.
    pub fn writes(&self) -> Vec<ChangeRecord> {
        self.changes().filter(|c| c.kind.needs_write()).cloned().collect()
    }
}

/// Inputs shared by every relation of one batch.
struct BatchView<'a> {
    /// Surviving row positions in traversal order, per relation.
    positions: BTreeMap<&'a str, Vec<usize>>,
    duplicates: BTreeMap<&'a str, Vec<DuplicateKeyWarning>>,
    rows: &'a [FlatRow],
    cleared: BTreeSet<(&'a str, &'a NaturalKey)>,
    prior: &'a PriorState,
    scope: MissingScope,
}

pub struct Classifier<'f> {
    forest: &'f SchemaForest,
    scope: MissingScope,
    parallel: bool,
}

impl<'f> Classifier<'f> {
    pub fn new(forest: &'f SchemaForest, scope: MissingScope) -> Self {
        Self {
            forest,
            scope,
            parallel: false,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// `parents[i]` is the position of row `i`'s parent row within `rows`.
    /// Rows past the end of `parents` are treated as unlinked.
    pub fn classify(
        &self,
        rows: &[FlatRow],
        parents: &[Option<usize>],
        cleared: &[ClearedParent],
        prior: &PriorState,
    ) -> Classification {
        let relations: Vec<&RelationSchema> = self.forest.relations().collect();
        let (positions, duplicates) = resolve_duplicates(&relations, rows, parents);
        let view = BatchView {
            positions,
            duplicates,
            rows,
            cleared: cleared
                .iter()
                .map(|c| (c.relation.as_str(), &c.parent_key))
                .collect(),
            prior,
            scope: self.scope,
        };

        let classified: Vec<RelationClassification> = if self.parallel && relations.len() > 1 {
            thread::scope(|s| {
                let handles: Vec<_> = relations
                    .iter()
                    .map(|relation| {
                        let view = &view;
                        s.spawn(move || classify_relation(relation, view))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| match h.join() {
                        Ok(result) => result,
                        Err(panic) => std::panic::resume_unwind(panic),
                    })
                    .collect()
            })
        } else {
            relations.iter().map(|relation| classify_relation(relation, &view)).collect()
        };

        Classification {
            relations: classified,
        }
    }
}

/// Later occurrences of a key win. Relations are visited parents first, so a
/// superseded occurrence takes every row nested under it down with it.
///
/// Returns the surviving positions and the warnings, per relation.
fn resolve_duplicates<'a>(
    relations: &[&'a RelationSchema],
    rows: &'a [FlatRow],
    parents: &[Option<usize>],
) -> (
    BTreeMap<&'a str, Vec<usize>>,
    BTreeMap<&'a str, Vec<DuplicateKeyWarning>>,
) {
    let mut positions: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, row) in rows.iter().enumerate() {
        positions.entry(row.relation.as_str()).or_default().push(i);
    }

    // index into `warnings` of the duplicate that dropped each row
    let mut dropped_by: Vec<Option<usize>> = vec![None; rows.len()];
    let mut warnings: Vec<(&'a str, DuplicateKeyWarning)> = Vec::new();
    let mut kept: BTreeMap<&'a str, Vec<usize>> = BTreeMap::new();

    for relation in relations {
        let name = relation.name.as_str();
        let mut by_key: BTreeMap<&NaturalKey, Vec<usize>> = BTreeMap::new();
        for &i in positions.get(name).map(Vec::as_slice).unwrap_or(&[]) {
            let parent = parents.get(i).copied().flatten();
            match parent.and_then(|p| dropped_by.get(p).copied().flatten()) {
                Some(w) => {
                    dropped_by[i] = Some(w);
                    warnings[w].1.dropped_descendants.push(i);
                }
                None => by_key.entry(&rows[i].key).or_default().push(i),
            }
        }

        let mut survivors = Vec::with_capacity(by_key.len());
        for (key, occurrences) in by_key {
            let Some((&last, earlier)) = occurrences.split_last() else {
                continue;
            };
            survivors.push(last);
            if earlier.is_empty() {
                continue;
            }
            warn!(
                relation = name,
                key = %key,
                occurrences = occurrences.len(),
                "duplicate natural key in batch, keeping last occurrence"
            );
            for &i in earlier {
                dropped_by[i] = Some(warnings.len());
            }
            warnings.push((
                name,
                DuplicateKeyWarning {
                    relation: name.to_string(),
                    key: key.clone(),
                    occurrences: occurrences.len(),
                    superseded: earlier.to_vec(),
                    kept: last,
                    dropped_descendants: Vec::new(),
                },
            ));
        }
        survivors.sort_unstable();
        kept.insert(name, survivors);
    }

    let mut duplicates: BTreeMap<&'a str, Vec<DuplicateKeyWarning>> = BTreeMap::new();
    for (name, warning) in warnings {
        duplicates.entry(name).or_default().push(warning);
    }
    (kept, duplicates)
}

fn classify_relation(relation: &RelationSchema, view: &BatchView<'_>) -> RelationClassification {
    let name = relation.name.as_str();
    let positions = view.positions.get(name).map(Vec::as_slice).unwrap_or(&[]);

    let changes = positions
        .iter()
        .map(|&i| classify_row(&view.rows[i], view.prior))
        .collect();

    let present: BTreeSet<&NaturalKey> = positions.iter().map(|&i| &view.rows[i].key).collect();
    let missing = find_missing(relation, &present, view);

    RelationClassification {
        relation: name.to_string(),
        changes,
        duplicates: view.duplicates.get(name).cloned().unwrap_or_default(),
        missing,
    }
}

fn classify_row(row: &FlatRow, prior: &PriorState) -> ChangeRecord {
    let fingerprint = row.fingerprint();
    let (kind, diff) = match prior.get(&row.relation, &row.key) {
        None => (ChangeKind::Insert, Vec::new()),
        Some(entry) if entry.fingerprint == fingerprint => (ChangeKind::Unchanged, Vec::new()),
        Some(entry) => (ChangeKind::Update, diff_fields(&entry.row, row)),
    };
    ChangeRecord {
        kind,
        row: row.clone(),
        fingerprint,
        diff,
    }
}

/// Fields of `new` whose value differs from `old`. Fields the old row lacks
/// compare as null.
fn diff_fields(old: &FlatRow, new: &FlatRow) -> Vec<FieldChange> {
    new.fields
        .iter()
        .filter_map(|(field, value)| {
            let before = old.get(field).cloned().unwrap_or(FieldValue::Null);
            (before != *value).then(|| FieldChange {
                field: field.clone(),
                old: before,
                new: value.clone(),
            })
        })
        .collect()
}

fn find_missing(
    relation: &RelationSchema,
    present: &BTreeSet<&NaturalKey>,
    view: &BatchView<'_>,
) -> Vec<MissingRow> {
    let parent_keys: Option<BTreeSet<&NaturalKey>> = match (view.scope, relation.parent.as_deref()) {
        (MissingScope::Full, _) => None,
        (MissingScope::Children, None) => return Vec::new(),
        (MissingScope::Children, Some(parent)) => Some(
            view.positions
                .get(parent)
                .into_iter()
                .flatten()
                .map(|&i| &view.rows[i].key)
                .collect(),
        ),
    };

    view.prior
        .relation(&relation.name)
        .filter(|entry| !present.contains(&entry.row.key))
        .filter(|entry| match (&parent_keys, &entry.row.parent_key) {
            (None, _) => true,
            (Some(keys), Some(parent)) => keys.contains(parent),
            (Some(_), None) => false,
        })
        .map(|entry| MissingRow {
            relation: relation.name.clone(),
            key: entry.row.key.clone(),
            parent_key: entry.row.parent_key.clone(),
            explicitly_cleared: entry
                .row
                .parent_key
                .as_ref()
                .is_some_and(|p| view.cleared.contains(&(relation.name.as_str(), p))),
        })
        .collect()
}
