use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use ordersync_core::{key::NaturalKey, row::FlatRow, row::PriorEntry, schema::SchemaForest};
use ordersync_storage::{PriorStateStore, StorageError};

use crate::config::MissingScope;

/// Immutable view of the persisted rows relevant to one batch. Loaded once
/// before classification and shared read-only by every relation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorState {
    relations: BTreeMap<String, BTreeMap<NaturalKey, PriorEntry>>,
}

impl PriorState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = PriorEntry>) -> Self {
        let mut state = Self::default();
        for entry in entries {
            state.insert(entry);
        }
        state
    }

    fn insert(&mut self, entry: PriorEntry) {
        self.relations
            .entry(entry.row.relation.clone())
            .or_default()
            .insert(entry.row.key.clone(), entry);
    }

    pub fn get(&self, relation: &str, key: &NaturalKey) -> Option<&PriorEntry> {
        self.relations.get(relation)?.get(key)
    }

    /// Entries of `relation` in natural-key order.
    pub fn relation(&self, relation: &str) -> impl Iterator<Item = &PriorEntry> {
        self.relations.get(relation).into_iter().flat_map(|m| m.values())
    }

    pub fn len(&self) -> usize {
        self.relations.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetches what classification of `rows` needs: every row the batch
    /// names, plus the candidates for missing detection under `scope`.
    pub fn load(
        store: &dyn PriorStateStore,
        forest: &SchemaForest,
        rows: &[FlatRow],
        scope: MissingScope,
    ) -> Result<Self, StorageError> {
        let mut keys: BTreeMap<&str, BTreeSet<&NaturalKey>> = BTreeMap::new();
        for row in rows {
            keys.entry(row.relation.as_str()).or_default().insert(&row.key);
        }

        let mut state = Self::default();
        for relation in forest.relations() {
            let name = relation.name.as_str();
            let entries = match scope {
                MissingScope::Full => store.scan_relation(name)?,
                MissingScope::Children => {
                    let wanted: Vec<NaturalKey> = keys
                        .get(name)
                        .map(|k| k.iter().map(|key| (*key).clone()).collect())
                        .unwrap_or_default();
                    let mut entries = if wanted.is_empty() {
                        Vec::new()
                    } else {
                        store.prefetch(name, &wanted)?
                    };
                    let parent_keys: Vec<NaturalKey> = relation
                        .parent
                        .as_deref()
                        .and_then(|parent| keys.get(parent))
                        .map(|k| k.iter().map(|key| (*key).clone()).collect())
                        .unwrap_or_default();
                    if !parent_keys.is_empty() {
                        entries.extend(store.children_of(name, &parent_keys)?);
                    }
                    entries
                }
            };
            debug!(relation = name, entries = entries.len(), "prior state loaded");
            for entry in entries {
                state.insert(entry);
            }
        }
        Ok(state)
    }
}
