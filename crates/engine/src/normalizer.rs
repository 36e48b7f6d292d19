use tracing::warn;

use ordersync_core::{
    error::CoreError,
    field_value::FieldValue,
    key::NaturalKey,
    lookup::LookupTables,
    row::FlatRow,
    schema::SchemaForest,
};

use crate::flatten::FlattenOutput;

/// A parent whose tracked child collection arrived present but empty.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ClearedParent {
    pub relation: String,
    pub parent_key: NaturalKey,
}

/// Where a record sits in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub page: usize,
    pub index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub rows: Vec<FlatRow>,
    /// Index of each row's parent within `rows`.
    pub parents: Vec<Option<usize>>,
    pub cleared: Vec<ClearedParent>,
}

/// Normalizes every raw row of one record and assigns natural keys.
///
/// Rows without a usable declared key fall back to a synthetic key built from
/// `FieldValue::Ordinal` parts: the parent's key plus the row's ordinal, or
/// `[page, record, ordinal]` for roots. Such rows carry `synthetic_key = true`.
/// Any coercion failure fails the whole record, since its children could not
/// be linked.
pub fn normalize_record(
    forest: &SchemaForest,
    lookups: &LookupTables,
    flat: &FlattenOutput<'_>,
    position: RecordPosition,
) -> Result<NormalizedRecord, CoreError> {
    let mut rows: Vec<FlatRow> = Vec::with_capacity(flat.rows.len());

    for raw in &flat.rows {
        let schema = forest.get(raw.relation)?;
        let mut fields = Vec::with_capacity(schema.fields.len());
        for (spec, value) in schema.fields.iter().zip(&raw.values) {
            fields.push((spec.name.clone(), lookups.normalize(&schema.name, spec, *value)?));
        }

        let parent_key = match raw.parent {
            Some(index) => Some(
                rows.get(index)
                    .map(|parent| parent.key.clone())
                    .ok_or_else(|| {
                        CoreError::InvalidData(format!(
                            "row of {} references parent {index} that was not emitted first",
                            schema.name
                        ))
                    })?,
            ),
            None => None,
        };

        let declared: Vec<FieldValue> = schema
            .key_indices()?
            .into_iter()
            .map(|i| fields[i].1.clone())
            .collect();
        let usable = !declared.is_empty() && declared.iter().all(|v| !v.is_null());

        let (own_parts, synthetic_key) = if usable {
            (declared, false)
        } else {
            if !schema.key_fields.is_empty() {
                warn!(
                    relation = %schema.name,
                    page = position.page,
                    record = position.index,
                    ordinal = raw.ordinal,
                    "key fields missing, using positional key"
                );
            }
            let ordinal = FieldValue::Ordinal(raw.ordinal as u64);
            let parts = match parent_key {
                Some(_) => vec![ordinal],
                None => vec![
                    FieldValue::Ordinal(position.page as u64),
                    FieldValue::Ordinal(position.index as u64),
                    ordinal,
                ],
            };
            (parts, true)
        };

        let key = match &parent_key {
            Some(parent) => parent.child(own_parts),
            None => NaturalKey::new(own_parts),
        };

        rows.push(FlatRow {
            relation: schema.name.clone(),
            key,
            parent_key,
            synthetic_key,
            fields,
        });
    }

    let cleared = flat
        .cleared
        .iter()
        .filter_map(|c| {
            rows.get(c.parent).map(|parent| ClearedParent {
                relation: c.relation.clone(),
                parent_key: parent.key.clone(),
            })
        })
        .collect();

    Ok(NormalizedRecord {
        rows,
        parents: flat.rows.iter().map(|raw| raw.parent).collect(),
        cleared,
    })
}
