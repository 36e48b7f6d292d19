//! Flattening of nested source records into per-relation rows.
//!
//! Traversal is driven by the relation forest and uses explicit stacks, so
//! hostile nesting is bounded by `max_depth` rather than by the call stack.

use serde_json::Value;

use ordersync_core::{error::CoreError, schema::RelationSchema, schema::SchemaForest};

/// One matched sub-structure before normalization. `values` line up with the
/// relation's declared fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow<'a> {
    pub relation: &'a str,
    /// Index of the parent row within the same `FlattenOutput`.
    pub parent: Option<usize>,
    /// Position within the parent's collection (or within the record, for roots).
    pub ordinal: usize,
    pub values: Vec<Option<&'a Value>>,
}

/// A tracked collection that was sent present but empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearedCollection {
    pub relation: String,
    pub parent: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlattenOutput<'a> {
    /// Rows in depth-first pre-order: every parent precedes its children.
    pub rows: Vec<RawRow<'a>>,
    pub cleared: Vec<ClearedCollection>,
}

struct Visit<'a> {
    relation: &'a RelationSchema,
    node: &'a Value,
    parent: Option<usize>,
    ordinal: usize,
    depth: usize,
}

pub struct Flattener<'f> {
    forest: &'f SchemaForest,
    max_depth: usize,
}

impl<'f> Flattener<'f> {
    pub fn new(forest: &'f SchemaForest, max_depth: usize) -> Self {
        Self { forest, max_depth }
    }

    pub fn flatten<'a>(&'a self, record: &'a Value) -> Result<FlattenOutput<'a>, CoreError> {
        let mut output = FlattenOutput::default();
        let mut stack: Vec<Visit<'a>> = Vec::new();

        let roots: Vec<&'a RelationSchema> = self.forest.roots().collect();
        self.push_children(&roots, record, None, 0, &mut stack, &mut output)?;

        while let Some(visit) = stack.pop() {
            let index = output.rows.len();
            let values = visit
                .relation
                .fields
                .iter()
                .map(|field| lookup_path(visit.node, field.source_path()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|segment| {
                    CoreError::mismatch(
                        &visit.relation.name,
                        &segment,
                        "field path crosses a non-object value",
                    )
                })?;
            output.rows.push(RawRow {
                relation: &visit.relation.name,
                parent: visit.parent,
                ordinal: visit.ordinal,
                values,
            });

            let children: Vec<&'a RelationSchema> = self
                .forest
                .children(&visit.relation.name)
                .iter()
                .map(|name| self.forest.get(name))
                .collect::<Result<_, _>>()?;
            self.push_children(
                &children,
                visit.node,
                Some(index),
                visit.depth,
                &mut stack,
                &mut output,
            )?;
        }
        Ok(output)
    }

    /// Pushes visits for every instance of `relations` under `node`, so that
    /// popping yields them in declaration and document order.
    fn push_children<'a>(
        &'a self,
        relations: &[&'a RelationSchema],
        node: &'a Value,
        parent: Option<usize>,
        depth: usize,
        stack: &mut Vec<Visit<'a>>,
        output: &mut FlattenOutput<'a>,
    ) -> Result<(), CoreError> {
        let mut pending = Vec::new();
        for &relation in relations {
            let segments = relation.path_segments().count();
            let depth = depth + segments;
            self.check_depth(relation, depth)?;

            let Some(target) = lookup_path(node, relation.path_segments()).map_err(|segment| {
                CoreError::mismatch(&relation.name, &segment, "relation path crosses a non-object value")
            })?
            else {
                continue;
            };

            let instances = self.collect_instances(relation, target, depth)?;
            if instances.is_empty() {
                if let (true, Some(parent), Value::Array(_)) = (relation.track_cleared, parent, target) {
                    output.cleared.push(ClearedCollection {
                        relation: relation.name.clone(),
                        parent,
                    });
                }
                continue;
            }
            for (ordinal, (instance, depth)) in instances.into_iter().enumerate() {
                pending.push(Visit {
                    relation,
                    node: instance,
                    parent,
                    ordinal,
                    depth,
                });
            }
        }
        stack.extend(pending.into_iter().rev());
        Ok(())
    }

    /// Objects reachable from `node` through (possibly nested) arrays, in
    /// document order.
    fn collect_instances<'a>(
        &self,
        relation: &RelationSchema,
        node: &'a Value,
        depth: usize,
    ) -> Result<Vec<(&'a Value, usize)>, CoreError> {
        let mut out = Vec::new();
        let mut pending = vec![(node, depth)];
        while let Some((value, depth)) = pending.pop() {
            self.check_depth(relation, depth)?;
            match value {
                Value::Object(_) => out.push((value, depth)),
                Value::Array(items) => pending.extend(items.iter().rev().map(|item| (item, depth + 1))),
                Value::Null => {}
                _ => {
                    return Err(CoreError::mismatch(
                        &relation.name,
                        &relation.path,
                        "expected an object or an array of objects",
                    ));
                }
            }
        }
        Ok(out)
    }

    fn check_depth(&self, relation: &RelationSchema, depth: usize) -> Result<(), CoreError> {
        if depth > self.max_depth {
            return Err(CoreError::DepthExceeded {
                relation: relation.name.clone(),
                depth,
                max_depth: self.max_depth,
            });
        }
        Ok(())
    }
}

/// Follows `segments` through nested objects. Missing keys and nulls resolve
/// to `None`; any other non-object on the way is an error naming the segment.
fn lookup_path<'a, 's>(
    node: &'a Value,
    segments: impl Iterator<Item = &'s str>,
) -> Result<Option<&'a Value>, String> {
    let mut current = node;
    for segment in segments {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => next,
                None => return Ok(None),
            },
            Value::Null => return Ok(None),
            _ => return Err(segment.to_string()),
        };
    }
    Ok(Some(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordersync_core::field_value::FieldType;
    use serde_json::json;

    fn forest() -> SchemaForest {
        SchemaForest::new(vec![
            RelationSchema::new("orders")
                .key(&["order_id"])
                .field("order_id", FieldType::Text)
                .field_from("ship_city", "shippingAddress.city", FieldType::Text),
            RelationSchema::new("order_lines")
                .child_of("orders", "shoppingCart.items")
                .key(&["sku"])
                .field_from("sku", "catRefId", FieldType::Text)
                .field("quantity", FieldType::Integer)
                .track_cleared(),
            RelationSchema::new("line_discounts")
                .child_of("order_lines", "discounts")
                .field("code", FieldType::Text),
        ])
        .unwrap()
    }

    #[test]
    fn emits_parents_before_children_in_document_order() {
        let forest = forest();
        let flattener = Flattener::new(&forest, 16);
        let record = json!({
            "order_id": "A1",
            "shippingAddress": {"city": "Lima"},
            "shoppingCart": {"items": [
                {"catRefId": "S1", "quantity": 1, "discounts": [{"code": "X"}]},
                {"catRefId": "S2", "quantity": 2}
            ]}
        });
        let out = flattener.flatten(&record).unwrap();
        let shape: Vec<(&str, Option<usize>, usize)> =
            out.rows.iter().map(|r| (r.relation, r.parent, r.ordinal)).collect();
        assert_eq!(
            shape,
            vec![
                ("orders", None, 0),
                ("order_lines", Some(0), 0),
                ("line_discounts", Some(1), 0),
                ("order_lines", Some(0), 1),
            ]
        );
        assert_eq!(out.rows[0].values[1], Some(&json!("Lima")));
        assert_eq!(out.rows[3].values[0], Some(&json!("S2")));
    }

    #[test]
    fn absent_and_empty_collections_yield_no_rows() {
        let forest = forest();
        let flattener = Flattener::new(&forest, 16);

        let absent = json!({"order_id": "A1"});
        let out = flattener.flatten(&absent).unwrap();
        assert_eq!(out.rows.len(), 1);
        assert!(out.cleared.is_empty());
        // missing nested object field is just absent
        assert_eq!(out.rows[0].values[1], None);

        let empty = json!({"order_id": "A1", "shoppingCart": {"items": []}});
        let out = flattener.flatten(&empty).unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(
            out.cleared,
            vec![ClearedCollection {
                relation: "order_lines".into(),
                parent: 0
            }]
        );
    }

    #[test]
    fn nested_arrays_are_flattened_in_order() {
        let forest = forest();
        let flattener = Flattener::new(&forest, 16);
        let record = json!({
            "order_id": "A1",
            "shoppingCart": {"items": [[{"catRefId": "S1"}], [{"catRefId": "S2"}, null]]}
        });
        let out = flattener.flatten(&record).unwrap();
        let skus: Vec<_> = out.rows[1..].iter().map(|r| (r.ordinal, r.values[0])).collect();
        assert_eq!(skus, vec![(0, Some(&json!("S1"))), (1, Some(&json!("S2")))]);
    }

    #[test]
    fn hostile_nesting_hits_depth_guard() {
        let forest = forest();
        let flattener = Flattener::new(&forest, 8);
        let mut items = json!([{"catRefId": "S1"}]);
        for _ in 0..50 {
            items = json!([items]);
        }
        let record = json!({"order_id": "A1", "shoppingCart": {"items": items}});
        match flattener.flatten(&record).unwrap_err() {
            CoreError::DepthExceeded { relation, max_depth, .. } => {
                assert_eq!(relation, "order_lines");
                assert_eq!(max_depth, 8);
            }
            other => panic!("expected DepthExceeded, got {other:?}"),
        }
    }

    #[test]
    fn scalar_in_place_of_collection_is_a_mismatch() {
        let forest = forest();
        let flattener = Flattener::new(&forest, 16);
        let record = json!({"order_id": "A1", "shoppingCart": {"items": "none"}});
        assert!(matches!(
            flattener.flatten(&record),
            Err(CoreError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn root_record_must_be_an_object() {
        let forest = forest();
        let flattener = Flattener::new(&forest, 16);
        assert!(flattener.flatten(&json!("A1")).is_err());
        assert!(flattener.flatten(&json!(null)).unwrap().rows.is_empty());
    }
}
