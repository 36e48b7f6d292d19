use std::collections::BTreeMap;

use ordersync_core::{
    change::ChangeRecord,
    error::CoreError,
    plan::{WriteBatch, WriteOp, WritePlan},
    schema::{RelationSchema, topological_order},
};

/// Orders Insert/Update records into relation batches, parents first.
#[derive(Debug, Clone)]
pub struct Planner {
    /// Relation name to (topological rank, parent relation).
    relations: BTreeMap<String, (usize, Option<String>)>,
    max_batch_size: usize,
}

impl Planner {
    /// Fails with `SchemaCycle` if the parent graph is not acyclic.
    pub fn new(relations: &[RelationSchema], max_batch_size: usize) -> Result<Self, CoreError> {
        let order = topological_order(relations)?;
        let parents: BTreeMap<&str, Option<String>> = relations
            .iter()
            .map(|r| (r.name.as_str(), r.parent.clone()))
            .collect();
        let relations = order
            .into_iter()
            .enumerate()
            .map(|(rank, name)| {
                let parent = parents.get(name.as_str()).cloned().flatten();
                (name, (rank, parent))
            })
            .collect();
        Ok(Self {
            relations,
            max_batch_size: max_batch_size.max(1),
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Unchanged records are skipped. The result depends only on the set of
    /// records, not on their order.
    pub fn plan(&self, changes: &[ChangeRecord]) -> Result<WritePlan, CoreError> {
        let mut grouped: BTreeMap<(usize, &str), Vec<WriteOp>> = BTreeMap::new();
        for change in changes {
            let Some(op) = WriteOp::from_change(change) else {
                continue;
            };
            let (rank, _) = self
                .relations
                .get(change.relation())
                .ok_or_else(|| CoreError::UnknownRelation(change.relation().to_string()))?;
            grouped.entry((*rank, change.relation())).or_default().push(op);
        }

        let mut batches = Vec::new();
        for ((_, relation), mut ops) in grouped {
            ops.sort_by(|a, b| a.key().cmp(b.key()));
            let parent_relation = self.relations.get(relation).and_then(|(_, p)| p.clone());
            for chunk in ops.chunks(self.max_batch_size) {
                batches.push(WriteBatch {
                    relation: relation.to_string(),
                    parent_relation: parent_relation.clone(),
                    ops: chunk.to_vec(),
                });
            }
        }
        Ok(WritePlan { batches })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordersync_core::{
        change::ChangeKind, field_value::FieldType, field_value::FieldValue, key::NaturalKey,
        plan::WriteKind, row::FlatRow,
    };

    fn relations() -> Vec<RelationSchema> {
        vec![
            RelationSchema::new("order_lines")
                .child_of("orders", "lines")
                .key(&["line_id"])
                .field("line_id", FieldType::Integer),
            RelationSchema::new("orders")
                .key(&["order_id"])
                .field("order_id", FieldType::Text),
            RelationSchema::new("customers")
                .key(&["customer_id"])
                .field("customer_id", FieldType::Text),
        ]
    }

    fn change(relation: &str, key: &str, kind: ChangeKind) -> ChangeRecord {
        let row = FlatRow {
            relation: relation.into(),
            key: NaturalKey::new(vec![FieldValue::Text(key.into())]),
            parent_key: None,
            synthetic_key: false,
            fields: vec![],
        };
        ChangeRecord {
            kind,
            fingerprint: row.fingerprint(),
            row,
            diff: vec![],
        }
    }

    #[test]
    fn parents_precede_children_and_ties_break_by_name() {
        let planner = Planner::new(&relations(), 100).unwrap();
        let plan = planner
            .plan(&[
                change("order_lines", "A1-1", ChangeKind::Insert),
                change("orders", "A1", ChangeKind::Insert),
                change("customers", "C1", ChangeKind::Update),
            ])
            .unwrap();
        let order: Vec<&str> = plan.batches.iter().map(|b| b.relation.as_str()).collect();
        assert_eq!(order, vec!["customers", "orders", "order_lines"]);
        assert_eq!(plan.batches[2].parent_relation.as_deref(), Some("orders"));
        assert_eq!(plan.batches[0].ops[0].kind, WriteKind::Update);
    }

    #[test]
    fn unchanged_records_never_reach_the_plan() {
        let planner = Planner::new(&relations(), 100).unwrap();
        let plan = planner.plan(&[change("orders", "A1", ChangeKind::Unchanged)]).unwrap();
        assert!(plan.is_empty());
        assert!(plan.batches.is_empty());
    }

    #[test]
    fn ops_are_sorted_by_key_and_chunked() {
        let planner = Planner::new(&relations(), 2).unwrap();
        let changes: Vec<_> = ["D", "B", "A", "C", "E"]
            .iter()
            .map(|k| change("orders", k, ChangeKind::Insert))
            .collect();
        let plan = planner.plan(&changes).unwrap();
        let sizes: Vec<usize> = plan.batches.iter().map(|b| b.ops.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let keys: Vec<String> = plan.ops().map(|op| op.key().to_string()).collect();
        assert_eq!(keys, vec!["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn input_order_does_not_change_plan_bytes() {
        let planner = Planner::new(&relations(), 100).unwrap();
        let mut changes = vec![
            change("orders", "B", ChangeKind::Insert),
            change("order_lines", "B-1", ChangeKind::Insert),
            change("orders", "A", ChangeKind::Update),
        ];
        let first = planner.plan(&changes).unwrap().to_msgpack().unwrap();
        changes.reverse();
        let second = planner.plan(&changes).unwrap().to_msgpack().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cyclic_relations_are_rejected() {
        let relations = vec![
            RelationSchema::new("a").child_of("b", "x").field("id", FieldType::Integer),
            RelationSchema::new("b").child_of("a", "y").field("id", FieldType::Integer),
        ];
        assert_eq!(
            Planner::new(&relations, 10).unwrap_err(),
            CoreError::SchemaCycle { relation: "a".into() }
        );
    }

    #[test]
    fn unknown_relation_is_an_error() {
        let planner = Planner::new(&relations(), 10).unwrap();
        assert!(matches!(
            planner.plan(&[change("refunds", "R1", ChangeKind::Insert)]),
            Err(CoreError::UnknownRelation(_))
        ));
    }
}
