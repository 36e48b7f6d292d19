use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Dotted path relative to the relation node. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(flatten)]
    pub field_type: FieldType,
    /// Name of a lookup table the source value is resolved through before
    /// coercion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<String>,
}

impl FieldSpec {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            source: None,
            field_type,
            lookup: None,
        }
    }

    pub fn with_lookup(mut self, table: &str) -> Self {
        self.lookup = Some(table.to_string());
        self
    }

    pub fn source_path(&self) -> impl Iterator<Item = &str> {
        path_segments(self.source.as_deref().unwrap_or(&self.name))
    }
}

/// Static definition of one target relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Dotted path from the parent node (or the record root) to this relation's
    /// node. The node may be an object, an array of objects or absent.
    #[serde(default)]
    pub path: String,
    pub key_fields: Vec<String>,
    pub fields: Vec<FieldSpec>,
    /// Report present-but-empty collections so callers can tell "cleared" from
    /// "never sent".
    #[serde(default)]
    pub track_cleared: bool,
}

impl RelationSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parent: None,
            path: String::new(),
            key_fields: Vec::new(),
            fields: Vec::new(),
            track_cleared: false,
        }
    }

    pub fn child_of(mut self, parent: &str, path: &str) -> Self {
        self.parent = Some(parent.to_string());
        self.path = path.to_string();
        self
    }

    pub fn at(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn key(mut self, fields: &[&str]) -> Self {
        self.key_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(FieldSpec::new(name, field_type));
        self
    }

    pub fn field_from(mut self, name: &str, source: &str, field_type: FieldType) -> Self {
        self.fields.push(FieldSpec {
            source: Some(source.to_string()),
            ..FieldSpec::new(name, field_type)
        });
        self
    }

    pub fn field_with_lookup(
        mut self,
        name: &str,
        source: &str,
        table: &str,
        field_type: FieldType,
    ) -> Self {
        self.fields.push(FieldSpec {
            source: Some(source.to_string()),
            ..FieldSpec::new(name, field_type).with_lookup(table)
        });
        self
    }

    pub fn track_cleared(mut self) -> Self {
        self.track_cleared = true;
        self
    }

    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        path_segments(&self.path)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Positions of the key fields within `fields`, in key order.
    pub fn key_indices(&self) -> Result<Vec<usize>, CoreError> {
        self.key_fields
            .iter()
            .map(|k| {
                self.field_index(k).ok_or_else(|| {
                    CoreError::InvalidSchema(format!(
                        "key field {k} is not declared on relation {}",
                        self.name
                    ))
                })
            })
            .collect()
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::InvalidSchema("relation name is empty".into()));
        }
        if self.fields.is_empty() {
            return Err(CoreError::InvalidSchema(format!(
                "relation {} declares no fields",
                self.name
            )));
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                return Err(CoreError::InvalidSchema(format!(
                    "relation {} has a field with an empty name",
                    self.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(CoreError::InvalidSchema(format!(
                    "field {} declared twice on relation {}",
                    field.name, self.name
                )));
            }
            if let FieldType::Decimal { scale } = field.field_type {
                if scale < 0 {
                    return Err(CoreError::InvalidSchema(format!(
                        "negative decimal scale on {}.{}",
                        self.name, field.name
                    )));
                }
            }
        }
        self.key_indices()?;
        Ok(())
    }
}

pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Stable topological order of the relation graph: parents first, ties broken
/// by relation name. Fails with `SchemaCycle` when some relation is its own
/// ancestor.
pub fn topological_order(relations: &[RelationSchema]) -> Result<Vec<String>, CoreError> {
    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut ready: BTreeSet<&str> = BTreeSet::new();
    for relation in relations {
        match &relation.parent {
            Some(parent) => children
                .entry(parent.as_str())
                .or_default()
                .push(relation.name.as_str()),
            None => {
                ready.insert(relation.name.as_str());
            }
        }
    }

    let mut order = Vec::with_capacity(relations.len());
    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        if let Some(kids) = children.get(name) {
            ready.extend(kids.iter().copied());
        }
    }

    if order.len() < relations.len() {
        let emitted: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let stuck = relations
            .iter()
            .map(|r| r.name.as_str())
            .filter(|name| !emitted.contains(name))
            .min()
            .unwrap_or_default();
        return Err(CoreError::SchemaCycle {
            relation: stuck.to_string(),
        });
    }
    Ok(order)
}

/// A validated set of relations forming a directed acyclic forest.
#[derive(Debug, Clone)]
pub struct SchemaForest {
    relations: BTreeMap<String, RelationSchema>,
    order: Vec<String>,
    children: BTreeMap<String, Vec<String>>,
}

impl SchemaForest {
    pub fn new(relations: Vec<RelationSchema>) -> Result<Self, CoreError> {
        let mut by_name = BTreeMap::new();
        for relation in &relations {
            relation.validate()?;
            if by_name.insert(relation.name.clone(), relation.clone()).is_some() {
                return Err(CoreError::InvalidSchema(format!(
                    "relation {} declared twice",
                    relation.name
                )));
            }
        }
        for relation in &relations {
            if let Some(parent) = &relation.parent {
                if !by_name.contains_key(parent) {
                    return Err(CoreError::InvalidSchema(format!(
                        "relation {} references unknown parent {parent}",
                        relation.name
                    )));
                }
            }
        }

        let order = topological_order(&relations)?;

        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in &order {
            if let Some(parent) = by_name.get(name).and_then(|r| r.parent.clone()) {
                children.entry(parent).or_default().push(name.clone());
            }
        }

        Ok(Self {
            relations: by_name,
            order,
            children,
        })
    }

    pub fn get(&self, name: &str) -> Result<&RelationSchema, CoreError> {
        self.relations
            .get(name)
            .ok_or_else(|| CoreError::UnknownRelation(name.to_string()))
    }

    /// Relation names, parents before children.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationSchema> {
        self.order.iter().filter_map(|name| self.relations.get(name))
    }

    pub fn roots(&self) -> impl Iterator<Item = &RelationSchema> {
        self.relations().filter(|r| r.parent.is_none())
    }

    pub fn children(&self, name: &str) -> &[String] {
        self.children.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Position of the relation in the topological order.
    pub fn rank(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> RelationSchema {
        RelationSchema::new("orders")
            .key(&["order_id"])
            .field("order_id", FieldType::Text)
            .field("status", FieldType::Text)
    }

    fn lines() -> RelationSchema {
        RelationSchema::new("order_lines")
            .child_of("orders", "lines")
            .key(&["line_id"])
            .field("line_id", FieldType::Integer)
            .field("qty", FieldType::Integer)
    }

    #[test]
    fn parents_precede_children() {
        // declared child-first on purpose
        let forest = SchemaForest::new(vec![lines(), orders()]).unwrap();
        assert_eq!(forest.order(), &["orders".to_string(), "order_lines".to_string()]);
        assert_eq!(forest.children("orders"), &["order_lines".to_string()]);
        assert_eq!(forest.roots().count(), 1);
    }

    #[test]
    fn ties_broken_by_name() {
        let payments = RelationSchema::new("payments")
            .child_of("orders", "payments")
            .key(&["payment_id"])
            .field("payment_id", FieldType::Text);
        let forest = SchemaForest::new(vec![payments, lines(), orders()]).unwrap();
        assert_eq!(forest.order(), &["orders", "order_lines", "payments"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let a = RelationSchema::new("a")
            .child_of("b", "a")
            .field("x", FieldType::Text);
        let b = RelationSchema::new("b")
            .child_of("a", "b")
            .field("y", FieldType::Text);
        let err = SchemaForest::new(vec![a, b]).unwrap_err();
        assert_eq!(
            err,
            CoreError::SchemaCycle {
                relation: "a".into()
            }
        );
    }

    #[test]
    fn self_parent_is_a_cycle() {
        let r = RelationSchema::new("r").child_of("r", "r").field("x", FieldType::Text);
        assert!(matches!(
            topological_order(&[r]),
            Err(CoreError::SchemaCycle { .. })
        ));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let err = SchemaForest::new(vec![lines()]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSchema(_)));
    }

    #[test]
    fn key_field_must_be_declared() {
        let bad = RelationSchema::new("orders")
            .key(&["order_id"])
            .field("status", FieldType::Text);
        assert!(matches!(
            SchemaForest::new(vec![bad]),
            Err(CoreError::InvalidSchema(_))
        ));
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"{
            "name": "order_lines",
            "parent": "orders",
            "path": "shoppingCart.items",
            "key_fields": ["sku"],
            "fields": [
                {"name": "sku", "source": "catRefId", "type": "text"},
                {"name": "unit_price", "source": "unitPrice", "type": "decimal", "scale": 2}
            ]
        }"#;
        let relation: RelationSchema = serde_json::from_str(json).unwrap();
        assert_eq!(relation.path_segments().collect::<Vec<_>>(), vec!["shoppingCart", "items"]);
        assert_eq!(relation.fields[1].field_type, FieldType::Decimal { scale: 2 });
        assert_eq!(relation.fields[0].source_path().collect::<Vec<_>>(), vec!["catRefId"]);
        assert!(!relation.track_cleared);
    }
}
