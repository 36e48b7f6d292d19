//! Named value tables for fields that store a display value in place of a
//! source identifier, e.g. a shipping city id resolved to the city's name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::normalize::{is_null_like, normalize_field};
use crate::schema::{FieldSpec, RelationSchema};

pub type LookupTable = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LookupTables(BTreeMap<String, LookupTable>);

impl LookupTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a table.
    pub fn insert(&mut self, name: &str, table: LookupTable) {
        self.0.insert(name.to_string(), table);
    }

    pub fn get(&self, name: &str) -> Option<&LookupTable> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fails if some field names a table that is not defined.
    pub fn check<'a>(
        &self,
        relations: impl IntoIterator<Item = &'a RelationSchema>,
    ) -> Result<(), CoreError> {
        for relation in relations {
            for field in &relation.fields {
                if let Some(name) = &field.lookup {
                    if !self.0.contains_key(name) {
                        return Err(CoreError::InvalidSchema(format!(
                            "{}.{} uses undefined lookup table {name}",
                            relation.name, field.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Normalizes `raw`, first replacing it with its table entry when the field
    /// declares a lookup. Identifiers missing from the table become null.
    pub fn normalize(
        &self,
        relation: &str,
        field: &FieldSpec,
        raw: Option<&Value>,
    ) -> Result<FieldValue, CoreError> {
        let Some(name) = &field.lookup else {
            return normalize_field(relation, field, raw);
        };
        let table = self.0.get(name).ok_or_else(|| {
            CoreError::InvalidSchema(format!("lookup table {name} is not defined"))
        })?;

        let id = match raw.filter(|v| !is_null_like(v)) {
            None => return Ok(FieldValue::Null),
            Some(Value::String(s)) => s.trim().to_string(),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
            Some(_) => {
                return Err(CoreError::mismatch(
                    relation,
                    &field.name,
                    format!("lookup {name} needs a scalar identifier"),
                ));
            }
        };
        let mapped = table.get(&id).map(|display| Value::String(display.clone()));
        normalize_field(relation, field, mapped.as_ref())
    }
}
