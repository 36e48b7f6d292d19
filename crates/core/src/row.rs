use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::ids::Fingerprint;
use crate::key::NaturalKey;

/// One normalized row of a target relation. `fields` follow the relation's
/// declared field order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatRow {
    pub relation: String,
    pub key: NaturalKey,
    pub parent_key: Option<NaturalKey>,
    pub synthetic_key: bool,
    pub fields: Vec<(String, FieldValue)>,
}

impl FlatRow {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn values(&self) -> impl Iterator<Item = &FieldValue> {
        self.fields.iter().map(|(_, value)| value)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&(self.relation.len() as u64).to_be_bytes());
        buf.extend_from_slice(self.relation.as_bytes());
        for (name, value) in &self.fields {
            buf.extend_from_slice(&(name.len() as u64).to_be_bytes());
            buf.extend_from_slice(name.as_bytes());
            value.write_canonical(&mut buf);
        }
        hasher.update(&buf);
        Fingerprint::from_bytes(*hasher.finalize().as_bytes())
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Last-known persisted content of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorEntry {
    pub row: FlatRow,
    pub fingerprint: Fingerprint,
}

impl PriorEntry {
    pub fn new(row: FlatRow) -> Self {
        let fingerprint = row.fingerprint();
        Self { row, fingerprint }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(status: &str) -> FlatRow {
        FlatRow {
            relation: "orders".into(),
            key: NaturalKey::new(vec![FieldValue::Text("A1".into())]),
            parent_key: None,
            synthetic_key: false,
            fields: vec![
                ("order_id".into(), FieldValue::Text("A1".into())),
                ("status".into(), FieldValue::Text(status.into())),
            ],
        }
    }

    #[test]
    fn fingerprint_tracks_content() {
        assert_eq!(order("NEW").fingerprint(), order("NEW").fingerprint());
        assert_ne!(order("NEW").fingerprint(), order("SHIPPED").fingerprint());
    }

    #[test]
    fn fingerprint_includes_relation_name() {
        let mut other = order("NEW");
        other.relation = "archived_orders".into();
        assert_ne!(order("NEW").fingerprint(), other.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_key_metadata() {
        let mut synthetic = order("NEW");
        synthetic.synthetic_key = true;
        assert_eq!(order("NEW").fingerprint(), synthetic.fingerprint());
    }

    #[test]
    fn lookup_by_field_name() {
        let row = order("NEW");
        assert_eq!(row.get("status"), Some(&FieldValue::Text("NEW".into())));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn prior_entry_carries_fingerprint() {
        let entry = PriorEntry::new(order("NEW"));
        assert_eq!(entry.fingerprint, order("NEW").fingerprint());
        let bytes = entry.row.to_msgpack().unwrap();
        assert_eq!(FlatRow::from_msgpack(&bytes).unwrap(), entry.row);
    }
}
