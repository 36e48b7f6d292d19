use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;

/// Business identifier of a row. A child's key is its parent's key followed by
/// its own key field values, so `(order_id, line_id)` identifies an order line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey(Vec<FieldValue>);

impl NaturalKey {
    pub fn new(parts: Vec<FieldValue>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[FieldValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns this key extended with `parts`, as used for child rows.
    pub fn child(&self, parts: impl IntoIterator<Item = FieldValue>) -> Self {
        let mut all = self.0.clone();
        all.extend(parts);
        Self(all)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

impl From<Vec<FieldValue>> for NaturalKey {
    fn from(parts: Vec<FieldValue>) -> Self {
        Self(parts)
    }
}
