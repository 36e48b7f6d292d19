use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("unknown relation: {0}")]
    UnknownRelation(String),

    #[error("schema mismatch on {relation}.{field}: {reason}")]
    SchemaMismatch {
        relation: String,
        field: String,
        reason: String,
    },

    #[error("relation graph has a cycle through {relation}")]
    SchemaCycle { relation: String },

    #[error("nesting depth {depth} exceeds maximum {max_depth} in relation {relation}")]
    DepthExceeded {
        relation: String,
        depth: usize,
        max_depth: usize,
    },
}

impl CoreError {
    pub fn mismatch(relation: &str, field: &str, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            relation: relation.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
