use serde::{Deserialize, Serialize};

use ordersync_core::{lookup::LookupTables, schema::RelationSchema};

use crate::error::EngineError;

/// Which prior rows count as missing when a batch does not contain them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingScope {
    /// Root rows are never reported; child rows only when their parent was
    /// sent in the batch.
    #[default]
    Children,
    /// Every prior row of every relation not present in the batch.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_depth: usize,
    pub max_batch_size: usize,
    pub missing_scope: MissingScope,
    pub parallel_classification: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_batch_size: 1000,
            missing_scope: MissingScope::Children,
            parallel_classification: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_batch_size == 0 {
            return Err(EngineError::InvalidConfig("max_batch_size must be at least 1".into()));
        }
        if self.max_depth == 0 {
            return Err(EngineError::InvalidConfig("max_depth must be at least 1".into()));
        }
        Ok(())
    }
}

/// Engine settings plus the relation forest, as loaded from a pipeline file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub relations: Vec<RelationSchema>,
    /// Tables named by fields' `lookup`, each mapping source id to value.
    #[serde(default, skip_serializing_if = "LookupTables::is_empty")]
    pub lookups: LookupTables,
}

impl PipelineConfig {
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }
}
