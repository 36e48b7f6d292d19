use ordersync_core::CoreError;
use ordersync_storage::StorageError;
use thiserror::Error;

use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
