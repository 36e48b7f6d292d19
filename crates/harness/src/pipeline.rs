use serde_json::Value;

use ordersync_core::schema::RelationSchema;
use ordersync_engine::{
    BatchOutcome, Engine, EngineConfig, EngineError, RunContext, RunSummary, VecSource,
};
use ordersync_storage::{ApplyReport, ExecutionSink, SqliteStore, StorageError};

use crate::fixtures::order_relations;

/// An engine wired to an in-memory store, for driving batches by hand.
pub struct TestPipeline {
    pub engine: Engine,
    pub store: SqliteStore,
    pub ctx: RunContext,
}

impl TestPipeline {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_relations(order_relations(), config)
    }

    pub fn with_relations(
        relations: Vec<RelationSchema>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        Self::with_engine(Engine::new(relations, config)?)
    }

    pub fn with_engine(engine: Engine) -> Result<Self, EngineError> {
        Ok(Self {
            engine,
            store: SqliteStore::open_in_memory()?,
            ctx: RunContext::new("default"),
        })
    }

    /// Classifies and plans one page against the current store contents.
    pub fn process(&self, records: &[Value]) -> Result<BatchOutcome, EngineError> {
        self.engine.process_batch(0, records, &self.store)
    }

    pub fn apply(&mut self, outcome: &BatchOutcome) -> Result<ApplyReport, StorageError> {
        self.store.apply(self.ctx.run_id, &outcome.plan)
    }

    /// Processes and applies one page.
    pub fn sync(&mut self, records: &[Value]) -> Result<BatchOutcome, Box<dyn std::error::Error>> {
        let outcome = self.process(records)?;
        let report = self.apply(&outcome)?;
        if !report.is_complete() {
            return Err(format!("plan only partly applied: {report:?}").into());
        }
        Ok(outcome)
    }

    /// Runs the full driver over in-memory pages.
    pub fn run_pages(&mut self, pages: Vec<Vec<Value>>) -> Result<RunSummary, EngineError> {
        let mut source = VecSource::new(pages);
        self.engine.run(&self.ctx, &mut source, &mut self.store, None)
    }
}
