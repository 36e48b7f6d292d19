pub mod classify;
pub mod config;
pub mod error;
pub mod flatten;
pub mod normalizer;
pub mod plan;
pub mod prior;
pub mod source;
pub mod summary;

pub use classify::{Classification, Classifier, RelationClassification};
pub use config::{EngineConfig, MissingScope, PipelineConfig};
pub use error::EngineError;
pub use flatten::{FlattenOutput, Flattener};
pub use normalizer::{ClearedParent, NormalizedRecord, RecordPosition, normalize_record};
pub use plan::Planner;
pub use prior::PriorState;
pub use source::{RecordSource, SourceError, VecSource};
pub use summary::{BatchOutcome, RecordFailure, RunContext, RunSummary, SinkApplyFailure};

use serde_json::Value;
use tracing::{debug, info, warn};

use ordersync_core::{
    lookup::LookupTables,
    plan::WritePlan,
    row::FlatRow,
    schema::{RelationSchema, SchemaForest},
};
use ordersync_storage::{ExecutionSink, PriorStateStore, Snapshot, SnapshotStore};

/// Rows of one page that survived flattening and normalization.
#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    pub page: usize,
    pub records: usize,
    pub rows: Vec<FlatRow>,
    /// Position of each row's parent within `rows`.
    pub parents: Vec<Option<usize>>,
    pub cleared: Vec<ClearedParent>,
    pub failures: Vec<RecordFailure>,
}

/// Change-detection pipeline over a fixed relation forest.
///
/// Holds only immutable schema and configuration, so one engine can serve
/// any number of sequential or concurrent batches.
#[derive(Debug, Clone)]
pub struct Engine {
    forest: SchemaForest,
    planner: Planner,
    config: EngineConfig,
    lookups: LookupTables,
}

impl Engine {
    pub fn new(relations: Vec<RelationSchema>, config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_lookups(relations, config, LookupTables::new())
    }

    /// Every table a field names must be present in `lookups`.
    pub fn with_lookups(
        relations: Vec<RelationSchema>,
        config: EngineConfig,
        lookups: LookupTables,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let forest = SchemaForest::new(relations.clone())?;
        let planner = Planner::new(&relations, config.max_batch_size)?;
        lookups.check(&relations)?;
        Ok(Self {
            forest,
            planner,
            config,
            lookups,
        })
    }

    pub fn from_config(pipeline: PipelineConfig) -> Result<Self, EngineError> {
        Self::with_lookups(pipeline.relations, pipeline.engine, pipeline.lookups)
    }

    pub fn forest(&self) -> &SchemaForest {
        &self.forest
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Pipeline stages
    // ========================================================================

    /// Flattens and normalizes every record of a page. A record that fails
    /// either step contributes no rows and is reported instead.
    pub fn prepare(&self, page: usize, records: &[Value]) -> PreparedBatch {
        let flattener = Flattener::new(&self.forest, self.config.max_depth);
        let mut batch = PreparedBatch {
            page,
            records: records.len(),
            ..PreparedBatch::default()
        };

        for (record_index, record) in records.iter().enumerate() {
            let position = RecordPosition {
                page,
                index: record_index,
            };
            let normalized = flattener.flatten(record).and_then(|flat| {
                normalize_record(&self.forest, &self.lookups, &flat, position)
            });
            match normalized {
                Ok(record) => {
                    let offset = batch.rows.len();
                    batch
                        .parents
                        .extend(record.parents.iter().map(|p| p.map(|i| i + offset)));
                    batch.rows.extend(record.rows);
                    batch.cleared.extend(record.cleared);
                }
                Err(error) => {
                    warn!(page, record = record_index, %error, "record dropped");
                    batch.failures.push(RecordFailure {
                        page,
                        record_index,
                        error,
                    });
                }
            }
        }
        batch
    }

    pub fn load_prior(
        &self,
        store: &dyn PriorStateStore,
        rows: &[FlatRow],
    ) -> Result<PriorState, EngineError> {
        Ok(PriorState::load(store, &self.forest, rows, self.config.missing_scope)?)
    }

    pub fn classify(&self, batch: &PreparedBatch, prior: &PriorState) -> Classification {
        Classifier::new(&self.forest, self.config.missing_scope)
            .parallel(self.config.parallel_classification)
            .classify(&batch.rows, &batch.parents, &batch.cleared, prior)
    }

    pub fn plan(&self, classification: &Classification) -> Result<WritePlan, EngineError> {
        Ok(self.planner.plan(&classification.writes())?)
    }

    /// Runs every stage for one page without writing anything.
    pub fn process_batch(
        &self,
        page: usize,
        records: &[Value],
        store: &dyn PriorStateStore,
    ) -> Result<BatchOutcome, EngineError> {
        let batch = self.prepare(page, records);
        let prior = self.load_prior(store, &batch.rows)?;
        let classification = self.classify(&batch, &prior);
        let plan = self.plan(&classification)?;
        debug!(
            page,
            rows = batch.rows.len(),
            prior = prior.len(),
            ops = plan.op_count(),
            "batch classified"
        );
        Ok(BatchOutcome {
            page,
            records: batch.records,
            rows: batch.rows,
            cleared: batch.cleared,
            classification,
            plan,
            failures: batch.failures,
        })
    }

    // ========================================================================
    // Run driver
    // ========================================================================

    /// Pulls pages until the source is exhausted, snapshotting and applying
    /// each page before fetching the next. A source error aborts the run;
    /// pages already applied stay applied.
    pub fn run<S>(
        &self,
        ctx: &RunContext,
        source: &mut dyn RecordSource,
        store: &mut S,
        snapshots: Option<&mut dyn SnapshotStore>,
    ) -> Result<RunSummary, EngineError>
    where
        S: PriorStateStore + ExecutionSink,
    {
        self.run_with(ctx, source, store, snapshots, |_| {})
    }

    /// Like `run`, handing every processed page to `on_page` once it has
    /// been applied.
    pub fn run_with<S, F>(
        &self,
        ctx: &RunContext,
        source: &mut dyn RecordSource,
        store: &mut S,
        mut snapshots: Option<&mut dyn SnapshotStore>,
        mut on_page: F,
    ) -> Result<RunSummary, EngineError>
    where
        S: PriorStateStore + ExecutionSink,
        F: FnMut(&BatchOutcome),
    {
        let mut summary = RunSummary::new(ctx);
        let mut page = 0;
        info!(run_id = %ctx.run_id, region = %ctx.region, "run started");

        while let Some(records) = source.next_page()? {
            let outcome = self.process_batch(page, &records, &*store)?;

            if let Some(snapshots) = snapshots.as_deref_mut() {
                let snapshot =
                    Snapshot::build(ctx.run_id, &ctx.region, page, &self.forest, &outcome.rows)?;
                snapshots.persist(&snapshot)?;
            }

            let report = if outcome.plan.is_empty() {
                None
            } else {
                Some(store.apply(ctx.run_id, &outcome.plan)?)
            };
            summary.absorb(&outcome, report.as_ref());

            info!(
                page,
                records = outcome.records,
                failed = outcome.failures.len(),
                ops = outcome.plan.op_count(),
                applied = report.as_ref().map_or(0, |r| r.applied_ops()),
                "page processed"
            );
            on_page(&outcome);
            page += 1;
        }

        info!(
            run_id = %ctx.run_id,
            pages = summary.pages,
            inserts = summary.inserts,
            updates = summary.updates,
            missing = summary.missing.len(),
            "run finished"
        );
        Ok(summary)
    }
}
