use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use ordersync_core::{
    change::{ChangeKind, DuplicateKeyWarning, MissingRow},
    error::CoreError,
    ids::RunId,
    key::NaturalKey,
    plan::WritePlan,
    row::FlatRow,
};
use ordersync_storage::{ApplyReport, BatchStatus};

use crate::classify::Classification;
use crate::normalizer::ClearedParent;

/// A raw record whose rows were all dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub page: usize,
    pub record_index: usize,
    pub error: CoreError,
}

/// A plan batch the sink rejected. Passed through, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkApplyFailure {
    pub page: usize,
    pub batch_index: usize,
    pub relation: String,
    pub op_count: usize,
    pub error: String,
}

/// Everything derived from one page before anything is written.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub page: usize,
    pub records: usize,
    pub rows: Vec<FlatRow>,
    pub cleared: Vec<ClearedParent>,
    pub classification: Classification,
    pub plan: WritePlan,
    pub failures: Vec<RecordFailure>,
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub region: String,
}

impl RunContext {
    pub fn new(region: &str) -> Self {
        Self {
            run_id: RunId::new(),
            region: region.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub region: String,
    pub pages: usize,
    pub records: usize,
    pub rows: usize,
    pub inserts: usize,
    pub updates: usize,
    pub unchanged: usize,
    pub planned_ops: usize,
    pub applied_ops: usize,
    pub skipped_batches: usize,
    pub record_failures: Vec<RecordFailure>,
    pub duplicates: Vec<DuplicateKeyWarning>,
    /// Prior rows no page of the run sent, each listed once.
    pub missing: Vec<MissingRow>,
    pub sink_failures: Vec<SinkApplyFailure>,
    /// Keys sent by any page so far, per relation.
    #[serde(skip)]
    sent: BTreeMap<String, BTreeSet<NaturalKey>>,
}

impl RunSummary {
    pub fn new(ctx: &RunContext) -> Self {
        Self {
            run_id: ctx.run_id,
            region: ctx.region.clone(),
            pages: 0,
            records: 0,
            rows: 0,
            inserts: 0,
            updates: 0,
            unchanged: 0,
            planned_ops: 0,
            applied_ops: 0,
            skipped_batches: 0,
            record_failures: Vec::new(),
            duplicates: Vec::new(),
            missing: Vec::new(),
            sink_failures: Vec::new(),
            sent: BTreeMap::new(),
        }
    }

    /// Folds one processed page in. `report` is `None` when nothing was
    /// applied (dry runs, empty plans).
    pub fn absorb(&mut self, outcome: &BatchOutcome, report: Option<&ApplyReport>) {
        let classification = &outcome.classification;
        self.pages += 1;
        self.records += outcome.records;
        self.rows += outcome.rows.len();
        self.inserts += classification.count(ChangeKind::Insert);
        self.updates += classification.count(ChangeKind::Update);
        self.unchanged += classification.count(ChangeKind::Unchanged);
        self.planned_ops += outcome.plan.op_count();
        self.record_failures.extend(outcome.failures.iter().cloned());
        self.duplicates.extend(classification.duplicates().cloned());
        self.absorb_missing(outcome);

        let Some(report) = report else {
            return;
        };
        self.applied_ops += report.applied_ops();
        for batch in &report.batches {
            match &batch.status {
                BatchStatus::Applied => {}
                BatchStatus::Skipped => self.skipped_batches += 1,
                BatchStatus::Failed { error } => self.sink_failures.push(SinkApplyFailure {
                    page: outcome.page,
                    batch_index: batch.index,
                    relation: batch.relation.clone(),
                    op_count: batch.op_count,
                    error: error.clone(),
                }),
            }
        }
    }

    /// A row reported missing by one page may arrive on a later one, and with
    /// `MissingScope::Full` every page reports the same unsent rows again.
    fn absorb_missing(&mut self, outcome: &BatchOutcome) {
        for row in &outcome.rows {
            self.sent
                .entry(row.relation.clone())
                .or_default()
                .insert(row.key.clone());
        }
        let sent = &self.sent;
        let was_sent = |m: &MissingRow| sent.get(&m.relation).is_some_and(|keys| keys.contains(&m.key));

        self.missing.retain(|m| !was_sent(m));
        let mut listed: BTreeSet<(&str, &NaturalKey)> = self
            .missing
            .iter()
            .map(|m| (m.relation.as_str(), &m.key))
            .collect();
        let mut fresh = Vec::new();
        for row in outcome.classification.missing() {
            if !was_sent(row) && listed.insert((row.relation.as_str(), &row.key)) {
                fresh.push(row.clone());
            }
        }
        self.missing.extend(fresh);
    }

    /// Every planned operation was applied and every record was usable.
    pub fn is_clean(&self) -> bool {
        self.record_failures.is_empty()
            && self.sink_failures.is_empty()
            && self.skipped_batches == 0
            && self.applied_ops == self.planned_ops
    }
}
