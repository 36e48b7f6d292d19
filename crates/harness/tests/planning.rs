use std::collections::BTreeSet;

use ordersync_core::{key::NaturalKey, plan::WritePlan};
use ordersync_engine::{EngineConfig, RunSummary};
use ordersync_harness::{TestPipeline, order};
use ordersync_storage::{BatchStatus, ExecutionSink, PriorStateStore};

fn busy_page() -> Vec<serde_json::Value> {
    vec![
        order("C3", "NEW", &[(2, 1), (1, 1)]),
        order("A1", "NEW", &[(1, 5), (3, 2), (2, 7)]),
        order("B2", "PAID", &[]),
    ]
}

// ============================================================================
// Determinism and ordering
// ============================================================================

#[test]
fn identical_input_gives_identical_plan_bytes() -> Result<(), Box<dyn std::error::Error>> {
    let first = TestPipeline::new()?.process(&busy_page())?;
    let second = TestPipeline::new()?.process(&busy_page())?;
    assert_eq!(first.plan.to_msgpack()?, second.plan.to_msgpack()?);

    // record order within the page does not matter for keyed rows
    let mut reversed = busy_page();
    reversed.reverse();
    let third = TestPipeline::new()?.process(&reversed)?;
    assert_eq!(first.plan.to_msgpack()?, third.plan.to_msgpack()?);
    Ok(())
}

#[test]
fn every_child_follows_its_parent() -> Result<(), Box<dyn std::error::Error>> {
    let mut pipeline = TestPipeline::with_config(EngineConfig {
        max_batch_size: 2,
        ..EngineConfig::default()
    })?;
    pipeline.sync(&[order("A1", "NEW", &[(1, 1)])])?;

    let outcome = pipeline.process(&busy_page())?;
    let mut written: BTreeSet<(String, NaturalKey)> = BTreeSet::new();
    for batch in &outcome.plan.batches {
        for op in &batch.ops {
            if let (Some(parent_relation), Some(parent_key)) = (&batch.parent_relation, &op.row.parent_key) {
                let earlier = written.contains(&(parent_relation.clone(), parent_key.clone()));
                let existed = pipeline.store.lookup(parent_relation, parent_key)?.is_some();
                assert!(earlier || existed, "{} written before its parent", op.row.key);
            }
            written.insert((op.row.relation.clone(), op.row.key.clone()));
        }
    }
    Ok(())
}

#[test]
fn batches_respect_size_limit_and_key_order() -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = TestPipeline::with_config(EngineConfig {
        max_batch_size: 2,
        ..EngineConfig::default()
    })?;
    let outcome = pipeline.process(&busy_page())?;

    let shape: Vec<(&str, usize)> = outcome
        .plan
        .batches
        .iter()
        .map(|b| (b.relation.as_str(), b.ops.len()))
        .collect();
    assert_eq!(
        shape,
        vec![("orders", 2), ("orders", 1), ("order_lines", 2), ("order_lines", 2), ("order_lines", 1)]
    );

    let line_keys: Vec<String> = outcome
        .plan
        .ops()
        .filter(|op| op.row.relation == "order_lines")
        .map(|op| op.key().to_string())
        .collect();
    assert_eq!(line_keys, vec!["A1/1", "A1/2", "A1/3", "C3/1", "C3/2"]);
    Ok(())
}

// ============================================================================
// Idempotence
// ============================================================================

#[test]
fn second_run_over_same_pages_writes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut pipeline = TestPipeline::new()?;
    let pages = vec![busy_page(), vec![order("D4", "NEW", &[(1, 1)])]];

    let first = pipeline.run_pages(pages.clone())?;
    assert_eq!(first.pages, 2);
    assert_eq!(first.inserts, 10);
    assert_eq!(first.applied_ops, first.planned_ops);
    assert!(first.is_clean());

    let second = pipeline.run_pages(pages)?;
    assert_eq!(second.planned_ops, 0);
    assert_eq!(second.unchanged, 10);
    assert_eq!(pipeline.store.row_count("order_lines")?, 6);
    Ok(())
}

// ============================================================================
// Sink failures
// ============================================================================

#[test]
fn failed_batch_rolls_back_and_skips_the_rest() -> Result<(), Box<dyn std::error::Error>> {
    let mut pipeline = TestPipeline::with_config(EngineConfig {
        max_batch_size: 1,
        ..EngineConfig::default()
    })?;
    let outcome = pipeline.process(&[order("A1", "NEW", &[(1, 1), (2, 1)])])?;

    // drop the order batch so its lines have nothing to attach to
    let plan = WritePlan {
        batches: outcome.plan.batches[1..].to_vec(),
    };
    let run_id = pipeline.ctx.run_id;
    let report = pipeline.store.apply(run_id, &plan)?;

    assert!(matches!(report.batches[0].status, BatchStatus::Failed { .. }));
    assert_eq!(report.batches[1].status, BatchStatus::Skipped);
    assert_eq!(report.applied_ops(), 0);
    assert_eq!(pipeline.store.row_count("order_lines")?, 0);
    assert_eq!(pipeline.store.logged_batches(run_id, "failed")?, 1);
    assert_eq!(pipeline.store.logged_batches(run_id, "skipped")?, 1);

    let mut summary = RunSummary::new(&pipeline.ctx);
    summary.absorb(&outcome, Some(&report));
    assert_eq!(summary.sink_failures.len(), 1);
    assert_eq!(summary.sink_failures[0].relation, "order_lines");
    assert_eq!(summary.skipped_batches, 1);
    assert!(!summary.is_clean());

    // the full plan still applies cleanly afterwards
    let report = pipeline.apply(&outcome)?;
    assert!(report.is_complete());
    assert_eq!(pipeline.store.row_count("order_lines")?, 2);
    Ok(())
}
