//! `ordersync` command-line driver.

mod source;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ordersync_core::{change::MissingRow, key::NaturalKey, lookup::LookupTable, plan::WritePlan};
use ordersync_engine::{Engine, PipelineConfig, RecordSource, RecordFailure, RunContext};
use ordersync_storage::{FileSnapshotStore, SnapshotStore, SqliteStore};

use crate::source::JsonFileSource;

#[derive(Parser, Debug)]
#[command(name = "ordersync")]
#[command(about = "Detects changed order records and upserts them into a row store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process page files and apply the resulting plans
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Pipeline file: engine settings and relation schemas
    #[arg(long)]
    config: PathBuf,

    /// SQLite database holding prior state
    #[arg(long, env = "ORDERSYNC_DB", default_value = "ordersync.db")]
    db: String,

    /// Region the rows belong to
    #[arg(long, env = "ORDERSYNC_REGION", default_value = "default")]
    region: String,

    /// Page files, processed in order
    #[arg(long = "input", required = true, num_args = 1..)]
    inputs: Vec<PathBuf>,

    /// Lookup table file as NAME=PATH, replacing any table of that name in
    /// the pipeline file
    #[arg(long = "lookup", value_name = "NAME=PATH")]
    lookups: Vec<String>,

    /// Write a msgpack snapshot of every page here before applying it
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Soft-delete rows reported missing once the run completes
    #[arg(long)]
    soft_delete_missing: bool,

    /// Print each page's plan instead of applying it
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    // stdout is reserved for JSON output
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ordersync=info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
    }
}

fn load_engine(path: &Path, lookups: &[String]) -> Result<Engine> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading pipeline config {}", path.display()))?;
    let mut pipeline = PipelineConfig::from_json(&text)
        .with_context(|| format!("parsing pipeline config {}", path.display()))?;
    for arg in lookups {
        let (name, file) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("--lookup expects NAME=PATH, got {arg}"))?;
        let table = load_lookup(Path::new(file))?;
        info!(table = name, entries = table.len(), "lookup table loaded");
        pipeline.lookups.insert(name, table);
    }
    Ok(Engine::from_config(pipeline)?)
}

/// Reads a lookup table: either a flat object of id to value, or the address
/// metadata shape, an array of regions each listing `city` entries with `id`
/// and `displayName`.
fn load_lookup(path: &Path) -> Result<LookupTable> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading lookup table {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing lookup table {}", path.display()))?;

    let mut table = LookupTable::new();
    match value {
        Value::Object(entries) => {
            for (id, display) in entries {
                let Value::String(display) = display else {
                    bail!("{}: value for {id} is not a string", path.display());
                };
                table.insert(id, display);
            }
        }
        Value::Array(regions) => {
            let cities = regions
                .iter()
                .filter_map(|region| region.get("city").and_then(Value::as_array))
                .flatten();
            for city in cities {
                let id = match city.get("id") {
                    Some(Value::String(id)) => id.clone(),
                    Some(id @ Value::Number(_)) => id.to_string(),
                    _ => continue,
                };
                if let Some(display) = city.get("displayName").and_then(Value::as_str) {
                    table.insert(id, display.to_string());
                }
            }
        }
        _ => bail!("{} is neither an object nor a region list", path.display()),
    }
    Ok(table)
}

fn run(args: RunArgs) -> Result<()> {
    let engine = load_engine(&args.config, &args.lookups)?;
    let mut store = SqliteStore::open(&args.db)
        .with_context(|| format!("opening database {}", args.db))?
        .for_region(&args.region);
    let mut source = JsonFileSource::new(args.inputs.clone());

    if args.dry_run {
        return dry_run(&engine, &store, &mut source);
    }

    let ctx = RunContext::new(&args.region);
    let mut snapshots = match &args.snapshot_dir {
        Some(dir) => Some(FileSnapshotStore::new(dir.clone())?),
        None => None,
    };

    let summary = engine.run(
        &ctx,
        &mut source,
        &mut store,
        snapshots.as_mut().map(|s| s as &mut dyn SnapshotStore),
    )?;

    if args.soft_delete_missing {
        let mut by_relation: BTreeMap<&str, BTreeSet<&NaturalKey>> = BTreeMap::new();
        for row in &summary.missing {
            by_relation.entry(row.relation.as_str()).or_default().insert(&row.key);
        }
        for (relation, keys) in by_relation {
            let keys: Vec<NaturalKey> = keys.into_iter().cloned().collect();
            let deleted = store.soft_delete(ctx.run_id, relation, &keys)?;
            info!(relation, deleted, "soft-deleted missing rows");
        }
    }

    print_json(&summary)?;
    Ok(())
}

#[derive(Serialize)]
struct DryRunPage<'a> {
    page: usize,
    records: usize,
    failures: &'a [RecordFailure],
    missing: Vec<&'a MissingRow>,
    plan: &'a WritePlan,
}

fn dry_run(engine: &Engine, store: &SqliteStore, source: &mut dyn RecordSource) -> Result<()> {
    let mut page = 0;
    while let Some(records) = source.next_page()? {
        let outcome = engine.process_batch(page, &records, store)?;
        print_json(&DryRunPage {
            page,
            records: outcome.records,
            failures: &outcome.failures,
            missing: outcome.classification.missing().collect(),
            plan: &outcome.plan,
        })?;
        page += 1;
    }
    if page == 0 {
        bail!("no input pages");
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse_with_repeated_inputs() {
        let cli = Cli::try_parse_from([
            "ordersync",
            "run",
            "--config",
            "pipeline.json",
            "--db",
            "state.db",
            "--region",
            "eu",
            "--input",
            "p0.json",
            "p1.json",
            "--dry-run",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command;
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.region, "eu");
        assert!(args.dry_run);
        assert!(!args.soft_delete_missing);
    }

    #[test]
    fn inputs_are_required() {
        assert!(Cli::try_parse_from(["ordersync", "run", "--config", "p.json"]).is_err());
    }

    #[test]
    fn pipeline_file_builds_an_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(
            &path,
            r#"{
                "engine": {"max_batch_size": 10},
                "relations": [
                    {"name": "orders", "key_fields": ["order_id"],
                     "fields": [{"name": "order_id", "type": "text"}]},
                    {"name": "order_lines", "parent": "orders", "path": "lines",
                     "key_fields": ["line_id"], "track_cleared": true,
                     "fields": [{"name": "line_id", "type": "integer"},
                                {"name": "price", "type": "decimal", "scale": 2}]}
                ]
            }"#,
        )
        .unwrap();
        let engine = load_engine(&path, &[]).unwrap();
        assert_eq!(engine.config().max_batch_size, 10);
        assert_eq!(engine.forest().order(), ["orders", "order_lines"]);
    }

    #[test]
    fn lookup_files_accept_flat_and_region_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let flat = dir.path().join("cities.json");
        let regions = dir.path().join("address_metadata.json");
        fs::write(&flat, r#"{"C-101": "Lisbon"}"#).unwrap();
        fs::write(
            &regions,
            r#"[{"name": "North", "city": [{"id": "C-7", "displayName": "Porto"},
                                          {"id": 8, "displayName": "Braga"}]},
                {"name": "Islands"}]"#,
        )
        .unwrap();

        assert_eq!(load_lookup(&flat).unwrap().get("C-101").map(String::as_str), Some("Lisbon"));
        let table = load_lookup(&regions).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("8").map(String::as_str), Some("Braga"));
    }

    #[test]
    fn lookup_flag_satisfies_fields_that_need_it() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = dir.path().join("pipeline.json");
        let cities = dir.path().join("cities.json");
        fs::write(
            &pipeline,
            r#"{"relations": [
                {"name": "orders", "key_fields": ["order_id"],
                 "fields": [{"name": "order_id", "type": "text"},
                            {"name": "ship_city_name", "source": "shippingAddress.city",
                             "type": "text", "lookup": "cities"}]}
            ]}"#,
        )
        .unwrap();
        fs::write(&cities, r#"{"C-101": "Lisbon"}"#).unwrap();

        assert!(load_engine(&pipeline, &[]).is_err());
        let arg = format!("cities={}", cities.display());
        assert!(load_engine(&pipeline, &[arg]).is_ok());
        assert!(load_engine(&pipeline, &["cities".to_string()]).is_err());
    }
}
