use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::{debug, warn};

use ordersync_core::{
    ids::{Fingerprint, RunId},
    key::NaturalKey,
    plan::{WriteBatch, WritePlan},
    row::{FlatRow, PriorEntry},
};

use crate::error::StorageError;
use crate::traits::{ApplyReport, BatchReport, BatchStatus, ExecutionSink, PriorStateStore};

pub const DEFAULT_REGION: &str = "default";

fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

/// Row store scoped to one region. Serves as both the prior-state source and
/// the execution sink of a run.
pub struct SqliteStore {
    conn: Connection,
    region: String,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn,
            region: DEFAULT_REGION.to_string(),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn,
            region: DEFAULT_REGION.to_string(),
        })
    }

    pub fn for_region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Live rows of `relation` in this region.
    pub fn row_count(&self, relation: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM rows WHERE region = ?1 AND relation = ?2 AND deleted_at IS NULL",
            rusqlite::params![self.region, relation],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Marks rows as deleted without removing them. Soft-deleted rows are no
    /// longer returned as prior state; writing them again revives them.
    pub fn soft_delete(
        &mut self,
        run_id: RunId,
        relation: &str,
        keys: &[NaturalKey],
    ) -> Result<usize, StorageError> {
        let tx = self.conn.transaction()?;
        let mut affected = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE rows SET deleted_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER), last_run = ?1
                 WHERE region = ?2 AND relation = ?3 AND natural_key = ?4 AND deleted_at IS NULL",
            )?;
            for key in keys {
                affected += stmt.execute(rusqlite::params![
                    run_id.as_bytes().as_slice(),
                    self.region,
                    relation,
                    key.to_msgpack()?,
                ])?;
            }
        }
        tx.commit()?;
        debug!(region = %self.region, relation, affected, "soft-deleted missing rows");
        Ok(affected)
    }

    /// Number of batches the apply log recorded for `run_id`, by status.
    pub fn logged_batches(&self, run_id: RunId, status: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM apply_log WHERE run_id = ?1 AND status = ?2",
            rusqlite::params![run_id.as_bytes().as_slice(), status],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn query_entries(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<PriorEntry>, StorageError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, |row| {
            let payload: Vec<u8> = row.get(0)?;
            let fingerprint: Vec<u8> = row.get(1)?;
            Ok((payload, fingerprint))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (payload, fingerprint) = row?;
            result.push(read_entry(payload, fingerprint)?);
        }
        Ok(result)
    }

    fn log_batch(&self, run_id: RunId, report: &BatchReport) -> Result<(), StorageError> {
        let (status, detail) = match &report.status {
            BatchStatus::Applied => ("applied", None),
            BatchStatus::Failed { error } => ("failed", Some(error.as_str())),
            BatchStatus::Skipped => ("skipped", None),
        };
        self.conn.execute(
            "INSERT INTO apply_log (run_id, region, batch_index, relation, op_count, status, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                run_id.as_bytes().as_slice(),
                self.region,
                report.index as i64,
                report.relation,
                report.op_count as i64,
                status,
                detail,
            ],
        )?;
        Ok(())
    }
}

fn read_entry(payload: Vec<u8>, fingerprint: Vec<u8>) -> Result<PriorEntry, StorageError> {
    let row = FlatRow::from_msgpack(&payload)?;
    let fingerprint = Fingerprint::from_bytes(to_array::<32>(fingerprint, "fingerprint")?);
    Ok(PriorEntry { row, fingerprint })
}

fn apply_batch(
    tx: &Transaction,
    region: &str,
    run_id: RunId,
    batch: &WriteBatch,
) -> Result<(), StorageError> {
    let mut parent_stmt = tx.prepare_cached(
        "SELECT 1 FROM rows WHERE region = ?1 AND relation = ?2 AND natural_key = ?3 AND deleted_at IS NULL",
    )?;
    let mut upsert_stmt = tx.prepare_cached(
        "INSERT INTO rows (region, relation, natural_key, parent_key, fingerprint, payload, synthetic_key, first_run, last_run)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT (region, relation, natural_key) DO UPDATE SET
            parent_key = excluded.parent_key,
            fingerprint = excluded.fingerprint,
            payload = excluded.payload,
            synthetic_key = excluded.synthetic_key,
            last_run = excluded.last_run,
            updated_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER),
            deleted_at = NULL",
    )?;

    for op in &batch.ops {
        if op.row.relation != batch.relation {
            return Err(StorageError::ConstraintViolation(format!(
                "row of {} in a batch for {}",
                op.row.relation, batch.relation
            )));
        }
        let parent_key = match (&batch.parent_relation, &op.row.parent_key) {
            (Some(parent_relation), Some(parent_key)) => {
                let parent_bytes = parent_key.to_msgpack()?;
                let exists = parent_stmt
                    .query_row(
                        rusqlite::params![region, parent_relation, parent_bytes],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if !exists {
                    return Err(StorageError::ConstraintViolation(format!(
                        "{}/{} references missing parent {parent_relation}/{parent_key}",
                        batch.relation,
                        op.row.key
                    )));
                }
                Some(parent_bytes)
            }
            (None, None) => None,
            _ => {
                return Err(StorageError::ConstraintViolation(format!(
                    "{}/{} has a parent link that does not match its relation",
                    batch.relation, op.row.key
                )));
            }
        };

        upsert_stmt.execute(rusqlite::params![
            region,
            batch.relation,
            op.row.key.to_msgpack()?,
            parent_key,
            op.fingerprint.as_bytes().as_slice(),
            op.row.to_msgpack()?,
            op.row.synthetic_key,
            run_id.as_bytes().as_slice(),
        ])?;
    }
    Ok(())
}

impl PriorStateStore for SqliteStore {
    fn lookup(&self, relation: &str, key: &NaturalKey) -> Result<Option<PriorEntry>, StorageError> {
        let result = self
            .conn
            .query_row(
                "SELECT payload, fingerprint FROM rows
                 WHERE region = ?1 AND relation = ?2 AND natural_key = ?3 AND deleted_at IS NULL",
                rusqlite::params![self.region, relation, key.to_msgpack()?],
                |row| {
                    let payload: Vec<u8> = row.get(0)?;
                    let fingerprint: Vec<u8> = row.get(1)?;
                    Ok((payload, fingerprint))
                },
            )
            .optional()?;

        match result {
            Some((payload, fingerprint)) => Ok(Some(read_entry(payload, fingerprint)?)),
            None => Ok(None),
        }
    }

    fn children_of(
        &self,
        relation: &str,
        parent_keys: &[NaturalKey],
    ) -> Result<Vec<PriorEntry>, StorageError> {
        let mut result = Vec::new();
        for parent_key in parent_keys {
            let parent_bytes = parent_key.to_msgpack()?;
            result.extend(self.query_entries(
                "SELECT payload, fingerprint FROM rows
                 WHERE region = ?1 AND relation = ?2 AND parent_key = ?3 AND deleted_at IS NULL
                 ORDER BY natural_key",
                &[&self.region, &relation, &parent_bytes],
            )?);
        }
        Ok(result)
    }

    fn scan_relation(&self, relation: &str) -> Result<Vec<PriorEntry>, StorageError> {
        self.query_entries(
            "SELECT payload, fingerprint FROM rows
             WHERE region = ?1 AND relation = ?2 AND deleted_at IS NULL
             ORDER BY natural_key",
            &[&self.region, &relation],
        )
    }
}

impl ExecutionSink for SqliteStore {
    fn apply(&mut self, run_id: RunId, plan: &WritePlan) -> Result<ApplyReport, StorageError> {
        let mut report = ApplyReport::default();
        let mut failed = false;

        for (index, batch) in plan.batches.iter().enumerate() {
            let status = if failed {
                BatchStatus::Skipped
            } else {
                let tx = self.conn.transaction()?;
                match apply_batch(&tx, &self.region, run_id, batch) {
                    Ok(()) => {
                        tx.commit()?;
                        debug!(
                            region = %self.region,
                            relation = %batch.relation,
                            ops = batch.ops.len(),
                            "applied write batch"
                        );
                        BatchStatus::Applied
                    }
                    // dropping the transaction rolls the batch back
                    Err(e) => {
                        failed = true;
                        warn!(
                            region = %self.region,
                            relation = %batch.relation,
                            batch = index,
                            error = %e,
                            "write batch failed"
                        );
                        BatchStatus::Failed {
                            error: e.to_string(),
                        }
                    }
                }
            };

            let batch_report = BatchReport {
                index,
                relation: batch.relation.clone(),
                op_count: batch.ops.len(),
                status,
            };
            self.log_batch(run_id, &batch_report)?;
            report.batches.push(batch_report);
        }
        Ok(report)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordersync_core::{
        field_value::FieldValue,
        plan::{WriteKind, WriteOp},
    };

    fn key(parts: &[FieldValue]) -> NaturalKey {
        NaturalKey::new(parts.to_vec())
    }

    fn order(id: &str, status: &str) -> FlatRow {
        FlatRow {
            relation: "orders".into(),
            key: key(&[FieldValue::Text(id.into())]),
            parent_key: None,
            synthetic_key: false,
            fields: vec![
                ("order_id".into(), FieldValue::Text(id.into())),
                ("status".into(), FieldValue::Text(status.into())),
            ],
        }
    }

    fn line(order_id: &str, line_id: i64, qty: i64) -> FlatRow {
        FlatRow {
            relation: "order_lines".into(),
            key: key(&[FieldValue::Text(order_id.into()), FieldValue::Integer(line_id)]),
            parent_key: Some(key(&[FieldValue::Text(order_id.into())])),
            synthetic_key: false,
            fields: vec![
                ("line_id".into(), FieldValue::Integer(line_id)),
                ("qty".into(), FieldValue::Integer(qty)),
            ],
        }
    }

    fn insert(row: FlatRow) -> WriteOp {
        WriteOp {
            kind: WriteKind::Insert,
            fingerprint: row.fingerprint(),
            row,
            diff: Vec::new(),
        }
    }

    fn plan(batches: Vec<(&str, Option<&str>, Vec<WriteOp>)>) -> WritePlan {
        WritePlan {
            batches: batches
                .into_iter()
                .map(|(relation, parent, ops)| WriteBatch {
                    relation: relation.into(),
                    parent_relation: parent.map(str::to_string),
                    ops,
                })
                .collect(),
        }
    }

    #[test]
    fn applied_rows_become_prior_state() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let run = RunId::new();
        let report = store
            .apply(
                run,
                &plan(vec![
                    ("orders", None, vec![insert(order("A1", "NEW"))]),
                    ("order_lines", Some("orders"), vec![insert(line("A1", 1, 2))]),
                ]),
            )
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.applied_ops(), 2);

        let entry = store
            .lookup("orders", &key(&[FieldValue::Text("A1".into())]))
            .unwrap()
            .unwrap();
        assert_eq!(entry.row, order("A1", "NEW"));
        assert_eq!(entry.fingerprint, order("A1", "NEW").fingerprint());

        let children = store
            .children_of("order_lines", &[key(&[FieldValue::Text("A1".into())])])
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(store.logged_batches(run, "applied").unwrap(), 2);
    }

    #[test]
    fn upsert_replaces_content() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .apply(RunId::new(), &plan(vec![("orders", None, vec![insert(order("A1", "NEW"))])]))
            .unwrap();
        let mut update = insert(order("A1", "SHIPPED"));
        update.kind = WriteKind::Update;
        store
            .apply(RunId::new(), &plan(vec![("orders", None, vec![update])]))
            .unwrap();

        assert_eq!(store.row_count("orders").unwrap(), 1);
        let entry = store
            .lookup("orders", &key(&[FieldValue::Text("A1".into())]))
            .unwrap()
            .unwrap();
        assert_eq!(entry.row.get("status"), Some(&FieldValue::Text("SHIPPED".into())));
    }

    #[test]
    fn missing_parent_fails_batch_and_skips_rest() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let run = RunId::new();
        let report = store
            .apply(
                run,
                &plan(vec![
                    ("order_lines", Some("orders"), vec![insert(line("ZZ", 1, 1))]),
                    ("orders", None, vec![insert(order("A1", "NEW"))]),
                ]),
            )
            .unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.batches[1].status, BatchStatus::Skipped);
        assert_eq!(store.row_count("order_lines").unwrap(), 0);
        assert_eq!(store.row_count("orders").unwrap(), 0);
        assert_eq!(store.logged_batches(run, "failed").unwrap(), 1);
        assert_eq!(store.logged_batches(run, "skipped").unwrap(), 1);
    }

    #[test]
    fn failed_batch_rolls_back_whole_batch() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .apply(RunId::new(), &plan(vec![("orders", None, vec![insert(order("A1", "NEW"))])]))
            .unwrap();
        // first op is fine, second references an unknown order
        let report = store
            .apply(
                RunId::new(),
                &plan(vec![(
                    "order_lines",
                    Some("orders"),
                    vec![insert(line("A1", 1, 1)), insert(line("B9", 1, 1))],
                )]),
            )
            .unwrap();
        assert_eq!(report.failures().count(), 1);
        assert_eq!(store.row_count("order_lines").unwrap(), 0);
    }

    #[test]
    fn regions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        let path = path.to_str().unwrap();

        let mut a = SqliteStore::open(path).unwrap().for_region("region_a");
        a.apply(RunId::new(), &plan(vec![("orders", None, vec![insert(order("A1", "NEW"))])]))
            .unwrap();

        let b = SqliteStore::open(path).unwrap().for_region("region_b");
        assert_eq!(b.row_count("orders").unwrap(), 0);
        assert!(b
            .lookup("orders", &key(&[FieldValue::Text("A1".into())]))
            .unwrap()
            .is_none());
        assert_eq!(a.row_count("orders").unwrap(), 1);
    }

    #[test]
    fn soft_deleted_rows_leave_prior_state_until_rewritten() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let a1 = key(&[FieldValue::Text("A1".into())]);
        store
            .apply(RunId::new(), &plan(vec![("orders", None, vec![insert(order("A1", "NEW"))])]))
            .unwrap();

        assert_eq!(store.soft_delete(RunId::new(), "orders", &[a1.clone()]).unwrap(), 1);
        assert!(store.lookup("orders", &a1).unwrap().is_none());
        assert!(store.scan_relation("orders").unwrap().is_empty());
        // second delete is a no-op
        assert_eq!(store.soft_delete(RunId::new(), "orders", &[a1.clone()]).unwrap(), 0);

        store
            .apply(RunId::new(), &plan(vec![("orders", None, vec![insert(order("A1", "NEW"))])]))
            .unwrap();
        assert!(store.lookup("orders", &a1).unwrap().is_some());
    }

    #[test]
    fn prefetch_returns_only_known_keys() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .apply(
                RunId::new(),
                &plan(vec![(
                    "orders",
                    None,
                    vec![insert(order("A1", "NEW")), insert(order("A2", "NEW"))],
                )]),
            )
            .unwrap();
        let found = store
            .prefetch(
                "orders",
                &[
                    key(&[FieldValue::Text("A2".into())]),
                    key(&[FieldValue::Text("A3".into())]),
                ],
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].row.key, key(&[FieldValue::Text("A2".into())]));
    }
}
