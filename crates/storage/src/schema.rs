use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, unixepoch())",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS rows (
    region TEXT NOT NULL,
    relation TEXT NOT NULL,
    natural_key BLOB NOT NULL,
    parent_key BLOB,
    fingerprint BLOB NOT NULL CHECK (length(fingerprint) = 32),
    payload BLOB NOT NULL,
    synthetic_key INTEGER NOT NULL DEFAULT 0,
    first_run BLOB NOT NULL CHECK (length(first_run) = 16),
    last_run BLOB NOT NULL CHECK (length(last_run) = 16),
    updated_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER)),
    deleted_at INTEGER,
    PRIMARY KEY (region, relation, natural_key)
);
CREATE INDEX IF NOT EXISTS idx_rows_parent ON rows (region, relation, parent_key);

CREATE TABLE IF NOT EXISTS apply_log (
    rowid INTEGER PRIMARY KEY,
    run_id BLOB NOT NULL CHECK (length(run_id) = 16),
    region TEXT NOT NULL,
    batch_index INTEGER NOT NULL,
    relation TEXT NOT NULL,
    op_count INTEGER NOT NULL,
    status TEXT NOT NULL,
    detail TEXT,
    applied_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
);
CREATE INDEX IF NOT EXISTS idx_apply_log_run ON apply_log (run_id, batch_index);
";
