mod cross_txs;
mod records;

use std::{
    fmt,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use itertools::Itertools;
pub use cross_txs::{CrossTxStore, TxFilter, TxOrder};
use parking_lot::Mutex;
pub use records::{
    CrossTransactionStore, IndexedRecord, NeverDowngrade, RecordFilter, RecordOrder,
    ReplacePolicy, Replaceable,
};
use rusqlite::{
    Connection, OptionalExtension, ToSql,
    types::{FromSql, FromSqlError, ToSqlOutput, ValueRef},
};
use thiserror::Error;
use tracing::*;

use crate::{
    contract::{CStatus, ContractError},
    crypto::Hash,
};

/// File name of the database inside the data directory.
const DB_FILE_NAME: &str = "crosshub.sqlite3";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS cross_transactions (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        ctx_id BLOB NOT NULL UNIQUE,
        tx_hash BLOB NOT NULL,
        price BLOB NOT NULL,
        status INTEGER NOT NULL,
        from_addr TEXT NOT NULL,
        to_addr TEXT NOT NULL,
        data BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS cross_transactions_tx_hash ON cross_transactions (tx_hash);
    CREATE INDEX IF NOT EXISTS cross_transactions_price ON cross_transactions (price);
    CREATE INDEX IF NOT EXISTS cross_transactions_status ON cross_transactions (status);
    CREATE INDEX IF NOT EXISTS cross_transactions_from ON cross_transactions (from_addr);
    CREATE INDEX IF NOT EXISTS cross_transactions_to ON cross_transactions (to_addr);

    CREATE TABLE IF NOT EXISTS cross_txs (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        cross_id TEXT NOT NULL UNIQUE,
        tx_id TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        ts_seconds INTEGER NOT NULL,
        ts_nanos INTEGER NOT NULL,
        status INTEGER NOT NULL,
        data TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS cross_txs_tx_id ON cross_txs (tx_id);
    CREATE INDEX IF NOT EXISTS cross_txs_block_number ON cross_txs (block_number);
    CREATE INDEX IF NOT EXISTS cross_txs_timestamp ON cross_txs (ts_seconds, ts_nanos);
    CREATE INDEX IF NOT EXISTS cross_txs_status ON cross_txs (status);

    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("{stage}: {source}")]
    Failure {
        stage: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("update of {id} rejected: {source}")]
    Rejected {
        id: String,
        #[source]
        source: ContractError,
    },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("{0} is already stored with different content")]
    Conflict(Hash),
}

/// Labels a SQLite failure with the stage of the operation it happened in.
trait Stage<T> {
    fn stage(self, stage: &'static str) -> Result<T, StoreError>;
}

impl<T> Stage<T> for rusqlite::Result<T> {
    fn stage(self, stage: &'static str) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Failure { stage, source })
    }
}

pub struct Db {
    conn: Mutex<Connection>,
    cache: Mutex<records::RecordCache>,
    path: Option<Box<Path>>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Db {
    /// Opens the database in `data_dir`, or an in-memory database if no directory is given.
    pub fn new<P>(data_dir: Option<P>, cache_size: usize) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let (conn, path) = match data_dir {
            Some(dir) => {
                let dir = dir.as_ref();
                fs::create_dir_all(dir)
                    .with_context(|| format!("Unable to create data directory {}", dir.display()))?;
                let path: PathBuf = dir.join(DB_FILE_NAME);
                let conn = Connection::open(&path)
                    .with_context(|| format!("Unable to open database {}", path.display()))?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                (conn, Some(path.into_boxed_path()))
            }
            None => (Connection::open_in_memory()?, None),
        };

        conn.trace_v2(
            rusqlite::trace::TraceEventCodes::SQLITE_TRACE_STMT,
            Some(|statement| {
                if let rusqlite::trace::TraceEvent::Stmt(_, statement) = statement {
                    trace!(statement, "sql executed");
                }
            }),
        );
        conn.execute_batch(SCHEMA)?;

        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        debug!(path = ?path, capacity, "opened database");

        Ok(Db {
            conn: Mutex::new(conn),
            cache: Mutex::new(records::RecordCache::new(capacity)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Indexed, signed cross-chain transactions.
    pub fn cross_transactions(&self) -> CrossTransactionStore<'_> {
        CrossTransactionStore::new(&self.conn, &self.cache)
    }

    /// Intent records observed on the source ledger.
    pub fn cross_txs(&self) -> CrossTxStore<'_> {
        CrossTxStore::new(&self.conn)
    }

    /// Checkpoint values.
    pub fn config(&self) -> ConfigStore<'_> {
        ConfigStore { conn: &self.conn }
    }

    /// Runs raw SQL against the database, for tests which need to break it.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> rusqlite::Result<()> {
        self.conn.lock().execute_batch(sql)
    }
}

pub struct ConfigStore<'a> {
    conn: &'a Mutex<Connection>,
}

impl ConfigStore<'_> {
    pub fn set(&self, key: &str, value: u64) -> Result<(), StoreError> {
        let value = i64::try_from(value)
            .map_err(|_| StoreError::InvalidParams(format!("{key} = {value} is out of range")))?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                (key, value),
            )
            .stage("config update failed")?;
        Ok(())
    }

    /// Reads a value, returning 0 if it is missing or cannot be read.
    pub fn get(&self, key: &str) -> u64 {
        let value = self
            .conn
            .lock()
            .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
                row.get::<_, i64>(0)
            })
            .optional();
        match value {
            Ok(Some(value)) => u64::try_from(value).unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(key, error = %e, "config read failed");
                0
            }
        }
    }
}

impl ToSql for Hash {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_vec()))
    }
}

impl FromSql for Hash {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        Ok(Hash(<[u8; 32]>::column_result(value)?))
    }
}

impl ToSql for CStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_u8()))
    }
}

impl FromSql for CStatus {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let raw = u8::column_result(value)?;
        CStatus::from_u8(raw).ok_or(FromSqlError::OutOfRange(raw.into()))
    }
}

/// Builds the `WHERE` clause of a query from column/value pairs.
fn where_clause(conditions: &[(&'static str, Box<dyn ToSql + '_>)]) -> String {
    if conditions.is_empty() {
        return String::new();
    }
    let terms = conditions
        .iter()
        .enumerate()
        .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
        .join(" AND ");
    format!("WHERE {terms}")
}

/// The `LIMIT`/`OFFSET` for a page, or `None` if the page is empty by definition. Pages are numbered from 1 and a
/// page size of 0 returns everything.
fn page_bounds(page_size: usize, page: i64) -> Option<(i64, i64)> {
    if page_size == 0 {
        return Some((-1, 0));
    }
    if page <= 0 {
        return None;
    }
    let size = i64::try_from(page_size).unwrap_or(i64::MAX);
    Some((size, size.saturating_mul(page - 1)))
}
