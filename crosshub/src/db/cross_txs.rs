use parking_lot::Mutex;
use rusqlite::{Connection, Row, ToSql, Transaction, params_from_iter};
use tracing::*;

use super::{Stage, StoreError, page_bounds, where_clause};
use crate::{
    contract::{CStatus, ContractError},
    tx::CrossTx,
};

#[derive(Debug, Clone)]
pub enum TxFilter {
    CrossId(String),
    TxId(String),
    BlockNumber(u64),
    Status(CStatus),
}

impl TxFilter {
    fn condition(&self) -> (&'static str, Box<dyn ToSql + '_>) {
        match self {
            TxFilter::CrossId(id) => ("cross_id", Box::new(id)),
            TxFilter::TxId(id) => ("tx_id", Box::new(id)),
            TxFilter::BlockNumber(n) => ("block_number", Box::new(*n as i64)),
            TxFilter::Status(s) => ("status", Box::new(s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum TxOrder {
    #[default]
    Insertion,
    BlockNumber,
    Timestamp,
}

impl TxOrder {
    fn columns(self, direction: &str) -> String {
        match self {
            TxOrder::Insertion => format!("pk {direction}"),
            TxOrder::BlockNumber => format!("block_number {direction}, pk {direction}"),
            TxOrder::Timestamp => {
                format!("ts_seconds {direction}, ts_nanos {direction}, pk {direction}")
            }
        }
    }
}

const SELECT: &str = "SELECT pk, data FROM cross_txs";

enum Stored {
    Decoded(CrossTx),
    Corrupt(String),
}

pub struct CrossTxStore<'a> {
    conn: &'a Mutex<Connection>,
}

impl<'a> CrossTxStore<'a> {
    pub(super) fn new(conn: &'a Mutex<Connection>) -> Self {
        CrossTxStore { conn }
    }

    /// Saves a batch of records observed on the ledger, in one transaction.
    ///
    /// A record with an unknown `cross_id` is inserted. A `Finished` or `OutOnceCompleted` record for a known id
    /// completes the stored record and is itself discarded. Any other duplicate is skipped.
    ///
    /// Returns the positions in `batch` of the records which were inserted.
    pub fn save(&self, batch: &[CrossTx]) -> Result<Vec<usize>, StoreError> {
        let mut conn = self.conn.lock();
        let txn = conn.transaction().stage("begin transaction failed")?;
        let mut inserted = Vec::new();

        for (i, tx) in batch.iter().enumerate() {
            match Self::find(&txn, &TxFilter::CrossId(tx.cross_id.clone()))? {
                None => {
                    Self::insert(&txn, tx)?;
                    inserted.push(i);
                }
                Some((_, Stored::Corrupt(e))) => {
                    warn!(cross_id = %tx.cross_id, error = %e, "stored record is unreadable, skipping");
                }
                Some((pk, Stored::Decoded(mut old))) => {
                    if tx.status().is_terminal_event() {
                        old.update_status(CStatus::Completed)
                            .map_err(|source| StoreError::Rejected {
                                id: old.cross_id.clone(),
                                source,
                            })?;
                        Self::replace_row(&txn, pk, &old)?;
                        info!(cross_id = %old.cross_id, "cross tx completed");
                    } else {
                        warn!(cross_id = %tx.cross_id, status = %tx.status(), "duplicate cross tx, skipping");
                    }
                }
            }
        }

        txn.commit().stage("commit transaction failed")?;
        Ok(inserted)
    }

    pub fn update<F>(&self, id: &str, updater: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut CrossTx) -> Result<(), ContractError>,
    {
        self.updates(&[id.to_owned()], vec![updater])
    }

    /// Applies `updaters[i]` to the record `ids[i]`, all in one transaction. A missing record or a refused update
    /// rolls back the whole batch.
    pub fn updates<F>(&self, ids: &[String], updaters: Vec<F>) -> Result<(), StoreError>
    where
        F: FnOnce(&mut CrossTx) -> Result<(), ContractError>,
    {
        if ids.len() != updaters.len() {
            return Err(StoreError::InvalidParams(format!(
                "{} ids but {} updaters",
                ids.len(),
                updaters.len()
            )));
        }

        let mut conn = self.conn.lock();
        let txn = conn.transaction().stage("begin transaction failed")?;

        for (id, updater) in ids.iter().zip(updaters) {
            let (pk, stored) =
                Self::find(&txn, &TxFilter::CrossId(id.clone()))?.ok_or(StoreError::NotFound)?;
            let mut tx = match stored {
                Stored::Decoded(tx) => tx,
                Stored::Corrupt(e) => return Err(StoreError::Corrupt(e)),
            };
            updater(&mut tx).map_err(|source| StoreError::Rejected {
                id: id.clone(),
                source,
            })?;
            Self::replace_row(&txn, pk, &tx)?;
        }

        txn.commit().stage("commit transaction failed")?;
        Ok(())
    }

    pub fn one(&self, filter: TxFilter) -> Result<Option<CrossTx>, StoreError> {
        let conn = self.conn.lock();
        match Self::find(&conn, &filter)? {
            None => Ok(None),
            Some((_, Stored::Decoded(tx))) => Ok(Some(tx)),
            Some((_, Stored::Corrupt(e))) => Err(StoreError::Corrupt(e)),
        }
    }

    /// A page of records matching every filter. Pages are numbered from 1 and a `page_size` of 0 returns every
    /// match. Unreadable records are skipped.
    pub fn query(
        &self,
        page_size: usize,
        page: i64,
        order_by: TxOrder,
        reverse: bool,
        filters: &[TxFilter],
    ) -> Result<Vec<CrossTx>, StoreError> {
        let Some((limit, offset)) = page_bounds(page_size, page) else {
            return Ok(Vec::new());
        };
        let conditions: Vec<_> = filters.iter().map(TxFilter::condition).collect();
        let direction = if reverse { "DESC" } else { "ASC" };
        let sql = format!(
            "{SELECT} {} ORDER BY {} LIMIT {limit} OFFSET {offset}",
            where_clause(&conditions),
            order_by.columns(direction),
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).stage("transaction query failed")?;
        let mut rows = stmt
            .query(params_from_iter(conditions.iter().map(|(_, v)| v)))
            .stage("transaction query failed")?;
        let mut txs = Vec::new();
        while let Some(row) = rows.next().stage("transaction query failed")? {
            match Self::decode(row)? {
                Stored::Decoded(tx) => txs.push(tx),
                Stored::Corrupt(e) => warn!(error = %e, "stored record is unreadable, skipping"),
            }
        }
        Ok(txs)
    }

    pub fn count(&self, filters: &[TxFilter]) -> Result<usize, StoreError> {
        let conditions: Vec<_> = filters.iter().map(TxFilter::condition).collect();
        let sql = format!("SELECT COUNT(*) FROM cross_txs {}", where_clause(&conditions));
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                &sql,
                params_from_iter(conditions.iter().map(|(_, v)| v)),
                |row| row.get(0),
            )
            .stage("transaction query failed")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn decode(row: &Row<'_>) -> Result<Stored, StoreError> {
        let data: String = row.get("data").stage("transaction query failed")?;
        Ok(match serde_json::from_str(&data) {
            Ok(tx) => Stored::Decoded(tx),
            Err(e) => Stored::Corrupt(e.to_string()),
        })
    }

    fn find(conn: &Connection, filter: &TxFilter) -> Result<Option<(i64, Stored)>, StoreError> {
        let (column, value) = filter.condition();
        let sql = format!("{SELECT} WHERE {column} = ?1 ORDER BY pk LIMIT 1");
        let mut stmt = conn.prepare_cached(&sql).stage("transaction query failed")?;
        let mut rows = stmt.query([value]).stage("transaction query failed")?;
        match rows.next().stage("transaction query failed")? {
            Some(row) => {
                let pk: i64 = row.get("pk").stage("transaction query failed")?;
                Ok(Some((pk, Self::decode(row)?)))
            }
            None => Ok(None),
        }
    }

    fn insert(txn: &Transaction<'_>, tx: &CrossTx) -> Result<(), StoreError> {
        let data = serde_json::to_string(tx).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        txn.execute(
            "INSERT INTO cross_txs (cross_id, tx_id, block_number, ts_seconds, ts_nanos, status, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                &tx.cross_id,
                &tx.tx_id,
                tx.block_number as i64,
                tx.timestamp.seconds,
                tx.timestamp.nanos,
                tx.status(),
                data,
            ),
        )
        .stage("transaction insert failed")?;
        Ok(())
    }

    fn replace_row(txn: &Transaction<'_>, pk: i64, tx: &CrossTx) -> Result<(), StoreError> {
        let data = serde_json::to_string(tx).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        txn.execute(
            "UPDATE cross_txs
             SET tx_id = ?2, block_number = ?3, ts_seconds = ?4, ts_nanos = ?5, status = ?6, data = ?7
             WHERE pk = ?1",
            (
                pk,
                &tx.tx_id,
                tx.block_number as i64,
                tx.timestamp.seconds,
                tx.timestamp.nanos,
                tx.status(),
                data,
            ),
        )
        .stage("transaction update failed")?;
        Ok(())
    }
}
