use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{Connection, Row, ToSql, Transaction, params_from_iter};

use super::{Stage, StoreError, page_bounds, where_clause};
use crate::{
    codec::{CrossTransaction, Price},
    contract::CStatus,
    crypto::Hash,
};

/// The stored projection of a [`CrossTransaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRecord {
    pub tx: CrossTransaction,
    pub status: CStatus,
}

impl IndexedRecord {
    pub fn new(tx: CrossTransaction, status: CStatus) -> Self {
        IndexedRecord { tx, status }
    }

    pub fn id(&self) -> Hash {
        self.tx.id()
    }

    pub fn price(&self) -> Price {
        self.tx.price()
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(&self.tx, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn decode(row: &Row<'_>) -> Result<IndexedRecord, StoreError> {
        let status: CStatus = row.get("status").stage("transaction query failed")?;
        let data: Vec<u8> = row.get("data").stage("transaction query failed")?;
        let (tx, _): (CrossTransaction, usize) =
            bincode::serde::decode_from_slice(&data, bincode::config::standard())
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(IndexedRecord { tx, status })
    }
}

/// Decides whether an incoming record may overwrite a stored record with the same id.
pub trait ReplacePolicy {
    fn replace(&self, old: &IndexedRecord, new: &IndexedRecord) -> bool;
}

/// Replaces unconditionally, or never.
#[derive(Debug, Clone, Copy)]
pub struct Replaceable(pub bool);

impl ReplacePolicy for Replaceable {
    fn replace(&self, _: &IndexedRecord, _: &IndexedRecord) -> bool {
        self.0
    }
}

/// Replaces unless the incoming record would move the status backwards.
#[derive(Debug, Clone, Copy)]
pub struct NeverDowngrade;

impl ReplacePolicy for NeverDowngrade {
    fn replace(&self, old: &IndexedRecord, new: &IndexedRecord) -> bool {
        old.status.can_advance_to(new.status)
    }
}

#[derive(Debug, Clone)]
pub enum RecordFilter {
    CtxId(Hash),
    TxHash(Hash),
    Status(CStatus),
    From(String),
    To(String),
}

impl RecordFilter {
    fn condition(&self) -> (&'static str, Box<dyn ToSql + '_>) {
        match self {
            RecordFilter::CtxId(h) => ("ctx_id", Box::new(h)),
            RecordFilter::TxHash(h) => ("tx_hash", Box::new(h)),
            RecordFilter::Status(s) => ("status", Box::new(s)),
            RecordFilter::From(a) => ("from_addr", Box::new(a)),
            RecordFilter::To(a) => ("to_addr", Box::new(a)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum RecordOrder {
    #[default]
    Insertion,
    Price,
}

impl RecordOrder {
    fn column(self) -> &'static str {
        match self {
            RecordOrder::Insertion => "pk",
            RecordOrder::Price => "price",
        }
    }
}

/// Point lookups by `ctx_id` and by `tx_hash`.
pub(super) struct RecordCache {
    by_ctx_id: LruCache<Hash, IndexedRecord>,
    by_tx_hash: LruCache<Hash, IndexedRecord>,
}

impl RecordCache {
    pub(super) fn new(capacity: NonZeroUsize) -> Self {
        RecordCache {
            by_ctx_id: LruCache::new(capacity),
            by_tx_hash: LruCache::new(capacity),
        }
    }

    fn invalidate(&mut self, record: &IndexedRecord) {
        self.by_ctx_id.pop(&record.tx.ctx_id);
        self.by_tx_hash.pop(&record.tx.tx_hash);
    }
}

pub struct CrossTransactionStore<'a> {
    conn: &'a Mutex<Connection>,
    cache: &'a Mutex<RecordCache>,
}

const SELECT: &str = "SELECT pk, status, data FROM cross_transactions";

impl<'a> CrossTransactionStore<'a> {
    pub(super) fn new(conn: &'a Mutex<Connection>, cache: &'a Mutex<RecordCache>) -> Self {
        CrossTransactionStore { conn, cache }
    }

    pub fn write(&self, record: &IndexedRecord) -> Result<(), StoreError> {
        self.write_batch(std::slice::from_ref(record), true)
    }

    pub fn write_batch(&self, records: &[IndexedRecord], replaceable: bool) -> Result<(), StoreError> {
        self.write_batch_with(records, &Replaceable(replaceable))
    }

    /// Writes `records` in one transaction. Records whose id already exists are replaced only if `policy` allows
    /// it and are otherwise skipped. A record whose id exists with different content fails the whole batch, whatever
    /// the policy.
    pub fn write_batch_with(
        &self,
        records: &[IndexedRecord],
        policy: &dyn ReplacePolicy,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let txn = conn.transaction().stage("begin transaction failed")?;
        let mut touched = Vec::new();

        for record in records {
            match Self::find(&txn, &RecordFilter::CtxId(record.id()))? {
                None => {
                    Self::insert(&txn, record)?;
                    touched.push(record.clone());
                }
                Some((_, old)) if old.tx.hash() != record.tx.hash() => {
                    return Err(StoreError::Conflict(record.id()));
                }
                Some((pk, old)) => {
                    if policy.replace(&old, record) {
                        Self::replace_row(&txn, pk, record)?;
                        touched.push(old);
                        touched.push(record.clone());
                    }
                }
            }
        }

        txn.commit().stage("commit transaction failed")?;
        let mut cache = self.cache.lock();
        for record in &touched {
            cache.invalidate(record);
        }
        Ok(())
    }

    pub fn read(&self, id: Hash) -> Result<IndexedRecord, StoreError> {
        self.one(RecordFilter::CtxId(id))?.ok_or(StoreError::NotFound)
    }

    /// The first record matching `filter`. Lookups by `ctx_id` and `tx_hash` go through the cache.
    pub fn one(&self, filter: RecordFilter) -> Result<Option<IndexedRecord>, StoreError> {
        {
            let mut cache = self.cache.lock();
            let hit = match &filter {
                RecordFilter::CtxId(h) => cache.by_ctx_id.get(h).cloned(),
                RecordFilter::TxHash(h) => cache.by_tx_hash.get(h).cloned(),
                _ => None,
            };
            if hit.is_some() {
                return Ok(hit);
            }
        }

        // The connection stays locked until the cache is filled so a concurrent write cannot be shadowed.
        let conn = self.conn.lock();
        let found = Self::find(&conn, &filter)?.map(|(_, record)| record);
        if let Some(record) = &found {
            let mut cache = self.cache.lock();
            match filter {
                RecordFilter::CtxId(h) => {
                    cache.by_ctx_id.put(h, record.clone());
                }
                RecordFilter::TxHash(h) => {
                    cache.by_tx_hash.put(h, record.clone());
                }
                _ => {}
            }
        }
        Ok(found)
    }

    pub fn has(&self, id: Hash) -> Result<bool, StoreError> {
        Ok(self.one(RecordFilter::CtxId(id))?.is_some())
    }

    pub fn update<F>(&self, id: Hash, mutator: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut IndexedRecord),
    {
        self.update_batch(&[id], vec![mutator])
    }

    /// Applies `mutators[i]` to the record `ids[i]`, all in one transaction.
    pub fn update_batch<F>(&self, ids: &[Hash], mutators: Vec<F>) -> Result<(), StoreError>
    where
        F: FnOnce(&mut IndexedRecord),
    {
        if ids.len() != mutators.len() {
            return Err(StoreError::InvalidParams(format!(
                "{} ids but {} mutators",
                ids.len(),
                mutators.len()
            )));
        }

        let mut conn = self.conn.lock();
        let txn = conn.transaction().stage("begin transaction failed")?;
        let mut touched = Vec::new();

        for (id, mutator) in ids.iter().zip(mutators) {
            let (pk, old) = Self::find(&txn, &RecordFilter::CtxId(*id))?.ok_or(StoreError::NotFound)?;
            let mut record = old.clone();
            mutator(&mut record);
            Self::replace_row(&txn, pk, &record)?;
            touched.push(old);
            touched.push(record);
        }

        txn.commit().stage("commit transaction failed")?;
        let mut cache = self.cache.lock();
        for record in &touched {
            cache.invalidate(record);
        }
        Ok(())
    }

    /// Deletes the records with the given ids. Missing ids are skipped.
    pub fn delete(&self, ids: &[Hash]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let txn = conn.transaction().stage("begin transaction failed")?;
        let mut touched = Vec::new();

        for id in ids {
            if let Some((pk, old)) = Self::find(&txn, &RecordFilter::CtxId(*id))? {
                txn.execute("DELETE FROM cross_transactions WHERE pk = ?1", [pk])
                    .stage("transaction delete failed")?;
                touched.push(old);
            }
        }

        txn.commit().stage("commit transaction failed")?;
        let mut cache = self.cache.lock();
        for record in &touched {
            cache.invalidate(record);
        }
        Ok(())
    }

    /// A page of records matching every filter. Pages are numbered from 1 and a `page_size` of 0 returns every
    /// match.
    pub fn query(
        &self,
        page_size: usize,
        page: i64,
        order_by: RecordOrder,
        reverse: bool,
        filters: &[RecordFilter],
    ) -> Result<Vec<IndexedRecord>, StoreError> {
        let Some((limit, offset)) = page_bounds(page_size, page) else {
            return Ok(Vec::new());
        };
        let conditions: Vec<_> = filters.iter().map(RecordFilter::condition).collect();
        let direction = if reverse { "DESC" } else { "ASC" };
        let sql = format!(
            "{SELECT} {} ORDER BY {} {direction}, pk {direction} LIMIT {limit} OFFSET {offset}",
            where_clause(&conditions),
            order_by.column(),
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).stage("transaction query failed")?;
        let mut rows = stmt
            .query(params_from_iter(conditions.iter().map(|(_, v)| v)))
            .stage("transaction query failed")?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().stage("transaction query failed")? {
            records.push(IndexedRecord::decode(row)?);
        }
        Ok(records)
    }

    pub fn count(&self, filters: &[RecordFilter]) -> Result<usize, StoreError> {
        let conditions: Vec<_> = filters.iter().map(RecordFilter::condition).collect();
        let sql = format!(
            "SELECT COUNT(*) FROM cross_transactions {}",
            where_clause(&conditions)
        );
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

    fn find(
        conn: &Connection,
        filter: &RecordFilter,
    ) -> Result<Option<(i64, IndexedRecord)>, StoreError> {
        let (column, value) = filter.condition();
        let sql = format!("{SELECT} WHERE {column} = ?1 ORDER BY pk LIMIT 1");
        let mut stmt = conn.prepare_cached(&sql).stage("transaction query failed")?;
        let mut rows = stmt.query([value]).stage("transaction query failed")?;
        match rows.next().stage("transaction query failed")? {
            Some(row) => {
                let pk: i64 = row.get("pk").stage("transaction query failed")?;
                Ok(Some((pk, IndexedRecord::decode(row)?)))
            }
            None => Ok(None),
        }
    }

    fn insert(txn: &Transaction<'_>, record: &IndexedRecord) -> Result<(), StoreError> {
        txn.execute(
            "INSERT INTO cross_transactions (ctx_id, tx_hash, price, status, from_addr, to_addr, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                record.tx.ctx_id,
                record.tx.tx_hash,
                record.price().sort_key().to_vec(),
                record.status,
                &record.tx.from,
                &record.tx.to,
                record.encode()?,
            ),
        )
        .stage("transaction insert failed")?;
        Ok(())
    }

    fn replace_row(txn: &Transaction<'_>, pk: i64, record: &IndexedRecord) -> Result<(), StoreError> {
        txn.execute(
            "UPDATE cross_transactions
             SET ctx_id = ?2, tx_hash = ?3, price = ?4, status = ?5, from_addr = ?6, to_addr = ?7, data = ?8
             WHERE pk = ?1",
            (
                pk,
                record.tx.ctx_id,
                record.tx.tx_hash,
                record.price().sort_key().to_vec(),
                record.status,
                &record.tx.from,
                &record.tx.to,
                record.encode()?,
            ),
        )
        .stage("transaction update failed")?;
        Ok(())
    }
}
