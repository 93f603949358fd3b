//! Moves observed cross-chain transactions through their lifecycle.
//!
//! Records waiting to be relayed sit in the `pending` queue, oldest first. Receipts from the destination chain sit
//! in the `executed` queue, lowest sequence first. Each queue has a drain loop which is woken by a doorbell.

pub mod pool;
pub mod queue;

use std::{future, sync::Arc};

use anyhow::{Result, anyhow};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::*;

pub use self::{
    pool::WorkerPool,
    queue::{Doorbell, PriorityQueue, doorbell},
};
use crate::{
    cfg::DispatchConfig,
    channel::OutChainClient,
    codec::Eip155Signer,
    contract::{CStatus, ContractError},
    crypto::SecretKey,
    db::{Db, IndexedRecord, StoreError, TxFilter, TxOrder},
    ledger::LedgerClient,
    tx::{CrossTx, CrossTxReceipt, to_cross_transaction},
};

/// Name of the chaincode function which records a receipt on the source ledger.
pub const COMMIT_FCN: &str = "commit";

struct Inner {
    ledger: Arc<dyn LedgerClient>,
    out_chain: Arc<dyn OutChainClient>,
    db: Arc<Db>,
    key: SecretKey,
    signer: Eip155Signer,
    pending: PriorityQueue<CrossTx>,
    executed: PriorityQueue<CrossTxReceipt>,
    pending_bell: Doorbell,
    executed_bell: Doorbell,
    /// Relayed records whose status could not be stored yet.
    unmarked: Mutex<Vec<String>>,
    stop: watch::Sender<bool>,
}

pub struct TxManager {
    inner: Arc<Inner>,
    bells: Mutex<Option<(mpsc::Receiver<()>, mpsc::Receiver<()>)>>,
    workers: tokio::sync::Mutex<JoinSet<Result<()>>>,
    span: Span,
}

impl TxManager {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        out_chain: Arc<dyn OutChainClient>,
        db: Arc<Db>,
        key: SecretKey,
        chain_id: u64,
        config: &DispatchConfig,
        span: Span,
    ) -> Self {
        let (pending_bell, pending_rx) = doorbell(config.pending_doorbell);
        let (executed_bell, executed_rx) = doorbell(config.executed_doorbell);
        let (stop, _) = watch::channel(false);

        TxManager {
            inner: Arc::new(Inner {
                ledger,
                out_chain,
                db,
                key,
                signer: Eip155Signer::new(chain_id),
                pending: PriorityQueue::new(),
                executed: PriorityQueue::new(),
                pending_bell,
                executed_bell,
                unmarked: Mutex::new(Vec::new()),
                stop,
            }),
            bells: Mutex::new(Some((pending_rx, executed_rx))),
            workers: tokio::sync::Mutex::new(JoinSet::new()),
            span,
        }
    }

    /// Spawns both drain loops and refills the queues from the store.
    pub async fn start(&self) -> Result<()> {
        let (pending_rx, executed_rx) = self
            .bells
            .lock()
            .take()
            .ok_or_else(|| anyhow!("transaction manager already started"))?;

        {
            let mut workers = self.workers.lock().await;
            let inner = self.inner.clone();
            workers.spawn(inner.run_pending(pending_rx).instrument(self.span.clone()));
            let inner = self.inner.clone();
            workers.spawn(inner.run_executed(executed_rx).instrument(self.span.clone()));
        }

        let _enter = self.span.enter();
        self.inner.reload()
    }

    /// Persists a batch of observed records and queues the newly stored ones which still need relaying. Nothing is
    /// queued if the batch cannot be persisted. Records which were already stored are queued by [`TxManager::start`]
    /// if they still need relaying, so a redelivered record is never sent twice.
    pub fn add_cross_txs(&self, batch: Vec<CrossTx>) -> Result<()> {
        let inserted = self.inner.db.cross_txs().save(&batch)?;

        let mut queued = 0;
        for (i, tx) in batch.into_iter().enumerate() {
            if !inserted.contains(&i) || tx.status().is_terminal_event() {
                continue;
            }
            let priority = -tx.timestamp.seconds;
            self.inner.pending.push(tx, priority);
            queued += 1;
        }
        if queued > 0 {
            trace!(queued, "cross txs queued");
            self.inner.pending_bell.ring();
        }
        Ok(())
    }

    /// Queues a receipt for the executed drain loop.
    pub fn push_receipt(&self, receipt: CrossTxReceipt) {
        let priority = -receipt.sequence;
        self.inner.executed.push(receipt, priority);
        self.inner.executed_bell.ring();
    }

    /// Applies a batch of receipts to their records in one transaction.
    pub fn add_cross_tx_receipts(&self, receipts: &[CrossTxReceipt]) -> Result<(), StoreError> {
        let ids: Vec<_> = receipts.iter().map(|r| r.cross_id.clone()).collect();
        let updaters: Vec<_> = receipts
            .iter()
            .map(|r| move |tx: &mut CrossTx| tx.apply_receipt(r))
            .collect();
        self.inner.db.cross_txs().updates(&ids, updaters)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn executed_len(&self) -> usize {
        self.inner.executed.len()
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Resolves when a drain loop exits. Never resolves if none are running.
    pub async fn wait(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        match workers.join_next().await {
            Some(result) => result?,
            None => {
                drop(workers);
                future::pending().await
            }
        }
    }

    /// Stops both drain loops, then closes the ledger and destination clients.
    pub async fn stop(&self) -> Result<()> {
        self.inner.stop.send_replace(true);

        let mut workers = self.workers.lock().await;
        let mut first_error = None;
        while let Some(result) = workers.join_next().await {
            let result = result.map_err(anyhow::Error::from).and_then(|r| r);
            if let Err(e) = result {
                error!(error = %e, "dispatch loop failed");
                first_error.get_or_insert(e);
            }
        }
        drop(workers);

        self.inner.ledger.close().await;
        self.inner.out_chain.close().await;
        info!("transaction manager stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Inner {
    fn reload(&self) -> Result<()> {
        let store = self.db.cross_txs();

        let init = store.query(
            0,
            1,
            TxOrder::Timestamp,
            false,
            &[TxFilter::Status(CStatus::Init)],
        )?;
        let init_count = init.len();
        for tx in init {
            let priority = -tx.timestamp.seconds;
            self.pending.push(tx, priority);
        }

        let executed = store.query(
            0,
            1,
            TxOrder::Timestamp,
            false,
            &[TxFilter::Status(CStatus::Executed)],
        )?;
        let mut receipt_count = 0;
        for tx in executed {
            match tx.receipt() {
                Some(receipt) => {
                    let priority = -receipt.sequence;
                    self.executed.push(receipt, priority);
                    receipt_count += 1;
                }
                None => warn!(cross_id = %tx.cross_id, "executed record has no receipt"),
            }
        }

        info!(pending = init_count, executed = receipt_count, "reloaded cross txs");
        self.pending_bell.ring();
        self.executed_bell.ring();
        Ok(())
    }

    async fn run_pending(self: Arc<Self>, mut bell: mpsc::Receiver<()>) -> Result<()> {
        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                _ = stop.wait_for(|s| *s).map(|_| ()) => break,
                rung = bell.recv() => {
                    if rung.is_none() {
                        break;
                    }
                    self.drain_pending().await;
                }
            }
        }
        debug!("pending loop stopped");
        Ok(())
    }

    async fn run_executed(self: Arc<Self>, mut bell: mpsc::Receiver<()>) -> Result<()> {
        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                _ = stop.wait_for(|s| *s).map(|_| ()) => break,
                rung = bell.recv() => {
                    if rung.is_none() {
                        break;
                    }
                    self.drain_executed().await;
                }
            }
        }
        debug!("executed loop stopped");
        Ok(())
    }

    async fn drain_pending(&self) {
        let batch = self.pending.drain();
        let mut relayed = std::mem::take(&mut *self.unmarked.lock());
        if batch.is_empty() && relayed.is_empty() {
            return;
        }

        for (tx, priority) in batch {
            let Some(unsigned) = to_cross_transaction(&tx) else {
                error!(cross_id = %tx.cross_id, "cross tx has no cross transaction form, dropping");
                continue;
            };
            let signed = match self
                .signer
                .sign(&unsigned, |hash| self.key.sign_recoverable(hash))
            {
                Ok(signed) => signed,
                Err(e) => {
                    error!(cross_id = %tx.cross_id, error = %e, "failed to sign cross transaction, dropping");
                    continue;
                }
            };

            if let Err(e) = self.out_chain.send(&signed).await {
                warn!(cross_id = %tx.cross_id, error = %e, "failed to send cross transaction");
                self.pending.push(tx, priority);
                continue;
            }

            let record = IndexedRecord::new(signed, CStatus::Pending);
            if let Err(e) = self.db.cross_transactions().write(&record) {
                warn!(cross_id = %tx.cross_id, error = %e, "failed to index cross transaction");
            }
            relayed.push(tx.cross_id);
        }

        if relayed.is_empty() {
            return;
        }
        self.mark_relayed(relayed);
    }

    /// Moves relayed records to `Pending`. Records which cannot be updated are retried on the next drain rather than
    /// queued again, since they have already been sent.
    fn mark_relayed(&self, relayed: Vec<String>) {
        let updaters: Vec<_> = relayed.iter().map(|_| mark_pending).collect();
        let error = match self.db.cross_txs().updates(&relayed, updaters) {
            Ok(()) => {
                debug!(count = relayed.len(), "cross txs relayed");
                return;
            }
            Err(e) => e,
        };

        warn!(count = relayed.len(), %error, "failed to mark relayed cross txs as a batch, marking one by one");
        let mut unmarked = Vec::new();
        for cross_id in relayed {
            match self.db.cross_txs().update(&cross_id, mark_pending) {
                Ok(()) => {}
                Err(e @ (StoreError::NotFound | StoreError::Corrupt(_) | StoreError::Rejected { .. })) => {
                    error!(%cross_id, error = %e, "relayed cross tx cannot be marked, giving up");
                }
                Err(e) => {
                    error!(%cross_id, error = %e, "failed to mark relayed cross tx");
                    unmarked.push(cross_id);
                }
            }
        }
        self.unmarked.lock().extend(unmarked);
    }

    async fn drain_executed(&self) {
        for (receipt, priority) in self.executed.drain() {
            let cross_id = receipt.cross_id.clone();
            match self
                .db
                .cross_txs()
                .update(&cross_id, |tx| tx.apply_receipt(&receipt))
            {
                Ok(()) => {}
                Err(StoreError::NotFound) => {
                    info!(%cross_id, "receipt for unknown cross tx, discarding");
                    continue;
                }
                Err(StoreError::Rejected { source, .. }) => {
                    debug!(%cross_id, error = %source, "cross tx is past executed, discarding receipt");
                    continue;
                }
                Err(e) => {
                    warn!(%cross_id, error = %e, "failed to apply receipt");
                    self.executed.push(receipt, priority);
                    continue;
                }
            }

            let args = [receipt.cross_id.clone(), receipt.receipt.clone()];
            match self.ledger.invoke(COMMIT_FCN, &args).await {
                Ok(tx_id) => info!(%cross_id, %tx_id, "receipt committed"),
                Err(e) => error!(%cross_id, error = %e, "failed to commit receipt"),
            }
            // Stays queued until the ledger reports the cross tx as finished.
            self.executed.push(receipt, priority);
        }
    }
}

// A record may have moved on between being queued and being relayed.
fn mark_pending(tx: &mut CrossTx) -> Result<(), ContractError> {
    if tx.status().can_advance_to(CStatus::Pending) {
        tx.update_status(CStatus::Pending)?;
    }
    Ok(())
}
