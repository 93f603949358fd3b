//! Follows the source ledger block by block and feeds the contracts it emits into the dispatch manager.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use futures::FutureExt;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinSet,
    time::{Instant, sleep},
};
use tracing::*;

use crate::{
    cfg::ScannerConfig,
    contract::Contract,
    db::Db,
    dispatch::TxManager,
    ledger::{Block, HeaderType, LedgerClient, Validation, is_not_yet_produced},
    tx::{CrossTx, Timestamp},
};

/// Checkpoint key of the next block to scan.
pub const CHECKPOINT_KEY: &str = "number";

/// A scanned batch, and where to report whether it was ingested.
type Handoff = (Vec<PrepareCrossTx>, oneshot::Sender<Result<()>>);

pub const PRECOMMIT_EVENT: &str = "precommit";
pub const COMMIT_EVENT: &str = "commit";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("block {0} has no cross-chain events")]
    Ignore(u64),
    #[error("block {0} has not been produced yet")]
    NotYetProduced(u64),
    #[error("unsupported filter event: {0}")]
    UnsupportedEvent(String),
    #[error("query of block {number} failed: {source}")]
    Query {
        number: u64,
        source: anyhow::Error,
    },
}

/// A chaincode event which carries a contract, together with where it was emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareCrossTx {
    pub block_number: u64,
    pub tx_id: String,
    pub timestamp: Timestamp,
    pub event_name: String,
    pub payload: Vec<u8>,
}

/// Selects the first chaincode event of every valid endorser transaction in `block`, keeping those named in
/// `filter`.
pub fn get_prepare_cross_txs(block: &Block, filter: &[String]) -> Result<Vec<PrepareCrossTx>, ScanError> {
    let prepared: Vec<_> = block
        .transactions
        .iter()
        .filter(|tx| tx.validation == Validation::Valid)
        .filter(|tx| tx.header_type == HeaderType::EndorserTransaction)
        .filter_map(|tx| {
            let event = tx.events.first()?;
            filter.contains(&event.event_name).then(|| PrepareCrossTx {
                block_number: block.number,
                tx_id: tx.tx_id.clone(),
                timestamp: tx.timestamp,
                event_name: event.event_name.clone(),
                payload: event.payload.clone(),
            })
        })
        .collect();

    if prepared.is_empty() {
        return Err(ScanError::Ignore(block.number));
    }
    Ok(prepared)
}

struct Inner {
    ledger: Arc<dyn LedgerClient>,
    txm: Arc<TxManager>,
    db: Arc<Db>,
    filter: Vec<String>,
    interval: Duration,
    stop: watch::Sender<bool>,
}

/// The block scanner.
pub struct BlockSync {
    inner: Arc<Inner>,
    start_block: u64,
    tasks: tokio::sync::Mutex<JoinSet<Result<()>>>,
    span: Span,
}

impl BlockSync {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        txm: Arc<TxManager>,
        db: Arc<Db>,
        config: &ScannerConfig,
        span: Span,
    ) -> Result<Self, ScanError> {
        let filter = ledger.filter_events();
        if let Some(event) = filter
            .iter()
            .find(|e| *e != PRECOMMIT_EVENT && *e != COMMIT_EVENT)
        {
            return Err(ScanError::UnsupportedEvent(event.clone()));
        }

        let start_block = match db.config().get(CHECKPOINT_KEY) {
            0 => 1,
            n => n,
        };
        let (stop, _) = watch::channel(false);

        Ok(BlockSync {
            inner: Arc::new(Inner {
                ledger,
                txm,
                db,
                filter,
                interval: config.block_interval,
                stop,
            }),
            start_block,
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            span,
        })
    }

    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    pub async fn start(&self) {
        let (batch_tx, batch_rx) = mpsc::channel(1);

        let mut tasks = self.tasks.lock().await;
        tasks.spawn(
            self.inner
                .clone()
                .scan(self.start_block, batch_tx)
                .instrument(self.span.clone()),
        );
        tasks.spawn(self.inner.clone().parse(batch_rx).instrument(self.span.clone()));
        info!(parent: &self.span, from = self.start_block, "scanner started");
    }

    /// Resolves with the first failure of a scanner loop, or once both loops have exited cleanly. Never resolves if
    /// the scanner is not running.
    pub async fn wait(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            drop(tasks);
            return std::future::pending().await;
        }
        while let Some(result) = tasks.join_next().await {
            result??;
        }
        Ok(())
    }

    /// Stops both loops. Calling this more than once is harmless.
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(parent: &self.span, error = %e, "scanner had already failed"),
                Err(e) => error!(parent: &self.span, error = %e, "scanner task panicked"),
            }
        }
    }
}

impl Inner {
    async fn scan_block(&self, number: u64) -> Result<Vec<PrepareCrossTx>, ScanError> {
        let block = self.ledger.query_block(number).await.map_err(|source| {
            if is_not_yet_produced(&source) {
                ScanError::NotYetProduced(number)
            } else {
                ScanError::Query { number, source }
            }
        })?;
        get_prepare_cross_txs(&block, &self.filter)
    }

    /// Scans from `number` onwards. The checkpoint only moves past a block once the parse loop has ingested it.
    async fn scan(self: Arc<Self>, mut number: u64, batches: mpsc::Sender<Handoff>) -> Result<()> {
        let mut stop = self.stop.subscribe();
        let timer = sleep(Duration::ZERO);
        tokio::pin!(timer);

        let result = loop {
            tokio::select! {
                _ = stop.wait_for(|s| *s).map(|_| ()) => break Ok(()),
                () = &mut timer => {
                    if let Err(e) = self.db.config().set(CHECKPOINT_KEY, number) {
                        error!(number, error = %e, "failed to persist checkpoint, stopping scanner");
                        break Err(e.into());
                    }

                    match self.scan_block(number).await {
                        Ok(batch) => {
                            let delay = match batch.first() {
                                Some(first) if first.timestamp.elapsed() > self.interval => Duration::ZERO,
                                _ => self.interval,
                            };
                            debug!(number, count = batch.len(), "scanned block");
                            let (ack, ingested) = oneshot::channel();
                            tokio::select! {
                                _ = stop.wait_for(|s| *s).map(|_| ()) => break Ok(()),
                                sent = batches.send((batch, ack)) => {
                                    if sent.is_err() {
                                        break Err(anyhow!("parse loop exited"));
                                    }
                                }
                            }
                            let ingested = tokio::select! {
                                _ = stop.wait_for(|s| *s).map(|_| ()) => break Ok(()),
                                ingested = ingested => ingested,
                            };
                            match ingested {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    error!(number, error = %e, "failed to ingest cross txs, stopping scanner");
                                    break Err(e);
                                }
                                Err(_) => break Err(anyhow!("parse loop exited")),
                            }
                            number += 1;
                            timer.as_mut().reset(Instant::now() + delay);
                        }
                        Err(ScanError::Ignore(_)) => {
                            trace!(number, "ignored block");
                            number += 1;
                            timer.as_mut().reset(Instant::now() + self.interval);
                        }
                        Err(ScanError::NotYetProduced(_)) => {
                            trace!(number, "waiting for block");
                            timer.as_mut().reset(Instant::now() + self.interval);
                        }
                        Err(e) => {
                            error!(number, error = %e, "failed to scan block, stopping scanner");
                            break Err(e.into());
                        }
                    }
                }
            }
        };

        // Wakes the parse loop, which exits once `batches` is dropped.
        self.stop.send_replace(true);
        result
    }

    async fn parse(self: Arc<Self>, mut batches: mpsc::Receiver<Handoff>) -> Result<()> {
        while let Some((batch, ack)) = batches.recv().await {
            let result = self.ingest(batch);
            let failed = result.is_err();
            // The scan loop reports the failure.
            let _ = ack.send(result);
            if failed {
                break;
            }
        }
        Ok(())
    }

    fn ingest(&self, batch: Vec<PrepareCrossTx>) -> Result<()> {
        let txs = batch
            .into_iter()
            .map(|prepared| {
                let contract = Contract::decode(&prepared.payload)?;
                trace!(
                    tx_id = %prepared.tx_id,
                    event = %prepared.event_name,
                    status = %contract.status(),
                    "decoded contract"
                );
                Ok(CrossTx::new(
                    contract,
                    prepared.tx_id,
                    prepared.block_number,
                    prepared.timestamp,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        self.txm.add_cross_txs(txs)
    }
}
