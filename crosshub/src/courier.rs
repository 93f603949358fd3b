//! The source-ledger side of the relay: the block scanner, the dispatch manager and the receipt intake.

use std::{net::SocketAddr, sync::Arc};

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};
use tracing::*;

use crate::{
    cfg::Config,
    channel::OutChainClient,
    codec::{CodecError, Eip155Signer, ReceptTransaction, verify_recept},
    crypto::SecretKey,
    db::{Db, StoreError, TxFilter},
    dispatch::{TxManager, WorkerPool},
    ledger::LedgerClient,
    scanner::BlockSync,
    tx::CrossTxReceipt,
    webhook::{self, ReceiptSink},
};

/// The spans the courier's components log under.
#[derive(Debug, Clone)]
pub struct CourierSpans {
    pub courier: Span,
    pub scanner: Span,
    pub dispatch: Span,
    pub webhook: Span,
}

impl CourierSpans {
    pub fn none() -> Self {
        CourierSpans {
            courier: Span::none(),
            scanner: Span::none(),
            dispatch: Span::none(),
            webhook: Span::none(),
        }
    }
}

/// Turns receipts into work for the dispatch manager, on a bounded pool of workers.
struct Intake {
    txm: Arc<TxManager>,
    db: Arc<Db>,
    signer: Eip155Signer,
    pool: WorkerPool,
    stopped: watch::Sender<bool>,
}

impl Intake {
    async fn recv_message(&self, receipt: CrossTxReceipt) -> Result<()> {
        let txm = self.txm.clone();
        let stopped = self.stopped.subscribe();
        self.pool
            .submit(async move {
                if *stopped.borrow() {
                    return;
                }
                txm.push_receipt(receipt);
            })
            .await
    }

    async fn recv_recept(&self, sequence: i64, rtx: ReceptTransaction) -> Result<()> {
        let txm = self.txm.clone();
        let db = self.db.clone();
        let signer = self.signer;
        let stopped = self.stopped.subscribe();
        self.pool
            .submit(async move {
                if *stopped.borrow() {
                    return;
                }
                match to_receipt(&db, &signer, sequence, &rtx) {
                    Ok(Some(receipt)) => txm.push_receipt(receipt),
                    Ok(None) => info!(ctx_id = %rtx.id(), "receipt for unknown cross tx, discarding"),
                    Err(e)
                        if e
                            .downcast_ref::<CodecError>()
                            .is_some_and(CodecError::is_invalid_recept) =>
                    {
                        warn!(ctx_id = %rtx.id(), error = %e, "receipt does not match its cross transaction, discarding")
                    }
                    Err(e) => warn!(ctx_id = %rtx.id(), error = %e, "unverifiable receipt, discarding"),
                }
            })
            .await
    }
}

/// Checks a receipt from the destination chain against the cross transaction it acknowledges. The receipt must be
/// signed by the taker it names, and must match the cross transaction this node relayed.
fn to_receipt(
    db: &Db,
    signer: &Eip155Signer,
    sequence: i64,
    rtx: &ReceptTransaction,
) -> Result<Option<CrossTxReceipt>> {
    let taker = signer.sender(rtx)?;
    if rtx.taker.parse::<Address>().ok() != Some(taker) {
        return Err(CodecError::TakerMismatch.into());
    }

    let cross_id = rtx.id().to_string();
    if db.cross_txs().one(TxFilter::CrossId(cross_id.clone()))?.is_none() {
        return Ok(None);
    }
    // Only relayed records have a cross transaction to answer.
    let relayed = match db.cross_transactions().read(rtx.id()) {
        Ok(record) => record.tx,
        Err(StoreError::NotFound) => return Err(CodecError::InvalidRecept.into()),
        Err(e) => return Err(e.into()),
    };
    verify_recept(rtx, &relayed)?;

    debug!(%cross_id, %taker, sequence, "receipt verified");
    Ok(Some(CrossTxReceipt {
        cross_id,
        receipt: rtx.tx_hash.to_string(),
        sequence,
    }))
}

#[async_trait]
impl ReceiptSink for Intake {
    async fn submit(&self, receipt: CrossTxReceipt) -> Result<()> {
        self.recv_message(receipt).await
    }
}

pub struct Courier {
    db: Mutex<Option<Arc<Db>>>,
    txm: Arc<TxManager>,
    scanner: BlockSync,
    intake: Arc<Intake>,
    webhook_addr: Option<SocketAddr>,
    webhook_local_addr: Mutex<Option<SocketAddr>>,
    webhook: tokio::sync::Mutex<JoinSet<Result<()>>>,
    webhook_stop: watch::Sender<bool>,
    spans: CourierSpans,
}

impl Courier {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        out_chain: Arc<dyn OutChainClient>,
        db: Arc<Db>,
        key: SecretKey,
        config: &Config,
        spans: CourierSpans,
    ) -> Result<Self> {
        let txm = Arc::new(TxManager::new(
            ledger.clone(),
            out_chain,
            db.clone(),
            key,
            config.chain_id,
            &config.dispatch,
            spans.dispatch.clone(),
        ));
        let scanner = BlockSync::new(
            ledger,
            txm.clone(),
            db.clone(),
            &config.scanner,
            spans.scanner.clone(),
        )?;
        let (stopped, _) = watch::channel(false);
        let intake = Arc::new(Intake {
            txm: txm.clone(),
            db: db.clone(),
            signer: Eip155Signer::new(config.chain_id),
            pool: WorkerPool::new(config.courier.receipt_workers, spans.courier.clone()),
            stopped,
        });
        let (webhook_stop, _) = watch::channel(false);

        Ok(Courier {
            db: Mutex::new(Some(db)),
            txm,
            scanner,
            intake,
            webhook_addr: config.courier.webhook,
            webhook_local_addr: Mutex::new(None),
            webhook: tokio::sync::Mutex::new(JoinSet::new()),
            webhook_stop,
            spans,
        })
    }

    /// Starts the dispatch manager, then the scanner, then the webhook if one is configured.
    pub async fn start(&self) -> Result<()> {
        self.txm.start().await?;
        self.scanner.start().await;

        if let Some(addr) = self.webhook_addr {
            let listener = TcpListener::bind(addr).await?;
            *self.webhook_local_addr.lock() = Some(listener.local_addr()?);
            let sink: Arc<dyn ReceiptSink> = self.intake.clone();
            self.webhook.lock().await.spawn(
                webhook::serve(listener, sink, self.webhook_stop.subscribe())
                    .instrument(self.spans.webhook.clone()),
            );
        }
        info!(parent: &self.spans.courier, "courier started");
        Ok(())
    }

    /// The address the webhook is listening on, once started.
    pub fn webhook_addr(&self) -> Option<SocketAddr> {
        *self.webhook_local_addr.lock()
    }

    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.txm
    }

    /// Queues a receipt reported by the destination side.
    pub async fn recv_message(&self, receipt: CrossTxReceipt) -> Result<()> {
        self.intake.recv_message(receipt).await
    }

    /// Verifies a signed receipt from a peer and queues it.
    pub async fn recv_recept(&self, sequence: i64, rtx: ReceptTransaction) -> Result<()> {
        self.intake.recv_recept(sequence, rtx).await
    }

    /// Resolves when any component exits. Any exit before [`Courier::stop`] is fatal to the node.
    pub async fn wait(&self) -> Result<()> {
        let webhook = async {
            let mut tasks = self.webhook.lock().await;
            match tasks.join_next().await {
                Some(result) => result.map_err(anyhow::Error::from).and_then(|r| r),
                None => {
                    drop(tasks);
                    std::future::pending().await
                }
            }
        };
        tokio::select! {
            result = self.txm.wait() => result,
            result = self.scanner.wait() => result,
            result = webhook => result,
        }
    }

    pub async fn stop(&self) {
        self.scanner.stop().await;

        self.webhook_stop.send_replace(true);
        let mut webhook = self.webhook.lock().await;
        while let Some(result) = webhook.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(parent: &self.spans.webhook, error = %e, "webhook failed"),
                Err(e) => error!(parent: &self.spans.webhook, error = %e, "webhook panicked"),
            }
        }
        drop(webhook);

        self.intake.stopped.send_replace(true);
        self.intake.pool.shutdown().await;

        if let Err(e) = self.txm.stop().await {
            error!(parent: &self.spans.courier, error = %e, "transaction manager failed");
        }
        self.db.lock().take();
        info!(parent: &self.spans.courier, "courier stopped");
    }
}
