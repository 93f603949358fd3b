//! The destination side of the relay: the client which delivers signed cross-chain transactions, and the channel
//! which connects it to the peer swarm.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::*;

use crate::codec::{CrossTransaction, ReceptTransaction};

/// A client of the destination chain.
#[async_trait]
pub trait OutChainClient: Send + Sync {
    async fn send(&self, tx: &CrossTransaction) -> Result<()>;

    async fn close(&self);
}

/// A message received from a peer relay node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Cross(CrossTransaction),
    Recept { sequence: i64, recept: ReceptTransaction },
}

/// One end of the channel between the courier and the swarm.
#[derive(Debug)]
pub struct CrossChannel<Out, In> {
    pub outbound: mpsc::Sender<Out>,
    pub inbound: mpsc::Receiver<In>,
}

/// Builds a connected pair: the courier's end sends cross-chain transactions and receives peer messages, the
/// swarm's end the reverse.
pub fn cross_channel(
    capacity: usize,
) -> (
    CrossChannel<CrossTransaction, InboundMessage>,
    CrossChannel<InboundMessage, CrossTransaction>,
) {
    let (to_swarm, from_courier) = mpsc::channel(capacity);
    let (to_courier, from_swarm) = mpsc::channel(capacity);
    (
        CrossChannel {
            outbound: to_swarm,
            inbound: from_swarm,
        },
        CrossChannel {
            outbound: to_courier,
            inbound: from_courier,
        },
    )
}

/// Delivers cross-chain transactions into the swarm through the outbound half of a [`CrossChannel`].
#[derive(Debug, Clone)]
pub struct ChannelOutChainClient {
    outbound: mpsc::Sender<CrossTransaction>,
}

impl ChannelOutChainClient {
    pub fn new(outbound: mpsc::Sender<CrossTransaction>) -> Self {
        ChannelOutChainClient { outbound }
    }
}

#[async_trait]
impl OutChainClient for ChannelOutChainClient {
    async fn send(&self, tx: &CrossTransaction) -> Result<()> {
        self.outbound
            .send(tx.clone())
            .await
            .map_err(|_| anyhow!("cross channel closed"))?;
        debug!(ctx_id = %tx.id(), "sent cross transaction");
        Ok(())
    }

    async fn close(&self) {}
}

/// Records what it is sent. Sends fail while `failing` is set.
#[derive(Debug, Default, Clone)]
pub struct MockOutChainClient {
    sent: Arc<Mutex<Vec<CrossTransaction>>>,
    attempts: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockOutChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<CrossTransaction> {
        self.sent.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutChainClient for MockOutChainClient {
    async fn send(&self, tx: &CrossTransaction) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("destination unavailable"));
        }
        self.sent.lock().push(tx.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
