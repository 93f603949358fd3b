//! A relay node: the peer swarm and the courier, connected by a [`CrossChannel`](crate::channel::CrossChannel).

use std::{net::SocketAddr, num::NonZeroUsize, sync::Arc};

use anyhow::Result;
use lru::LruCache;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::*;

use crate::{
    cfg::Config,
    channel::{ChannelOutChainClient, InboundMessage, cross_channel},
    codec::{CodecError, CrossTransaction, Eip155Signer, ReceptTransaction, Signatures},
    contract::CStatus,
    courier::{Courier, CourierSpans},
    crypto::{Hash, SecretKey},
    db::{Db, IndexedRecord},
    ledger::DirectoryLedger,
    swarm::{Certificates, Swarm},
};

pub struct Node {
    db: Arc<Db>,
    courier: Arc<Courier>,
    swarm: Arc<Swarm>,
    listen_addr: SocketAddr,
    pump: tokio::sync::Mutex<JoinSet<()>>,
    stop: watch::Sender<bool>,
}

impl Node {
    /// Builds and starts every component of a node.
    pub async fn launch(config: Config, secret_key: SecretKey) -> Result<Node> {
        info!(address = %secret_key.address()?, chain_id = config.chain_id, "launching node");

        let db = Arc::new(Db::new(config.data_dir.as_ref(), config.cache_size)?);
        let ledger = Arc::new(DirectoryLedger::new(
            config.ledger.blocks_dir.clone(),
            config.ledger.filter_events.clone(),
        ));
        let certs = Certificates::load(
            &config.swarm.ca_cert,
            &config.swarm.agency_cert,
            &config.swarm.node_cert,
        )?;

        let (courier_end, swarm_end) = cross_channel(config.swarm.channel_capacity);
        let swarm = Arc::new(Swarm::new(
            &config.swarm,
            certs,
            swarm_end,
            info_span!("swarm", peer_id = %config.swarm.peer_id),
        ));
        let spans = CourierSpans {
            courier: info_span!("courier"),
            scanner: info_span!("scanner"),
            dispatch: info_span!("dispatch"),
            webhook: info_span!("webhook"),
        };
        let courier = Arc::new(Courier::new(
            ledger,
            Arc::new(ChannelOutChainClient::new(courier_end.outbound)),
            db.clone(),
            secret_key,
            &config,
            spans.clone(),
        )?);

        let listen_addr = swarm.start().await?;
        courier.start().await?;

        let (stop, _) = watch::channel(false);
        let mut pump = JoinSet::new();
        pump.spawn(
            inbound_pump(
                courier_end.inbound,
                courier.clone(),
                db.clone(),
                Eip155Signer::new(config.chain_id),
                config.cache_size,
                stop.subscribe(),
            )
            .instrument(spans.courier),
        );

        Ok(Node {
            db,
            courier,
            swarm,
            listen_addr,
            pump: tokio::sync::Mutex::new(pump),
            stop,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn courier(&self) -> &Arc<Courier> {
        &self.courier
    }

    pub fn swarm(&self) -> &Arc<Swarm> {
        &self.swarm
    }

    /// Broadcasts a signed receipt to the other nodes.
    pub async fn send_recept(&self, sequence: i64, recept: ReceptTransaction) -> Result<()> {
        self.swarm.send_recept(sequence, recept).await
    }

    /// Resolves when a component of the courier exits.
    pub async fn wait(&self) -> Result<()> {
        self.courier.wait().await
    }

    /// Stops the courier, then the swarm.
    pub async fn stop(&self) {
        self.courier.stop().await;

        self.stop.send_replace(true);
        let mut pump = self.pump.lock().await;
        while let Some(result) = pump.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "inbound pump panicked");
            }
        }
        drop(pump);

        self.swarm.stop().await;
        info!("node stopped");
    }
}

/// Hands messages from peers to the courier.
async fn inbound_pump(
    mut inbound: mpsc::Receiver<InboundMessage>,
    courier: Arc<Courier>,
    db: Arc<Db>,
    signer: Eip155Signer,
    cache_size: usize,
    mut stop: watch::Receiver<bool>,
) {
    let mut seen = LruCache::new(NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN));
    loop {
        let message = tokio::select! {
            _ = stop.wait_for(|s| *s) => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        match message {
            InboundMessage::Cross(tx) => accept_cross(&db, &signer, &mut seen, tx),
            InboundMessage::Recept { sequence, recept } => {
                if let Err(e) = courier.recv_recept(sequence, recept).await {
                    debug!(error = %e, "courier is no longer accepting receipts");
                    break;
                }
            }
        }
    }
}

/// Stores the first copy of a cross transaction relayed by a peer. Later copies only contribute their signature,
/// and must carry the same content.
fn accept_cross(
    db: &Db,
    signer: &Eip155Signer,
    seen: &mut LruCache<Hash, Signatures>,
    tx: CrossTransaction,
) {
    let ctx_id = tx.id();
    let sender = match signer.sender(&tx) {
        Ok(sender) => sender,
        Err(e) => {
            warn!(%ctx_id, error = %e, "peer sent an unverifiable cross transaction");
            return;
        }
    };

    if let Some(signatures) = seen.get_mut(&ctx_id) {
        match signatures.add_signature(&tx) {
            Ok(()) => debug!(%ctx_id, %sender, signatures = signatures.len(), "collected peer signature"),
            Err(CodecError::DuplicateSign) => trace!(%ctx_id, %sender, "duplicate peer signature"),
            Err(e) => warn!(%ctx_id, %sender, error = %e, "peer sent a conflicting cross transaction"),
        }
        return;
    }

    let record = IndexedRecord::new(tx.clone(), CStatus::Pending);
    match db.cross_transactions().write_batch(&[record], false) {
        Ok(()) => {
            debug!(%ctx_id, %sender, "stored peer cross transaction");
            seen.put(ctx_id, Signatures::new(tx));
        }
        Err(e) => warn!(%ctx_id, error = %e, "failed to store peer cross transaction"),
    }
}
