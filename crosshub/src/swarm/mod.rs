//! The peer swarm: authenticated TCP connections to the other relay nodes.
//!
//! Connections are established by a handshake in which both sides exchange their certificate chains. Once a peer
//! is connected, signed cross-chain transactions and receipts are broadcast to it as framed messages.

pub mod certs;
pub mod message;

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use futures::{FutureExt, future::BoxFuture};
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, watch},
    task::JoinSet,
    time::{sleep, timeout},
};
use tracing::*;

pub use self::{
    certs::{CertError, Certificates},
    message::{CERT_MSG, CTX_SIGN_MSG, CertsMessage, GET_CERT_MSG, RTX_SIGN_MSG, ReceiptEnvelope},
};
use crate::{
    cfg::SwarmConfig,
    channel::{CrossChannel, InboundMessage},
    codec::{CrossTransaction, ReceptTransaction},
    transport::{FramedStream, Msg, read_msg},
};

/// Failed connection attempts are only logged once per this many attempts.
const LOG_EVERY_ATTEMPTS: u64 = 5;

type Writer = Arc<tokio::sync::Mutex<FramedStream<OwnedWriteHalf>>>;

struct Inner {
    peer_id: String,
    /// Configured peers, by id.
    peers: HashMap<String, SocketAddr>,
    certs: Certificates,
    connected: DashMap<String, Writer>,
    inbound: mpsc::Sender<InboundMessage>,
    retry_interval: Duration,
    send_timeout: Duration,
    stop: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
    span: Span,
}

pub struct Swarm {
    inner: Arc<Inner>,
    listen_addr: SocketAddr,
    outbound: Mutex<Option<mpsc::Receiver<CrossTransaction>>>,
}

impl Swarm {
    /// `channel` is the swarm's end of the [`CrossChannel`]: messages from peers are sent out of it and signed
    /// cross-chain transactions to broadcast arrive on it.
    pub fn new(
        config: &SwarmConfig,
        certs: Certificates,
        channel: CrossChannel<InboundMessage, CrossTransaction>,
        span: Span,
    ) -> Self {
        let peers = config
            .peers
            .iter()
            .filter(|p| p.id != config.peer_id)
            .map(|p| (p.id.clone(), p.addr))
            .collect();
        let (stop, _) = watch::channel(false);

        Swarm {
            inner: Arc::new(Inner {
                peer_id: config.peer_id.clone(),
                peers,
                certs,
                connected: DashMap::new(),
                inbound: channel.outbound,
                retry_interval: config.retry_interval,
                send_timeout: config.send_timeout,
                stop,
                tasks: Mutex::new(JoinSet::new()),
                span,
            }),
            listen_addr: config.listen_addr,
            outbound: Mutex::new(Some(channel.inbound)),
        }
    }

    /// Starts listening, dials every configured peer and starts relaying the outbound channel. Returns the
    /// address the swarm listens on.
    pub async fn start(&self) -> Result<SocketAddr> {
        let outbound = self
            .outbound
            .lock()
            .take()
            .ok_or_else(|| anyhow!("swarm already started"))?;
        let listener = TcpListener::bind(self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(parent: &self.inner.span, %local_addr, peer_id = %self.inner.peer_id, "swarm listening");

        self.inner.spawn(self.inner.clone().accept_loop(listener));
        self.inner.spawn(self.inner.clone().event_loop(outbound));
        for id in self.inner.peers.keys() {
            self.inner.spawn(self.inner.clone().connect(id.clone()));
        }
        Ok(local_addr)
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Ids of the peers with an established connection.
    pub fn connected_peers(&self) -> Vec<String> {
        self.inner
            .connected
            .iter()
            .map(|e| e.key().clone())
            .sorted()
            .collect()
    }

    pub async fn broadcast(&self, msg: &Msg) {
        self.inner.broadcast(msg).await
    }

    /// Broadcasts a receipt to every connected peer.
    pub async fn send_recept(&self, sequence: i64, recept: ReceptTransaction) -> Result<()> {
        let msg = Msg::encode(RTX_SIGN_MSG, &ReceiptEnvelope { sequence, recept })?;
        self.inner.broadcast(&msg).await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(parent: &self.inner.span, error = %e, "swarm task panicked");
            }
        }
        self.inner.connected.clear();
        info!(parent: &self.inner.span, "swarm stopped");
    }
}

impl Inner {
    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.stopped() {
            return;
        }
        self.tasks.lock().spawn(task.instrument(self.span.clone()));
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                _ = stop.wait_for(|s| *s) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "accepted connection");
                        let (read, write) = stream.into_split();
                        let writer = Arc::new(tokio::sync::Mutex::new(FramedStream::new(write, self.send_timeout)));
                        self.spawn(self.clone().read_loop(read, writer, None));
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
            }
        }
    }

    /// Dials `id` until a handshake succeeds, the peer connects to us first, or the swarm stops. Boxed, since a
    /// connection's read loop restarts this routine when the connection fails.
    fn connect(self: Arc<Self>, id: String) -> BoxFuture<'static, ()> {
        async move { self.dial(id).await }.boxed()
    }

    async fn dial(self: Arc<Self>, id: String) {
        let Some(addr) = self.peers.get(&id).copied() else {
            return;
        };
        let mut stop = self.stop.subscribe();
        let mut attempt: u64 = 0;

        loop {
            if self.stopped() || self.connected.contains_key(&id) {
                return;
            }
            attempt += 1;
            match self.handshake(&id, addr).await {
                Ok((read, writer)) => {
                    info!(peer = %id, %addr, attempt, "connected to peer");
                    self.connected.insert(id.clone(), writer.clone());
                    self.spawn(self.clone().read_loop(read, writer, Some(id)));
                    return;
                }
                Err(e) if attempt % LOG_EVERY_ATTEMPTS == 0 => {
                    warn!(peer = %id, %addr, attempt, error = %e, "failed to connect to peer");
                }
                Err(e) => trace!(peer = %id, attempt, error = %e, "failed to connect to peer"),
            }

            tokio::select! {
                _ = stop.wait_for(|s| *s) => return,
                _ = sleep(self.retry_interval) => {}
            }
        }
    }

    async fn handshake(&self, id: &str, addr: SocketAddr) -> Result<(OwnedReadHalf, Writer)> {
        let stream = timeout(self.send_timeout, TcpStream::connect(addr)).await??;
        let (mut read, write) = stream.into_split();
        let mut writer = FramedStream::new(write, self.send_timeout);

        writer
            .send(&Msg::encode(GET_CERT_MSG, &self.certs.bundle(&self.peer_id))?)
            .await?;
        let reply = read_msg(&mut read, Some(self.send_timeout)).await?;
        if reply.code != CERT_MSG {
            return Err(anyhow!("expected certificates, got message code {}", reply.code));
        }
        let bundle: CertsMessage = reply.decode()?;
        self.certs.verify(&bundle)?;
        if bundle.id != id {
            return Err(anyhow!("peer at {addr} presented id {}", bundle.id));
        }
        Ok((read, Arc::new(tokio::sync::Mutex::new(writer))))
    }

    /// Reads messages from one connection until it fails or the swarm stops. `peer` is known up front for
    /// connections we dialed, and learned from the handshake for connections we accepted.
    async fn read_loop(self: Arc<Self>, read: OwnedReadHalf, writer: Writer, mut peer: Option<String>) {
        let mut stop = self.stop.subscribe();
        let mut reader = FramedStream::new(read, self.send_timeout);

        loop {
            let msg = tokio::select! {
                _ = stop.wait_for(|s| *s) => return,
                msg = reader.recv() => msg,
            };
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(peer = ?peer, error = %e, "connection closed");
                    break;
                }
            };

            match self.handle(msg, &writer, &mut peer).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(peer = ?peer, error = %e, "dropping connection");
                    break;
                }
            }
        }

        // Forget the connection, unless it has already been replaced.
        if let Some(id) = peer {
            let removed = self
                .connected
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &writer))
                .is_some();
            if removed {
                self.spawn(self.clone().connect(id));
            }
        }
    }

    /// Handles one message. Returns `false` if the message channel has closed.
    ///
    /// Until the remote side has presented a verified certificate bundle, only `GET_CERT_MSG` is accepted. Anything
    /// else fails the connection.
    async fn handle(&self, msg: Msg, writer: &Writer, peer: &mut Option<String>) -> Result<bool> {
        match (msg.code, peer.as_ref()) {
            (GET_CERT_MSG, Some(id)) => {
                return Err(anyhow!("peer {id} repeated the handshake"));
            }
            (GET_CERT_MSG, None) => {}
            (code, None) => {
                return Err(anyhow!("message code {code} before the handshake"));
            }
            (_, Some(_)) => {}
        }

        match msg.code {
            GET_CERT_MSG => {
                let bundle: CertsMessage = msg.decode()?;
                self.certs.verify(&bundle)?;
                if !self.peers.contains_key(&bundle.id) {
                    return Err(anyhow!("unknown peer {}", bundle.id));
                }
                writer
                    .lock()
                    .await
                    .send(&Msg::encode(CERT_MSG, &self.certs.bundle(&self.peer_id))?)
                    .await?;
                info!(peer = %bundle.id, "peer connected");
                self.connected.insert(bundle.id.clone(), writer.clone());
                *peer = Some(bundle.id);
            }
            CTX_SIGN_MSG => {
                let tx: CrossTransaction = msg.decode()?;
                trace!(peer = ?peer, ctx_id = %tx.id(), "received cross transaction");
                if self.inbound.send(InboundMessage::Cross(tx)).await.is_err() {
                    return Ok(false);
                }
            }
            RTX_SIGN_MSG => {
                let envelope: ReceiptEnvelope = msg.decode()?;
                trace!(peer = ?peer, ctx_id = %envelope.recept.id(), "received receipt");
                let inbound = InboundMessage::Recept {
                    sequence: envelope.sequence,
                    recept: envelope.recept,
                };
                if self.inbound.send(inbound).await.is_err() {
                    return Ok(false);
                }
            }
            code => debug!(peer = ?peer, code, "ignoring message with unknown code"),
        }
        Ok(true)
    }

    async fn event_loop(self: Arc<Self>, mut outbound: mpsc::Receiver<CrossTransaction>) {
        let mut stop = self.stop.subscribe();
        loop {
            let tx = tokio::select! {
                _ = stop.wait_for(|s| *s) => break,
                tx = outbound.recv() => match tx {
                    Some(tx) => tx,
                    None => break,
                },
            };
            match Msg::encode(CTX_SIGN_MSG, &tx) {
                Ok(msg) => self.broadcast(&msg).await,
                Err(e) => error!(ctx_id = %tx.id(), error = %e, "failed to encode cross transaction"),
            }
        }
    }

    async fn broadcast(self: &Arc<Self>, msg: &Msg) {
        let peers: Vec<_> = self
            .connected
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (id, writer) in peers {
            let result = writer.lock().await.send(msg).await;
            if let Err(e) = result {
                warn!(peer = %id, code = msg.code, error = %e, "failed to send message, reconnecting");
                let removed = self
                    .connected
                    .remove_if(&id, |_, current| Arc::ptr_eq(current, &writer))
                    .is_some();
                if removed {
                    self.spawn(self.clone().connect(id));
                }
            }
        }
    }
}
