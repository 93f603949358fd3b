use std::time::Duration;

use alloy::primitives::U256;
use crosshub::{
    channel::{CrossChannel, InboundMessage, cross_channel},
    codec::{CrossTransaction, CrossTransactionData, Eip155Signer, ReceptTransaction, ReceptTransactionData},
    crypto::{Hash, SecretKey},
    swarm::{CTX_SIGN_MSG, Certificates, RTX_SIGN_MSG, ReceiptEnvelope, Swarm},
    transport::{Msg, read_msg, write_msg},
};
use rand_chacha::ChaCha8Rng;
use tokio::net::TcpStream;
use tracing::Span;

use crate::{Authority, eventually, free_addr, peer, swarm_config};

fn swarm(
    id: &str,
    addr: std::net::SocketAddr,
    peers: Vec<crosshub::cfg::PeerConfig>,
    certs: Certificates,
) -> (Swarm, CrossChannel<CrossTransaction, InboundMessage>) {
    let (courier_end, swarm_end) = cross_channel(16);
    let swarm = Swarm::new(&swarm_config(id, addr, peers), certs, swarm_end, Span::none());
    (swarm, courier_end)
}

fn signed_cross_transaction(key: &SecretKey, chain_id: u64) -> CrossTransaction {
    let unsigned = CrossTransaction::new(CrossTransactionData::unsigned(
        Hash::from_u64(0xaa01),
        Hash::from_u64(0xcc03),
        Hash::from_u64(9),
        U256::from(100u64),
        U256::from(1u64),
        "0xmaker".to_owned(),
        String::new(),
        2,
        5,
        b"{}".to_vec(),
    ));
    Eip155Signer::new(chain_id)
        .sign(&unsigned, |h| key.sign_recoverable(h))
        .unwrap()
}

fn signed_recept(key: &SecretKey, chain_id: u64) -> ReceptTransaction {
    let unsigned = ReceptTransaction::new(ReceptTransactionData::unsigned(
        Hash::from_u64(0xaa01),
        Hash::from_u64(0xbb02),
        "0xmaker".to_owned(),
        String::new(),
        "0xtaker".to_owned(),
        2,
        5,
        vec![],
    ));
    Eip155Signer::new(chain_id)
        .sign(&unsigned, |h| key.sign_recoverable(h))
        .unwrap()
}

#[crosshub_macros::test]
async fn peers_handshake_and_exchange_messages(mut rng: ChaCha8Rng) {
    let ca = Authority::new("ca");
    let (addr1, addr2) = (free_addr(), free_addr());
    let (swarm1, mut end1) = swarm("node1", addr1, vec![peer("node2", addr2)], ca.certificates("node1"));
    let (swarm2, mut end2) = swarm("node2", addr2, vec![peer("node1", addr1)], ca.certificates("node2"));
    swarm1.start().await.unwrap();
    swarm2.start().await.unwrap();

    eventually("the handshake", || {
        swarm1.connected_peers() == ["node2"] && swarm2.connected_peers() == ["node1"]
    })
    .await;

    let key = SecretKey::new_from_rng(&mut rng).unwrap();
    let tx = signed_cross_transaction(&key, 5);
    end1.outbound.send(tx.clone()).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), end2.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, InboundMessage::Cross(tx.clone()));
    // The signature survives the trip.
    let InboundMessage::Cross(received) = received else {
        unreachable!()
    };
    assert_eq!(Eip155Signer::new(5).sender(&received).unwrap(), key.address().unwrap());

    let recept = signed_recept(&key, 5);
    swarm2.send_recept(3, recept.clone()).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), end1.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, InboundMessage::Recept { sequence: 3, recept });

    swarm1.stop().await;
    swarm2.stop().await;
    assert!(swarm1.connected_peers().is_empty());
}

#[crosshub_macros::test]
async fn peers_from_a_foreign_authority_are_refused(_rng: ChaCha8Rng) {
    let (addr1, addr2) = (free_addr(), free_addr());
    let (swarm1, _end1) = swarm(
        "node1",
        addr1,
        vec![peer("node2", addr2)],
        Authority::new("ca").certificates("node1"),
    );
    let (swarm2, _end2) = swarm(
        "node2",
        addr2,
        vec![peer("node1", addr1)],
        Authority::new("rogue").certificates("node2"),
    );
    swarm1.start().await.unwrap();
    swarm2.start().await.unwrap();

    // Both sides keep dialing and keep failing verification.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(swarm1.connected_peers().is_empty());
    assert!(swarm2.connected_peers().is_empty());

    swarm1.stop().await;
    swarm2.stop().await;
}

#[crosshub_macros::test]
async fn messages_before_the_handshake_are_refused(mut rng: ChaCha8Rng) {
    let ca = Authority::new("ca");
    let addr = free_addr();
    let (swarm1, mut end1) = swarm("node1", addr, vec![peer("node2", free_addr())], ca.certificates("node1"));
    swarm1.start().await.unwrap();

    // A well-formed, properly signed transaction, but sent by a client that never presented certificates.
    let key = SecretKey::new_from_rng(&mut rng).unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let deadline = Duration::from_secs(2);
    write_msg(
        &mut stream,
        &Msg::encode(CTX_SIGN_MSG, &signed_cross_transaction(&key, 5)).unwrap(),
        deadline,
    )
    .await
    .unwrap();

    // The connection is closed and nothing is forwarded.
    assert!(read_msg(&mut stream, Some(deadline)).await.is_err());
    assert!(
        tokio::time::timeout(Duration::from_millis(300), end1.inbound.recv())
            .await
            .is_err()
    );

    // Receipts are refused the same way.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let envelope = ReceiptEnvelope {
        sequence: 1,
        recept: signed_recept(&key, 5),
    };
    write_msg(&mut stream, &Msg::encode(RTX_SIGN_MSG, &envelope).unwrap(), deadline)
        .await
        .unwrap();
    assert!(read_msg(&mut stream, Some(deadline)).await.is_err());
    assert!(
        tokio::time::timeout(Duration::from_millis(300), end1.inbound.recv())
            .await
            .is_err()
    );
    assert!(swarm1.connected_peers().is_empty());

    swarm1.stop().await;
}
