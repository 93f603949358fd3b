use std::{net::SocketAddr, path::Path, time::Duration};

use crosshub::{
    cfg::{Config, CourierConfig, DispatchConfig, LedgerConfig, ScannerConfig, SwarmConfig, filter_events_default},
    codec::{Eip155Signer, ReceptTransaction, ReceptTransactionData},
    contract::CStatus,
    crypto::{Hash, SecretKey},
    db::TxFilter,
    dispatch::COMMIT_FCN,
    ledger::{Block, DirectoryLedger},
    node::Node,
    tx::Timestamp,
    webhook::RECEIPT_PATH,
};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{Authority, event_tx, eventually, free_addr, peer};

const CHAIN_ID: u64 = 5;

fn config(dir: &Path, swarm: SwarmConfig) -> Config {
    let blocks_dir = dir.join("blocks");
    std::fs::create_dir_all(&blocks_dir).unwrap();
    Config {
        chain_id: CHAIN_ID,
        data_dir: Some(dir.join("data").to_string_lossy().into_owned()),
        cache_size: 64,
        ledger: LedgerConfig {
            blocks_dir,
            filter_events: filter_events_default(),
        },
        scanner: ScannerConfig {
            block_interval: Duration::from_millis(50),
        },
        dispatch: DispatchConfig::default(),
        courier: CourierConfig {
            receipt_workers: 4,
            webhook: Some("127.0.0.1:0".parse().unwrap()),
        },
        swarm,
    }
}

fn status_of(node: &Node, cross_id: &str) -> Option<CStatus> {
    node.db()
        .cross_txs()
        .one(TxFilter::CrossId(cross_id.to_owned()))
        .unwrap()
        .map(|tx| tx.status())
}

async fn commits(ledger: &DirectoryLedger) -> Vec<Vec<String>> {
    ledger
        .invocations()
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.fcn == COMMIT_FCN)
        .map(|i| i.args)
        .collect()
}

/// Posts a receipt to the webhook over a bare HTTP/1.1 connection and returns the status line.
async fn post_receipt(addr: SocketAddr, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST {RECEIPT_PATH} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response.lines().next().unwrap_or_default().to_owned()
}

#[crosshub_macros::test]
async fn precommit_is_relayed_committed_and_finalized(mut rng: ChaCha8Rng) {
    let dir = tempfile::tempdir().unwrap();
    let ca = Authority::new("ca");
    let (addr1, addr2) = (free_addr(), free_addr());
    let config1 = config(
        &dir.path().join("node1"),
        ca.write_chain(&dir.path().join("node1/certs"), "node1", addr1, vec![peer("node2", addr2)]),
    );
    let config2 = config(
        &dir.path().join("node2"),
        ca.write_chain(&dir.path().join("node2/certs"), "node2", addr2, vec![peer("node1", addr1)]),
    );
    let source = DirectoryLedger::new(config1.ledger.blocks_dir.clone(), filter_events_default());

    let node1 = Node::launch(config1, SecretKey::new_from_rng(&mut rng).unwrap())
        .await
        .unwrap();
    let node2 = Node::launch(config2, SecretKey::new_from_rng(&mut rng).unwrap())
        .await
        .unwrap();
    eventually("the peers to connect", || {
        node1.swarm().connected_peers() == ["node2"] && node2.swarm().connected_peers() == ["node1"]
    })
    .await;

    // The source ledger produces a precommit.
    let ctx_id = Hash::from_u64(0xaa01);
    let cross_id = ctx_id.to_string();
    let precommit = json!({
        "status": "Init",
        "contract_id": cross_id,
        "address": "0xmaker",
        "value": "100",
    });
    source
        .put_block(&Block {
            number: 1,
            transactions: vec![event_tx(
                &Hash::from_u64(0xcc03).to_string(),
                "precommit",
                precommit,
                Timestamp::now(),
            )],
        })
        .await
        .unwrap();

    // Node 1 signs and relays it. Node 2 verifies and stores it.
    eventually("the relay", || {
        status_of(&node1, &cross_id) == Some(CStatus::Pending)
            && node2.db().cross_transactions().has(ctx_id).unwrap()
    })
    .await;
    let relayed = node2.db().cross_transactions().read(ctx_id).unwrap();
    assert_eq!(relayed.status, CStatus::Pending);
    assert_eq!(relayed.tx.from, "0xmaker");
    assert_eq!(node1.db().cross_transactions().read(ctx_id).unwrap().tx, relayed.tx);

    // The counterpart answers with a receipt signed by its taker, and node 1 commits it to the source ledger. A
    // receipt naming the same taker but signed by another key is dropped first.
    let key2 = SecretKey::new_from_rng(&mut rng).unwrap();
    let forger = SecretKey::new_from_rng(&mut rng).unwrap();
    let recept = |tx_hash: u64, key: &SecretKey| {
        let unsigned = ReceptTransaction::new(ReceptTransactionData::unsigned(
            ctx_id,
            Hash::from_u64(tx_hash),
            "0xmaker".to_owned(),
            String::new(),
            key2.address().unwrap().to_string(),
            2,
            5,
            vec![],
        ));
        Eip155Signer::new(CHAIN_ID)
            .sign(&unsigned, |h| key.sign_recoverable(h))
            .unwrap()
    };
    node2.send_recept(1, recept(0xbb99, &forger)).await.unwrap();
    node2.send_recept(2, recept(0xbb02, &key2)).await.unwrap();

    let receipt = Hash::from_u64(0xbb02).to_string();
    let mut committed = Vec::new();
    for _ in 0..500 {
        committed = commits(&source).await;
        if !committed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(committed, vec![vec![cross_id.clone(), receipt.clone()]]);
    assert_eq!(status_of(&node1, &cross_id), Some(CStatus::Executed));

    // The source ledger reports the contract finished.
    source
        .put_block(&Block {
            number: 2,
            transactions: vec![event_tx(
                &Hash::from_u64(0xcc04).to_string(),
                "commit",
                json!({ "status": "Finished", "contract_id": cross_id }),
                Timestamp::now(),
            )],
        })
        .await
        .unwrap();
    eventually("completion", || status_of(&node1, &cross_id) == Some(CStatus::Completed)).await;

    // A late duplicate receipt is accepted by the webhook but never committed again.
    let webhook = node1.courier().webhook_addr().unwrap();
    let status = post_receipt(webhook, &format!("crossid={cross_id}&receipt={receipt}&sequence=2")).await;
    assert!(status.starts_with("HTTP/1.1 200"), "{status}");
    eventually("the receipts to be discarded", || {
        node1.courier().tx_manager().executed_len() == 0
    })
    .await;
    assert_eq!(commits(&source).await.len(), 1);
    assert_eq!(status_of(&node1, &cross_id), Some(CStatus::Completed));

    node1.stop().await;
    node2.stop().await;
}
