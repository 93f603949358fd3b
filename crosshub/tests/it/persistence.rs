use std::{sync::Arc, time::Duration};

use crosshub::{
    cfg::{DispatchConfig, ScannerConfig},
    channel::MockOutChainClient,
    contract::{CStatus, Contract},
    crypto::{Hash, SecretKey},
    db::{Db, TxFilter, TxOrder},
    dispatch::TxManager,
    ledger::{Block, DirectoryLedger},
    scanner::{BlockSync, CHECKPOINT_KEY},
    tx::{CrossTx, Timestamp},
};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use tracing::Span;

use crate::{event_tx, eventually};

fn precommit(id: u64) -> serde_json::Value {
    json!({
        "status": "Init",
        "contract_id": Hash::from_u64(id).to_string(),
        "address": "0xmaker",
        "value": "7",
    })
}

fn scanner(ledger: Arc<DirectoryLedger>, db: Arc<Db>, rng: &mut ChaCha8Rng) -> BlockSync {
    let txm = Arc::new(TxManager::new(
        ledger.clone(),
        Arc::new(MockOutChainClient::new()),
        db.clone(),
        SecretKey::new_from_rng(rng).unwrap(),
        1,
        &DispatchConfig::default(),
        Span::none(),
    ));
    let config = ScannerConfig {
        block_interval: Duration::from_millis(20),
    };
    BlockSync::new(ledger, txm, db, &config, Span::none()).unwrap()
}

#[crosshub_macros::test]
async fn scanner_resumes_from_its_checkpoint(mut rng: ChaCha8Rng) {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let ledger = Arc::new(DirectoryLedger::new(
        dir.path().join("blocks"),
        vec!["precommit".to_owned()],
    ));
    std::fs::create_dir_all(ledger.dir()).unwrap();
    for number in 1..=2 {
        ledger
            .put_block(&Block {
                number,
                transactions: vec![event_tx(
                    &Hash::from_u64(number).to_string(),
                    "precommit",
                    precommit(0xa0 + number),
                    Timestamp::new(number as i64, 0),
                )],
            })
            .await
            .unwrap();
    }

    {
        let db = Arc::new(Db::new(Some(&data_dir), 16).unwrap());
        let scanner = scanner(ledger.clone(), db.clone(), &mut rng);
        scanner.start().await;
        eventually("block 2 to be ingested", || {
            db.config().get(CHECKPOINT_KEY) == 3 && db.cross_txs().count(&[]).unwrap() == 2
        })
        .await;
        scanner.stop().await;
    }

    // The checkpoint was persisted before block 3 was queried, so a restart queries block 3 next.
    let db = Arc::new(Db::new(Some(&data_dir), 16).unwrap());
    assert_eq!(db.config().get(CHECKPOINT_KEY), 3);
    assert_eq!(db.cross_txs().count(&[]).unwrap(), 2);

    ledger
        .put_block(&Block {
            number: 3,
            transactions: vec![event_tx(
                &Hash::from_u64(3).to_string(),
                "precommit",
                precommit(0xa3),
                Timestamp::new(3, 0),
            )],
        })
        .await
        .unwrap();
    let scanner = scanner(ledger, db.clone(), &mut rng);
    assert_eq!(scanner.start_block(), 3);
    scanner.start().await;
    eventually("block 3 to be ingested", || {
        db.config().get(CHECKPOINT_KEY) == 4 && db.cross_txs().count(&[]).unwrap() == 3
    })
    .await;
    scanner.stop().await;

    let stored = db
        .cross_txs()
        .query(0, 1, TxOrder::BlockNumber, false, &[])
        .unwrap();
    let blocks: Vec<_> = stored.iter().map(|tx| tx.block_number).collect();
    assert_eq!(blocks, vec![1, 2, 3]);
}

#[crosshub_macros::test]
async fn ingestion_is_idempotent_across_restarts(_rng: ChaCha8Rng) {
    let dir = tempfile::tempdir().unwrap();
    let batch: Vec<CrossTx> = (1..=3)
        .map(|n| {
            let contract = Contract::from_value(precommit(n)).unwrap();
            CrossTx::new(contract, Hash::from_u64(n + 10).to_string(), n, Timestamp::new(n as i64, 0))
        })
        .collect();

    {
        let db = Db::new(Some(dir.path()), 16).unwrap();
        db.cross_txs().save(&batch).unwrap();
        db.cross_txs()
            .update(&batch[0].cross_id, |tx| tx.update_status(CStatus::Pending))
            .unwrap();
    }

    let db = Db::new(Some(dir.path()), 16).unwrap();
    db.cross_txs().save(&batch).unwrap();
    assert_eq!(db.cross_txs().count(&[]).unwrap(), 3);

    // The resubmitted batch did not reset the record that had already advanced.
    let first = db
        .cross_txs()
        .one(TxFilter::CrossId(batch[0].cross_id.clone()))
        .unwrap()
        .unwrap();
    assert_eq!(first.status(), CStatus::Pending);

    // Regressions are refused.
    assert!(
        db.cross_txs()
            .update(&batch[0].cross_id, |tx| tx.update_status(CStatus::Init))
            .is_err()
    );
}

#[crosshub_macros::test]
async fn a_checkpointed_block_is_scanned_after_a_crash(mut rng: ChaCha8Rng) {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let ledger = Arc::new(DirectoryLedger::new(
        dir.path().join("blocks"),
        vec!["precommit".to_owned()],
    ));
    std::fs::create_dir_all(ledger.dir()).unwrap();
    for number in 1..=3 {
        ledger
            .put_block(&Block {
                number,
                transactions: vec![event_tx(
                    &Hash::from_u64(number).to_string(),
                    "precommit",
                    precommit(0xb0 + number),
                    Timestamp::new(number as i64, 0),
                )],
            })
            .await
            .unwrap();
    }

    // The node went down after persisting the checkpoint for block 2, before querying it.
    {
        let db = Db::new(Some(&data_dir), 16).unwrap();
        db.config().set(CHECKPOINT_KEY, 2).unwrap();
    }

    let db = Arc::new(Db::new(Some(&data_dir), 16).unwrap());
    let scanner = scanner(ledger, db.clone(), &mut rng);
    assert_eq!(scanner.start_block(), 2);
    scanner.start().await;
    eventually("blocks 2 and 3 to be ingested", || {
        db.config().get(CHECKPOINT_KEY) == 4 && db.cross_txs().count(&[]).unwrap() == 2
    })
    .await;
    scanner.stop().await;

    let blocks: Vec<_> = db
        .cross_txs()
        .query(0, 1, TxOrder::BlockNumber, false, &[])
        .unwrap()
        .iter()
        .map(|tx| tx.block_number)
        .collect();
    assert_eq!(blocks, vec![2, 3]);
}
