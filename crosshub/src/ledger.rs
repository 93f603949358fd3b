//! The source ledger, as seen by the relay.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::*;

use crate::tx::Timestamp;

/// Identifier of a ledger transaction.
pub type TxId = String;

/// Marker text of a ledger error for a block which has not been produced yet.
pub const NOT_YET_PRODUCED: &str = "Entry not found in index";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Entry not found in index: block {0}")]
    NotYetProduced(u64),
    #[error("ledger client is closed")]
    Closed,
}

/// Whether `e` reports a block which has not been produced yet.
pub fn is_not_yet_produced(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<LedgerError>(), Some(LedgerError::NotYetProduced(_)))
        || e.to_string().contains(NOT_YET_PRODUCED)
}

/// Outcome of transaction validation. Only `Valid` transactions were committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Validation {
    #[default]
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaderType {
    Message,
    Config,
    ConfigUpdate,
    #[default]
    EndorserTransaction,
    OrdererTransaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeEvent {
    pub event_name: String,
    /// JSON emitted by the chaincode.
    #[serde(with = "json_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTransaction {
    pub tx_id: TxId,
    #[serde(default)]
    pub validation: Validation,
    #[serde(default)]
    pub header_type: HeaderType,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub events: Vec<ChaincodeEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    #[serde(default)]
    pub transactions: Vec<BlockTransaction>,
}

/// A client of the source ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fetches block `number`. Fails with [`LedgerError::NotYetProduced`] if the ledger has not reached it.
    async fn query_block(&self, number: u64) -> Result<Block>;

    /// Invokes a chaincode function.
    async fn invoke(&self, fcn: &str, args: &[String]) -> Result<TxId>;

    /// Names of the chaincode events the relay follows.
    fn filter_events(&self) -> Vec<String>;

    async fn close(&self);
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Invocation {
    pub tx_id: TxId,
    pub fcn: String,
    pub args: Vec<String>,
}

/// Replays a ledger stored as a directory of `<n>.json` block files. Invocations are appended to
/// `invocations.jsonl` in the same directory.
#[derive(Debug)]
pub struct DirectoryLedger {
    dir: PathBuf,
    filter_events: Vec<String>,
    invocations: Mutex<()>,
    next_tx: AtomicU64,
    closed: AtomicBool,
}

impl DirectoryLedger {
    pub const INVOCATIONS_FILE: &'static str = "invocations.jsonl";

    pub fn new(dir: impl Into<PathBuf>, filter_events: Vec<String>) -> Self {
        DirectoryLedger {
            dir: dir.into(),
            filter_events,
            invocations: Mutex::new(()),
            next_tx: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn block_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{number}.json"))
    }

    /// Writes `block` as `<n>.json`.
    pub async fn put_block(&self, block: &Block) -> Result<()> {
        let path = self.block_path(block.number);
        let tmp = path.with_extension("part");
        fs::write(&tmp, serde_json::to_vec_pretty(block)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Every invocation recorded so far.
    pub async fn invocations(&self) -> Result<Vec<Invocation>> {
        let path = self.dir.join(Self::INVOCATIONS_FILE);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Ok(serde_json::from_str(l)?))
            .collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LedgerError::Closed.into());
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for DirectoryLedger {
    async fn query_block(&self, number: u64) -> Result<Block> {
        self.ensure_open()?;
        let path = self.block_path(number);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::NotYetProduced(number).into());
            }
            Err(e) => return Err(e.into()),
        };
        let block: Block = serde_json::from_slice(&bytes)?;
        if block.number != number {
            return Err(anyhow!(
                "{} holds block {} instead of {number}",
                path.display(),
                block.number
            ));
        }
        Ok(block)
    }

    async fn invoke(&self, fcn: &str, args: &[String]) -> Result<TxId> {
        self.ensure_open()?;
        let tx_id = format!("{:064x}", self.next_tx.fetch_add(1, Ordering::Relaxed) + 1);
        let invocation = Invocation {
            tx_id: tx_id.clone(),
            fcn: fcn.to_owned(),
            args: args.to_vec(),
        };
        let mut line = serde_json::to_vec(&invocation)?;
        line.push(b'\n');

        let _guard = self.invocations.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(Self::INVOCATIONS_FILE))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        debug!(fcn, %tx_id, "invoked chaincode");
        Ok(tx_id)
    }

    fn filter_events(&self) -> Vec<String> {
        self.filter_events.clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Carries JSON payload bytes as embedded JSON, falling back to a string for anything else.
mod json_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => value.serialize(serializer),
            Err(_) => String::from_utf8_lossy(bytes).serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(s.into_bytes()),
            value => serde_json::to_vec(&value).map_err(serde::de::Error::custom),
        }
    }
}
