//! The persisted intent record of a cross-chain transaction and its inbound acknowledgement.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::{
    codec::{
        CrossTransaction, CrossTransactionData, ORIGIN_SOURCE_LEDGER, PURPOSE_DESTINATION_CHAIN,
    },
    contract::{CStatus, Contract, ContractError},
    crypto::Hash,
};

/// Wall-clock time of a ledger transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        Timestamp { seconds, nanos }
    }

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Time elapsed since this timestamp. Timestamps in the future have elapsed zero.
    pub fn elapsed(&self) -> Duration {
        let now = Timestamp::now();
        let secs = now.seconds.saturating_sub(self.seconds);
        let nanos = i64::from(now.nanos) - i64::from(self.nanos);
        let total = secs.saturating_mul(1_000_000_000).saturating_add(nanos);
        Duration::from_nanos(u64::try_from(total).unwrap_or(0))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp::new(
                i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                d.subsec_nanos() as i32,
            ),
            Err(_) => Timestamp::default(),
        }
    }
}

/// A contract observed on the source ledger, together with where it was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossTx {
    pub contract: Contract,
    /// Globally unique; equal to the contract id.
    pub cross_id: String,
    pub tx_id: String,
    pub block_number: u64,
    pub timestamp: Timestamp,
    /// Sequence of the latest receipt applied to this record.
    #[serde(default)]
    pub sequence: i64,
}

impl CrossTx {
    pub fn new(contract: Contract, tx_id: String, block_number: u64, timestamp: Timestamp) -> Self {
        CrossTx {
            cross_id: contract.contract_id().to_owned(),
            contract,
            tx_id,
            block_number,
            timestamp,
            sequence: 0,
        }
    }

    pub fn status(&self) -> CStatus {
        self.contract.status()
    }

    pub fn update_status(&mut self, next: CStatus) -> Result<(), ContractError> {
        self.contract.update_status(next)
    }

    /// Applies an inbound receipt: the record becomes `Executed` and remembers the receipt and its sequence.
    pub fn apply_receipt(&mut self, receipt: &CrossTxReceipt) -> Result<(), ContractError> {
        self.contract.update_status(CStatus::Executed)?;
        self.contract.set_receipt(receipt.receipt.clone())?;
        self.sequence = receipt.sequence;
        Ok(())
    }

    /// Rebuilds the receipt applied to an `Executed` record.
    pub fn receipt(&self) -> Option<CrossTxReceipt> {
        let receipt = self.contract.receipt().filter(|r| !r.is_empty())?;
        Some(CrossTxReceipt {
            cross_id: self.cross_id.clone(),
            receipt: receipt.to_owned(),
            sequence: self.sequence,
        })
    }
}

/// Acknowledgement from the destination chain that a cross-chain transaction was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossTxReceipt {
    pub cross_id: String,
    pub receipt: String,
    pub sequence: i64,
}

/// Builds the cross-chain transaction relayed for a precommit record. Commit records and records whose ids are not
/// hex have no counterpart.
pub fn to_cross_transaction(tx: &CrossTx) -> Option<CrossTransaction> {
    let core = tx.contract.core()?;
    let payload = serde_json::to_vec(core).ok()?;
    let value = U256::from_str_radix(&core.value, 10).unwrap_or_default();

    Some(CrossTransaction::new(CrossTransactionData::unsigned(
        Hash::from_hex(&tx.cross_id).ok()?,
        Hash::from_hex(&tx.tx_id).ok()?,
        Hash::from_u64(tx.block_number),
        value,
        U256::ZERO,
        core.address.clone(),
        String::new(),
        ORIGIN_SOURCE_LEDGER,
        PURPOSE_DESTINATION_CHAIN,
        payload,
    )))
}
