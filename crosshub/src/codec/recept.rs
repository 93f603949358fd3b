use std::ops::Deref;

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use super::{CodecError, CrossTransaction, SignedRecord, derive_chain_id, word};
use crate::crypto::Hash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceptTransactionData {
    pub ctx_id: Hash,
    /// Hash of the taker's transaction on the destination chain.
    pub tx_hash: Hash,
    pub from: String,
    pub to: String,
    pub taker: String,
    pub origin: u8,
    pub purpose: u8,
    pub payload: Vec<u8>,
    pub v: U256,
    pub r: U256,
    pub s: U256,
}

impl ReceptTransactionData {
    #[allow(clippy::too_many_arguments)]
    pub fn unsigned(
        ctx_id: Hash,
        tx_hash: Hash,
        from: String,
        to: String,
        taker: String,
        origin: u8,
        purpose: u8,
        payload: Vec<u8>,
    ) -> Self {
        ReceptTransactionData {
            ctx_id,
            tx_hash,
            from,
            to,
            taker,
            origin,
            purpose,
            payload,
            v: U256::ZERO,
            r: U256::ZERO,
            s: U256::ZERO,
        }
    }

    fn content_hash(&self) -> Hash {
        let preimages: [&[u8]; 8] = [
            self.ctx_id.as_bytes(),
            self.tx_hash.as_bytes(),
            self.from.as_bytes(),
            self.to.as_bytes(),
            self.taker.as_bytes(),
            &[self.origin],
            &[self.purpose],
            &self.payload,
        ];
        Hash::compute(preimages)
    }

    fn sign_hash(&self) -> Hash {
        let (v, r, s) = (word(&self.v), word(&self.r), word(&self.s));
        let preimages: [&[u8]; 11] = [
            self.ctx_id.as_bytes(),
            self.tx_hash.as_bytes(),
            self.from.as_bytes(),
            self.to.as_bytes(),
            self.taker.as_bytes(),
            &[self.origin],
            &[self.purpose],
            &self.payload,
            v.as_slice(),
            r.as_slice(),
            s.as_slice(),
        ];
        Hash::compute(preimages)
    }

    // The signed digest leaves out the taker and the origin.
    fn signer_hash(&self) -> Hash {
        let preimages: [&[u8]; 6] = [
            self.ctx_id.as_bytes(),
            self.tx_hash.as_bytes(),
            self.from.as_bytes(),
            self.to.as_bytes(),
            &[self.purpose],
            &self.payload,
        ];
        Hash::compute(preimages)
    }
}

/// Acknowledgement that a cross-chain transaction was taken on the destination chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ReceptTransactionData", into = "ReceptTransactionData")]
pub struct ReceptTransaction {
    data: ReceptTransactionData,
    hash: Hash,
    sign_hash: Hash,
    signer_hash: Hash,
}

impl ReceptTransaction {
    pub fn new(data: ReceptTransactionData) -> Self {
        ReceptTransaction {
            hash: data.content_hash(),
            sign_hash: data.sign_hash(),
            signer_hash: data.signer_hash(),
            data,
        }
    }

    pub fn id(&self) -> Hash {
        self.data.ctx_id
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn sign_hash(&self) -> Hash {
        self.sign_hash
    }

    pub fn chain_id(&self) -> U256 {
        derive_chain_id(&self.data.v)
    }

    pub fn data(&self) -> &ReceptTransactionData {
        &self.data
    }
}

impl Deref for ReceptTransaction {
    type Target = ReceptTransactionData;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl From<ReceptTransactionData> for ReceptTransaction {
    fn from(data: ReceptTransactionData) -> Self {
        ReceptTransaction::new(data)
    }
}

impl From<ReceptTransaction> for ReceptTransactionData {
    fn from(tx: ReceptTransaction) -> Self {
        tx.data
    }
}

impl SignedRecord for ReceptTransaction {
    fn signer_hash(&self) -> Hash {
        self.signer_hash
    }

    fn signature(&self) -> (U256, U256, U256) {
        (self.data.v, self.data.r, self.data.s)
    }

    fn with_signature(&self, v: U256, r: U256, s: U256) -> Self {
        let mut data = self.data.clone();
        data.v = v;
        data.r = r;
        data.s = s;
        ReceptTransaction::new(data)
    }
}

/// Checks a receipt against the cross-chain transaction it acknowledges.
pub fn verify_recept(rtx: &ReceptTransaction, ctx: &CrossTransaction) -> Result<(), CodecError> {
    if rtx.ctx_id != ctx.ctx_id {
        return Err(CodecError::InvalidRecept);
    }
    if rtx.chain_id() != ctx.chain_id() {
        return Err(CodecError::ChainIdMismatch);
    }
    if !ctx.to.is_empty() && rtx.to != ctx.to {
        return Err(CodecError::ToMismatch);
    }
    if rtx.from != ctx.from {
        return Err(CodecError::FromMismatch);
    }
    Ok(())
}
