use std::ops::Deref;

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use super::{Price, SignedRecord, derive_chain_id, word};
use crate::crypto::Hash;

/// The fields of a [`CrossTransaction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossTransactionData {
    pub ctx_id: Hash,
    pub tx_hash: Hash,
    pub block_hash: Hash,
    pub value: U256,
    /// Fee paid to the relay.
    pub charge: U256,
    pub from: String,
    /// Empty when any taker may fulfil the transaction.
    pub to: String,
    pub origin: u8,
    pub purpose: u8,
    pub payload: Vec<u8>,
    pub v: U256,
    pub r: U256,
    pub s: U256,
}

impl CrossTransactionData {
    /// Builds unsigned data. The signature triple is zero.
    #[allow(clippy::too_many_arguments)]
    pub fn unsigned(
        ctx_id: Hash,
        tx_hash: Hash,
        block_hash: Hash,
        value: U256,
        charge: U256,
        from: String,
        to: String,
        origin: u8,
        purpose: u8,
        payload: Vec<u8>,
    ) -> Self {
        CrossTransactionData {
            ctx_id,
            tx_hash,
            block_hash,
            value,
            charge,
            from,
            to,
            origin,
            purpose,
            payload,
            v: U256::ZERO,
            r: U256::ZERO,
            s: U256::ZERO,
        }
    }

    fn content_hash(&self) -> Hash {
        let value = word(&self.value);
        let charge = word(&self.charge);
        let preimages: [&[u8]; 10] = [
            self.ctx_id.as_bytes(),
            self.tx_hash.as_bytes(),
            self.block_hash.as_bytes(),
            value.as_slice(),
            charge.as_slice(),
            self.from.as_bytes(),
            self.to.as_bytes(),
            &[self.origin],
            &[self.purpose],
            &self.payload,
        ];
        Hash::compute(preimages)
    }

    fn sign_hash(&self) -> Hash {
        let value = word(&self.value);
        let charge = word(&self.charge);
        let (v, r, s) = (word(&self.v), word(&self.r), word(&self.s));
        let preimages: [&[u8]; 13] = [
            self.ctx_id.as_bytes(),
            self.tx_hash.as_bytes(),
            self.block_hash.as_bytes(),
            value.as_slice(),
            charge.as_slice(),
            self.from.as_bytes(),
            self.to.as_bytes(),
            &[self.origin],
            &[self.purpose],
            &self.payload,
            v.as_slice(),
            r.as_slice(),
            s.as_slice(),
        ];
        Hash::compute(preimages)
    }
}

/// A cross-chain transaction, identified by its `ctx_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CrossTransactionData", into = "CrossTransactionData")]
pub struct CrossTransaction {
    data: CrossTransactionData,
    hash: Hash,
    sign_hash: Hash,
}

impl CrossTransaction {
    pub fn new(data: CrossTransactionData) -> Self {
        let hash = data.content_hash();
        let sign_hash = data.sign_hash();
        CrossTransaction {
            data,
            hash,
            sign_hash,
        }
    }

    pub fn id(&self) -> Hash {
        self.data.ctx_id
    }

    /// Digest over the content fields, excluding the signature.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Digest over the content fields and the signature.
    pub fn sign_hash(&self) -> Hash {
        self.sign_hash
    }

    pub fn chain_id(&self) -> U256 {
        derive_chain_id(&self.data.v)
    }

    pub fn price(&self) -> Price {
        Price::new(self.data.charge, self.data.value)
    }

    pub fn data(&self) -> &CrossTransactionData {
        &self.data
    }

    pub fn into_data(self) -> CrossTransactionData {
        self.data
    }
}

impl Deref for CrossTransaction {
    type Target = CrossTransactionData;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl From<CrossTransactionData> for CrossTransaction {
    fn from(data: CrossTransactionData) -> Self {
        CrossTransaction::new(data)
    }
}

impl From<CrossTransaction> for CrossTransactionData {
    fn from(tx: CrossTransaction) -> Self {
        tx.data
    }
}

impl SignedRecord for CrossTransaction {
    fn signer_hash(&self) -> Hash {
        self.hash
    }

    fn signature(&self) -> (U256, U256, U256) {
        (self.data.v, self.data.r, self.data.s)
    }

    fn with_signature(&self, v: U256, r: U256, s: U256) -> Self {
        let mut data = self.data.clone();
        data.v = v;
        data.r = r;
        data.s = s;
        CrossTransaction::new(data)
    }
}
