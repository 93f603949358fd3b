use alloy::primitives::{Address, U256};
use anyhow::Result;

use super::CodecError;
use crate::crypto::{self, Hash, SIGNATURE_LEN};

/// A record carrying an EIP-155 style `(v, r, s)` signature.
pub trait SignedRecord: Sized {
    /// The digest which is signed.
    fn signer_hash(&self) -> Hash;

    fn signature(&self) -> (U256, U256, U256);

    /// Returns a copy of this record carrying the given signature.
    fn with_signature(&self, v: U256, r: U256, s: U256) -> Self;
}

/// Derives the chain id folded into a signature's `v` value.
pub fn derive_chain_id(v: &U256) -> U256 {
    if *v == U256::from(27u64) || *v == U256::from(28u64) {
        return U256::ZERO;
    }
    v.saturating_sub(U256::from(35u64)) / U256::from(2u64)
}

/// Signs and recovers records under the replay protection of a single chain id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eip155Signer {
    chain_id: U256,
}

impl Eip155Signer {
    pub fn new(chain_id: u64) -> Self {
        Eip155Signer {
            chain_id: U256::from(chain_id),
        }
    }

    pub fn chain_id(&self) -> U256 {
        self.chain_id
    }

    fn chain_id_mul(&self) -> U256 {
        self.chain_id * U256::from(2u64)
    }

    /// Splits a raw `r || s || recovery_id` signature into `(v, r, s)`.
    pub fn signature_values(&self, sig: &[u8; SIGNATURE_LEN]) -> (U256, U256, U256) {
        let r = U256::from_be_slice(&sig[..32]);
        let s = U256::from_be_slice(&sig[32..64]);
        let v = if self.chain_id.is_zero() {
            U256::from(sig[64] as u64 + 27)
        } else {
            U256::from(sig[64] as u64 + 35) + self.chain_id_mul()
        };
        (v, r, s)
    }

    /// Signs `record` with `sign_fn`, returning a new signed record. The input is left untouched.
    pub fn sign<T, F>(&self, record: &T, sign_fn: F) -> Result<T>
    where
        T: SignedRecord,
        F: FnOnce(&Hash) -> Result<[u8; SIGNATURE_LEN]>,
    {
        let sig = sign_fn(&record.signer_hash())?;
        let (v, r, s) = self.signature_values(&sig);
        Ok(record.with_signature(v, r, s))
    }

    /// Recovers the address which signed `record`.
    pub fn sender<T: SignedRecord>(&self, record: &T) -> Result<Address, CodecError> {
        let (v, r, s) = record.signature();
        if derive_chain_id(&v) != self.chain_id {
            return Err(CodecError::InvalidChainId);
        }

        let base = if self.chain_id.is_zero() {
            U256::from(27u64)
        } else {
            self.chain_id_mul() + U256::from(35u64)
        };
        let recovery_id = v
            .checked_sub(base)
            .filter(|id| *id <= U256::from(1u64))
            .ok_or(CodecError::InvalidSignature)?;

        crypto::recover_address(
            &record.signer_hash(),
            &r.to_be_bytes::<32>(),
            &s.to_be_bytes::<32>(),
            recovery_id.to::<u8>(),
        )
        .map_err(|_| CodecError::InvalidSignature)
    }
}
