use alloy::primitives::U256;

use super::{CodecError, CrossTransaction, SignedRecord};
use crate::crypto::Hash;

/// The signatures collected from several relay nodes over one cross-chain transaction.
#[derive(Debug, Clone)]
pub struct Signatures {
    record: CrossTransaction,
    signatures: Vec<(U256, U256, U256)>,
}

impl Signatures {
    pub fn new(first: CrossTransaction) -> Self {
        let signatures = vec![first.signature()];
        Signatures {
            record: first,
            signatures,
        }
    }

    pub fn id(&self) -> Hash {
        self.record.id()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn signatures(&self) -> &[(U256, U256, U256)] {
        &self.signatures
    }

    /// Adds the signature carried by `tx`, which must sign the same content.
    pub fn add_signature(&mut self, tx: &CrossTransaction) -> Result<(), CodecError> {
        if tx.hash() != self.record.hash() {
            return Err(CodecError::InvalidSign);
        }
        let (v, r, s) = tx.signature();
        if self.signatures.iter().any(|(_, seen, _)| *seen == r) {
            return Err(CodecError::DuplicateSign);
        }
        self.signatures.push((v, r, s));
        Ok(())
    }

    /// The record carrying the signature at `index`.
    pub fn resolve(&self, index: usize) -> Option<CrossTransaction> {
        let (v, r, s) = *self.signatures.get(index)?;
        Some(self.record.with_signature(v, r, s))
    }
}
