//! Cross-chain transaction records and their canonical digests.
//!
//! Records are immutable once built: every digest is computed when the record is constructed and a signature is
//! attached by building a new record with [`SignedRecord::with_signature`].

mod cross;
mod price;
mod recept;
mod signatures;
mod signer;

use alloy::primitives::U256;
pub use cross::{CrossTransaction, CrossTransactionData};
pub use price::Price;
pub use recept::{ReceptTransaction, ReceptTransactionData, verify_recept};
pub use signatures::Signatures;
pub use signer::{Eip155Signer, SignedRecord, derive_chain_id};
use thiserror::Error;

/// Domain tag of the source ledger.
pub const ORIGIN_SOURCE_LEDGER: u8 = 2;
/// Domain tag of the destination chain.
pub const PURPOSE_DESTINATION_CHAIN: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid chain id for signer")]
    InvalidChainId,
    #[error("invalid transaction v, r, s values")]
    InvalidSignature,
    #[error("signatures already exist")]
    DuplicateSign,
    #[error("invalid signature, different sign hash")]
    InvalidSign,
    #[error("invalid recept transaction")]
    InvalidRecept,
    #[error("[invalid recept transaction]: recept chainId miss match")]
    ChainIdMismatch,
    #[error("[invalid recept transaction]: recept to address miss match")]
    ToMismatch,
    #[error("[invalid recept transaction]: recept from address miss match")]
    FromMismatch,
    #[error("[invalid recept transaction]: recept signer is not its taker")]
    TakerMismatch,
}

impl CodecError {
    /// Whether this error is [`CodecError::InvalidRecept`] or one of its refinements.
    pub fn is_invalid_recept(&self) -> bool {
        matches!(
            self,
            CodecError::InvalidRecept
                | CodecError::ChainIdMismatch
                | CodecError::ToMismatch
                | CodecError::FromMismatch
                | CodecError::TakerMismatch
        )
    }
}

/// Big-endian, left-padded 32-byte word.
pub(crate) fn word(value: &U256) -> [u8; 32] {
    value.to_be_bytes::<32>()
}
