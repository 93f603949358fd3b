//! A collection of cryptographic primitives used by the relay.
//!
//! The exact implementations of these primitives is an implementation detail for this module only and dependents
//! should not care about the implementations. Hashing is Keccak-256 and signatures are recoverable secp256k1 ECDSA,
//! which is what the destination chain verifies.

use std::fmt::Display;

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::Deserialize;
use sha3::{Digest, Keccak256};

/// Length of a recoverable signature: `r || s || recovery_id`.
pub const SIGNATURE_LEN: usize = 65;

/// The secret key used by a relay node to sign outbound cross-chain transactions.
#[derive(Debug, Clone, Copy)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    /// Generates a random private key.
    pub fn new() -> Result<SecretKey> {
        Self::new_from_rng(&mut rand::rngs::OsRng)
    }

    pub fn new_from_rng<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Result<SecretKey> {
        let key = SigningKey::random(rng);
        Self::from_bytes(&key.to_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SecretKey> {
        let bytes: [u8; 32] = bytes.try_into()?;

        if bytes == [0; 32] {
            return Err(anyhow!("bytes are all zero"));
        }
        // Rejects values at or above the curve order.
        SigningKey::from_bytes(&bytes.into())?;

        Ok(SecretKey { bytes })
    }

    pub fn from_hex(s: &str) -> Result<SecretKey> {
        let bytes_vec = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_bytes(&bytes_vec)
    }

    fn as_ecdsa(&self) -> Result<SigningKey> {
        Ok(SigningKey::from_bytes(&self.bytes.into())?)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Signs a 32-byte digest, returning `r || s || recovery_id`.
    pub fn sign_recoverable(&self, hash: &Hash) -> Result<[u8; SIGNATURE_LEN]> {
        let (signature, recovery_id) = self.as_ecdsa()?.sign_prehash_recoverable(hash.as_bytes())?;
        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(out)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        Ok(VerifyingKey::from(&self.as_ecdsa()?))
    }

    pub fn address(&self) -> Result<Address> {
        Ok(address_of(&self.verifying_key()?))
    }
}

/// Derives the account address of a public key: the last 20 bytes of the Keccak-256 hash of the uncompressed key.
pub fn address_of(key: &VerifyingKey) -> Address {
    // Remove the first byte before hashing - The first byte specifies the encoding tag.
    let encoded = key.to_encoded_point(false);
    Address::from_slice(&Keccak256::digest(&encoded.as_bytes()[1..])[12..32])
}

/// Recovers the address which produced the signature `(r, s)` over `hash`.
pub fn recover_address(hash: &Hash, r: &[u8; 32], s: &[u8; 32], recovery_id: u8) -> Result<Address> {
    let mut raw = [0u8; 64];
    raw[..32].copy_from_slice(r);
    raw[32..].copy_from_slice(s);
    let signature = Signature::from_slice(&raw)?;
    let recovery_id = RecoveryId::from_byte(recovery_id)
        .ok_or_else(|| anyhow!("invalid recovery id {recovery_id}"))?;
    let key = VerifyingKey::recover_from_prehash(hash.as_bytes(), &signature, recovery_id)?;
    Ok(address_of(&key))
}

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0; 32]);

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn compute<T: AsRef<[S]>, S: AsRef<[u8]>>(preimages: T) -> Hash {
        let mut hasher = Keccak256::new();
        for preimage in preimages.as_ref() {
            hasher.update(preimage.as_ref());
        }
        Self(hasher.finalize().into())
    }

    /// Interprets `bytes` as a big-endian word: shorter inputs are left-padded, longer inputs keep their last 32
    /// bytes.
    pub fn from_word(bytes: &[u8]) -> Hash {
        let mut out = [0u8; 32];
        if bytes.len() >= 32 {
            out.copy_from_slice(&bytes[bytes.len() - 32..]);
        } else {
            out[32 - bytes.len()..].copy_from_slice(bytes);
        }
        Hash(out)
    }

    /// Parses a hex string, with or without a `0x` prefix, as a big-endian word. An odd number of digits is
    /// treated as if it had a leading zero.
    pub fn from_hex(s: &str) -> Result<Hash> {
        let digits = s.trim_start_matches("0x").trim_start_matches("0X");
        let bytes = if digits.len() % 2 == 1 {
            hex::decode(format!("0{digits}"))?
        } else {
            hex::decode(digits)?
        };
        Ok(Self::from_word(&bytes))
    }

    pub fn from_u64(n: u64) -> Hash {
        Self::from_word(&n.to_be_bytes())
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn signature_recovers_signer_address() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let key = SecretKey::new_from_rng(&mut rng).unwrap();
        let hash = Hash::compute([b"cross".as_slice(), b"hub".as_slice()]);

        let sig = key.sign_recoverable(&hash).unwrap();
        let r: [u8; 32] = sig[..32].try_into().unwrap();
        let s: [u8; 32] = sig[32..64].try_into().unwrap();

        let recovered = recover_address(&hash, &r, &s, sig[64]).unwrap();
        assert_eq!(recovered, key.address().unwrap());
    }

    #[test]
    fn hex_words_are_left_padded() {
        assert_eq!(Hash::from_hex("0x01").unwrap(), Hash::from_u64(1));
        assert_eq!(Hash::from_hex("abc").unwrap(), Hash::from_u64(0xabc));
        assert!(Hash::from_hex("zz").is_err());

        let long = [0xffu8; 40];
        assert_eq!(Hash::from_word(&long), Hash([0xff; 32]));
    }

    #[test]
    fn zero_key_is_rejected() {
        assert!(SecretKey::from_bytes(&[0u8; 32]).is_err());
        assert!(SecretKey::from_bytes(&[1u8; 31]).is_err());
    }
}
