use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 256-bit hash used to identify blocks, transactions, and PoW targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `double_sha256(x) = SHA-256(SHA-256(x))`, Bitcoin's standard hash.
    #[must_use]
    pub fn double_sha256(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        Self(out)
    }

    /// Single-pass `SHA-256(x)`, used where the spec pins one round rather
    /// than Bitcoin's usual double hash (address derivation, snapshot
    /// commitment).
    #[must_use]
    pub fn sha256(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Treats the hash as a big-endian 256-bit integer and checks it against
    /// a target of the same shape: `int(self) < int(target)`.
    #[must_use]
    pub fn meets_target(&self, target: &Hash256) -> bool {
        self.0 < target.0
    }

    #[must_use]
    pub fn leading_zero_bits(&self) -> u32 {
        let mut zeros = 0;
        for &byte in &self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl TryFrom<&str> for Hash256 {
    type Error = hex::FromHexError;

    fn try_from(hex_string: &str) -> Result<Self, Self::Error> {
        let bytes = hex::decode(hex_string)?;
        let mut hash = [0u8; 32];
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }
}

/// `HASH160(x) = RIPEMD-160(SHA-256(x))`, the 20-byte Bitcoin address digest.
#[must_use]
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_displays_as_64_zero_hex_chars() {
        let s = Hash256::zero().to_string();
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c == '0'));
    }

    #[test]
    fn double_sha256_is_deterministic_and_nonzero() {
        let a = Hash256::double_sha256(b"hello world");
        let b = Hash256::double_sha256(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, Hash256::zero());
    }

    #[test]
    fn hash160_matches_known_vector_length() {
        let digest = hash160(b"some pubkey bytes");
        assert_eq!(digest.len(), 20);
    }

    #[test]
    fn meets_target_is_strict_less_than() {
        let low = Hash256::from_bytes([0u8; 32]);
        let mut high_bytes = [0u8; 32];
        high_bytes[31] = 1;
        let high = Hash256::from_bytes(high_bytes);
        assert!(low.meets_target(&high));
        assert!(!high.meets_target(&low));
        assert!(!low.meets_target(&low));
    }

    #[test]
    fn leading_zero_bits_counts_across_byte_boundary() {
        let hash = Hash256::from_bytes([
            0, 0, 0, 128, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0,
        ]);
        assert_eq!(hash.leading_zero_bits(), 24);
    }
}
