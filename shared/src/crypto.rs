//! Post-quantum signing (ML-DSA / Dilithium) and the one-shot ECDSA
//! verification used by the claim subsystem.

use crate::{BlockchainError, Hash256, Result};
use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{
    PublicKey as PQCPublicKeyTrait, SecretKey as PQCSecretKeyTrait, SignedMessage,
};
use secp256k1::ecdsa::Signature as EcdsaSignature;
use secp256k1::{Message, PublicKey as EcdsaPublicKey, Secp256k1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Post-quantum signature scheme used for all native transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    MlDsa65,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    key_data: Vec<u8>,
    algorithm: SignatureAlgorithm,
}

#[derive(Debug, Clone)]
pub struct PrivateKey {
    key_data: Vec<u8>,
    algorithm: SignatureAlgorithm,
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

/// Post-quantum digital signature. Carries its own public key, matching
/// `Input.pubKey`/`Input.signature` being populated together in the wire
/// transaction model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    data: Vec<u8>,
}

impl Signature {
    /// Wraps raw bytes as a signature with no validation — used to carry
    /// wire-format bytes that may not even be a well-formed signed message
    /// (e.g. attacker-controlled `Input.signature`) through to `pq_verify`,
    /// which is the only place that needs to reject them.
    #[must_use]
    pub const fn from_raw(data: Vec<u8>) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl PublicKey {
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            key_data: bytes,
            algorithm: SignatureAlgorithm::MlDsa65,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// `deriveAddress(pk) = SHA-256(pk)`.
    #[must_use]
    pub fn derive_address(&self) -> Hash256 {
        let digest = Sha256::digest(&self.key_data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Hash256::from_bytes(out)
    }

    fn to_pqc_public_key(&self) -> Result<dilithium5::PublicKey> {
        dilithium5::PublicKey::from_bytes(&self.key_data)
            .map_err(|_| BlockchainError::InvalidKeySize {
                expected: dilithium5::public_key_bytes(),
                actual: self.key_data.len(),
            })
    }
}

impl PrivateKey {
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            key_data: bytes,
            algorithm: SignatureAlgorithm::MlDsa65,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn to_pqc_secret_key(&self) -> Result<dilithium5::SecretKey> {
        dilithium5::SecretKey::from_bytes(&self.key_data)
            .map_err(|_| BlockchainError::InvalidKeySize {
                expected: dilithium5::secret_key_bytes(),
                actual: self.key_data.len(),
            })
    }
}

impl KeyPair {
    /// `pqKeygen()`.
    #[must_use]
    pub fn generate() -> Self {
        let (pk_bytes, sk_bytes) = dilithium5::keypair();
        Self {
            public_key: PublicKey::from_bytes(pk_bytes.as_bytes().to_vec()),
            private_key: PrivateKey::from_bytes(sk_bytes.as_bytes().to_vec()),
        }
    }

    /// `pqSign(msg, sk)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored secret key bytes are malformed.
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let secret_key = self.private_key.to_pqc_secret_key()?;
        let signed = dilithium5::sign(message, &secret_key);
        Ok(Signature {
            data: signed.as_bytes().to_vec(),
        })
    }
}

/// `pqVerify(sig, msg, pk)`. Failure paths (bad key bytes, bad signed-message
/// encoding, signature/message mismatch) all fall through to `Ok(false)`
/// rather than branching on timing-sensitive details of the signature itself;
/// the only data that can affect control flow before the constant-time
/// library verification is the public key.
///
/// # Errors
///
/// Returns an error only if `public_key`'s bytes cannot be parsed as a
/// Dilithium-5 public key.
pub fn pq_verify(signature: &Signature, message: &[u8], public_key: &PublicKey) -> Result<bool> {
    let pk = public_key.to_pqc_public_key()?;
    let Ok(signed_message) = SignedMessage::from_bytes(&signature.data) else {
        return Ok(false);
    };
    Ok(dilithium5::open(&signed_message, &pk)
        .map(|opened| opened == message)
        .unwrap_or(false))
}

/// `ecdsaVerify(sig, msgHash, pk)` over secp256k1, used only by the claim
/// subsystem to check a proof against a frozen Bitcoin public key.
///
/// # Errors
///
/// Returns an error if `pubkey` is not a valid compressed secp256k1 point or
/// `signature` is not 64 compact bytes; a parseable-but-non-matching
/// signature returns `Ok(false)`, not an error.
pub fn ecdsa_verify(signature: &[u8], msg_hash: &Hash256, pubkey: &[u8]) -> Result<bool> {
    let secp = Secp256k1::verification_only();
    let pk = EcdsaPublicKey::from_slice(pubkey)
        .map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;
    let sig = EcdsaSignature::from_compact(signature)
        .map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;
    let msg = Message::from_digest_slice(msg_hash.as_bytes())
        .map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;
    Ok(secp.verify_ecdsa(&msg, &sig, &pk).is_ok())
}

impl Zeroize for PrivateKey {
    fn zeroize(&mut self) {
        self.key_data.zeroize();
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let keypair = KeyPair::generate();
        let message = b"post-quantum utxo node";

        let signature = keypair.sign(message).unwrap();
        assert!(pq_verify(&signature, message, &keypair.public_key).unwrap());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"original").unwrap();
        assert!(!pq_verify(&signature, b"tampered", &keypair.public_key).unwrap());
    }

    #[test]
    fn derive_address_is_sha256_of_pubkey() {
        let keypair = KeyPair::generate();
        let expected = Hash256::double_sha256(&[]); // sanity: Hash256 API works
        assert_ne!(keypair.public_key.derive_address(), expected);
    }
}
