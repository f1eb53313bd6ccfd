//! The claim engine: converts a one-shot ECDSA proof over a frozen Bitcoin
//! UTXO into native PQ-signed balance. Grounded on `shared::crypto`'s
//! `ecdsa_verify`/`hash160` primitives; has no counterpart in the teacher
//! repo (Aevum-Bond has no claim/snapshot concept at all).

use crate::error::ClaimError;
use crate::snapshot::{EntryType, Snapshot};
use crate::transaction::{ClaimData, Transaction, TxKind};
use shared::{ecdsa_verify, hash160, Hash256};

/// `message = "CLAIM:" ‖ btcAddress ‖ ":" ‖ pqAddress ‖ ":" ‖ snapshotBlockHash`,
/// hashed with double-SHA-256 — the exact preimage a claimant signs over.
#[must_use]
pub fn claim_message_hash(claim: &ClaimData, snapshot_block_hash: &Hash256) -> Hash256 {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"CLAIM:");
    buf.extend_from_slice(&claim.btc_address);
    buf.extend_from_slice(b":");
    buf.extend_from_slice(claim.pq_address.as_bytes());
    buf.extend_from_slice(b":");
    buf.extend_from_slice(snapshot_block_hash.as_bytes());
    Hash256::double_sha256(&buf)
}

/// Derives the 20-byte address a given ECDSA pubkey would control under
/// `entry_type`. The P2PKH/P2WPKH preimage is `hash160(pubkey)`; P2SH-P2WPKH
/// wraps the P2WPKH redeem script (`0x00 0x14 hash160(pubkey)`) before
/// hashing again. Any divergence from this exact preimage silently
/// invalidates legitimate claims (spec.md §9), so this is the one place the
/// three cases are allowed to differ.
fn derive_btc_address(pubkey: &[u8], entry_type: EntryType) -> Result<[u8; 20], ClaimError> {
    match entry_type {
        EntryType::P2pkh | EntryType::P2wpkh => Ok(hash160(pubkey)),
        EntryType::P2shP2wpkh => {
            let witness_program = hash160(pubkey);
            let mut redeem_script = Vec::with_capacity(22);
            redeem_script.push(0x00);
            redeem_script.push(0x14);
            redeem_script.extend_from_slice(&witness_program);
            Ok(hash160(&redeem_script))
        }
        EntryType::Other => Err(ClaimError::UnsupportedType),
    }
}

/// `verifyClaimProof(tx, snapshot)`, spec.md §4.4 steps 1-5.
///
/// # Errors
///
/// Returns the first violated step as a `ClaimError`.
pub fn verify_claim_proof(tx: &Transaction, snapshot: &Snapshot) -> Result<(), ClaimError> {
    let claim = match tx.kind() {
        TxKind::Claim => tx.claim_data.as_ref().ok_or(ClaimError::BadProof)?,
        _ => return Err(ClaimError::BadProof),
    };

    let entry = snapshot
        .lookup(&claim.btc_address)
        .ok_or(ClaimError::NoSuchEntry)?;

    let output = tx.outputs.first().ok_or(ClaimError::AmountMismatch)?;
    if output.amount != entry.amount || output.address != claim.pq_address {
        return Err(ClaimError::AmountMismatch);
    }

    let msg_hash = claim_message_hash(claim, &snapshot.block_hash);

    let expected_address = derive_btc_address(&claim.ecdsa_pub_key, entry.entry_type)?;
    if expected_address != claim.btc_address {
        return Err(ClaimError::WrongKey);
    }

    let verified = ecdsa_verify(&claim.ecdsa_signature, &msg_hash, &claim.ecdsa_pub_key)
        .map_err(|_| ClaimError::BadProof)?;
    if !verified {
        return Err(ClaimError::BadProof);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotEntry;

    fn sample_snapshot(entries: Vec<SnapshotEntry>) -> Snapshot {
        Snapshot::from_entries(entries, 0, Hash256::zero())
    }

    #[test]
    fn unsupported_entry_type_is_rejected() {
        let addr = [9u8; 20];
        let snapshot = sample_snapshot(vec![SnapshotEntry {
            btc_address: addr,
            amount: 1_000,
            entry_type: EntryType::Other,
        }]);
        let claim = ClaimData {
            btc_address: addr,
            ecdsa_pub_key: vec![0u8; 33],
            ecdsa_signature: vec![0u8; 64],
            pq_address: Hash256::zero(),
        };
        let tx = Transaction {
            id: Hash256::zero(),
            inputs: vec![crate::transaction::Input {
                prev_txid: crate::transaction::claim_sentinel_txid(),
                prev_index: crate::transaction::SENTINEL_INDEX,
                pub_key: vec![],
                signature: vec![],
            }],
            outputs: vec![crate::transaction::Output {
                address: Hash256::zero(),
                amount: 1_000,
            }],
            timestamp: 0,
            claim_data: Some(claim),
        };
        assert_eq!(
            verify_claim_proof(&tx, &snapshot).unwrap_err(),
            ClaimError::UnsupportedType
        );
    }

    #[test]
    fn missing_snapshot_entry_is_rejected() {
        let snapshot = sample_snapshot(vec![]);
        let claim = ClaimData {
            btc_address: [1u8; 20],
            ecdsa_pub_key: vec![0u8; 33],
            ecdsa_signature: vec![0u8; 64],
            pq_address: Hash256::zero(),
        };
        let tx = Transaction {
            id: Hash256::zero(),
            inputs: vec![crate::transaction::Input {
                prev_txid: crate::transaction::claim_sentinel_txid(),
                prev_index: crate::transaction::SENTINEL_INDEX,
                pub_key: vec![],
                signature: vec![],
            }],
            outputs: vec![crate::transaction::Output {
                address: Hash256::zero(),
                amount: 1_000,
            }],
            timestamp: 0,
            claim_data: Some(claim),
        };
        assert_eq!(
            verify_claim_proof(&tx, &snapshot).unwrap_err(),
            ClaimError::NoSuchEntry
        );
    }
}
