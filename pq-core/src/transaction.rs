use crate::error::TxError;
use crate::utxo::UtxoSet;
use serde::{Deserialize, Serialize};
use shared::{pq_verify, Address, Amount, BlockHeight, Hash256, OutPoint, PublicKey, Signature,
    Timestamp};

/// Subsidy halves every 210 000 blocks, matching Bitcoin's cadence.
pub const HALVING_INTERVAL: u64 = 210_000;
/// One coin = 100 000 000 base units, so `INITIAL_SUBSIDY` of 3.125 coins is
/// representable as an exact integer.
pub const COIN: Amount = 100_000_000;
pub const INITIAL_SUBSIDY: Amount = 3 * COIN + COIN / 8; // 3.125 * COIN
/// Beyond this many halvings the subsidy is defined to be zero.
pub const MAX_HALVINGS: u64 = 26;

/// `blockSubsidy(h) = INITIAL_SUBSIDY / 2^(h / HALVING_INTERVAL)`, zero past
/// `MAX_HALVINGS` halvings.
#[must_use]
pub fn block_subsidy(height: BlockHeight) -> Amount {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= MAX_HALVINGS {
        0
    } else {
        INITIAL_SUBSIDY >> halvings
    }
}

/// Sentinel `prevIndex` marking a coinbase/claim input rather than a real
/// spend.
pub const SENTINEL_INDEX: u32 = 0xFFFF_FFFF;

/// Distinct sentinel `prevTxId` identifying a claim transaction's single
/// input (all `0xCC` bytes, as opposed to coinbase's all-zero sentinel).
#[must_use]
pub fn claim_sentinel_txid() -> Hash256 {
    Hash256::from_bytes([0xCC; 32])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub prev_txid: Hash256,
    pub prev_index: u32,
    /// Empty for coinbase/claim inputs.
    pub pub_key: Vec<u8>,
    /// Empty for coinbase/claim inputs.
    pub signature: Vec<u8>,
}

impl Input {
    #[must_use]
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.prev_txid, self.prev_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub address: Address,
    pub amount: Amount,
}

/// Present iff this transaction is a claim; binds a one-shot ECDSA proof
/// over a frozen Bitcoin UTXO to a freshly-generated PQ address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimData {
    pub btc_address: [u8; 20],
    pub ecdsa_pub_key: Vec<u8>,
    pub ecdsa_signature: Vec<u8>,
    pub pq_address: Address,
}

/// Tagged classification of a transaction, computed from the sentinel input
/// rather than stored, so match sites read `tx.kind()` instead of repeated
/// sentinel comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Regular,
    Coinbase,
    Claim,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Hash256,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub timestamp: Timestamp,
    pub claim_data: Option<ClaimData>,
}

impl Transaction {
    #[must_use]
    pub fn kind(&self) -> TxKind {
        if self.inputs.len() == 1
            && self.inputs[0].prev_txid == Hash256::zero()
            && self.inputs[0].prev_index == SENTINEL_INDEX
        {
            TxKind::Coinbase
        } else if self.inputs.len() == 1
            && self.inputs[0].prev_txid == claim_sentinel_txid()
            && self.claim_data.is_some()
        {
            TxKind::Claim
        } else {
            TxKind::Regular
        }
    }

    /// The digest signed by every input and that determines `id`. Excludes
    /// signatures and public keys so signatures are non-malleable w.r.t. the
    /// txid.
    #[must_use]
    pub fn serialize_for_signing(
        inputs: &[Input],
        outputs: &[Output],
        timestamp: Timestamp,
        claim_data: Option<&ClaimData>,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        for input in inputs {
            buf.extend_from_slice(input.prev_txid.as_bytes());
            buf.extend_from_slice(&input.prev_index.to_le_bytes());
        }
        for output in outputs {
            buf.extend_from_slice(output.address.as_bytes());
            buf.extend_from_slice(&output.amount.to_le_bytes());
        }
        buf.extend_from_slice(&timestamp.to_le_bytes());
        if let Some(claim) = claim_data {
            buf.extend_from_slice(&claim.btc_address);
            buf.extend_from_slice(&claim.ecdsa_pub_key);
            buf.extend_from_slice(&claim.ecdsa_signature);
            buf.extend_from_slice(claim.pq_address.as_bytes());
        }
        buf
    }

    #[must_use]
    pub fn compute_id(
        inputs: &[Input],
        outputs: &[Output],
        timestamp: Timestamp,
        claim_data: Option<&ClaimData>,
    ) -> Hash256 {
        Hash256::double_sha256(&Self::serialize_for_signing(
            inputs, outputs, timestamp, claim_data,
        ))
    }

    /// `createCoinbase(address, height, fees)`.
    #[must_use]
    pub fn create_coinbase(
        address: Address,
        height: BlockHeight,
        fees: Amount,
        timestamp: Timestamp,
    ) -> Self {
        let inputs = vec![Input {
            prev_txid: Hash256::zero(),
            prev_index: SENTINEL_INDEX,
            pub_key: Vec::new(),
            signature: Vec::new(),
        }];
        let outputs = vec![Output {
            address,
            amount: block_subsidy(height) + fees,
        }];
        let id = Self::compute_id(&inputs, &outputs, timestamp, None);
        Self {
            id,
            inputs,
            outputs,
            timestamp,
            claim_data: None,
        }
    }

    /// `createTransfer(wallet, utxos, recipients, fee)`. `spend` is the set
    /// of `(outpoint, amount, signer keypair)` being spent; change (if any,
    /// nonzero) is paid back to `wallet_address`.
    ///
    /// # Errors
    ///
    /// Returns `TxError::FeeNegative` if `sum(spend) < sum(recipients) + fee`.
    pub fn create_transfer(
        wallet_address: Address,
        spend: &[(OutPoint, Amount, &shared::KeyPair)],
        recipients: &[(Address, Amount)],
        fee: Amount,
        timestamp: Timestamp,
    ) -> Result<Self, TxError> {
        let total_in: Amount = spend.iter().map(|(_, amount, _)| amount).sum();
        let total_out: Amount = recipients.iter().map(|(_, amount)| amount).sum();
        let total_needed = total_out
            .checked_add(fee)
            .ok_or_else(|| TxError::InvalidStructure("amount overflow".into()))?;
        if total_in < total_needed {
            return Err(TxError::FeeNegative);
        }
        let change = total_in - total_needed;

        let mut outputs: Vec<Output> = recipients
            .iter()
            .map(|(address, amount)| Output {
                address: *address,
                amount: *amount,
            })
            .collect();
        if change > 0 {
            outputs.push(Output {
                address: wallet_address,
                amount: change,
            });
        }

        let unsigned_inputs: Vec<Input> = spend
            .iter()
            .map(|(outpoint, _, keypair)| Input {
                prev_txid: outpoint.txid,
                prev_index: outpoint.vout,
                pub_key: keypair.public_key.as_bytes().to_vec(),
                signature: Vec::new(),
            })
            .collect();

        let sighash = Self::compute_id(&unsigned_inputs, &outputs, timestamp, None);

        let mut inputs = Vec::with_capacity(unsigned_inputs.len());
        for (mut input, (_, _, keypair)) in unsigned_inputs.into_iter().zip(spend.iter()) {
            let sig = keypair
                .sign(sighash.as_bytes())
                .map_err(|e| TxError::InvalidStructure(e.to_string()))?;
            input.signature = signature_to_bytes(&sig);
            inputs.push(input);
        }

        let id = Self::compute_id(&inputs, &outputs, timestamp, None);
        Ok(Self {
            id,
            inputs,
            outputs,
            timestamp,
            claim_data: None,
        })
    }

    /// `validate(tx, utxoSet, currentHeight)`, spec.md §4.2 steps 2-7.
    /// Coinbase/claim transactions bypass the per-input spend checks here;
    /// the block and claim-engine components validate them separately.
    ///
    /// # Errors
    ///
    /// Returns the first `TxError` variant whose step fails.
    pub fn validate(&self, utxos: &UtxoSet, current_height: BlockHeight) -> Result<(), TxError> {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(TxError::InvalidStructure(
                "transaction needs at least one input and one output".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.outpoint()) {
                return Err(TxError::InvalidStructure(
                    "duplicate outpoint within inputs".into(),
                ));
            }
        }

        let kind = self.kind();
        let mut total_in: u128 = 0;
        if matches!(kind, TxKind::Regular) {
            let sighash = Self::compute_id(&self.inputs, &self.outputs, self.timestamp, None);
            for input in &self.inputs {
                let outpoint = input.outpoint();
                let utxo = utxos.get(&outpoint).ok_or(TxError::MissingUtxo)?;

                let pubkey = PublicKey::from_bytes(input.pub_key.clone());
                if pubkey.derive_address() != utxo.address {
                    return Err(TxError::AddressMismatch);
                }

                let signature = signature_from_bytes(&input.signature);
                let ok = pq_verify(&signature, sighash.as_bytes(), &pubkey)
                    .map_err(|_| TxError::BadSignature)?;
                if !ok {
                    return Err(TxError::BadSignature);
                }

                if !utxo.is_mature_at(current_height) {
                    return Err(TxError::ImmatureUtxo);
                }

                total_in += u128::from(utxo.amount);
            }
        }

        if self.outputs.iter().any(|o| o.amount == 0) {
            return Err(TxError::FeeNegative);
        }
        let total_out: u128 = self.outputs.iter().map(|o| u128::from(o.amount)).sum();
        if matches!(kind, TxKind::Regular) && total_in < total_out {
            return Err(TxError::FeeNegative);
        }

        let recomputed = Self::compute_id(
            &self.inputs,
            &self.outputs,
            self.timestamp,
            self.claim_data.as_ref(),
        );
        if recomputed != self.id {
            return Err(TxError::IdMismatch);
        }

        Ok(())
    }

    /// `sum(inputAmounts from utxoSet) - sum(outputAmounts)`. Only
    /// meaningful for `Regular` transactions; coinbase/claim fee is zero.
    #[must_use]
    pub fn fee(&self, utxos: &UtxoSet) -> Amount {
        let total_in: Amount = self
            .inputs
            .iter()
            .filter_map(|input| utxos.get(&input.outpoint()))
            .map(|utxo| utxo.amount)
            .sum();
        let total_out: Amount = self.outputs.iter().map(|o| o.amount).sum();
        total_in.saturating_sub(total_out)
    }

    /// Approximate wire size in bytes, used for fee-rate and block-size
    /// accounting.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

fn signature_to_bytes(sig: &Signature) -> Vec<u8> {
    sig.as_bytes().to_vec()
}

/// Total: wraps whatever bytes a peer sent, well-formed or not. `pq_verify`
/// is the one place that needs to reject a malformed signature, so this
/// never panics on attacker-controlled `Input.signature`.
fn signature_from_bytes(bytes: &[u8]) -> Signature {
    Signature::from_raw(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::Utxo;

    fn addr(byte: u8) -> Address {
        Hash256::from_bytes([byte; 32])
    }

    #[test]
    fn block_subsidy_halves_on_schedule() {
        assert_eq!(block_subsidy(0), INITIAL_SUBSIDY);
        assert_eq!(block_subsidy(HALVING_INTERVAL), INITIAL_SUBSIDY / 2);
        assert_eq!(block_subsidy(HALVING_INTERVAL * MAX_HALVINGS), 0);
    }

    #[test]
    fn coinbase_kind_is_detected() {
        let tx = Transaction::create_coinbase(addr(1), 0, 0, 1_000);
        assert_eq!(tx.kind(), TxKind::Coinbase);
    }

    #[test]
    fn coinbase_id_matches_recompute() {
        let tx = Transaction::create_coinbase(addr(1), 0, 500, 1_000);
        let recomputed = Transaction::compute_id(&tx.inputs, &tx.outputs, tx.timestamp, None);
        assert_eq!(recomputed, tx.id);
    }

    #[test]
    fn transfer_signs_and_validates() {
        let keypair = shared::KeyPair::generate();
        let sender_address = keypair.public_key.derive_address();
        let outpoint = OutPoint::new(Hash256::zero(), 0);

        let mut utxos = UtxoSet::new();
        utxos.insert(outpoint, Utxo::new(sender_address, 10_000, 0, false, false));

        let tx = Transaction::create_transfer(
            sender_address,
            &[(outpoint, 10_000, &keypair)],
            &[(addr(9), 5_000)],
            100,
            2_000,
        )
        .unwrap();

        assert!(tx.validate(&utxos, 0).is_ok());
    }

    #[test]
    fn transfer_rejects_when_funds_insufficient() {
        let keypair = shared::KeyPair::generate();
        let outpoint = OutPoint::new(Hash256::zero(), 0);
        let result = Transaction::create_transfer(
            keypair.public_key.derive_address(),
            &[(outpoint, 100, &keypair)],
            &[(addr(9), 5_000)],
            100,
            2_000,
        );
        assert_eq!(result.unwrap_err(), TxError::FeeNegative);
    }

    #[test]
    fn validate_rejects_duplicate_outpoints() {
        let keypair = shared::KeyPair::generate();
        let input = Input {
            prev_txid: Hash256::zero(),
            prev_index: 0,
            pub_key: keypair.public_key.as_bytes().to_vec(),
            signature: Vec::new(),
        };
        let outputs = vec![Output {
            address: addr(2),
            amount: 10,
        }];
        let inputs = vec![input.clone(), input];
        let id = Transaction::compute_id(&inputs, &outputs, 1, None);
        let tx = Transaction {
            id,
            inputs,
            outputs,
            timestamp: 1,
            claim_data: None,
        };
        let utxos = UtxoSet::new();
        assert!(matches!(
            tx.validate(&utxos, 0),
            Err(TxError::InvalidStructure(_))
        ));
    }
}
