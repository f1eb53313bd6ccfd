//! The transaction pool awaiting inclusion in a block. Grounded on the
//! teacher's `bond-core/src/mempool.rs` fee-rate-ordered map shape,
//! generalized with claim de-duplication and maturity-aware revalidation
//! per spec.md §4.7 (no scripting: inputs reference UTXOs directly, there is
//! no witness/weight distinction).

use crate::error::MempoolError;
use crate::transaction::{Transaction, TxKind};
use crate::utxo::{OutPoint, UtxoSet};
use shared::{Amount, BlockHeight};
use std::collections::{HashMap, HashSet};

/// Bytes per MB, used to express `MAX_MEMPOOL_BYTES` as Bitcoin's docs do.
const MB: usize = 1_000_000;
pub const MAX_MEMPOOL_BYTES: usize = 50 * MB;
/// Minimum accepted fee rate, in satoshis per byte; claim txs are exempt.
pub const MIN_RELAY_FEE_RATE: f64 = 1.0;

#[derive(Debug, Clone)]
struct Entry {
    tx: Transaction,
    fee: Amount,
    size: usize,
    is_claim: bool,
}

impl Entry {
    fn fee_rate(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.fee as f64 / self.size as f64
        }
    }
}

/// The pending-transaction pool. `claimed_outpoints` tracks every input any
/// pooled tx spends (mempool-internal double-spend guard); `pending_btc_claims`
/// tracks in-flight claim BTC addresses so two pooled claims can't target the
/// same snapshot entry.
#[derive(Debug, Clone, Default)]
pub struct Mempool {
    txs: HashMap<shared::Hash256, Entry>,
    claimed_outpoints: HashSet<OutPoint>,
    pending_btc_claims: HashSet<[u8; 20]>,
    total_bytes: usize,
}

impl Mempool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Looks up one pooled transaction by id, for the node facade's
    /// tx-lookup endpoint.
    #[must_use]
    pub fn get(&self, txid: &shared::Hash256) -> Option<&Transaction> {
        self.txs.get(txid).map(|entry| &entry.tx)
    }

    /// Every pooled transaction, most recently admitted order is not
    /// guaranteed; callers that need fee-rate ordering should use
    /// [`Self::get_block_candidate`] instead.
    #[must_use]
    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.txs.values().map(|entry| entry.tx.clone()).collect()
    }

    #[must_use]
    pub fn contains(&self, txid: &shared::Hash256) -> bool {
        self.txs.contains_key(txid)
    }

    /// `addTransaction(tx, utxoSet, chainTipHeight)`, spec.md §4.7 steps 1-6.
    ///
    /// # Errors
    ///
    /// Returns the first violated step as a `MempoolError`.
    pub fn add_transaction(
        &mut self,
        tx: Transaction,
        utxos: &UtxoSet,
        chain_tip_height: BlockHeight,
        claimed_btc: &HashSet<[u8; 20]>,
    ) -> Result<(), MempoolError> {
        if matches!(tx.kind(), TxKind::Coinbase) {
            return Err(MempoolError::Tx(crate::error::TxError::InvalidStructure(
                "coinbase cannot enter the mempool".into(),
            )));
        }

        tx.validate(utxos, chain_tip_height + 1)?;

        for input in &tx.inputs {
            if self.claimed_outpoints.contains(&input.outpoint()) {
                return Err(MempoolError::MempoolDoubleSpend);
            }
        }

        let is_claim = matches!(tx.kind(), TxKind::Claim);
        if is_claim {
            let claim = tx
                .claim_data
                .as_ref()
                .expect("Claim kind implies claim_data present");
            if self.pending_btc_claims.contains(&claim.btc_address)
                || claimed_btc.contains(&claim.btc_address)
            {
                return Err(MempoolError::Claim(crate::error::ClaimError::AlreadyClaimed));
            }
        }

        let fee = tx.fee(utxos);
        let size = tx.serialized_size();
        if !is_claim {
            let rate = if size == 0 { 0.0 } else { fee as f64 / size as f64 };
            if rate < MIN_RELAY_FEE_RATE {
                return Err(MempoolError::FeeTooLow);
            }
        }

        if self.total_bytes + size > MAX_MEMPOOL_BYTES {
            self.evict_to_fit(size, fee, is_claim)?;
        }

        if is_claim {
            let claim = tx.claim_data.as_ref().expect("checked above");
            self.pending_btc_claims.insert(claim.btc_address);
        }
        for input in &tx.inputs {
            self.claimed_outpoints.insert(input.outpoint());
        }
        self.total_bytes += size;
        self.txs.insert(
            tx.id,
            Entry {
                tx,
                fee,
                size,
                is_claim,
            },
        );

        Ok(())
    }

    /// Evicts ascending-fee-rate entries (claims last) until `incoming_size`
    /// fits; rejects the incoming tx as `FeeTooLow` if it would rank below
    /// the cheapest entry it would have to evict.
    fn evict_to_fit(
        &mut self,
        incoming_size: usize,
        incoming_fee: Amount,
        incoming_is_claim: bool,
    ) -> Result<(), MempoolError> {
        let incoming_rate = if incoming_size == 0 {
            0.0
        } else {
            incoming_fee as f64 / incoming_size as f64
        };

        // Ascending eviction order: non-claims by fee-rate first, claims
        // last regardless of rate (spec.md §4.7 step 5).
        let mut candidates: Vec<shared::Hash256> = self.txs.keys().copied().collect();
        candidates.sort_by(|a, b| {
            let ea = &self.txs[a];
            let eb = &self.txs[b];
            ea.is_claim
                .cmp(&eb.is_claim)
                .then(ea.fee_rate().partial_cmp(&eb.fee_rate()).unwrap())
        });

        let mut freed = 0usize;
        let mut to_evict = Vec::new();
        for txid in candidates {
            if self.total_bytes + incoming_size - freed <= MAX_MEMPOOL_BYTES {
                break;
            }
            let entry = &self.txs[&txid];
            if !incoming_is_claim && entry.is_claim {
                // Claims are evicted last; a paying tx may not evict one
                // while non-claim candidates remain.
                continue;
            }
            if !incoming_is_claim && incoming_rate <= entry.fee_rate() {
                return Err(MempoolError::FeeTooLow);
            }
            freed += entry.size;
            to_evict.push(txid);
        }

        if self.total_bytes + incoming_size - freed > MAX_MEMPOOL_BYTES {
            return Err(MempoolError::PoolFull);
        }

        for txid in to_evict {
            self.remove(&txid);
        }
        Ok(())
    }

    fn remove(&mut self, txid: &shared::Hash256) -> Option<Transaction> {
        let entry = self.txs.remove(txid)?;
        self.total_bytes -= entry.size;
        for input in &entry.tx.inputs {
            self.claimed_outpoints.remove(&input.outpoint());
        }
        if let Some(claim) = &entry.tx.claim_data {
            self.pending_btc_claims.remove(&claim.btc_address);
        }
        Some(entry.tx)
    }

    /// `revalidateAgainst(utxoSet, tipHeight)`, called after a reorg: drops
    /// any tx whose inputs no longer resolve or have gone immature, or
    /// whose claim address was (re-)claimed on the new chain.
    pub fn revalidate_against(
        &mut self,
        utxos: &UtxoSet,
        tip_height: BlockHeight,
        claimed_btc: &HashSet<[u8; 20]>,
    ) {
        let stale: Vec<shared::Hash256> = self
            .txs
            .iter()
            .filter(|(_, entry)| {
                if entry.tx.validate(utxos, tip_height + 1).is_err() {
                    return true;
                }
                if let Some(claim) = &entry.tx.claim_data {
                    if claimed_btc.contains(&claim.btc_address) {
                        return true;
                    }
                }
                false
            })
            .map(|(txid, _)| *txid)
            .collect();

        for txid in stale {
            self.remove(&txid);
        }
    }

    /// `getBlockCandidate(maxBytes)`: descending fee-rate, truncated to the
    /// block byte budget after `max_bytes` has already had coinbase space
    /// reserved out of it by the caller.
    #[must_use]
    pub fn get_block_candidate(&self, max_bytes: usize) -> Vec<Transaction> {
        let mut entries: Vec<&Entry> = self.txs.values().collect();
        entries.sort_by(|a, b| b.fee_rate().partial_cmp(&a.fee_rate()).unwrap());

        let mut out = Vec::new();
        let mut used = 0usize;
        for entry in entries {
            if used + entry.size > max_bytes {
                continue;
            }
            used += entry.size;
            out.push(entry.tx.clone());
        }
        out
    }

    /// Total fees carried by the txs `get_block_candidate` would select for
    /// `max_bytes`, for the miner's coinbase-amount computation.
    #[must_use]
    pub fn total_fees_for_candidate(&self, max_bytes: usize) -> Amount {
        let mut entries: Vec<&Entry> = self.txs.values().collect();
        entries.sort_by(|a, b| b.fee_rate().partial_cmp(&a.fee_rate()).unwrap());

        let mut used = 0usize;
        let mut fees = 0;
        for entry in entries {
            if used + entry.size > max_bytes {
                continue;
            }
            used += entry.size;
            fees += entry.fee;
        }
        fees
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::Utxo;
    use shared::{Address, Hash256};

    fn addr(byte: u8) -> Address {
        Hash256::from_bytes([byte; 32])
    }

    fn funded_utxos(keypair: &shared::KeyPair, amount: Amount) -> (UtxoSet, OutPoint) {
        let outpoint = OutPoint::new(Hash256::zero(), 0);
        let mut utxos = UtxoSet::new();
        utxos.insert(
            outpoint,
            Utxo::new(keypair.public_key.derive_address(), amount, 0, false, false),
        );
        (utxos, outpoint)
    }

    #[test]
    fn accepts_well_formed_transfer() {
        let keypair = shared::KeyPair::generate();
        let (utxos, outpoint) = funded_utxos(&keypair, 10_000);
        let tx = Transaction::create_transfer(
            keypair.public_key.derive_address(),
            &[(outpoint, 10_000, &keypair)],
            &[(addr(9), 5_000)],
            4_900,
            1_000,
        )
        .unwrap();

        let mut pool = Mempool::new();
        let claimed = HashSet::new();
        pool.add_transaction(tx, &utxos, 0, &claimed).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn rejects_mempool_double_spend() {
        let keypair = shared::KeyPair::generate();
        let (utxos, outpoint) = funded_utxos(&keypair, 10_000);
        let tx1 = Transaction::create_transfer(
            keypair.public_key.derive_address(),
            &[(outpoint, 10_000, &keypair)],
            &[(addr(9), 4_000)],
            4_000,
            1_000,
        )
        .unwrap();
        let tx2 = Transaction::create_transfer(
            keypair.public_key.derive_address(),
            &[(outpoint, 10_000, &keypair)],
            &[(addr(10), 3_000)],
            4_000,
            1_001,
        )
        .unwrap();

        let mut pool = Mempool::new();
        let claimed = HashSet::new();
        pool.add_transaction(tx1, &utxos, 0, &claimed).unwrap();
        let err = pool.add_transaction(tx2, &utxos, 0, &claimed).unwrap_err();
        assert_eq!(err, MempoolError::MempoolDoubleSpend);
    }

    #[test]
    fn rejects_low_fee_rate() {
        let keypair = shared::KeyPair::generate();
        let (utxos, outpoint) = funded_utxos(&keypair, 10_000);
        let tx = Transaction::create_transfer(
            keypair.public_key.derive_address(),
            &[(outpoint, 10_000, &keypair)],
            &[(addr(9), 9_999)],
            0,
            1_000,
        )
        .unwrap();

        let mut pool = Mempool::new();
        let claimed = HashSet::new();
        let err = pool.add_transaction(tx, &utxos, 0, &claimed).unwrap_err();
        assert_eq!(err, MempoolError::FeeTooLow);
    }

    #[test]
    fn revalidate_drops_spent_utxo_entries() {
        let keypair = shared::KeyPair::generate();
        let (utxos, outpoint) = funded_utxos(&keypair, 10_000);
        let tx = Transaction::create_transfer(
            keypair.public_key.derive_address(),
            &[(outpoint, 10_000, &keypair)],
            &[(addr(9), 5_000)],
            4_900,
            1_000,
        )
        .unwrap();

        let mut pool = Mempool::new();
        let claimed = HashSet::new();
        pool.add_transaction(tx, &utxos, 0, &claimed).unwrap();

        let empty_utxos = UtxoSet::new();
        pool.revalidate_against(&empty_utxos, 0, &claimed);
        assert!(pool.is_empty());
    }

    #[test]
    fn block_candidate_orders_by_descending_fee_rate() {
        let keypair = shared::KeyPair::generate();
        let outpoint_a = OutPoint::new(Hash256::from_bytes([1; 32]), 0);
        let outpoint_b = OutPoint::new(Hash256::from_bytes([2; 32]), 0);
        let mut utxos = UtxoSet::new();
        utxos.insert(
            outpoint_a,
            Utxo::new(keypair.public_key.derive_address(), 10_000, 0, false, false),
        );
        utxos.insert(
            outpoint_b,
            Utxo::new(keypair.public_key.derive_address(), 10_000, 0, false, false),
        );

        let cheap = Transaction::create_transfer(
            keypair.public_key.derive_address(),
            &[(outpoint_a, 10_000, &keypair)],
            &[(addr(9), 9_900)],
            1,
            1_000,
        )
        .unwrap();
        let rich = Transaction::create_transfer(
            keypair.public_key.derive_address(),
            &[(outpoint_b, 10_000, &keypair)],
            &[(addr(10), 5_000)],
            5_000,
            1_001,
        )
        .unwrap();

        let mut pool = Mempool::new();
        let claimed = HashSet::new();
        pool.add_transaction(cheap, &utxos, 0, &claimed).unwrap();
        pool.add_transaction(rich, &utxos, 0, &claimed).unwrap();

        let candidate = pool.get_block_candidate(usize::MAX);
        assert_eq!(candidate.len(), 2);
        let fee_of = |tx: &Transaction| tx.fee(&utxos);
        assert!(fee_of(&candidate[0]) >= fee_of(&candidate[1]));
    }

    /// Exercises the eviction invariant at `MAX_MEMPOOL_BYTES` itself
    /// without literally constructing 50 MB of signed transactions: a
    /// synthetic filler entry occupies the whole budget at a near-zero fee
    /// rate, and a real, high-fee-rate transfer must evict it to fit.
    #[test]
    fn evicts_low_fee_rate_filler_to_admit_higher_fee_rate_incoming() {
        let keypair = shared::KeyPair::generate();
        let (utxos, outpoint) = funded_utxos(&keypair, 10_000);

        let mut pool = Mempool::new();
        let filler_txid = Hash256::from_bytes([7; 32]);
        pool.txs.insert(
            filler_txid,
            Entry {
                tx: Transaction::create_coinbase(addr(1), 0, 0, 0),
                fee: 1,
                size: MAX_MEMPOOL_BYTES,
                is_claim: false,
            },
        );
        pool.total_bytes = MAX_MEMPOOL_BYTES;

        let claimed = HashSet::new();
        let incoming = Transaction::create_transfer(
            keypair.public_key.derive_address(),
            &[(outpoint, 10_000, &keypair)],
            &[(addr(9), 1_000)],
            8_900,
            2_000,
        )
        .unwrap();

        pool.add_transaction(incoming, &utxos, 0, &claimed).unwrap();

        assert!(
            !pool.contains(&filler_txid),
            "low fee-rate filler should be evicted to make room"
        );
        assert!(pool.total_bytes() <= MAX_MEMPOOL_BYTES);
    }
}
