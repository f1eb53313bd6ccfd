use serde::{Deserialize, Serialize};
use shared::{Address, Amount, BlockHeight};
pub use shared::OutPoint;

/// Coinbase spends require 100 confirmations.
pub const COINBASE_MATURITY: u64 = 100;
/// Claim spends require only 10 confirmations.
pub const CLAIM_MATURITY: u64 = 10;

/// An unspent transaction output: the unit of balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub address: Address,
    pub amount: Amount,
    pub height: BlockHeight,
    pub is_coinbase: bool,
    pub is_claim: bool,
}

impl Utxo {
    #[must_use]
    pub const fn new(
        address: Address,
        amount: Amount,
        height: BlockHeight,
        is_coinbase: bool,
        is_claim: bool,
    ) -> Self {
        Self {
            address,
            amount,
            height,
            is_coinbase,
            is_claim,
        }
    }

    /// Required confirmations before this UTXO may be spent, per §4.6.
    #[must_use]
    pub const fn maturity_requirement(&self) -> u64 {
        if self.is_coinbase {
            COINBASE_MATURITY
        } else if self.is_claim {
            CLAIM_MATURITY
        } else {
            0
        }
    }

    /// Whether this UTXO may be spent in a block/mempool-tx targeting
    /// `spend_height` (block height for on-chain spends, `tipHeight + 1` for
    /// mempool admission).
    #[must_use]
    pub const fn is_mature_at(&self, spend_height: BlockHeight) -> bool {
        spend_height >= self.height + self.maturity_requirement()
    }
}

/// The full set of unspent outputs, keyed by `(txid, vout)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtxoSet {
    utxos: std::collections::HashMap<OutPoint, Utxo>,
}

impl UtxoSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, outpoint: OutPoint, utxo: Utxo) {
        self.utxos.insert(outpoint, utxo);
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        self.utxos.remove(outpoint)
    }

    #[must_use]
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    #[must_use]
    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_key(outpoint)
    }

    /// Sum of all UTXOs controlled by `address`.
    #[must_use]
    pub fn balance_of(&self, address: &Address) -> Amount {
        self.utxos
            .values()
            .filter(|utxo| &utxo.address == address)
            .map(|utxo| utxo.amount)
            .sum()
    }

    /// All outpoints (and the backing UTXOs) owned by `address`, optionally
    /// filtered to those individually worth at least `min_amount`.
    #[must_use]
    pub fn find_utxos(
        &self,
        address: &Address,
        min_amount: Option<Amount>,
    ) -> Vec<(OutPoint, &Utxo)> {
        self.utxos
            .iter()
            .filter(|(_, utxo)| &utxo.address == address)
            .filter(|(_, utxo)| min_amount.map_or(true, |m| utxo.amount >= m))
            .map(|(op, utxo)| (*op, utxo))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Hash256;

    fn addr(byte: u8) -> Address {
        Hash256::from_bytes([byte; 32])
    }

    #[test]
    fn coinbase_matures_after_100_blocks() {
        let utxo = Utxo::new(addr(1), 5_000, 100, true, false);
        assert!(!utxo.is_mature_at(199));
        assert!(utxo.is_mature_at(200));
    }

    #[test]
    fn claim_matures_after_10_blocks() {
        let utxo = Utxo::new(addr(1), 5_000, 100, false, true);
        assert!(!utxo.is_mature_at(109));
        assert!(utxo.is_mature_at(110));
    }

    #[test]
    fn regular_utxo_is_immediately_spendable() {
        let utxo = Utxo::new(addr(1), 5_000, 100, false, false);
        assert!(utxo.is_mature_at(100));
    }

    #[test]
    fn set_insert_balance_and_remove() {
        let mut set = UtxoSet::new();
        let outpoint = OutPoint::new(Hash256::zero(), 0);
        set.insert(outpoint, Utxo::new(addr(7), 1_000, 0, false, false));

        assert!(set.contains(&outpoint));
        assert_eq!(set.balance_of(&addr(7)), 1_000);
        assert_eq!(set.len(), 1);

        let removed = set.remove(&outpoint);
        assert!(removed.is_some());
        assert!(set.is_empty());
    }

    #[test]
    fn find_utxos_filters_by_minimum_amount() {
        let mut set = UtxoSet::new();
        set.insert(
            OutPoint::new(Hash256::zero(), 0),
            Utxo::new(addr(3), 500, 0, false, false),
        );
        set.insert(
            OutPoint::new(Hash256::zero(), 1),
            Utxo::new(addr(3), 5_000, 0, false, false),
        );

        let all = set.find_utxos(&addr(3), None);
        assert_eq!(all.len(), 2);
        let big = set.find_utxos(&addr(3), Some(1_000));
        assert_eq!(big.len(), 1);
    }
}
