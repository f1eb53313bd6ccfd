use crate::error::BlockError;
use crate::transaction::{block_subsidy, Transaction, TxKind};
use crate::utxo::UtxoSet;
use serde::{Deserialize, Serialize};
use shared::{BlockHeight, Hash256, Timestamp};

/// Header is a fixed 112-byte little-endian record:
/// `version(4) ‖ previousHash(32) ‖ merkleRoot(32) ‖ timestamp(8) ‖ target(32) ‖ nonce(4)`.
pub const HEADER_SIZE: usize = 4 + 32 + 32 + 8 + 32 + 4;

pub const MAX_BLOCK_SIZE: usize = 1_000_000;
pub const MAX_FUTURE_BLOCK_TIME_MS: i64 = 2 * 60 * 60 * 1000;
/// Number of trailing blocks averaged to compute the median-time-past floor.
pub const MTP_WINDOW: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: Timestamp,
    pub target: Hash256,
    pub nonce: u32,
}

impl BlockHeader {
    #[must_use]
    pub const fn new(
        version: u32,
        previous_hash: Hash256,
        merkle_root: Hash256,
        timestamp: Timestamp,
        target: Hash256,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            previous_hash,
            merkle_root,
            timestamp,
            target,
            nonce,
        }
    }

    /// 112-byte little-endian wire encoding.
    #[must_use]
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut offset = 0;
        buf[offset..offset + 4].copy_from_slice(&self.version.to_le_bytes());
        offset += 4;
        buf[offset..offset + 32].copy_from_slice(self.previous_hash.as_bytes());
        offset += 32;
        buf[offset..offset + 32].copy_from_slice(self.merkle_root.as_bytes());
        offset += 32;
        buf[offset..offset + 8].copy_from_slice(&self.timestamp.to_le_bytes());
        offset += 8;
        buf[offset..offset + 32].copy_from_slice(self.target.as_bytes());
        offset += 32;
        buf[offset..offset + 4].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Inverse of `serialize`.
    #[must_use]
    pub fn deserialize(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut offset = 0;
        let version = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[offset..offset + 32]);
        offset += 32;
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&bytes[offset..offset + 32]);
        offset += 32;
        let timestamp = Timestamp::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
        offset += 8;
        let mut target = [0u8; 32];
        target.copy_from_slice(&bytes[offset..offset + 32]);
        offset += 32;
        let nonce = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
        Self {
            version,
            previous_hash: Hash256::from_bytes(prev),
            merkle_root: Hash256::from_bytes(merkle),
            timestamp,
            target: Hash256::from_bytes(target),
            nonce,
        }
    }

    /// `blockHash = doubleSHA256(header)`.
    #[must_use]
    pub fn block_hash(&self) -> Hash256 {
        Hash256::double_sha256(&self.serialize())
    }
}

/// Recomputes the merkle root over transaction ids: pairs consecutive txids
/// under double-SHA-256, duplicating the last leaf when a level has odd
/// cardinality. A 0-tx block has a root of 32 zero bytes; a 1-tx block's
/// root equals that txid.
#[must_use]
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return Hash256::zero();
    }
    let mut level: Vec<Hash256> = txids.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = Vec::with_capacity(64);
                buf.extend_from_slice(pair[0].as_bytes());
                buf.extend_from_slice(pair[1].as_bytes());
                Hash256::double_sha256(&buf)
            })
            .collect();
    }
    level[0]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub transactions: Vec<Transaction>,
    pub height: BlockHeight,
}

impl Block {
    #[must_use]
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>, height: BlockHeight) -> Self {
        let hash = header.block_hash();
        Self {
            header,
            hash,
            transactions,
            height,
        }
    }

    #[must_use]
    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE
            + self
                .transactions
                .iter()
                .map(Transaction::serialized_size)
                .sum::<usize>()
    }

    /// Static validation, spec.md §4.3 steps 1-2, 4-11 (step 3, the
    /// target-matches-schedule check, belongs to chain state at apply time).
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant as a `BlockError`.
    pub fn validate_static(
        &self,
        prev: Option<&Block>,
        utxos: &UtxoSet,
        recent_timestamps: &[Timestamp],
        now_ms: Timestamp,
    ) -> Result<(), BlockError> {
        if self.header.block_hash() != self.hash {
            return Err(BlockError::HashMismatch);
        }
        if !self.hash.meets_target(&self.header.target) {
            return Err(BlockError::PowInsufficient);
        }

        match prev {
            Some(prev_block) => {
                if self.header.previous_hash != prev_block.hash {
                    return Err(BlockError::PrevHashMismatch);
                }
            }
            None => {
                if self.header.previous_hash != Hash256::zero() {
                    return Err(BlockError::PrevHashMismatch);
                }
            }
        }

        let txids: Vec<Hash256> = self.transactions.iter().map(|tx| tx.id).collect();
        if merkle_root(&txids) != self.header.merkle_root {
            return Err(BlockError::MerkleMismatch);
        }

        if self.serialized_size() > MAX_BLOCK_SIZE {
            return Err(BlockError::OversizeBlock);
        }

        if self.transactions.is_empty() || !matches!(self.transactions[0].kind(), TxKind::Coinbase)
        {
            return Err(BlockError::BadCoinbase("transactions[0] must be coinbase".into()));
        }
        if self.transactions[1..]
            .iter()
            .any(|tx| matches!(tx.kind(), TxKind::Coinbase))
        {
            return Err(BlockError::BadCoinbase(
                "only transactions[0] may be coinbase".into(),
            ));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for tx in &self.transactions {
            if !seen_ids.insert(tx.id) {
                return Err(BlockError::DuplicateTxid);
            }
        }

        let mtp = median_time_past(recent_timestamps);
        if self.header.timestamp <= mtp {
            return Err(BlockError::TimestampTooOld);
        }
        if i64::try_from(self.header.timestamp).unwrap_or(i64::MAX)
            > i64::try_from(now_ms).unwrap_or(i64::MAX) + MAX_FUTURE_BLOCK_TIME_MS
        {
            return Err(BlockError::TimestampTooNew);
        }

        let mut spent_in_block = std::collections::HashSet::new();
        let mut total_fees: u128 = 0;
        for tx in &self.transactions[1..] {
            match tx.kind() {
                TxKind::Coinbase => unreachable!("checked above"),
                TxKind::Claim => {
                    if tx.outputs.len() != 1 || tx.outputs[0].amount == 0 {
                        return Err(BlockError::BadCoinbase(
                            "claim tx must have exactly one positive output".into(),
                        ));
                    }
                    if tx.claim_data.is_none() {
                        return Err(BlockError::BadCoinbase(
                            "claim tx must carry claimData".into(),
                        ));
                    }
                }
                TxKind::Regular => {
                    for input in &tx.inputs {
                        if !spent_in_block.insert(input.outpoint()) {
                            return Err(BlockError::Tx(crate::error::TxError::InvalidStructure(
                                "outpoint spent twice within block".into(),
                            )));
                        }
                    }
                    tx.validate(utxos, self.height)?;
                    total_fees += u128::from(tx.fee(utxos));
                }
            }
        }

        let coinbase_out: u128 = self.transactions[0]
            .outputs
            .iter()
            .map(|o| u128::from(o.amount))
            .sum();
        let max_allowed = u128::from(block_subsidy(self.height)) + total_fees;
        if coinbase_out > max_allowed {
            return Err(BlockError::CoinbaseOverpay);
        }

        Ok(())
    }
}

/// Median of the last `MTP_WINDOW` block timestamps (or fewer, before the
/// chain has that many blocks).
#[must_use]
pub fn median_time_past(recent_timestamps: &[Timestamp]) -> Timestamp {
    if recent_timestamps.is_empty() {
        return 0;
    }
    let window = recent_timestamps
        .iter()
        .rev()
        .take(MTP_WINDOW)
        .copied()
        .collect::<Vec<_>>();
    let mut sorted = window;
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_serialize_deserialize() {
        let header = BlockHeader::new(
            1,
            Hash256::from_bytes([1; 32]),
            Hash256::from_bytes([2; 32]),
            123_456,
            Hash256::from_bytes([0xFF; 32]),
            42,
        );
        let bytes = header.serialize();
        let decoded = BlockHeader::deserialize(&bytes);
        assert_eq!(header, decoded);
    }

    #[test]
    fn merkle_root_of_zero_txs_is_zero() {
        assert_eq!(merkle_root(&[]), Hash256::zero());
    }

    #[test]
    fn merkle_root_of_one_tx_is_that_txid() {
        let txid = Hash256::from_bytes([7; 32]);
        assert_eq!(merkle_root(&[txid]), txid);
    }

    #[test]
    fn merkle_root_duplicates_last_leaf_on_odd_count() {
        let a = Hash256::from_bytes([1; 32]);
        let b = Hash256::from_bytes([2; 32]);
        let c = Hash256::from_bytes([3; 32]);
        let with_three = merkle_root(&[a, b, c]);
        let with_duplicated_fourth = merkle_root(&[a, b, c, c]);
        assert_eq!(with_three, with_duplicated_fourth);
    }

    #[test]
    fn median_time_past_of_uniform_spacing() {
        let timestamps: Vec<Timestamp> = (0..11).map(|i| i * 1000).collect();
        assert_eq!(median_time_past(&timestamps), 5000);
    }
}
