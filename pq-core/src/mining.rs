//! The async cooperative miner. Grounded on the teacher's
//! `bond-core/src/mining.rs` `Arc<AtomicBool>` cancellation flag, replacing
//! its OS-thread nonce-range split with a single `tokio` task that yields
//! between batches, per spec.md §4.8 and the project's single-writer
//! concurrency decision (there is exactly one miner loop, not N competing
//! threads, because there is exactly one chain/mempool writer).

use crate::blockchain::Blockchain;
use crate::block::{merkle_root, Block, BlockHeader, MAX_BLOCK_SIZE};
use crate::mempool::Mempool;
use crate::transaction::Transaction;
use shared::{Address, Amount, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Nonces tried per batch before yielding to the scheduler (§4.8 step 3).
pub const NONCE_BATCH_SIZE: u32 = 5_000;
/// Conservative upper bound on a coinbase transaction's wire size, reserved
/// out of `MAX_BLOCK_SIZE` before filling the rest from the mempool.
const COINBASE_RESERVE_BYTES: usize = 512;

/// Owns the cancellation flag shared between the mining loop and whatever
/// drives it (peer block arrival, explicit stop, mempool mutation).
pub struct Miner {
    address: Address,
    cancel: Arc<AtomicBool>,
}

impl Miner {
    #[must_use]
    pub fn new(address: Address) -> Self {
        Self {
            address,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// A clone of the cancellation flag, for handing to callers that need
    /// to trip it from elsewhere (a new block from a peer, a mempool
    /// mutation requiring re-assembly).
    #[must_use]
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Clears a prior cancellation so the next `mine_next_block` call can
    /// run. Called by the node facade right before restarting the loop on
    /// a new tip.
    pub fn reset(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// `startMining(address)`'s single-candidate iteration, spec.md §4.8
    /// steps 1-3: assembles one candidate against `chain`/`mempool` and
    /// searches for a satisfying nonce, bumping the timestamp and looping
    /// when the 32-bit nonce space is exhausted. Returns `None` as soon as
    /// cancellation is observed between batches (step 4); callers re-check
    /// the tip and re-assemble before calling again.
    ///
    /// `now_ms` is supplied by the caller rather than read from the wall
    /// clock here, so the timestamp-clamping behaviour is deterministic and
    /// testable.
    pub async fn mine_next_block(
        &self,
        chain: &Blockchain,
        mempool: &Mempool,
        now_ms: Timestamp,
    ) -> Option<Block> {
        let height = chain.height() + 1;
        let target = chain.target();
        let mtp = chain.median_time_past();
        let max_tx_bytes = MAX_BLOCK_SIZE.saturating_sub(COINBASE_RESERVE_BYTES);

        let candidate_txs = mempool.get_block_candidate(max_tx_bytes);
        let total_fees: Amount = mempool.total_fees_for_candidate(max_tx_bytes);

        let mut timestamp = now_ms.max(mtp + 1);
        let coinbase = Transaction::create_coinbase(self.address, height, total_fees, timestamp);

        let mut transactions = Vec::with_capacity(candidate_txs.len() + 1);
        transactions.push(coinbase.clone());
        transactions.extend(candidate_txs);
        let txids: Vec<_> = transactions.iter().map(|tx| tx.id).collect();
        let mut root = merkle_root(&txids);

        loop {
            for batch_start in (0..=u32::MAX).step_by(NONCE_BATCH_SIZE as usize) {
                if self.is_cancelled() {
                    return None;
                }

                let batch_end = batch_start.saturating_add(NONCE_BATCH_SIZE);
                for nonce in batch_start..batch_end {
                    let header = BlockHeader::new(1, chain.tip().hash, root, timestamp, target, nonce);
                    if header.block_hash().meets_target(&target) {
                        return Some(Block::new(header, transactions, height));
                    }
                }

                tokio::task::yield_now().await;

                if batch_end == u32::MAX {
                    break;
                }
            }

            // Nonce space exhausted at this timestamp: bump and restart,
            // recomputing the coinbase (its timestamp field feeds the txid)
            // and therefore the merkle root.
            timestamp += 1;
            let rebuilt_coinbase =
                Transaction::create_coinbase(self.address, height, total_fees, timestamp);
            transactions[0] = rebuilt_coinbase;
            let txids: Vec<_> = transactions.iter().map(|tx| tx.id).collect();
            root = merkle_root(&txids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{make_genesis_block, NetworkParams};
    use shared::Hash256;

    fn addr(byte: u8) -> Address {
        Hash256::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn mines_a_block_against_an_easy_target() {
        let easy_target = Hash256::from_bytes([0xff; 32]);
        let genesis = make_genesis_block(addr(1), easy_target, 0);
        let chain = Blockchain::new(
            genesis,
            NetworkParams {
                starting_target: easy_target,
            },
            None,
        );
        let mempool = Mempool::new();
        let miner = Miner::new(addr(2));

        let block = miner
            .mine_next_block(&chain, &mempool, 1_000)
            .await
            .expect("an easy target should be found quickly");

        assert!(block.hash.meets_target(&easy_target));
        assert_eq!(block.transactions[0].outputs[0].address, addr(2));
    }

    #[tokio::test]
    async fn cancellation_stops_the_search() {
        let target = Hash256::from_bytes([0xff; 32]);
        let genesis = make_genesis_block(addr(1), target, 0);
        let chain = Blockchain::new(
            genesis,
            NetworkParams {
                starting_target: target,
            },
            None,
        );
        let mempool = Mempool::new();
        let miner = Miner::new(addr(2));
        miner.stop();

        let result = miner.mine_next_block(&chain, &mempool, 1_000).await;
        assert!(result.is_none());
    }
}
