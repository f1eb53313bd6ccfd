//! The node facade: single-writer actor over chain state, mempool, miner,
//! and storage, spec.md §5. No teacher counterpart (the demo mutates its
//! `Blockchain` directly from `main`'s call sites); grounded on the
//! project's single-writer concurrency decision (see DESIGN.md) — one
//! `tokio` task owns everything here, every other task (peer sessions, the
//! mining loop) talks to it over an `mpsc` channel.

use crate::error::StorageError;
use crate::storage::{Metadata, Storage};
use pq_core::block::Block;
use pq_core::blockchain::ChainStats;
use pq_core::error::ChainError;
use pq_core::{Blockchain, Mempool, Miner, Transaction};
use shared::{Address, Amount, BlockHeight, Hash256, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

/// A read-only status snapshot for `getState`.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub chain: ChainStats,
    pub peer_count: usize,
    pub mempool_len: usize,
    pub mempool_bytes: usize,
    pub mining: bool,
}

enum Command {
    ReceiveBlock {
        block: Block,
        now_ms: Timestamp,
        reply: oneshot::Sender<Result<(), ChainError>>,
    },
    ReceiveTransaction {
        tx: Transaction,
        reply: oneshot::Sender<Result<(), pq_core::error::MempoolError>>,
    },
    ResetToHeight {
        height: BlockHeight,
        reply: oneshot::Sender<Result<(), ChainError>>,
    },
    StartMining {
        address: Address,
    },
    StopMining,
    SetPeerCount {
        count: usize,
    },
    GetState {
        reply: oneshot::Sender<NodeState>,
    },
    GetBalance {
        address: Address,
        reply: oneshot::Sender<Amount>,
    },
    GetUtxos {
        address: Address,
        min_amount: Option<Amount>,
        reply: oneshot::Sender<Vec<(shared::OutPoint, pq_core::utxo::Utxo)>>,
    },
    GetBlockByHeight {
        height: BlockHeight,
        reply: oneshot::Sender<Option<Block>>,
    },
    GetTip {
        reply: oneshot::Sender<Block>,
    },
    /// Looks a transaction up by id, checking the mempool first and then
    /// every on-chain block (the block it's found in, if any, travels
    /// alongside so callers can report confirmation depth).
    GetTransaction {
        txid: Hash256,
        reply: oneshot::Sender<Option<(Transaction, Option<BlockHeight>)>>,
    },
    GetMempoolTransactions {
        limit: usize,
        reply: oneshot::Sender<Vec<Transaction>>,
    },
    GetClaimStats {
        reply: oneshot::Sender<(u64, Amount)>,
    },
    /// A read-only copy of chain + mempool state for the standalone mining
    /// loop to assemble a candidate from, without holding up the actor.
    GetMiningSnapshot {
        reply: oneshot::Sender<(Blockchain, Mempool)>,
    },
    /// A read-only chain snapshot for the P2P layer's locator/fork-point
    /// bookkeeping, which needs to walk chain history without holding up
    /// the actor for the duration of a peer session.
    GetChainSnapshot {
        reply: oneshot::Sender<Blockchain>,
    },
    /// Looks a block up by hash, for `getdata` responses (§4.10). Scans the
    /// block log the same way `GetTransaction` does; the wire protocol has
    /// no height-indexed lookup from a bare hash.
    GetBlockByHash {
        hash: Hash256,
        reply: oneshot::Sender<Option<Block>>,
    },
}

fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// A cheap, cloneable handle to the running node actor. All mutation flows
/// through this; nothing outside the actor task touches `Blockchain`,
/// `Mempool`, or `Storage` directly.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
    mining_paused: Arc<AtomicBool>,
    accepted_blocks: broadcast::Sender<Hash256>,
}

impl NodeHandle {
    /// `receiveBlock`, spec.md §4.5/§4.11: validates and applies `block`,
    /// persists it, and revalidates the mempool against the new tip.
    ///
    /// # Errors
    ///
    /// Returns `ChainError` if the block was rejected.
    pub async fn receive_block(&self, block: Block, now_ms: Timestamp) -> Result<(), ChainError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ReceiveBlock { block, now_ms, reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    /// `receiveTransaction`, spec.md §4.7.
    ///
    /// # Errors
    ///
    /// Returns `MempoolError` on rejection.
    pub async fn receive_transaction(
        &self,
        tx: Transaction,
    ) -> Result<(), pq_core::error::MempoolError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ReceiveTransaction { tx, reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    /// `resetToHeight`, spec.md §4.5/§4.11.
    ///
    /// # Errors
    ///
    /// Returns `ChainError::ReorgTooDeep` if `height` exceeds the chain tip.
    pub async fn reset_to_height(&self, height: BlockHeight) -> Result<(), ChainError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ResetToHeight { height, reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    pub async fn start_mining(&self, address: Address) {
        let _ = self.commands.send(Command::StartMining { address }).await;
    }

    pub async fn stop_mining(&self) {
        let _ = self.commands.send(Command::StopMining).await;
    }

    /// Pauses the mining loop without tearing it down, e.g. while a peer's
    /// IBD batch is in flight (§4.8, "mining paused during IBD").
    pub fn pause_mining(&self) {
        self.mining_paused.store(true, Ordering::SeqCst);
    }

    /// Resumes mining once every peer reports `Synced` (§4.11).
    pub fn resume_mining(&self) {
        self.mining_paused.store(false, Ordering::SeqCst);
    }

    pub async fn set_peer_count(&self, count: usize) {
        let _ = self.commands.send(Command::SetPeerCount { count }).await;
    }

    pub async fn get_state(&self) -> NodeState {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetState { reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    pub async fn get_balance(&self, address: Address) -> Amount {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetBalance { address, reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    pub async fn get_utxos(
        &self,
        address: Address,
        min_amount: Option<Amount>,
    ) -> Vec<(shared::OutPoint, pq_core::utxo::Utxo)> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetUtxos {
                address,
                min_amount,
                reply,
            })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    pub async fn get_block_by_height(&self, height: BlockHeight) -> Option<Block> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetBlockByHeight { height, reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    pub async fn get_tip(&self) -> Block {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetTip { reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    /// Looks a transaction up in the mempool, then every on-chain block.
    /// The returned height is `None` for a still-pooled transaction.
    pub async fn get_transaction(&self, txid: Hash256) -> Option<(Transaction, Option<BlockHeight>)> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetTransaction { txid, reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    pub async fn get_mempool_transactions(&self, limit: usize) -> Vec<Transaction> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetMempoolTransactions { limit, reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    pub async fn get_claim_stats(&self) -> (u64, Amount) {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetClaimStats { reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    /// A cloned chain snapshot for the P2P layer's locator construction and
    /// fork-point search (spec.md §4.11), which run over many round-trips of
    /// peer I/O and must not hold the actor hostage for their duration.
    pub async fn get_chain_snapshot(&self) -> Blockchain {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetChainSnapshot { reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    pub async fn get_block_by_hash(&self, hash: Hash256) -> Option<Block> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetBlockByHash { hash, reply })
            .await
            .expect("node actor task is alive for the handle's lifetime");
        rx.await.expect("node actor always replies")
    }

    /// Subscribes to every block this node accepts, whether mined locally
    /// or received from a peer, for the P2P layer to re-announce over
    /// gossip. Lagging subscribers silently miss old announcements rather
    /// than blocking the actor; a missed announcement just costs a later
    /// peer an extra round-trip to discover the block via `getblocks`.
    pub fn subscribe_accepted_blocks(&self) -> broadcast::Receiver<Hash256> {
        self.accepted_blocks.subscribe()
    }
}

struct Actor {
    chain: Blockchain,
    mempool: Mempool,
    storage: Storage,
    peer_count: usize,
    miner_cancel: Option<Arc<AtomicBool>>,
    command_tx: mpsc::Sender<Command>,
    mining_paused: Arc<AtomicBool>,
    accepted_blocks: broadcast::Sender<Hash256>,
}

impl Actor {
    fn handle(&mut self, command: Command) {
        match command {
            Command::ReceiveBlock { block, now_ms, reply } => {
                let result = self.receive_block(block, now_ms);
                let _ = reply.send(result);
            }
            Command::ReceiveTransaction { tx, reply } => {
                let result = self.mempool.add_transaction(
                    tx,
                    self.chain.utxos(),
                    self.chain.height(),
                    self.chain.claimed_addresses(),
                );
                let _ = reply.send(result);
            }
            Command::ResetToHeight { height, reply } => {
                let result = self.chain.reset_to_height(height);
                if result.is_ok() {
                    self.mempool.revalidate_against(
                        self.chain.utxos(),
                        self.chain.height(),
                        self.chain.claimed_addresses(),
                    );
                }
                let _ = reply.send(result);
            }
            Command::StartMining { address } => self.start_mining(address),
            Command::StopMining => {
                if let Some(cancel) = self.miner_cancel.take() {
                    cancel.store(true, Ordering::SeqCst);
                }
            }
            Command::SetPeerCount { count } => {
                self.peer_count = count;
            }
            Command::GetState { reply } => {
                let state = NodeState {
                    chain: self.chain.stats(),
                    peer_count: self.peer_count,
                    mempool_len: self.mempool.len(),
                    mempool_bytes: self.mempool.total_bytes(),
                    mining: self.miner_cancel.is_some(),
                };
                let _ = reply.send(state);
            }
            Command::GetBalance { address, reply } => {
                let _ = reply.send(self.chain.get_balance(&address));
            }
            Command::GetUtxos {
                address,
                min_amount,
                reply,
            } => {
                let utxos = self
                    .chain
                    .find_utxos(&address, min_amount)
                    .into_iter()
                    .map(|(op, utxo)| (op, utxo.clone()))
                    .collect();
                let _ = reply.send(utxos);
            }
            Command::GetBlockByHeight { height, reply } => {
                let block = self.chain.get_block_hash(height).and_then(|_| {
                    self.storage
                        .load_blocks()
                        .ok()
                        .and_then(|blocks| blocks.into_iter().find(|b| b.height == height))
                });
                let _ = reply.send(block);
            }
            Command::GetTip { reply } => {
                let _ = reply.send(self.chain.tip().clone());
            }
            Command::GetTransaction { txid, reply } => {
                let found = self.mempool.get(&txid).cloned().map(|tx| (tx, None)).or_else(|| {
                    self.storage.load_blocks().ok().and_then(|blocks| {
                        blocks.into_iter().find_map(|b| {
                            b.transactions
                                .iter()
                                .find(|tx| tx.id == txid)
                                .cloned()
                                .map(|tx| (tx, Some(b.height)))
                        })
                    })
                });
                let _ = reply.send(found);
            }
            Command::GetMempoolTransactions { limit, reply } => {
                let mut txs = self.mempool.all_transactions();
                txs.truncate(limit);
                let _ = reply.send(txs);
            }
            Command::GetClaimStats { reply } => {
                let _ = reply.send(self.chain.get_claim_stats());
            }
            Command::GetMiningSnapshot { reply } => {
                let _ = reply.send((self.chain.clone(), self.mempool.clone()));
            }
            Command::GetChainSnapshot { reply } => {
                let _ = reply.send(self.chain.clone());
            }
            Command::GetBlockByHash { hash, reply } => {
                let found = self
                    .storage
                    .load_blocks()
                    .ok()
                    .and_then(|blocks| blocks.into_iter().find(|b| b.hash == hash));
                let _ = reply.send(found);
            }
        }
    }

    fn receive_block(&mut self, block: Block, now_ms: Timestamp) -> Result<(), ChainError> {
        self.chain.add_block(block.clone(), now_ms)?;

        if let Err(err) = self.storage.append_block(&block) {
            error!(?err, "fatal: failed to persist block");
        }
        if let Err(err) = self.persist_metadata() {
            error!(?err, "fatal: failed to persist metadata");
        }

        self.mempool.revalidate_against(
            self.chain.utxos(),
            self.chain.height(),
            self.chain.claimed_addresses(),
        );
        let _ = self.accepted_blocks.send(block.hash);

        // A new tip invalidates whatever candidate the mining loop was
        // searching against; it will pick this up on its next snapshot
        // request rather than being told to stop outright.
        Ok(())
    }

    fn persist_metadata(&self) -> Result<(), StorageError> {
        let stats = self.chain.stats();
        self.storage.write_metadata(&Metadata {
            height: stats.height,
            difficulty: hex::encode(stats.target.as_bytes()),
            genesis_hash: hex::encode(
                self.chain
                    .get_block_hash(0)
                    .unwrap_or(Hash256::zero())
                    .as_bytes(),
            ),
        })
    }

    /// `startMining(address)`, spec.md §4.8: spawns a standalone loop that
    /// pulls a fresh chain/mempool snapshot each round, mines against it,
    /// and feeds any found block back through `ReceiveBlock` — so mining
    /// never holds the actor's own lock-free single-writer loop hostage.
    fn start_mining(&mut self, address: Address) {
        if let Some(cancel) = self.miner_cancel.take() {
            cancel.store(true, Ordering::SeqCst);
        }

        let miner = Miner::new(address);
        self.miner_cancel = Some(miner.cancel_token());
        let command_tx = self.command_tx.clone();
        let mining_paused = Arc::clone(&self.mining_paused);

        tokio::spawn(async move {
            loop {
                if miner.is_cancelled() {
                    break;
                }
                if mining_paused.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }

                let (reply, rx) = oneshot::channel();
                if command_tx
                    .send(Command::GetMiningSnapshot { reply })
                    .await
                    .is_err()
                {
                    break;
                }
                let Ok((chain_snapshot, mempool_snapshot)) = rx.await else {
                    break;
                };

                match miner
                    .mine_next_block(&chain_snapshot, &mempool_snapshot, now_millis())
                    .await
                {
                    Some(block) => {
                        let (reply, rx) = oneshot::channel();
                        let now_ms = now_millis();
                        if command_tx
                            .send(Command::ReceiveBlock { block, now_ms, reply })
                            .await
                            .is_err()
                        {
                            break;
                        }
                        if let Ok(Err(err)) = rx.await {
                            // Most commonly a race against a peer's block
                            // landing on the same tip first; not fatal.
                            warn!(?err, "mined block rejected by chain state");
                        }
                        miner.reset();
                    }
                    None => break,
                }
            }
        });

        info!(%address, "mining started");
    }
}

/// Spawns the actor task and returns a handle to it.
#[must_use]
pub fn spawn(chain: Blockchain, mempool: Mempool, storage: Storage) -> NodeHandle {
    let (tx, mut rx) = mpsc::channel(256);
    let mining_paused = Arc::new(AtomicBool::new(false));
    let (accepted_blocks, _rx) = broadcast::channel(256);

    let mut actor = Actor {
        chain,
        mempool,
        storage,
        peer_count: 0,
        miner_cancel: None,
        command_tx: tx.clone(),
        mining_paused: Arc::clone(&mining_paused),
        accepted_blocks: accepted_blocks.clone(),
    };

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            actor.handle(command);
        }
        warn!("node actor channel closed, shutting down");
    });

    NodeHandle {
        commands: tx,
        mining_paused,
        accepted_blocks,
    }
}
