pub mod block;
pub mod blockchain;
pub mod claim;
pub mod error;
pub mod mempool;
pub mod mining;
pub mod snapshot;
pub mod transaction;
pub mod utxo;

pub use block::{Block, BlockHeader};
pub use blockchain::{Blockchain, ChainStats, NetworkParams};
pub use mempool::Mempool;
pub use mining::Miner;
pub use snapshot::Snapshot;
pub use transaction::{Input, Output, Transaction, TxKind};
pub use utxo::{OutPoint, Utxo, UtxoSet};

pub use shared::{BlockchainError, Hash256, Result};
