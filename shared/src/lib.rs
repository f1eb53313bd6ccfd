pub mod crypto;
pub mod error;
pub mod hash;
pub mod types;

pub use crypto::{ecdsa_verify, pq_verify, KeyPair, PrivateKey, PublicKey, Signature,
    SignatureAlgorithm};
pub use error::BlockchainError;
pub use hash::{hash160, Hash256};
pub use types::{
    Address, Amount, BlockHeight, BlockId, NetworkType, NodeConfig, OutPoint, OutputIndex,
    PeerInfo, Timestamp, TxId,
};

pub type Result<T> = std::result::Result<T, BlockchainError>;
