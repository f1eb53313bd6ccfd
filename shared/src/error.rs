use thiserror::Error;

/// Cross-cutting errors surfaced by the crypto and type layer. Layer-specific
/// errors (transaction, claim, block, chain, mempool, P2P, storage) live in
/// their own modules and convert into this where they cross a boundary.
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid hash")]
    InvalidHash,

    #[error("insufficient proof of work")]
    InsufficientDifficulty,

    #[error("utxo not found")]
    UtxoNotFound,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("cryptographic error: {0}")]
    CryptographicError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("i/o error: {0}")]
    IoError(String),

    #[error("network error: {0}")]
    NetworkError(String),
}
