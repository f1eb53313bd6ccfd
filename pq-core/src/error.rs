//! Typed, layered errors for the consensus engine. Each layer gets its own
//! enum so callers can match on exactly the failures that layer can produce;
//! `shared::BlockchainError` is the cross-cutting escape hatch for
//! cryptographic/serialization failures raised below this crate.

use shared::BlockchainError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("invalid structure: {0}")]
    InvalidStructure(String),
    #[error("missing utxo")]
    MissingUtxo,
    #[error("bad signature")]
    BadSignature,
    #[error("address mismatch")]
    AddressMismatch,
    #[error("immature utxo")]
    ImmatureUtxo,
    #[error("fee negative")]
    FeeNegative,
    #[error("id mismatch")]
    IdMismatch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("no such snapshot entry")]
    NoSuchEntry,
    #[error("amount mismatch")]
    AmountMismatch,
    #[error("already claimed")]
    AlreadyClaimed,
    #[error("unsupported snapshot entry type")]
    UnsupportedType,
    #[error("wrong key for claimed address")]
    WrongKey,
    #[error("bad proof")]
    BadProof,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("hash mismatch")]
    HashMismatch,
    #[error("proof of work insufficient")]
    PowInsufficient,
    #[error("target mismatch")]
    TargetMismatch,
    #[error("previous hash mismatch")]
    PrevHashMismatch,
    #[error("merkle root mismatch")]
    MerkleMismatch,
    #[error("block exceeds max size")]
    OversizeBlock,
    #[error("duplicate txid in block")]
    DuplicateTxid,
    #[error("bad coinbase: {0}")]
    BadCoinbase(String),
    #[error("timestamp too old")]
    TimestampTooOld,
    #[error("timestamp too far in the future")]
    TimestampTooNew,
    #[error("coinbase overpay")]
    CoinbaseOverpay,
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("reorg too deep")]
    ReorgTooDeep,
    #[error("candidate chain work too low")]
    WorkTooLow,
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("fee too low")]
    FeeTooLow,
    #[error("mempool full")]
    PoolFull,
    #[error("mempool double spend")]
    MempoolDoubleSpend,
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
}

impl From<BlockchainError> for TxError {
    fn from(err: BlockchainError) -> Self {
        TxError::InvalidStructure(err.to_string())
    }
}
