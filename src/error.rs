//! Node-level error layers: P2P transport/sync and storage. Mirrors
//! `pq_core::error`'s per-layer enum style, one level up the stack.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum P2pError {
    #[error("failed to decode frame")]
    DecodeError,
    #[error("frame exceeds maximum size")]
    OversizeFrame,
    #[error("message not allowed before handshake completes")]
    PreHandshakeRestricted,
    #[error("unknown message type")]
    UnknownMessage,
    #[error("genesis hash mismatch")]
    GenesisMismatch,
    #[error("peer is banned")]
    Banned,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("corrupt record at offset {offset}")]
    CorruptRecord { offset: u64 },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
