//! Wire message catalogue and framing, spec.md §4.10/§6. No teacher
//! counterpart (the Aevum-Bond demo speaks gossipsub, not a framed JSON
//! protocol); grounded on `zebra-chain`'s message-catalogue-plus-framing
//! shape, generalized to this protocol's flat `{type, payload}` envelope.

use crate::error::P2pError;
use pq_core::{Block, Transaction};
use serde::{Deserialize, Serialize};
use shared::{BlockHeight, Hash256};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;
/// Maximum frame size before the sender is penalized and the frame dropped.
pub const MAX_FRAME_BYTES: u32 = 5 * 1_000_000;
/// Cap on `getheaders` locator entries.
pub const MAX_LOCATOR_HASHES: usize = 101;
/// Cap on blocks returned per `blocks` batch during IBD.
pub const MAX_BLOCKS_PER_BATCH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvType {
    Block,
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvItem {
    pub kind: InvType,
    pub hash: Hash256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

/// One protocol message, tagged by `type` in the wire JSON (internally
/// represented with serde's adjacently-tagged default so the discriminant
/// travels as an explicit field rather than structural inference).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Message {
    Version {
        height: BlockHeight,
        genesis_hash: Hash256,
        version: u32,
    },
    Verack,
    Reject {
        reason: String,
    },
    GetBlocks {
        from_height: BlockHeight,
    },
    Blocks {
        blocks: Vec<Block>,
    },
    Inv {
        item: InvItem,
    },
    GetData {
        item: InvItem,
    },
    Tx {
        tx: Transaction,
    },
    GetHeaders {
        locator_hashes: Vec<Hash256>,
    },
    Headers {
        headers: Vec<pq_core::BlockHeader>,
    },
    Ping,
    Pong,
    GetAddr,
    Addr {
        peers: Vec<PeerAddr>,
    },
}

impl Message {
    /// Whether this message may be exchanged before the handshake
    /// (`version`/`verack`) completes. Everything else is
    /// `PreHandshakeRestricted` (§4.10).
    #[must_use]
    pub const fn allowed_pre_handshake(&self) -> bool {
        matches!(self, Self::Version { .. } | Self::Verack | Self::Reject { .. })
    }
}

/// Encodes `message` as a length-prefixed frame: `u32 BE length ‖ UTF-8 JSON`.
///
/// # Errors
///
/// Returns `P2pError::DecodeError` if serialization fails (should not
/// happen for a well-formed `Message`), or `OversizeFrame` if the encoded
/// payload would exceed [`MAX_FRAME_BYTES`].
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, P2pError> {
    let payload = serde_json::to_vec(message).map_err(|_| P2pError::DecodeError)?;
    if payload.len() as u64 > u64::from(MAX_FRAME_BYTES) {
        return Err(P2pError::OversizeFrame);
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes one message from `length` bytes of UTF-8 JSON payload (the frame
/// header is handled by the transport loop, which reads exactly `length`
/// bytes before calling this).
///
/// # Errors
///
/// Returns `P2pError::OversizeFrame` if `length` exceeds [`MAX_FRAME_BYTES`],
/// or `DecodeError` if `payload` fails to parse.
pub fn decode_frame(length: u32, payload: &[u8]) -> Result<Message, P2pError> {
    if length > MAX_FRAME_BYTES {
        return Err(P2pError::OversizeFrame);
    }
    serde_json::from_slice(payload).map_err(|_| P2pError::DecodeError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trips_through_frame_encoding() {
        let message = Message::Version {
            height: 10,
            genesis_hash: Hash256::zero(),
            version: PROTOCOL_VERSION,
        };
        let frame = encode_frame(&message).unwrap();
        let length = u32::from_be_bytes(frame[0..4].try_into().unwrap());
        let decoded = decode_frame(length, &frame[4..]).unwrap();
        assert!(matches!(decoded, Message::Version { height: 10, .. }));
    }

    #[test]
    fn oversize_frame_is_rejected_before_decoding() {
        let huge_length = MAX_FRAME_BYTES + 1;
        let err = decode_frame(huge_length, &[]).unwrap_err();
        assert_eq!(err, P2pError::OversizeFrame);
    }

    #[test]
    fn version_and_verack_are_allowed_pre_handshake() {
        let version = Message::Version {
            height: 0,
            genesis_hash: Hash256::zero(),
            version: 1,
        };
        assert!(version.allowed_pre_handshake());
        assert!(Message::Verack.allowed_pre_handshake());
        assert!(!Message::Ping.allowed_pre_handshake());
    }
}
