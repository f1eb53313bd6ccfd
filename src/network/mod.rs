//! P2P subsystem: wire protocol, per-connection transport, and peer sync
//! state, spec.md §4.10-§4.11. Split the way `bond-core`'s former
//! `network.rs` never needed to (that file spoke gossipsub, with no framing
//! or handshake of its own); here the concerns are distinct enough to
//! warrant their own files.

pub mod protocol;
pub mod session;
pub mod sync;
pub mod transport;

use crate::error::P2pError;
use protocol::Message;
use shared::Timestamp;
use sync::PeerSync;
use tokio::net::TcpStream;
use transport::{MisbehaviorScore, TokenBucket};

/// One live connection: the socket plus everything needed to police and
/// drive it. Owned by the node facade, one per connected peer.
pub struct PeerConnection {
    pub stream: TcpStream,
    pub addr: String,
    pub inbound: bool,
    pub sync: PeerSync,
    bucket: TokenBucket,
    score: MisbehaviorScore,
    handshaken: bool,
}

impl PeerConnection {
    #[must_use]
    pub fn new(stream: TcpStream, addr: String, inbound: bool, now_ms: Timestamp) -> Self {
        Self {
            stream,
            addr,
            inbound,
            sync: PeerSync::new(),
            bucket: TokenBucket::new(now_ms),
            score: MisbehaviorScore::new(now_ms),
            handshaken: false,
        }
    }

    pub fn mark_handshaken(&mut self) {
        self.handshaken = true;
    }

    #[must_use]
    pub fn misbehavior_score(&self) -> u32 {
        self.score.value()
    }

    /// Applies a misbehavior penalty for content-level protocol violations
    /// the framing layer's own `receive` can't see (e.g. an implausible
    /// work claim). Returns `true` if the peer has now crossed the ban
    /// threshold.
    pub fn penalize(&mut self, now_ms: Timestamp, penalty: u32) -> bool {
        self.score.penalize(now_ms, penalty)
    }

    /// Reads one message, applying rate limiting and the pre-handshake
    /// restriction before handing it back to the caller for dispatch.
    /// Penalties are applied internally; the returned `bool` alongside a
    /// successfully-read message is `true` if this connection has now
    /// crossed the ban threshold and should be dropped.
    ///
    /// # Errors
    ///
    /// Returns `P2pError::DecodeError` if the rate limit is exceeded or the
    /// frame fails to decode, or `PreHandshakeRestricted` if a restricted
    /// message arrives before the handshake completes.
    pub async fn receive(&mut self, now_ms: Timestamp) -> Result<(Message, bool), P2pError> {
        if !self.bucket.try_consume(now_ms, transport::RATE_LIMIT_COST) {
            self.score
                .penalize(now_ms, transport::PENALTY_MALFORMED_PAYLOAD);
            return Err(P2pError::DecodeError);
        }

        let message = match transport::read_message(&mut self.stream).await {
            Ok(message) => message,
            Err(err) => {
                self.score
                    .penalize(now_ms, transport::PENALTY_DECODE_FAILURE);
                return Err(err);
            }
        };

        if !self.handshaken && !message.allowed_pre_handshake() {
            self.score
                .penalize(now_ms, transport::PENALTY_PRE_HANDSHAKE_RESTRICTED);
            return Err(P2pError::PreHandshakeRestricted);
        }

        let banned = self.score.value() >= transport::BAN_THRESHOLD;
        Ok((message, banned))
    }

    /// # Errors
    ///
    /// Returns `P2pError` if encoding or the underlying write fails.
    pub async fn send(&mut self, message: &Message) -> Result<(), P2pError> {
        transport::write_message(&mut self.stream, message).await
    }
}
