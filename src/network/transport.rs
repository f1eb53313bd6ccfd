//! Per-connection framing, rate limiting, misbehavior scoring, and address
//! book, spec.md §4.10. No teacher counterpart; the token-bucket/score/decay
//! shape is grounded on `zebra-network`'s peer-misbehavior bookkeeping,
//! generalized to this protocol's explicit numeric penalties.

use crate::error::P2pError;
use crate::network::protocol::{decode_frame, encode_frame, Message, MAX_FRAME_BYTES};
use shared::Timestamp;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Token bucket capacity (§4.10): a peer may burst up to this many messages
/// before being throttled.
pub const RATE_LIMIT_BURST: f64 = 200.0;
/// Tokens refilled per second.
pub const RATE_LIMIT_REFILL_PER_SEC: f64 = 100.0;
/// Cost charged against the bucket per message.
pub const RATE_LIMIT_COST: f64 = 1.0;

/// Misbehavior score at which a peer is banned.
pub const BAN_THRESHOLD: u32 = 100;
/// Score decayed per minute of good behavior.
pub const SCORE_DECAY_PER_MINUTE: u32 = 1;

pub const PENALTY_DECODE_FAILURE: u32 = 25;
pub const PENALTY_UNKNOWN_TYPE: u32 = 10;
pub const PENALTY_PRE_HANDSHAKE_RESTRICTED: u32 = 10;
pub const PENALTY_MALFORMED_PAYLOAD: u32 = 10;
/// A peer claiming more than `WORK_CLAIM_BAN_MULTIPLIER` times our verified
/// work without the headers to back it (§4.5/§4.11).
pub const PENALTY_IMPLAUSIBLE_WORK_CLAIM: u32 = 50;

/// Inbound/outbound connection caps (§4.10).
pub const MAX_INBOUND: usize = 25;
pub const MAX_OUTBOUND: usize = 25;
/// Outbound connections allowed to share a /16 before diversification
/// relaxes (§4.10).
pub const MAX_PER_SUBNET: usize = 2;

/// A simple leaky/token bucket, refilled lazily on each `try_consume` call
/// rather than by a background timer.
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill_ms: Timestamp,
}

impl TokenBucket {
    #[must_use]
    pub fn new(now_ms: Timestamp) -> Self {
        Self {
            tokens: RATE_LIMIT_BURST,
            capacity: RATE_LIMIT_BURST,
            refill_per_sec: RATE_LIMIT_REFILL_PER_SEC,
            last_refill_ms: now_ms,
        }
    }

    /// Refills proportionally to elapsed time, then charges `cost`. Returns
    /// `false` (without charging) if insufficient tokens remain.
    pub fn try_consume(&mut self, now_ms: Timestamp, cost: f64) -> bool {
        let elapsed_secs = now_ms.saturating_sub(self.last_refill_ms) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_per_sec).min(self.capacity);
        self.last_refill_ms = now_ms;

        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// Per-peer misbehavior accounting: an additive score that decays over time
/// and trips a ban once it crosses [`BAN_THRESHOLD`].
pub struct MisbehaviorScore {
    score: u32,
    last_decay_ms: Timestamp,
}

impl MisbehaviorScore {
    #[must_use]
    pub fn new(now_ms: Timestamp) -> Self {
        Self {
            score: 0,
            last_decay_ms: now_ms,
        }
    }

    fn decay(&mut self, now_ms: Timestamp) {
        let elapsed_minutes = now_ms.saturating_sub(self.last_decay_ms) / 60_000;
        if elapsed_minutes > 0 {
            let decay = elapsed_minutes as u32 * SCORE_DECAY_PER_MINUTE;
            self.score = self.score.saturating_sub(decay);
            self.last_decay_ms = now_ms;
        }
    }

    /// Applies `penalty`, decaying first, and reports whether the peer has
    /// now crossed the ban threshold.
    pub fn penalize(&mut self, now_ms: Timestamp, penalty: u32) -> bool {
        self.decay(now_ms);
        self.score = self.score.saturating_add(penalty);
        self.score >= BAN_THRESHOLD
    }

    #[must_use]
    pub fn value(&self) -> u32 {
        self.score
    }
}

/// Whether `ip` is a private/link-local address that should be excluded
/// from the address book's outbound candidates unless local mode is on
/// (§4.10).
#[must_use]
pub fn is_private_or_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local() || v4.is_loopback() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique local (fc00::/7)
        }
    }
}

/// A /16 (IPv4) or top-32-bits (IPv6) subnet key, used to diversify
/// outbound peer selection (§4.10).
#[must_use]
pub fn subnet_key(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("v4:{}.{}", o[0], o[1])
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("v6:{:x}:{:x}", s[0], s[1])
        }
    }
}

/// Known/candidate peer addresses, grouped by subnet to bound how many
/// outbound slots a single /16 can occupy.
#[derive(Default)]
pub struct AddressBook {
    candidates: Vec<(String, u16)>,
    outbound_subnet_counts: HashMap<String, usize>,
}

impl AddressBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_candidate(&mut self, host: String, port: u16, local_mode: bool) {
        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_or_link_local(&ip) && !local_mode {
                return;
            }
        }
        if !self.candidates.iter().any(|(h, p)| h == &host && *p == port) {
            self.candidates.push((host, port));
        }
    }

    /// Whether an outbound connection to `host` would respect the
    /// per-subnet diversification cap, relaxed (any peer allowed) once the
    /// whole outbound pool has no diverse candidates left.
    #[must_use]
    pub fn allows_outbound_to(&self, host: &str, saturated: bool) -> bool {
        if saturated {
            return true;
        }
        let Ok(ip) = host.parse::<IpAddr>() else {
            return true;
        };
        let key = subnet_key(&ip);
        self.outbound_subnet_counts.get(&key).copied().unwrap_or(0) < MAX_PER_SUBNET
    }

    pub fn record_outbound(&mut self, host: &str) {
        if let Ok(ip) = host.parse::<IpAddr>() {
            *self
                .outbound_subnet_counts
                .entry(subnet_key(&ip))
                .or_insert(0) += 1;
        }
    }

    pub fn release_outbound(&mut self, host: &str) {
        if let Ok(ip) = host.parse::<IpAddr>() {
            if let Some(count) = self.outbound_subnet_counts.get_mut(&subnet_key(&ip)) {
                *count = count.saturating_sub(1);
            }
        }
    }

    #[must_use]
    pub fn candidates(&self) -> &[(String, u16)] {
        &self.candidates
    }
}

/// Reads exactly one framed message off `stream`: a 4-byte big-endian
/// length, then that many payload bytes.
///
/// # Errors
///
/// Returns `P2pError::OversizeFrame` if the declared length exceeds
/// [`MAX_FRAME_BYTES`], or `DecodeError` on I/O failure or malformed JSON.
pub async fn read_message(stream: &mut TcpStream) -> Result<Message, P2pError> {
    let mut length_buf = [0u8; 4];
    stream
        .read_exact(&mut length_buf)
        .await
        .map_err(|_| P2pError::DecodeError)?;
    let length = u32::from_be_bytes(length_buf);
    if length > MAX_FRAME_BYTES {
        return Err(P2pError::OversizeFrame);
    }
    let mut payload = vec![0u8; length as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|_| P2pError::DecodeError)?;
    decode_frame(length, &payload)
}

/// Writes one framed message to `stream`.
///
/// # Errors
///
/// Returns `P2pError::OversizeFrame`/`DecodeError` from encoding, or
/// `DecodeError` if the write itself fails.
pub async fn write_message(stream: &mut TcpStream, message: &Message) -> Result<(), P2pError> {
    let frame = encode_frame(message)?;
    stream.write_all(&frame).await.map_err(|_| P2pError::DecodeError)?;
    stream.flush().await.map_err(|_| P2pError::DecodeError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(0);
        for _ in 0..200 {
            assert!(bucket.try_consume(0, 1.0));
        }
        assert!(!bucket.try_consume(0, 1.0));
        assert!(bucket.try_consume(1_000, 1.0));
    }

    #[test]
    fn misbehavior_score_bans_at_threshold() {
        let mut score = MisbehaviorScore::new(0);
        assert!(!score.penalize(0, 25));
        assert!(!score.penalize(0, 25));
        assert!(!score.penalize(0, 25));
        assert!(score.penalize(0, 25));
        assert_eq!(score.value(), 100);
    }

    #[test]
    fn misbehavior_score_decays_per_minute() {
        let mut score = MisbehaviorScore::new(0);
        score.penalize(0, 50);
        let banned = score.penalize(60_000 * 10, 0);
        assert!(!banned);
        assert_eq!(score.value(), 40);
    }

    #[test]
    fn private_addresses_are_flagged() {
        assert!(is_private_or_link_local(&"192.168.1.1".parse().unwrap()));
        assert!(is_private_or_link_local(&"10.0.0.5".parse().unwrap()));
        assert!(!is_private_or_link_local(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn address_book_skips_private_candidates_unless_local_mode() {
        let mut book = AddressBook::new();
        book.add_candidate("192.168.1.1".to_string(), 8333, false);
        assert!(book.candidates().is_empty());

        book.add_candidate("192.168.1.1".to_string(), 8333, true);
        assert_eq!(book.candidates().len(), 1);
    }

    #[test]
    fn subnet_diversification_caps_same_slash16() {
        let mut book = AddressBook::new();
        book.record_outbound("8.8.8.1");
        book.record_outbound("8.8.8.2");
        assert!(!book.allows_outbound_to("8.8.8.3", false));
        assert!(book.allows_outbound_to("8.8.8.3", true));
        assert!(book.allows_outbound_to("9.9.9.9", false));
    }
}
