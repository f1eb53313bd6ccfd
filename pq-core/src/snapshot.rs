//! The frozen Bitcoin UTXO set a node loads at startup to back claims.
//! Ingesting the NDJSON file itself (produced externally by
//! `dumptxoutset`-derived tooling) is an excluded collaborator per the
//! purpose spec; this module owns only the in-memory index and the merkle
//! root that commits to it.

use serde::{Deserialize, Serialize};
use shared::{Amount, BlockHeight, Hash256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    P2pkh,
    P2wpkh,
    P2shP2wpkh,
    /// Any script type the claim engine does not support (spec.md §4.4
    /// step 4: only P2PKH/P2WPKH/P2SH-P2WPKH are claimable).
    Other,
}

impl EntryType {
    #[must_use]
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag {
            Some("p2pkh") => Self::P2pkh,
            Some("p2wpkh") => Self::P2wpkh,
            Some("p2sh") => Self::P2shP2wpkh,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub btc_address: [u8; 20],
    pub amount: Amount,
    pub entry_type: EntryType,
}

/// One line of the snapshot NDJSON input, `{ "a": hex, "b": amount, "t"?: tag }`.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotLine {
    pub a: String,
    pub b: Amount,
    pub t: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub btc_block_height: BlockHeight,
    pub block_hash: Hash256,
    pub merkle_root: Hash256,
    entries: HashMap<[u8; 20], SnapshotEntry>,
}

impl Snapshot {
    /// Builds the lookup index and commitment root from parsed entries.
    /// The root is `SHA-256` (single pass, matching §6's NDJSON spec,
    /// unrelated to the double-SHA-256 block/tx hashing) over the stream of
    /// `"type:addr:amount;"` records in input order.
    #[must_use]
    pub fn from_entries(
        entries: Vec<SnapshotEntry>,
        btc_block_height: BlockHeight,
        block_hash: Hash256,
    ) -> Self {
        let mut commitment = Vec::new();
        let mut index = HashMap::with_capacity(entries.len());
        for entry in &entries {
            let tag = match entry.entry_type {
                EntryType::P2pkh => "p2pkh",
                EntryType::P2wpkh => "p2wpkh",
                EntryType::P2shP2wpkh => "p2sh",
                EntryType::Other => "other",
            };
            commitment.extend_from_slice(
                format!("{}:{}:{};", tag, hex::encode(entry.btc_address), entry.amount)
                    .as_bytes(),
            );
        }
        let merkle_root = Hash256::sha256(&commitment);
        for entry in entries {
            index.insert(entry.btc_address, entry);
        }
        Self {
            btc_block_height,
            block_hash,
            merkle_root,
            entries: index,
        }
    }

    /// Parses NDJSON lines (one `SnapshotLine` per input line) into entries.
    ///
    /// # Errors
    ///
    /// Returns an error if any line's `a` field is not 40 hex chars (20
    /// bytes) or otherwise fails to parse.
    pub fn parse_lines(lines: &[SnapshotLine]) -> Result<Vec<SnapshotEntry>, hex::FromHexError> {
        lines
            .iter()
            .map(|line| {
                let bytes = hex::decode(&line.a)?;
                let mut btc_address = [0u8; 20];
                if bytes.len() != 20 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                btc_address.copy_from_slice(&bytes);
                Ok(SnapshotEntry {
                    btc_address,
                    amount: line.b,
                    entry_type: EntryType::from_tag(line.t.as_deref()),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn lookup(&self, btc_address: &[u8; 20]) -> Option<&SnapshotEntry> {
        self.entries.get(btc_address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_loaded_entry() {
        let entry = SnapshotEntry {
            btc_address: [5u8; 20],
            amount: 42,
            entry_type: EntryType::P2pkh,
        };
        let snapshot = Snapshot::from_entries(vec![entry], 800_000, Hash256::zero());
        assert_eq!(snapshot.lookup(&[5u8; 20]).unwrap().amount, 42);
        assert!(snapshot.lookup(&[6u8; 20]).is_none());
    }

    #[test]
    fn merkle_root_is_deterministic() {
        let entries = vec![SnapshotEntry {
            btc_address: [1u8; 20],
            amount: 10,
            entry_type: EntryType::P2wpkh,
        }];
        let a = Snapshot::from_entries(entries.clone(), 0, Hash256::zero());
        let b = Snapshot::from_entries(entries, 0, Hash256::zero());
        assert_eq!(a.merkle_root, b.merkle_root);
    }

    #[test]
    fn parse_lines_rejects_short_address() {
        let lines = vec![SnapshotLine {
            a: "abcd".to_string(),
            b: 1,
            t: Some("p2pkh".to_string()),
        }];
        assert!(Snapshot::parse_lines(&lines).is_err());
    }
}
