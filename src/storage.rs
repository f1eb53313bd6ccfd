//! Crash-safe on-disk state, spec.md §4.9. No teacher counterpart (the
//! Aevum-Bond demo never persists anything); grounded on the append-only log
//! plus atomic-rename pattern used throughout the Bitcoin-adjacent crates in
//! `other_examples/` for metadata/ban-list files.

use crate::error::StorageError;
use pq_core::Block;
use serde::{Deserialize, Serialize};
use shared::{BlockHeight, Hash256, Timestamp};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// 24 hours, the ban TTL (§4.10).
pub const BAN_TTL_MS: u64 = 24 * 60 * 60 * 1000;
/// Most anchor peers retained across restarts (§4.9).
pub const MAX_ANCHORS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub height: BlockHeight,
    pub difficulty: String,
    pub genesis_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub host: String,
    pub port: u16,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletFile {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

/// Owns every on-disk artifact under `data_dir`. The block log is the only
/// append-only file; metadata/ban/anchor files are always rewritten whole
/// via write-temp-then-rename.
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// # Errors
    ///
    /// Returns `StorageError::Io` if `data_dir` cannot be created.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Appends one NDJSON record to `blocks.jsonl`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io`/`StorageError::Serialization` on failure;
    /// per spec.md §7, storage I/O errors are fatal to the caller.
    pub fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path("blocks.jsonl"))?;
        let line = serde_json::to_string(block)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    /// Reads every block recorded in `blocks.jsonl`, in order. A short or
    /// malformed trailing line (the signature of a crash mid-append) is
    /// silently dropped rather than treated as corruption; any non-trailing
    /// bad line is `CorruptRecord`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` on read failure, or `CorruptRecord` if a
    /// non-trailing line fails to parse.
    pub fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let path = self.path("blocks.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()?;

        let mut blocks = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Block>(line) {
                Ok(block) => blocks.push(block),
                Err(_) if i == lines.len() - 1 => break,
                Err(_) => {
                    return Err(StorageError::CorruptRecord {
                        offset: i as u64,
                    })
                }
            }
        }
        Ok(blocks)
    }

    fn write_atomic(&self, name: &str, contents: &str) -> Result<(), StorageError> {
        let final_path = self.path(name);
        let tmp_path = self.path(&format!("{name}.tmp"));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(contents.as_bytes())?;
            tmp.flush()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `StorageError` on write failure.
    pub fn write_metadata(&self, metadata: &Metadata) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(metadata)?;
        self.write_atomic("metadata.json", &json)
    }

    /// # Errors
    ///
    /// Returns `StorageError` on read failure; returns `Ok(None)` if the
    /// file has never been written.
    pub fn read_metadata(&self) -> Result<Option<Metadata>, StorageError> {
        let path = self.path("metadata.json");
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Loads `banned.json`, pruning entries whose expiry has passed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on read failure.
    pub fn load_bans(&self, now_ms: Timestamp) -> Result<HashMap<String, Timestamp>, StorageError> {
        let path = self.path("banned.json");
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(path)?;
        let raw: HashMap<String, Timestamp> = serde_json::from_str(&contents)?;
        Ok(raw.into_iter().filter(|(_, expiry)| *expiry > now_ms).collect())
    }

    /// # Errors
    ///
    /// Returns `StorageError` on write failure.
    pub fn write_bans(&self, bans: &HashMap<String, Timestamp>) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(bans)?;
        self.write_atomic("banned.json", &json)
    }

    /// # Errors
    ///
    /// Returns `StorageError` on read failure.
    pub fn load_anchors(&self) -> Result<Vec<Anchor>, StorageError> {
        let path = self.path("anchors.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Persists at most [`MAX_ANCHORS`] anchors, newest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on write failure.
    pub fn write_anchors(&self, anchors: &mut Vec<Anchor>) -> Result<(), StorageError> {
        anchors.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        anchors.truncate(MAX_ANCHORS);
        let json = serde_json::to_string_pretty(anchors)?;
        self.write_atomic("anchors.json", &json)
    }

    /// # Errors
    ///
    /// Returns `StorageError` on write failure.
    pub fn write_wallet(&self, keypair: &shared::KeyPair) -> Result<(), StorageError> {
        let wallet = WalletFile {
            public_key: keypair.public_key.as_bytes().to_vec(),
            private_key: keypair.private_key.as_bytes().to_vec(),
        };
        let json = serde_json::to_string_pretty(&wallet)?;
        self.write_atomic("wallet.json", &json)
    }

    /// # Errors
    ///
    /// Returns `StorageError` on read failure; `Ok(None)` if absent.
    pub fn read_wallet(&self) -> Result<Option<WalletFile>, StorageError> {
        let path = self.path("wallet.json");
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

/// `Metadata.genesisHash`/`difficulty` are hex strings in the external
/// representation (§6); this is the shared encode/decode helper.
#[must_use]
pub fn hash_to_hex(hash: &Hash256) -> String {
    hash.to_string()
}

/// # Errors
///
/// Returns a parse error if `s` is not 64 hex characters.
pub fn hex_to_hash(s: &str) -> Result<Hash256, hex::FromHexError> {
    Hash256::try_from(s)
}
