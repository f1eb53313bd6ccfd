//! Type aliases and small value types shared across every layer.

use serde::{Deserialize, Serialize};

/// Transaction id: `doubleSha256(serializeForSigning(...))`.
pub type TxId = crate::Hash256;
/// Block id: `doubleSha256(header)`.
pub type BlockId = crate::Hash256;
/// Address: `SHA-256(pqPublicKey)`, or all-zero for the burn address.
pub type Address = crate::Hash256;
/// Monetary amount, integer satoshi-like units.
pub type Amount = u64;
/// Unix timestamp in milliseconds.
pub type Timestamp = u64;
/// Height of a block in the chain; genesis is 0.
pub type BlockHeight = u64;
/// Index of an output within a transaction.
pub type OutputIndex = u32;

/// Reference to a transaction output: the unit a UTXO is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: OutputIndex,
}

impl OutPoint {
    #[must_use]
    pub const fn new(txid: TxId, vout: OutputIndex) -> Self {
        Self { txid, vout }
    }
}

/// Network this node is configured to participate in.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    Mainnet,
    Testnet,
    #[default]
    Devnet,
    Regtest,
}

/// Node-wide configuration, populated from CLI flags at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: NetworkType,
    pub p2p_port: u16,
    pub rpc_port: u16,
    pub bind_address: String,
    pub bootstrap_peers: Vec<String>,
    pub data_dir: String,
    pub snapshot_path: Option<String>,
    pub mine_address: Option<String>,
    pub local_mode: bool,
    pub simulate: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkType::Devnet,
            p2p_port: 8333,
            rpc_port: 8332,
            bind_address: "0.0.0.0".to_string(),
            bootstrap_peers: vec![],
            data_dir: "./data".to_string(),
            snapshot_path: None,
            mine_address: None,
            local_mode: false,
            simulate: false,
        }
    }
}

/// Per-peer bookkeeping exposed to the node facade's status accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: String,
    pub height: BlockHeight,
    pub protocol_version: u32,
    pub last_seen: Timestamp,
    pub inbound: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outpoint_roundtrips_fields() {
        let txid = crate::Hash256::zero();
        let outpoint = OutPoint::new(txid, 3);
        assert_eq!(outpoint.txid, txid);
        assert_eq!(outpoint.vout, 3);
    }

    #[test]
    fn node_config_defaults_to_devnet() {
        let config = NodeConfig::default();
        assert_eq!(config.network, NetworkType::Devnet);
        assert_eq!(config.p2p_port, 8333);
        assert!(!config.local_mode);
    }
}
