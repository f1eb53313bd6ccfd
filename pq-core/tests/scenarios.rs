//! End-to-end scenarios exercising public `pq_core` surface only (no access
//! to crate-private fields, unlike the in-crate tests in `blockchain.rs`,
//! `mempool.rs`, and `src/network/sync.rs` that cover the remaining
//! scenarios requiring private state).

use pq_core::blockchain::{make_genesis_block, NetworkParams};
use pq_core::claim::claim_message_hash;
use pq_core::error::{ChainError, ClaimError};
use pq_core::snapshot::{EntryType, Snapshot, SnapshotEntry};
use pq_core::transaction::{claim_sentinel_txid, block_subsidy, ClaimData, Input, Output, SENTINEL_INDEX};
use pq_core::{Block, BlockHeader, Blockchain, OutPoint, Transaction};
use shared::{Hash256, KeyPair};

fn easy_target() -> Hash256 {
    Hash256::from_bytes([0xff; 32])
}

fn params() -> NetworkParams {
    NetworkParams {
        starting_target: easy_target(),
    }
}

fn addr(byte: u8) -> shared::Address {
    Hash256::from_bytes([byte; 32])
}

/// Brute-forces a nonce against the trivially-satisfiable `0xff..` target,
/// the same technique `pq-core`'s own chain tests use in place of a real
/// miner.
fn mine(
    previous_hash: Hash256,
    transactions: Vec<Transaction>,
    timestamp: u64,
    target: Hash256,
    height: u64,
) -> Block {
    let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.id).collect();
    let root = pq_core::block::merkle_root(&txids);
    for nonce in 0..u32::MAX {
        let header = BlockHeader::new(1, previous_hash, root, timestamp, target, nonce);
        if header.block_hash().meets_target(&target) {
            return Block::new(header, transactions, height);
        }
    }
    panic!("failed to find a satisfying nonce");
}

/// S1: a coinbase matures after 100 confirmations and its output can then
/// fund a regular transfer, with change and fee landing where expected.
#[test]
fn s1_mine_mature_and_spend() {
    let wallet_a = KeyPair::generate();
    let a = wallet_a.public_key.derive_address();
    let b = addr(2);
    let filler_miner = addr(3);

    let genesis = make_genesis_block(addr(0xAA), easy_target(), 0);
    let mut chain = Blockchain::new(genesis, params(), None);

    let coinbase1 = Transaction::create_coinbase(a, 1, 0, 1_000);
    let coinbase1_id = coinbase1.id;
    let block1 = mine(chain.tip().hash, vec![coinbase1], 1_000, chain.target(), 1);
    chain.add_block(block1, 1_001).unwrap();

    // 100 empty blocks: the coinbase minted at height 1 needs
    // `spend_height >= 1 + COINBASE_MATURITY(100)`, i.e. spendable starting
    // at height 101.
    for h in 2..=101u64 {
        let ts = 1_000 * h;
        let coinbase = Transaction::create_coinbase(filler_miner, h, 0, ts);
        let block = mine(chain.tip().hash, vec![coinbase], ts, chain.target(), h);
        chain.add_block(block, ts + 1).unwrap();
    }
    assert_eq!(chain.height(), 101);

    let spend_outpoint = OutPoint::new(coinbase1_id, 0);
    let fee = 12_500_000u64;
    let transfer = Transaction::create_transfer(
        a,
        &[(spend_outpoint, block_subsidy(1), &wallet_a)],
        &[(b, 200_000_000)],
        fee,
        102_000,
    )
    .unwrap();

    let coinbase102 = Transaction::create_coinbase(b, 102, fee, 102_000);
    let block102 = mine(
        chain.tip().hash,
        vec![coinbase102, transfer],
        102_000,
        chain.target(),
        102,
    );
    chain.add_block(block102, 102_001).unwrap();

    assert_eq!(chain.height(), 102);
    // A kept only the change: 3.125 coin in, 2 coin out, 0.125 coin fee.
    assert_eq!(chain.get_balance(&a), 100_000_000);
    // B received the transfer plus its own block-102 coinbase (subsidy + fee).
    assert_eq!(chain.get_balance(&b), 525_000_000);
}

/// Signs a claim proof for a P2PKH entry: `btc_address = hash160(pubkey)`,
/// matching `claim.rs`'s `derive_btc_address` for [`EntryType::P2pkh`].
fn sign_claim(
    secp_key: &secp256k1::SecretKey,
    pq_address: Hash256,
    snapshot_block_hash: Hash256,
) -> (ClaimData, [u8; 20]) {
    let secp = secp256k1::Secp256k1::new();
    let ecdsa_pub_key = secp256k1::PublicKey::from_secret_key(&secp, secp_key)
        .serialize()
        .to_vec();
    let btc_address = shared::hash160(&ecdsa_pub_key);
    let mut claim = ClaimData {
        btc_address,
        ecdsa_pub_key,
        ecdsa_signature: Vec::new(),
        pq_address,
    };
    let digest = claim_message_hash(&claim, &snapshot_block_hash);
    let msg = secp256k1::Message::from_digest_slice(digest.as_bytes()).unwrap();
    let sig = secp.sign_ecdsa(&msg, secp_key);
    claim.ecdsa_signature = sig.serialize_compact().to_vec();
    (claim, btc_address)
}

fn claim_tx(claim: ClaimData, amount: u64, timestamp: u64) -> Transaction {
    let input = Input {
        prev_txid: claim_sentinel_txid(),
        prev_index: SENTINEL_INDEX,
        pub_key: Vec::new(),
        signature: Vec::new(),
    };
    let output = Output {
        address: claim.pq_address,
        amount,
    };
    let id = Transaction::compute_id(
        std::slice::from_ref(&input),
        std::slice::from_ref(&output),
        timestamp,
        Some(&claim),
    );
    Transaction {
        id,
        inputs: vec![input],
        outputs: vec![output],
        timestamp,
        claim_data: Some(claim),
    }
}

/// S2: a valid claim mints once; a second claim against the same frozen BTC
/// address is rejected as already-claimed even though nothing else about
/// the attempt is structurally wrong.
#[test]
fn s2_double_claim_is_rejected() {
    let snapshot_block_hash = Hash256::from_bytes([7; 32]);
    let secp_key = secp256k1::SecretKey::from_slice(&[0x11; 32]).unwrap();
    let entry_amount = 50_000_000u64;

    let (claim, btc_address) = sign_claim(&secp_key, addr(5), snapshot_block_hash);

    let snapshot = Snapshot::from_entries(
        vec![SnapshotEntry {
            btc_address,
            amount: entry_amount,
            entry_type: EntryType::P2pkh,
        }],
        700_000,
        snapshot_block_hash,
    );

    let genesis = make_genesis_block(addr(0xAA), easy_target(), 0);
    let mut chain = Blockchain::new(genesis, params(), Some(snapshot));

    let first_claim = claim_tx(claim.clone(), entry_amount, 1_000);
    let coinbase1 = Transaction::create_coinbase(addr(1), 1, 0, 1_000);
    let block1 = mine(
        chain.tip().hash,
        vec![coinbase1, first_claim],
        1_000,
        chain.target(),
        1,
    );
    chain.add_block(block1, 1_001).unwrap();

    assert!(chain.is_claimed(&btc_address));
    assert_eq!(chain.get_balance(&addr(5)), entry_amount);
    assert_eq!(chain.get_claim_stats(), (1, entry_amount));

    // Same BTC address, different recipient; a distinct txid but the same
    // already-spent snapshot entry.
    let mut second_claim_data = claim;
    second_claim_data.pq_address = addr(6);
    let second_claim = claim_tx(second_claim_data, entry_amount, 2_000);
    let coinbase2 = Transaction::create_coinbase(addr(1), 2, 0, 2_000);
    let block2 = mine(
        chain.tip().hash,
        vec![coinbase2, second_claim],
        2_000,
        chain.target(),
        2,
    );

    let result = chain.add_block(block2, 2_001);
    assert_eq!(result, Err(ChainError::Claim(ClaimError::AlreadyClaimed)));
    assert_eq!(chain.height(), 1);
    assert_eq!(chain.get_balance(&addr(6)), 0);
}

/// S2 variant: two claims for the *same* BTC address within a single block
/// must not both mint, even though `claimed_btc` (the cross-block dedup set)
/// is still empty when the block's transactions are first scanned.
#[test]
fn s2_double_claim_within_same_block_is_rejected() {
    let snapshot_block_hash = Hash256::from_bytes([8; 32]);
    let secp_key = secp256k1::SecretKey::from_slice(&[0x22; 32]).unwrap();
    let entry_amount = 25_000_000u64;

    let (claim, btc_address) = sign_claim(&secp_key, addr(5), snapshot_block_hash);

    let snapshot = Snapshot::from_entries(
        vec![SnapshotEntry {
            btc_address,
            amount: entry_amount,
            entry_type: EntryType::P2pkh,
        }],
        700_000,
        snapshot_block_hash,
    );

    let genesis = make_genesis_block(addr(0xAA), easy_target(), 0);
    let mut chain = Blockchain::new(genesis, params(), Some(snapshot));

    let first_claim = claim_tx(claim.clone(), entry_amount, 1_000);
    let mut second_claim_data = claim;
    second_claim_data.pq_address = addr(6);
    let second_claim = claim_tx(second_claim_data, entry_amount, 1_001);

    let coinbase1 = Transaction::create_coinbase(addr(1), 1, 0, 1_000);
    let block1 = mine(
        chain.tip().hash,
        vec![coinbase1, first_claim, second_claim],
        1_000,
        chain.target(),
        1,
    );

    let result = chain.add_block(block1, 1_001);
    assert_eq!(result, Err(ChainError::Claim(ClaimError::AlreadyClaimed)));
    assert_eq!(chain.height(), 0);
    assert!(!chain.is_claimed(&btc_address));
    assert_eq!(chain.get_balance(&addr(5)), 0);
    assert_eq!(chain.get_balance(&addr(6)), 0);
}
