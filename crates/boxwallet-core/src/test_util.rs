//! Shared test helpers for `boxwallet-core` unit tests.
//!
//! Consolidates id helpers, box builders and wallet fixtures so tests
//! across modules share a single source of truth for dummy data.

use std::sync::Arc;

use crate::address::Network;
use crate::keys::ExtendedKey;
use crate::types::{BoxId, ErgoBox, ErgoTree, Token, TokenId, TxId, Wallet, WalletId, WalletKind};

/// Standard BIP39 test vector mnemonic.
pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub const TEST_NETWORK: Network = Network::Mainnet;
pub const TEST_WALLET: WalletId = WalletId(1);

// ==============================================================================
// Id Helpers
// ==============================================================================

pub fn token_from_byte(b: u8) -> TokenId {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    bytes[31] = 0xee;
    TokenId(bytes)
}

pub fn box_id_from_byte(b: u8) -> BoxId {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    bytes[31] = 0xbb;
    BoxId(bytes)
}

pub fn tx_id_from_byte(b: u8) -> TxId {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    bytes[31] = 0x77;
    TxId(bytes)
}

// ==============================================================================
// Wallet Fixtures
// ==============================================================================

pub fn test_key() -> ExtendedKey {
    ExtendedKey::from_mnemonic(TEST_MNEMONIC, "").expect("test mnemonic is valid")
}

pub fn test_wallet(kind: WalletKind) -> Wallet {
    Wallet {
        id: TEST_WALLET,
        name: "test".into(),
        kind,
        extended_public_key: test_key().to_extended_public_key(),
        network: TEST_NETWORK,
    }
}

pub fn shared_key() -> Arc<ExtendedKey> {
    Arc::new(test_key())
}

/// Address string of the test wallet at `index`.
pub fn own_address(index: u32) -> String {
    test_key()
        .derive_address(index, TEST_NETWORK)
        .expect("derive test address")
        .address
}

/// P2PK tree of the test wallet at `index`.
pub fn p2pk_tree(index: u32) -> ErgoTree {
    test_key()
        .derive_address(index, TEST_NETWORK)
        .expect("derive test address")
        .ergo_tree
}

/// A tree that belongs to nobody in the test wallet.
pub fn foreign_tree(b: u8) -> ErgoTree {
    let mut bytes = vec![0x00, 0x08, 0xcd, 0x03];
    bytes.extend(std::iter::repeat(b).take(32));
    ErgoTree(bytes)
}

// ==============================================================================
// Box Builders
// ==============================================================================

/// Build a confirmed box with sane defaults.
pub fn make_box(
    id: u8,
    ergo_tree: ErgoTree,
    value: u64,
    creation_height: u32,
    assets: Vec<Token>,
) -> ErgoBox {
    ErgoBox {
        box_id: box_id_from_byte(id),
        transaction_id: tx_id_from_byte(id),
        index: 0,
        ergo_tree,
        value,
        creation_height,
        assets,
        additional_registers: Default::default(),
        confirmed: true,
    }
}

pub fn erg(whole: u64) -> u64 {
    whole * 1_000_000_000
}
