//! Ergo-style address encoding.
//!
//! An address is `base58(prefix ++ content ++ checksum)` where the prefix
//! byte combines the network and address type, and the checksum is the
//! first four bytes of BLAKE2b-256 over `prefix ++ content`.

use std::fmt;
use std::str::FromStr;

use bitcoin::base58;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;
use crate::sigma::blake2b256;
use crate::types::ErgoTree;

/// Script header for a tree that is exactly `proveDlog(pk)`.
const P2PK_TREE_PREFIX: [u8; 3] = [0x00, 0x08, 0xcd];
const PUBKEY_LEN: usize = 33;
const CHECKSUM_LEN: usize = 4;

const TYPE_P2PK: u8 = 0x01;
const TYPE_P2S: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    fn prefix(self) -> u8 {
        match self {
            Self::Mainnet => 0x00,
            Self::Testnet => 0x10,
        }
    }

    fn from_prefix(byte: u8) -> Option<Self> {
        match byte & 0xf0 {
            0x00 => Some(Self::Mainnet),
            0x10 => Some(Self::Testnet),
            _ => None,
        }
    }
}

impl FromStr for Network {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            other => Err(WalletError::InvalidRequest(format!(
                "unknown network `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Payload {
    P2pk([u8; PUBKEY_LEN]),
    P2s(Vec<u8>),
}

/// A decoded address bound to its network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    network: Network,
    payload: Payload,
}

impl Address {
    pub fn p2pk(network: Network, public_key: [u8; PUBKEY_LEN]) -> Self {
        Self {
            network,
            payload: Payload::P2pk(public_key),
        }
    }

    /// Address for an arbitrary tree. Trees that are a bare public key
    /// become P2PK addresses, everything else P2S.
    pub fn from_ergo_tree(network: Network, tree: &ErgoTree) -> Self {
        let bytes = tree.as_bytes();
        if bytes.len() == P2PK_TREE_PREFIX.len() + PUBKEY_LEN && bytes.starts_with(&P2PK_TREE_PREFIX)
        {
            let mut pk = [0u8; PUBKEY_LEN];
            pk.copy_from_slice(&bytes[P2PK_TREE_PREFIX.len()..]);
            return Self::p2pk(network, pk);
        }
        Self {
            network,
            payload: Payload::P2s(bytes.to_vec()),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn public_key(&self) -> Option<&[u8; PUBKEY_LEN]> {
        match &self.payload {
            Payload::P2pk(pk) => Some(pk),
            Payload::P2s(_) => None,
        }
    }

    pub fn ergo_tree(&self) -> ErgoTree {
        match &self.payload {
            Payload::P2pk(pk) => {
                let mut bytes = Vec::with_capacity(P2PK_TREE_PREFIX.len() + PUBKEY_LEN);
                bytes.extend_from_slice(&P2PK_TREE_PREFIX);
                bytes.extend_from_slice(pk);
                ErgoTree(bytes)
            }
            Payload::P2s(tree) => ErgoTree(tree.clone()),
        }
    }

    pub fn encode(&self) -> String {
        let (kind, content): (u8, &[u8]) = match &self.payload {
            Payload::P2pk(pk) => (TYPE_P2PK, pk),
            Payload::P2s(tree) => (TYPE_P2S, tree),
        };
        let mut bytes = Vec::with_capacity(1 + content.len() + CHECKSUM_LEN);
        bytes.push(self.network.prefix() | kind);
        bytes.extend_from_slice(content);
        let checksum = blake2b256(&bytes);
        bytes.extend_from_slice(&checksum[..CHECKSUM_LEN]);
        base58::encode(&bytes)
    }

    pub fn decode(s: &str) -> Result<Self, WalletError> {
        let bytes =
            base58::decode(s).map_err(|e| WalletError::InvalidAddress(format!("{s}: {e}")))?;
        if bytes.len() < 1 + CHECKSUM_LEN {
            return Err(WalletError::InvalidAddress(format!("{s}: too short")));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if blake2b256(body)[..CHECKSUM_LEN] != *checksum {
            return Err(WalletError::InvalidAddress(format!("{s}: bad checksum")));
        }

        let network = Network::from_prefix(body[0])
            .ok_or_else(|| WalletError::InvalidAddress(format!("{s}: unknown network")))?;
        let content = &body[1..];
        let payload = match body[0] & 0x0f {
            TYPE_P2PK => {
                let pk: [u8; PUBKEY_LEN] = content.try_into().map_err(|_| {
                    WalletError::InvalidAddress(format!("{s}: bad public key length"))
                })?;
                Payload::P2pk(pk)
            }
            TYPE_P2S => Payload::P2s(content.to_vec()),
            other => {
                return Err(WalletError::InvalidAddress(format!(
                    "{s}: unsupported address type {other:#04x}"
                )))
            }
        };

        Ok(Self { network, payload })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Address {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Encode the tree of a box as an address string for display and
/// ownership lookups.
pub fn tree_to_address(network: Network, tree: &ErgoTree) -> String {
    Address::from_ergo_tree(network, tree).encode()
}
