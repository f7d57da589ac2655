//! Hierarchical key derivation for wallet accounts.
//!
//! A wallet is rooted at a single account node (`m/44'/429'/0'/0`). Every
//! address is a non-hardened child of that node, so the neutered account
//! key alone is enough to derive the full address set.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::NetworkKind;
use serde::{Deserialize, Serialize};

use crate::address::{Address, Network};
use crate::error::WalletError;
use crate::types::ErgoTree;

/// Hardened prefix from the master node to the account node, plus the
/// fixed external chain.
pub const ACCOUNT_PATH: &str = "m/44'/429'/0'/0";

/// A derived address together with its index under the account node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedAddress {
    pub index: u32,
    pub address: String,
    pub ergo_tree: ErgoTree,
}

/// Account-level extended key. Holds the public node always and the
/// private node until [`ExtendedKey::neuter`] wipes it.
pub struct ExtendedKey {
    xpriv: Option<Xpriv>,
    xpub: Xpub,
}

impl ExtendedKey {
    /// Derive the account node from a BIP39 mnemonic.
    pub fn from_mnemonic(phrase: &str, passphrase: &str) -> Result<Self, WalletError> {
        let mnemonic = bip39::Mnemonic::parse(phrase)
            .map_err(|e| WalletError::InvalidRequest(format!("invalid mnemonic: {e}")))?;
        Self::from_seed(&mnemonic.to_seed(passphrase))
    }

    pub fn from_seed(seed: &[u8]) -> Result<Self, WalletError> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(NetworkKind::Main, seed).map_err(bip32_error)?;
        let path = account_path()?;
        let account = master.derive_priv(&secp, &path).map_err(bip32_error)?;
        let xpub = Xpub::from_priv(&secp, &account);
        Ok(Self {
            xpriv: Some(account),
            xpub,
        })
    }

    /// Import a watch-only key from its base58 export.
    pub fn from_extended_public_key(encoded: &str) -> Result<Self, WalletError> {
        let xpub = Xpub::from_str(encoded.trim())
            .map_err(|e| WalletError::InvalidRequest(format!("invalid extended key: {e}")))?;
        Ok(Self { xpriv: None, xpub })
    }

    pub fn to_extended_public_key(&self) -> String {
        self.xpub.to_string()
    }

    /// Compressed public key of the account node.
    pub fn public_key(&self) -> [u8; 33] {
        self.xpub.public_key.serialize()
    }

    pub fn chain_code(&self) -> [u8; 32] {
        // Serialized layout: version(4) depth(1) fingerprint(4) child(4) chain code(32) key(33).
        let encoded = self.xpub.encode();
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&encoded[13..45]);
        chain_code
    }

    /// Hex of the account public key; the key under which a session caches
    /// this wallet.
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    pub fn is_neutered(&self) -> bool {
        self.xpriv.is_none()
    }

    /// Wipe the private node. Irreversible for this instance; calling it
    /// again is a no-op.
    pub fn neuter(&mut self) {
        if let Some(mut xpriv) = self.xpriv.take() {
            xpriv.private_key.non_secure_erase();
        }
    }

    /// Neutered copy, safe to share with read-only consumers.
    pub fn public_only(&self) -> Self {
        Self {
            xpriv: None,
            xpub: self.xpub,
        }
    }

    pub fn derive_address(&self, index: u32, network: Network) -> Result<IndexedAddress, WalletError> {
        let secp = Secp256k1::verification_only();
        let child = self
            .xpub
            .derive_pub(&secp, &[normal_child(index)?])
            .map_err(bip32_error)?;
        let address = Address::p2pk(network, child.public_key.serialize());
        Ok(IndexedAddress {
            index,
            ergo_tree: address.ergo_tree(),
            address: address.encode(),
        })
    }

    /// Addresses `offset..offset + count` in ascending index order.
    pub fn derive_addresses(
        &self,
        count: u32,
        offset: u32,
        network: Network,
    ) -> Result<Vec<IndexedAddress>, WalletError> {
        let end = offset
            .checked_add(count)
            .ok_or_else(|| WalletError::InvalidRequest("address index overflow".into()))?;
        (offset..end)
            .map(|index| self.derive_address(index, network))
            .collect()
    }

    pub fn derive_private_key(&self, index: u32) -> Result<SecretKey, WalletError> {
        let xpriv = self.xpriv.as_ref().ok_or(WalletError::KeyUnavailable)?;
        let secp = Secp256k1::new();
        let child = xpriv
            .derive_priv(&secp, &[normal_child(index)?])
            .map_err(bip32_error)?;
        Ok(child.private_key)
    }

    /// Full path from the master node, as a hardware signer expects it.
    pub fn full_path(index: u32) -> Result<DerivationPath, WalletError> {
        Ok(account_path()?.child(normal_child(index)?))
    }
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedKey")
            .field("xpub", &self.xpub.to_string())
            .field("neutered", &self.is_neutered())
            .finish()
    }
}

impl Drop for ExtendedKey {
    fn drop(&mut self) {
        self.neuter();
    }
}

fn account_path() -> Result<DerivationPath, WalletError> {
    DerivationPath::from_str(ACCOUNT_PATH).map_err(bip32_error)
}

fn normal_child(index: u32) -> Result<ChildNumber, WalletError> {
    ChildNumber::from_normal_idx(index).map_err(bip32_error)
}

fn bip32_error(e: bitcoin::bip32::Error) -> WalletError {
    WalletError::InvalidRequest(format!("key derivation failed: {e}"))
}
