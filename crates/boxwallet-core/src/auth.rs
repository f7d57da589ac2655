//! Proof of address control for connected applications.
//!
//! The signed text binds the message to the requesting origin, a
//! timestamp and a random nonce, and is hashed under its own domain tag so
//! an auth signature can never double as a transaction proof.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::Address;
use crate::error::WalletError;
use crate::keys::ExtendedKey;
use crate::prover::{schnorr_sign, schnorr_verify};
use crate::sigma::blake2b256;
use crate::types::WalletAddress;
use crate::utxo::now_millis;

pub const AUTH_DOMAIN: &[u8] = b"boxwallet-auth:v1\0";

const NONCE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProof {
    pub address: String,
    pub message: String,
    pub origin: String,
    pub timestamp_ms: u64,
    /// Hex.
    pub nonce: String,
    /// Hex Schnorr signature.
    pub signature: String,
}

impl AuthProof {
    /// `{message};{origin};{timestamp_ms};{nonce_hex}`
    pub fn signed_message(&self) -> String {
        format!(
            "{};{};{};{}",
            self.message, self.origin, self.timestamp_ms, self.nonce
        )
    }
}

fn auth_digest(signed_message: &str) -> [u8; 32] {
    let mut data = Vec::with_capacity(AUTH_DOMAIN.len() + signed_message.len());
    data.extend_from_slice(AUTH_DOMAIN);
    data.extend_from_slice(signed_message.as_bytes());
    blake2b256(&data)
}

/// Sign `message` for `origin` with the key behind `address`.
pub fn sign_message(
    key: &ExtendedKey,
    addresses: &[WalletAddress],
    address: &str,
    message: &str,
    origin: &str,
) -> Result<AuthProof, WalletError> {
    // The message may hold separators; the origin may not, so the signed
    // text splits unambiguously from the right.
    if origin.contains(';') {
        return Err(WalletError::InvalidRequest("origin must not contain ';'".into()));
    }
    let index = addresses
        .iter()
        .find(|a| a.script == address)
        .map(|a| a.index)
        .ok_or_else(|| WalletError::AddressNotOwned(address.to_owned()))?;
    let network = Address::decode(address)?.network();
    if key.derive_address(index, network)?.address != address {
        return Err(WalletError::AddressNotOwned(address.to_owned()));
    }
    let secret = key.derive_private_key(index)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut proof = AuthProof {
        address: address.to_owned(),
        message: message.to_owned(),
        origin: origin.to_owned(),
        timestamp_ms: now_millis(),
        nonce: hex::encode(nonce),
        signature: String::new(),
    };
    proof.signature = hex::encode(schnorr_sign(&secret, auth_digest(&proof.signed_message())));
    debug!(address, origin, "auth message signed");
    Ok(proof)
}

/// Check `proof` against the public key embedded in its address.
pub fn verify_message(proof: &AuthProof) -> Result<bool, WalletError> {
    let address = Address::decode(&proof.address)?;
    let public_key = address
        .public_key()
        .ok_or_else(|| WalletError::InvalidAddress(format!("{}: not a P2PK address", proof.address)))?;
    let signature = hex::decode(&proof.signature)
        .map_err(|e| WalletError::InvalidRequest(format!("signature hex: {e}")))?;
    Ok(schnorr_verify(
        public_key,
        auth_digest(&proof.signed_message()),
        &signature,
    ))
}
