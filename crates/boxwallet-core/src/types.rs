//! Domain types for the wallet engine.
//!
//! Contains the fixed-width identifiers (`TokenId`, `BoxId`, `TxId`), box
//! and token representations, the persisted wallet rows (`WalletAddress`,
//! `AssetRecord`, `OverlayBox`) and chain context types like `Header`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ==============================================================================
// Fixed-width Identifiers
// ==============================================================================

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(s, &mut bytes)?;
                Ok(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

digest_id!(
    /// Token identifier. The all-zero id is reserved for the native coin.
    TokenId
);
digest_id!(BoxId);
digest_id!(TxId);

impl TokenId {
    pub const NATIVE: TokenId = TokenId([0u8; 32]);

    pub fn is_native(&self) -> bool {
        *self == Self::NATIVE
    }
}

impl From<BoxId> for TokenId {
    fn from(id: BoxId) -> Self {
        Self(id.0)
    }
}

// ==============================================================================
// Scripts
// ==============================================================================

/// Serialized spending condition of a box, carried as raw bytes and
/// exchanged as hex.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ErgoTree(pub Vec<u8>);

impl ErgoTree {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ErgoTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErgoTree({})", self.to_hex())
    }
}

impl Serialize for ErgoTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ErgoTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ==============================================================================
// Amount Encoding
// ==============================================================================

/// Serialize `u64` amounts as decimal strings so consumers without 64-bit
/// integers never lose precision. Deserialization accepts either form.
pub mod amount_str {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(n),
            Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<u64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(&v.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u64>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] u64);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
        }
    }
}

// ==============================================================================
// Boxes and Tokens
// ==============================================================================

/// A token amount carried by a box.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub token_id: TokenId,
    #[serde(with = "amount_str")]
    pub amount: u64,
}

impl Token {
    pub fn new(token_id: TokenId, amount: u64) -> Self {
        Self { token_id, amount }
    }
}

/// Non-mandatory registers `R4`..`R9`, keyed by register name, holding
/// hex-encoded serialized constants.
pub type Registers = BTreeMap<String, String>;

/// An unspent box as reported by the chain or recorded by the local
/// overlay. Immutable once created on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErgoBox {
    pub box_id: BoxId,
    pub transaction_id: TxId,
    pub index: u16,
    pub ergo_tree: ErgoTree,
    #[serde(with = "amount_str")]
    pub value: u64,
    pub creation_height: u32,
    #[serde(default)]
    pub assets: Vec<Token>,
    #[serde(default)]
    pub additional_registers: Registers,
    #[serde(default)]
    pub confirmed: bool,
}

impl ErgoBox {
    pub fn token_amount(&self, token_id: &TokenId) -> u64 {
        self.assets
            .iter()
            .filter(|t| t.token_id == *token_id)
            .map(|t| t.amount)
            .sum()
    }
}

// ==============================================================================
// Wallet Identity
// ==============================================================================

/// Local wallet identifier, wrapped for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(pub u32);

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    /// Seed held locally; signs in memory.
    Standard,
    /// Public key only; cannot sign.
    ReadOnly,
    /// Public key only; signs through an external device.
    Ledger,
}

impl WalletKind {
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Ledger)
    }
}

/// Wallet descriptor: everything needed to derive and scan addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: WalletId,
    pub name: String,
    pub kind: WalletKind,
    /// Base58 extended public key of the account node.
    pub extended_public_key: String,
    pub network: crate::address::Network,
}

// ==============================================================================
// Persisted Wallet State
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressState {
    Used,
    Unused,
}

/// Persisted usage state of one derived address. Transitions only from
/// `Unused` to `Used`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAddress {
    pub script: String,
    pub index: u32,
    pub state: AddressState,
    pub wallet_id: WalletId,
}

/// Per-address balance contribution of one token, keyed by
/// `(token_id, address)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub token_id: TokenId,
    pub address: String,
    #[serde(with = "amount_str")]
    pub confirmed_amount: u64,
    #[serde(default, with = "amount_str::option")]
    pub unconfirmed_amount: Option<u64>,
    pub wallet_id: WalletId,
}

impl AssetRecord {
    pub fn key(&self) -> AssetKey {
        (self.token_id, self.address.clone())
    }

    /// Value equality used by the sync diff.
    pub fn same_amounts(&self, other: &AssetRecord) -> bool {
        self.confirmed_amount == other.confirmed_amount
            && self.unconfirmed_amount == other.unconfirmed_amount
    }
}

/// Natural key of an [`AssetRecord`].
pub type AssetKey = (TokenId, String);

/// A box created or consumed by one of this wallet's own transactions that
/// the chain index may not reflect yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayBox {
    pub box_id: BoxId,
    pub wallet_id: WalletId,
    pub transaction_id: TxId,
    /// Consumed by a pending transaction; never select it again.
    pub locked: bool,
    /// Snapshot of a box created by a pending transaction.
    pub content: Option<ErgoBox>,
    /// Unix time in milliseconds the row was recorded.
    pub created_at: u64,
}

// ==============================================================================
// Chain Context
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub id: String,
    pub parent_id: String,
    pub height: u32,
    pub timestamp: u64,
    pub version: u8,
}

/// Display metadata for a token. Missing metadata means zero decimals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub name: Option<String>,
    pub decimals: u8,
}

/// A historical or mempool transaction with its inputs resolved to the
/// boxes they spent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTransaction {
    pub id: TxId,
    /// `None` for transactions still in the mempool.
    pub inclusion_height: Option<u32>,
    pub timestamp: Option<u64>,
    pub inputs: Vec<ErgoBox>,
    pub outputs: Vec<ErgoBox>,
}
