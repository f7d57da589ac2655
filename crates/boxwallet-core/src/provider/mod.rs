//! Remote chain-data abstraction layer.
//!
//! Defines the [`ChainProvider`] trait and provides an HTTP explorer
//! implementation ([`ExplorerClient`]) plus a test mock (`mock::MockProvider`).

mod explorer;
#[cfg(test)]
pub mod mock;

pub use explorer::ExplorerClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, WalletError};
use crate::tx::SignedTransaction;
use crate::types::{amount_str, ChainTransaction, ErgoBox, ErgoTree, Header, TokenId, TxId};

// ==============================================================================
// Query Types
// ==============================================================================

/// Remote balance of one token at one address. The native coin is
/// reported under [`TokenId::NATIVE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub token_id: TokenId,
    #[serde(with = "amount_str")]
    pub confirmed: u64,
    #[serde(default, with = "amount_str::option")]
    pub unconfirmed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressInfo {
    pub address: String,
    /// Whether the address ever appeared in a transaction.
    pub used: bool,
    pub assets: Vec<AssetBalance>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxTarget {
    Addresses(Vec<String>),
    TokenId(TokenId),
    ErgoTree(ErgoTree),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxSource {
    Chain,
    ChainAndPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxQuery {
    pub target: BoxTarget,
    pub source: BoxSource,
}

impl BoxQuery {
    pub fn addresses(addresses: Vec<String>, include_pending: bool) -> Self {
        Self {
            target: BoxTarget::Addresses(addresses),
            source: if include_pending {
                BoxSource::ChainAndPending
            } else {
                BoxSource::Chain
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Confirmed,
    Pending,
    /// Neither on chain nor in the pending pool.
    Dropped,
}

// ==============================================================================
// Provider Trait
// ==============================================================================

/// Remote chain queries the wallet engine depends on.
///
/// Implementations own their transport, timeouts and response decoding;
/// the engine never retries on its own except through
/// [`submit_with_retry`].
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Usage flag and balances for each address, in request order.
    async fn get_address_info(&self, addresses: &[String]) -> Result<Vec<AddressInfo>, WalletError>;

    /// Unspent boxes matching `query`.
    async fn get_boxes(&self, query: &BoxQuery) -> Result<Vec<ErgoBox>, WalletError>;

    /// Most recent `count` block headers, newest first.
    async fn get_block_headers(&self, count: usize) -> Result<Vec<Header>, WalletError>;

    async fn get_height(&self) -> Result<u32, WalletError>;

    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<TxId, WalletError>;

    async fn transaction_status(&self, tx_id: &TxId) -> Result<TxStatus, WalletError>;

    /// Recent confirmed and pending transactions touching any of
    /// `addresses`, newest first.
    async fn get_transactions(
        &self,
        addresses: &[String],
        limit: usize,
    ) -> Result<Vec<ChainTransaction>, WalletError>;
}

/// Maximum submission attempts when the network reports a lagging spend.
const SUBMIT_ATTEMPTS: usize = 3;

/// Submit, retrying only on the "input already spent" rejection that a
/// lagging index produces right after a previous send.
pub async fn submit_with_retry(
    provider: &dyn ChainProvider,
    tx: &SignedTransaction,
) -> Result<TxId, WalletError> {
    let mut attempt = 1;
    loop {
        match provider.submit_transaction(tx).await {
            Err(WalletError::Provider(err))
                if err.is_input_already_spent() && attempt < SUBMIT_ATTEMPTS =>
            {
                tracing::warn!(tx_id = %tx.id, attempt, error = %err, "submission rejected; retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

pub(crate) fn rejected(origin: &str, message: impl Into<String>) -> WalletError {
    ProviderError::Rejected {
        origin: origin.to_owned(),
        message: message.into(),
    }
    .into()
}
