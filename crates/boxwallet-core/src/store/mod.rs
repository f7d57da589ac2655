//! Persistence abstraction for wallet state.
//!
//! Defines the [`WalletStore`] trait and provides an in-memory
//! implementation ([`MemoryStore`]) plus a JSON snapshot file
//! implementation ([`FileStore`]). Every write is an idempotent upsert keyed
//! by a natural key, so a retried sync pass never duplicates rows.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::{MemoryStore, WriteCounts};

use async_trait::async_trait;

use crate::error::WalletError;
use crate::types::{AssetKey, AssetRecord, BoxId, OverlayBox, TokenId, WalletAddress, WalletId};

/// Selector for [`WalletStore::get_assets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetQuery {
    Wallet(WalletId),
    Token(WalletId, TokenId),
}

/// Key-value table operations the wallet engine needs.
///
/// No cross-call transactions are assumed; callers order their writes so
/// partial application is always a consistent prefix.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Addresses of a wallet, ordered by index.
    async fn get_addresses(&self, wallet_id: WalletId) -> Result<Vec<WalletAddress>, WalletError>;

    /// Upsert keyed by `script`.
    async fn put_addresses(&self, rows: &[WalletAddress]) -> Result<(), WalletError>;

    async fn get_assets(&self, query: AssetQuery) -> Result<Vec<AssetRecord>, WalletError>;

    /// Upsert keyed by `(token_id, address)`.
    async fn put_assets(&self, rows: &[AssetRecord]) -> Result<(), WalletError>;

    async fn delete_assets(&self, keys: &[AssetKey]) -> Result<(), WalletError>;

    async fn get_overlay_boxes(&self, wallet_id: WalletId) -> Result<Vec<OverlayBox>, WalletError>;

    /// Upsert keyed by `box_id`.
    async fn put_overlay_boxes(&self, rows: &[OverlayBox]) -> Result<(), WalletError>;

    async fn delete_overlay_boxes(&self, ids: &[BoxId]) -> Result<(), WalletError>;
}
