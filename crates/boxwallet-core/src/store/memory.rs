use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::WalletError;
use crate::types::{AssetKey, AssetRecord, BoxId, OverlayBox, WalletAddress, WalletId};

use super::{AssetQuery, WalletStore};

/// Plain table contents; also the on-disk snapshot format of
/// [`super::FileStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct Tables {
    /// Keyed by address script.
    pub(super) addresses: BTreeMap<String, WalletAddress>,
    /// Keyed by `"{token_id}:{address}"`.
    pub(super) assets: BTreeMap<String, AssetRecord>,
    /// Keyed by hex box id.
    pub(super) overlay: BTreeMap<String, OverlayBox>,
}

fn asset_row_key(key: &AssetKey) -> String {
    format!("{}:{}", key.0, key.1)
}

impl Tables {
    pub(super) fn addresses_of(&self, wallet_id: WalletId) -> Vec<WalletAddress> {
        let mut rows: Vec<WalletAddress> = self
            .addresses
            .values()
            .filter(|a| a.wallet_id == wallet_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.index);
        rows
    }

    pub(super) fn assets_matching(&self, query: AssetQuery) -> Vec<AssetRecord> {
        self.assets
            .values()
            .filter(|r| match query {
                AssetQuery::Wallet(id) => r.wallet_id == id,
                AssetQuery::Token(id, token_id) => r.wallet_id == id && r.token_id == token_id,
            })
            .cloned()
            .collect()
    }

    pub(super) fn overlay_of(&self, wallet_id: WalletId) -> Vec<OverlayBox> {
        self.overlay
            .values()
            .filter(|o| o.wallet_id == wallet_id)
            .cloned()
            .collect()
    }

    pub(super) fn put_addresses(&mut self, rows: &[WalletAddress]) {
        for row in rows {
            self.addresses.insert(row.script.clone(), row.clone());
        }
    }

    pub(super) fn put_assets(&mut self, rows: &[AssetRecord]) {
        for row in rows {
            self.assets.insert(asset_row_key(&row.key()), row.clone());
        }
    }

    pub(super) fn delete_assets(&mut self, keys: &[AssetKey]) {
        for key in keys {
            self.assets.remove(&asset_row_key(key));
        }
    }

    pub(super) fn put_overlay(&mut self, rows: &[OverlayBox]) {
        for row in rows {
            self.overlay.insert(row.box_id.to_string(), row.clone());
        }
    }

    pub(super) fn delete_overlay(&mut self, ids: &[BoxId]) {
        for id in ids {
            self.overlay.remove(&id.to_string());
        }
    }
}

/// Number of rows written per table since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub addresses: usize,
    pub assets: usize,
    pub asset_deletes: usize,
    pub overlay: usize,
}

impl WriteCounts {
    pub fn total(&self) -> usize {
        self.addresses + self.assets + self.asset_deletes + self.overlay
    }
}

/// In-memory store. Counts written rows so callers can assert that an
/// unchanged sync produces no writes.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    address_writes: AtomicUsize,
    asset_writes: AtomicUsize,
    asset_deletes: AtomicUsize,
    overlay_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_counts(&self) -> WriteCounts {
        WriteCounts {
            addresses: self.address_writes.load(Ordering::Relaxed),
            assets: self.asset_writes.load(Ordering::Relaxed),
            asset_deletes: self.asset_deletes.load(Ordering::Relaxed),
            overlay: self.overlay_writes.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn get_addresses(&self, wallet_id: WalletId) -> Result<Vec<WalletAddress>, WalletError> {
        Ok(self.tables.read().await.addresses_of(wallet_id))
    }

    async fn put_addresses(&self, rows: &[WalletAddress]) -> Result<(), WalletError> {
        self.address_writes.fetch_add(rows.len(), Ordering::Relaxed);
        self.tables.write().await.put_addresses(rows);
        Ok(())
    }

    async fn get_assets(&self, query: AssetQuery) -> Result<Vec<AssetRecord>, WalletError> {
        Ok(self.tables.read().await.assets_matching(query))
    }

    async fn put_assets(&self, rows: &[AssetRecord]) -> Result<(), WalletError> {
        self.asset_writes.fetch_add(rows.len(), Ordering::Relaxed);
        self.tables.write().await.put_assets(rows);
        Ok(())
    }

    async fn delete_assets(&self, keys: &[AssetKey]) -> Result<(), WalletError> {
        self.asset_deletes.fetch_add(keys.len(), Ordering::Relaxed);
        self.tables.write().await.delete_assets(keys);
        Ok(())
    }

    async fn get_overlay_boxes(&self, wallet_id: WalletId) -> Result<Vec<OverlayBox>, WalletError> {
        Ok(self.tables.read().await.overlay_of(wallet_id))
    }

    async fn put_overlay_boxes(&self, rows: &[OverlayBox]) -> Result<(), WalletError> {
        self.overlay_writes.fetch_add(rows.len(), Ordering::Relaxed);
        self.tables.write().await.put_overlay(rows);
        Ok(())
    }

    async fn delete_overlay_boxes(&self, ids: &[BoxId]) -> Result<(), WalletError> {
        self.overlay_writes.fetch_add(ids.len(), Ordering::Relaxed);
        self.tables.write().await.delete_overlay(ids);
        Ok(())
    }
}
