//! JSON snapshot persistence.
//!
//! The whole table set lives in memory and is rewritten to disk after each
//! mutation, via a temporary sibling file and an atomic rename so a crash
//! never leaves a half-written snapshot behind.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::WalletError;
use crate::types::{AssetKey, AssetRecord, BoxId, OverlayBox, WalletAddress, WalletId};

use super::memory::Tables;
use super::{AssetQuery, WalletStore};

pub struct FileStore {
    path: PathBuf,
    tables: RwLock<Tables>,
}

impl FileStore {
    /// Open a snapshot file, starting empty if it does not exist yet.
    pub fn open(path: &Path) -> Result<Self, WalletError> {
        let tables = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                WalletError::Store(format!("parse snapshot {}: {e}", path.display()))
            })?
        } else {
            Tables::default()
        };
        tracing::debug!(path = %path.display(), "opened wallet store");
        Ok(Self {
            path: path.to_owned(),
            tables: RwLock::new(tables),
        })
    }

    fn flush(&self, tables: &Tables) -> Result<(), WalletError> {
        let json = serde_json::to_string_pretty(tables)
            .map_err(|e| WalletError::Store(format!("serialize snapshot: {e}")))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Apply `apply` to a copy of the tables and swap it in only once the
    /// snapshot is on disk, so a failed write leaves memory untouched.
    async fn mutate(&self, apply: impl FnOnce(&mut Tables)) -> Result<(), WalletError> {
        let mut tables = self.tables.write().await;
        let mut next = tables.clone();
        apply(&mut next);
        self.flush(&next)?;
        *tables = next;
        Ok(())
    }
}

#[async_trait]
impl WalletStore for FileStore {
    async fn get_addresses(&self, wallet_id: WalletId) -> Result<Vec<WalletAddress>, WalletError> {
        Ok(self.tables.read().await.addresses_of(wallet_id))
    }

    async fn put_addresses(&self, rows: &[WalletAddress]) -> Result<(), WalletError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.mutate(|t| t.put_addresses(rows)).await
    }

    async fn get_assets(&self, query: AssetQuery) -> Result<Vec<AssetRecord>, WalletError> {
        Ok(self.tables.read().await.assets_matching(query))
    }

    async fn put_assets(&self, rows: &[AssetRecord]) -> Result<(), WalletError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.mutate(|t| t.put_assets(rows)).await
    }

    async fn delete_assets(&self, keys: &[AssetKey]) -> Result<(), WalletError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.mutate(|t| t.delete_assets(keys)).await
    }

    async fn get_overlay_boxes(&self, wallet_id: WalletId) -> Result<Vec<OverlayBox>, WalletError> {
        Ok(self.tables.read().await.overlay_of(wallet_id))
    }

    async fn put_overlay_boxes(&self, rows: &[OverlayBox]) -> Result<(), WalletError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.mutate(|t| t.put_overlay(rows)).await
    }

    async fn delete_overlay_boxes(&self, ids: &[BoxId]) -> Result<(), WalletError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.mutate(|t| t.delete_overlay(ids)).await
    }
}
