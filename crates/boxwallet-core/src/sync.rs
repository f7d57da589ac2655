//! Address and asset synchronization.
//!
//! A pass refreshes the persisted addresses, then gap-scans fresh indices
//! chunk by chunk until a chunk comes back entirely unused. Results are
//! diffed against the store so unchanged rows are never rewritten, and
//! every chunk's certain results are committed before the next request so
//! an aborted pass keeps its earlier progress.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::WalletSettings;
use crate::error::WalletError;
use crate::keys::ExtendedKey;
use crate::provider::{AddressInfo, ChainProvider};
use crate::store::{AssetQuery, WalletStore};
use crate::types::{AddressState, AssetKey, AssetRecord, Wallet, WalletAddress, WalletId};

const EVENT_CAPACITY: usize = 64;

/// Deltas published to reactive consumers after each commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
    AddressesChanged {
        wallet_id: WalletId,
        addresses: Vec<WalletAddress>,
    },
    AssetsChanged {
        wallet_id: WalletId,
        updated: Vec<AssetRecord>,
        removed: Vec<AssetKey>,
    },
}

/// Everything one pass wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub addresses: Vec<WalletAddress>,
    pub updated_assets: Vec<AssetRecord>,
    pub removed_assets: Vec<AssetKey>,
    /// Addresses queried remotely during the pass.
    pub scanned: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.updated_assets.is_empty() && self.removed_assets.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// The active wallet changed while the pass was in flight; nothing
    /// further was written.
    Discarded,
}

pub struct Synchronizer {
    provider: Arc<dyn ChainProvider>,
    store: Arc<dyn WalletStore>,
    settings: WalletSettings,
    wallet_locks: Mutex<HashMap<WalletId, Arc<Mutex<()>>>>,
    last_heights: Mutex<HashMap<WalletId, u32>>,
    active: watch::Sender<Option<WalletId>>,
    events: broadcast::Sender<WalletEvent>,
}

impl Synchronizer {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        store: Arc<dyn WalletStore>,
        settings: WalletSettings,
    ) -> Self {
        let (active, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            provider,
            store,
            settings,
            wallet_locks: Mutex::new(HashMap::new()),
            last_heights: Mutex::new(HashMap::new()),
            active,
            events,
        }
    }

    /// Focus a wallet. In-flight passes for any other wallet are discarded
    /// at their next commit. `None` lifts the restriction.
    pub fn set_active(&self, wallet_id: Option<WalletId>) {
        self.active.send_replace(wallet_id);
    }

    pub fn watch_active(&self) -> watch::Receiver<Option<WalletId>> {
        self.active.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    fn is_current(&self, wallet_id: WalletId) -> bool {
        self.active.borrow().map_or(true, |active| active == wallet_id)
    }

    /// Sync only if `height` is above the last height seen for the wallet.
    pub async fn on_new_height(
        &self,
        wallet: &Wallet,
        key: &ExtendedKey,
        height: u32,
    ) -> Result<Option<SyncOutcome>, WalletError> {
        {
            let heights = self.last_heights.lock().await;
            if heights.get(&wallet.id).is_some_and(|seen| *seen >= height) {
                return Ok(None);
            }
        }
        let outcome = self.sync(wallet, key).await?;
        let mut heights = self.last_heights.lock().await;
        let seen = heights.entry(wallet.id).or_insert(height);
        *seen = (*seen).max(height);
        Ok(Some(outcome))
    }

    /// Run one full pass. Concurrent passes for the same wallet queue
    /// behind each other.
    pub async fn sync(&self, wallet: &Wallet, key: &ExtendedKey) -> Result<SyncOutcome, WalletError> {
        let lock = {
            let mut locks = self.wallet_locks.lock().await;
            Arc::clone(locks.entry(wallet.id).or_default())
        };
        let _guard = lock.lock().await;

        let persisted = self.store.get_addresses(wallet.id).await?;
        let persisted_assets = self.store.get_assets(AssetQuery::Wallet(wallet.id)).await?;
        let mut pass = Pass::new(wallet.id, &persisted, persisted_assets);
        let chunk_size = self.settings.chunk_size.max(1);

        // Refresh what is already known.
        for chunk in persisted.chunks(chunk_size as usize) {
            let scripts: Vec<String> = chunk.iter().map(|a| a.script.clone()).collect();
            let infos = self.provider.get_address_info(&scripts).await?;
            pass.absorb(chunk.iter().map(|a| a.index).zip(infos));
            if !self.commit(&mut pass, false).await? {
                return Ok(SyncOutcome::Discarded);
            }
        }

        // Gap-scan fresh indices.
        let mut offset = persisted.iter().map(|a| a.index + 1).max().unwrap_or(0);
        loop {
            let derived = key.derive_addresses(chunk_size, offset, wallet.network)?;
            let scripts: Vec<String> = derived.iter().map(|a| a.address.clone()).collect();
            let infos = self.provider.get_address_info(&scripts).await?;
            let any_used = infos.iter().any(|i| i.used);
            debug!(
                wallet_id = %wallet.id,
                offset,
                chunk = chunk_size,
                any_used,
                "scanned address chunk"
            );
            pass.absorb(derived.iter().map(|a| a.index).zip(infos));
            if !any_used {
                break;
            }
            if !self.commit(&mut pass, false).await? {
                return Ok(SyncOutcome::Discarded);
            }
            offset += chunk_size;
        }

        if !self.commit(&mut pass, true).await? {
            return Ok(SyncOutcome::Discarded);
        }
        let report = pass.report;
        info!(
            wallet_id = %wallet.id,
            scanned = report.scanned,
            addresses = report.addresses.len(),
            assets_updated = report.updated_assets.len(),
            assets_removed = report.removed_assets.len(),
            "sync pass complete"
        );
        Ok(SyncOutcome::Completed(report))
    }

    /// Write the decided prefix of the pass. Returns `false` when the pass
    /// has been superseded by a wallet switch.
    async fn commit(&self, pass: &mut Pass, last: bool) -> Result<bool, WalletError> {
        let delta = pass.decide(last);
        if delta.is_empty() {
            return Ok(true);
        }
        if !self.is_current(pass.wallet_id) {
            warn!(wallet_id = %pass.wallet_id, "active wallet changed; discarding sync results");
            return Ok(false);
        }

        // Assets first: an address row never appears before its balances.
        self.store.put_assets(&delta.updated_assets).await?;
        self.store.delete_assets(&delta.removed_assets).await?;
        self.store.put_addresses(&delta.addresses).await?;

        if !delta.addresses.is_empty() {
            let _ = self.events.send(WalletEvent::AddressesChanged {
                wallet_id: pass.wallet_id,
                addresses: delta.addresses.clone(),
            });
        }
        if !delta.updated_assets.is_empty() || !delta.removed_assets.is_empty() {
            let _ = self.events.send(WalletEvent::AssetsChanged {
                wallet_id: pass.wallet_id,
                updated: delta.updated_assets.clone(),
                removed: delta.removed_assets.clone(),
            });
        }
        pass.report.addresses.extend(delta.addresses);
        pass.report.updated_assets.extend(delta.updated_assets);
        pass.report.removed_assets.extend(delta.removed_assets);
        Ok(true)
    }
}

// ==============================================================================
// Pass State
// ==============================================================================

struct Scanned {
    index: u32,
    info: AddressInfo,
}

impl Scanned {
    fn holds_assets(&self) -> bool {
        self.info
            .assets
            .iter()
            .any(|a| a.confirmed > 0 || a.unconfirmed.is_some())
    }
}

struct Pass {
    wallet_id: WalletId,
    persisted: HashMap<String, WalletAddress>,
    persisted_assets: HashMap<AssetKey, AssetRecord>,
    scanned: Vec<Scanned>,
    decided: usize,
    last_used: Option<u32>,
    report: SyncReport,
}

impl Pass {
    fn new(wallet_id: WalletId, persisted: &[WalletAddress], assets: Vec<AssetRecord>) -> Self {
        Self {
            wallet_id,
            persisted: persisted
                .iter()
                .map(|a| (a.script.clone(), a.clone()))
                .collect(),
            persisted_assets: assets.into_iter().map(|r| (r.key(), r)).collect(),
            scanned: Vec::new(),
            decided: 0,
            last_used: None,
            report: SyncReport::default(),
        }
    }

    fn absorb(&mut self, results: impl Iterator<Item = (u32, AddressInfo)>) {
        for (index, info) in results {
            let was_used = self
                .persisted
                .get(&info.address)
                .is_some_and(|a| a.state == AddressState::Used);
            if info.used || was_used {
                self.last_used = Some(self.last_used.map_or(index, |u| u.max(index)));
            }
            self.report.scanned += 1;
            self.scanned.push(Scanned { index, info });
        }
    }

    fn is_used(&self, entry: &Scanned) -> bool {
        entry.info.used
            || self
                .persisted
                .get(&entry.info.address)
                .is_some_and(|a| a.state == AddressState::Used)
    }

    /// Retention for an entry, if it is already certain. Only the last
    /// decision may drop an address: a later used index can still pull
    /// earlier unused addresses into range.
    fn retention(&self, entry: &Scanned, last: bool) -> Option<bool> {
        if entry.holds_assets() {
            return Some(true);
        }
        let within_gap = match self.last_used {
            Some(used) => entry.index <= used.saturating_add(1),
            None => entry.index == 0,
        };
        if within_gap || last {
            Some(within_gap)
        } else {
            None
        }
    }

    /// Decide the longest prefix of undecided entries whose retention is
    /// certain and compute its minimal diff.
    fn decide(&mut self, last: bool) -> SyncReport {
        let mut delta = SyncReport::default();
        while let Some(entry) = self.scanned.get(self.decided) {
            let Some(retained) = self.retention(entry, last) else {
                break;
            };
            if retained {
                let state = if self.is_used(entry) {
                    AddressState::Used
                } else {
                    AddressState::Unused
                };
                let changed = self
                    .persisted
                    .get(&entry.info.address)
                    .map_or(true, |row| row.state != state || row.index != entry.index);
                if changed {
                    delta.addresses.push(WalletAddress {
                        script: entry.info.address.clone(),
                        index: entry.index,
                        state,
                        wallet_id: self.wallet_id,
                    });
                }
            }
            self.diff_assets(entry, &mut delta);
            self.decided += 1;
        }
        for row in &delta.addresses {
            self.persisted.insert(row.script.clone(), row.clone());
        }
        delta
    }

    /// The remote view is authoritative for every queried address, kept
    /// or not.
    fn diff_assets(&self, entry: &Scanned, delta: &mut SyncReport) {
        let address = &entry.info.address;
        let remote: Vec<AssetRecord> = entry
            .info
            .assets
            .iter()
            .filter(|a| a.confirmed > 0 || a.unconfirmed.is_some())
            .map(|a| AssetRecord {
                token_id: a.token_id,
                address: address.clone(),
                confirmed_amount: a.confirmed,
                unconfirmed_amount: a.unconfirmed,
                wallet_id: self.wallet_id,
            })
            .collect();

        for record in &remote {
            let unchanged = self
                .persisted_assets
                .get(&record.key())
                .is_some_and(|stored| stored.same_amounts(record));
            if !unchanged {
                delta.updated_assets.push(record.clone());
            }
        }
        let mut removed: Vec<AssetKey> = self
            .persisted_assets
            .keys()
            .filter(|(token_id, owner)| {
                owner == address && !remote.iter().any(|r| r.token_id == *token_id)
            })
            .cloned()
            .collect();
        removed.sort();
        delta.removed_assets.extend(removed);
    }
}
