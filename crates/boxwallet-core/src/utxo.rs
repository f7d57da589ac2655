//! Spendable box reconciliation.
//!
//! Merges the remote unspent set with the local overlay of boxes this
//! wallet consumed or created through transactions the index has not
//! caught up with yet.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::config::WalletSettings;
use crate::error::WalletError;
use crate::provider::{BoxQuery, ChainProvider, TxStatus};
use crate::store::{AssetQuery, WalletStore};
use crate::tx::UnsignedTransaction;
use crate::types::{BoxId, ErgoBox, OverlayBox, TokenId, TxId, WalletId};

/// What [`UtxoReconciler::prune_overlay`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub confirmed: Vec<TxId>,
    pub dropped: Vec<TxId>,
}

pub struct UtxoReconciler {
    provider: Arc<dyn ChainProvider>,
    store: Arc<dyn WalletStore>,
    settings: WalletSettings,
}

impl UtxoReconciler {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        store: Arc<dyn WalletStore>,
        settings: WalletSettings,
    ) -> Self {
        Self {
            provider,
            store,
            settings,
        }
    }

    /// Addresses worth querying: those holding the native coin, or every
    /// known address when no balance has been recorded yet.
    async fn candidate_addresses(&self, wallet_id: WalletId) -> Result<Vec<String>, WalletError> {
        let holders = self
            .store
            .get_assets(AssetQuery::Token(wallet_id, TokenId::NATIVE))
            .await?;
        if !holders.is_empty() {
            let mut addresses: Vec<String> = holders.into_iter().map(|r| r.address).collect();
            addresses.sort();
            addresses.dedup();
            return Ok(addresses);
        }
        Ok(self
            .store
            .get_addresses(wallet_id)
            .await?
            .into_iter()
            .map(|a| a.script)
            .collect())
    }

    /// Remote boxes minus locked overlay rows, plus created overlay boxes,
    /// newest first.
    pub async fn fetch_spendable_boxes(
        &self,
        wallet_id: WalletId,
        include_unconfirmed: bool,
    ) -> Result<Vec<ErgoBox>, WalletError> {
        let addresses = self.candidate_addresses(wallet_id).await?;
        let overlay = self.store.get_overlay_boxes(wallet_id).await?;

        let remote = if addresses.is_empty() {
            Vec::new()
        } else {
            self.provider
                .get_boxes(&BoxQuery::addresses(addresses, include_unconfirmed))
                .await?
        };
        let remote_count = remote.len();

        let locked: HashSet<BoxId> = overlay
            .iter()
            .filter(|o| o.locked)
            .map(|o| o.box_id)
            .collect();
        let mut by_id: HashMap<BoxId, ErgoBox> = remote
            .into_iter()
            .filter(|b| !locked.contains(&b.box_id))
            .map(|b| (b.box_id, b))
            .collect();
        for created in overlay.iter().filter_map(|o| o.content.as_ref()) {
            if !locked.contains(&created.box_id) {
                by_id
                    .entry(created.box_id)
                    .or_insert_with(|| created.clone());
            }
        }

        let mut boxes: Vec<ErgoBox> = by_id.into_values().collect();
        boxes.sort_by(|a, b| {
            b.creation_height
                .cmp(&a.creation_height)
                .then_with(|| a.box_id.cmp(&b.box_id))
        });
        debug!(
            wallet_id = %wallet_id,
            remote = remote_count,
            locked = locked.len(),
            spendable = boxes.len(),
            "reconciled spendable boxes"
        );
        Ok(boxes)
    }

    /// Record the local effects of a broadcast transaction: every input is
    /// locked and every output paying one of `own_scripts` is remembered.
    pub async fn record_pending(
        &self,
        wallet_id: WalletId,
        tx: &UnsignedTransaction,
        own_scripts: &HashSet<String>,
    ) -> Result<Vec<OverlayBox>, WalletError> {
        let tx_id = tx.id();
        let created_at = now_millis();
        let mut rows: Vec<OverlayBox> = tx
            .inputs
            .iter()
            .map(|input| OverlayBox {
                box_id: input.spent.box_id,
                wallet_id,
                transaction_id: tx_id,
                locked: true,
                content: None,
                created_at,
            })
            .collect();

        for index in 0..tx.outputs.len() {
            let index = u16::try_from(index)
                .map_err(|_| WalletError::InvalidTransaction("too many outputs".into()))?;
            let Some(output) = tx.output_box(index) else {
                continue;
            };
            let address = crate::address::tree_to_address(self.settings.network, &output.ergo_tree);
            if own_scripts.contains(&address) {
                rows.push(OverlayBox {
                    box_id: output.box_id,
                    wallet_id,
                    transaction_id: tx_id,
                    locked: false,
                    content: Some(output),
                    created_at,
                });
            }
        }

        self.store.put_overlay_boxes(&rows).await?;
        debug!(wallet_id = %wallet_id, tx_id = %tx_id, rows = rows.len(), "recorded pending transaction");
        Ok(rows)
    }

    /// Forget overlay rows whose transaction confirmed, or vanished from
    /// the pending pool longer ago than the grace period.
    pub async fn prune_overlay(&self, wallet_id: WalletId) -> Result<PruneReport, WalletError> {
        let overlay = self.store.get_overlay_boxes(wallet_id).await?;
        let mut by_tx: HashMap<TxId, Vec<&OverlayBox>> = HashMap::new();
        for row in &overlay {
            by_tx.entry(row.transaction_id).or_default().push(row);
        }

        let grace = Duration::from_secs(self.settings.overlay_grace_secs).as_millis() as u64;
        let now = now_millis();
        let mut report = PruneReport::default();
        let mut doomed: Vec<BoxId> = Vec::new();
        let mut tx_ids: Vec<TxId> = by_tx.keys().copied().collect();
        tx_ids.sort();

        for tx_id in tx_ids {
            let rows = &by_tx[&tx_id];
            match self.provider.transaction_status(&tx_id).await? {
                TxStatus::Confirmed => {
                    report.confirmed.push(tx_id);
                    doomed.extend(rows.iter().map(|r| r.box_id));
                }
                TxStatus::Dropped => {
                    let recorded = rows.iter().map(|r| r.created_at).max().unwrap_or(0);
                    if now.saturating_sub(recorded) > grace {
                        report.dropped.push(tx_id);
                        doomed.extend(rows.iter().map(|r| r.box_id));
                    }
                }
                TxStatus::Pending => {}
            }
        }

        self.store.delete_overlay_boxes(&doomed).await?;
        if !doomed.is_empty() {
            debug!(
                wallet_id = %wallet_id,
                confirmed = report.confirmed.len(),
                dropped = report.dropped.len(),
                rows = doomed.len(),
                "pruned overlay"
            );
        }
        Ok(report)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use crate::store::MemoryStore;
    use crate::test_util::*;
    use crate::tx::{OutputCandidate, UnsignedInput, UNSIGNED_TX_VERSION};
    use crate::types::{AddressState, AssetRecord, WalletAddress};

    async fn seed_addresses(store: &MemoryStore, count: u32) {
        let rows: Vec<WalletAddress> = (0..count)
            .map(|index| WalletAddress {
                script: own_address(index),
                index,
                state: AddressState::Used,
                wallet_id: TEST_WALLET,
            })
            .collect();
        store.put_addresses(&rows).await.expect("seed addresses");
    }

    fn reconciler(provider: Arc<MockProvider>, store: Arc<MemoryStore>) -> UtxoReconciler {
        UtxoReconciler::new(provider, store, WalletSettings::default())
    }

    fn spend_tx(input: ErgoBox) -> UnsignedTransaction {
        UnsignedTransaction {
            version: UNSIGNED_TX_VERSION,
            outputs: vec![
                OutputCandidate::new(input.value - erg(1), foreign_tree(4), 500),
                OutputCandidate::new(erg(1), p2pk_tree(1), 500),
            ],
            inputs: vec![UnsignedInput::new(input)],
            data_inputs: vec![],
            height: 500,
        }
    }

    #[tokio::test]
    async fn boxes_are_sorted_newest_first() {
        let provider = Arc::new(
            MockProvider::builder()
                .with_box(make_box(1, p2pk_tree(0), erg(1), 100, vec![]))
                .with_box(make_box(2, p2pk_tree(1), erg(1), 300, vec![]))
                .with_box(make_box(3, p2pk_tree(0), erg(1), 200, vec![]))
                .build(),
        );
        let store = Arc::new(MemoryStore::new());
        seed_addresses(&store, 2).await;

        let boxes = reconciler(provider, store)
            .fetch_spendable_boxes(TEST_WALLET, false)
            .await
            .expect("fetch");
        let heights: Vec<u32> = boxes.iter().map(|b| b.creation_height).collect();
        assert_eq!(heights, vec![300, 200, 100]);
    }

    #[tokio::test]
    async fn native_holders_narrow_the_query() {
        let provider = Arc::new(
            MockProvider::builder()
                .with_box(make_box(1, p2pk_tree(0), erg(1), 100, vec![]))
                .with_box(make_box(2, p2pk_tree(1), erg(1), 300, vec![]))
                .build(),
        );
        let store = Arc::new(MemoryStore::new());
        seed_addresses(&store, 2).await;
        store
            .put_assets(&[AssetRecord {
                token_id: TokenId::NATIVE,
                address: own_address(1),
                confirmed_amount: erg(1),
                unconfirmed_amount: None,
                wallet_id: TEST_WALLET,
            }])
            .await
            .expect("seed assets");

        let boxes = reconciler(provider, store)
            .fetch_spendable_boxes(TEST_WALLET, false)
            .await
            .expect("fetch");
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].box_id, box_id_from_byte(2));
    }

    #[tokio::test]
    async fn overlay_hides_spent_and_adds_created_boxes() {
        let spent = make_box(1, p2pk_tree(0), erg(3), 100, vec![]);
        let provider = Arc::new(MockProvider::builder().with_box(spent.clone()).build());
        let store = Arc::new(MemoryStore::new());
        seed_addresses(&store, 2).await;
        let utxo = reconciler(provider.clone(), store.clone());

        let tx = spend_tx(spent.clone());
        let own: HashSet<String> = [own_address(0), own_address(1)].into_iter().collect();
        let rows = utxo
            .record_pending(TEST_WALLET, &tx, &own)
            .await
            .expect("record");
        assert_eq!(rows.len(), 2, "one locked input and one owned output");

        // The index still reports the spent box and has not seen the change.
        let boxes = utxo
            .fetch_spendable_boxes(TEST_WALLET, true)
            .await
            .expect("fetch");
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].box_id, tx.output_box_id(1));
        assert_eq!(boxes[0].value, erg(1));
        assert!(!boxes[0].confirmed);
    }

    #[tokio::test]
    async fn indexed_created_box_is_not_duplicated() {
        let spent = make_box(1, p2pk_tree(0), erg(3), 100, vec![]);
        let provider = Arc::new(MockProvider::builder().build());
        let store = Arc::new(MemoryStore::new());
        seed_addresses(&store, 2).await;
        let utxo = reconciler(provider.clone(), store.clone());

        let tx = spend_tx(spent);
        let own: HashSet<String> = [own_address(1)].into_iter().collect();
        utxo.record_pending(TEST_WALLET, &tx, &own)
            .await
            .expect("record");
        let mut indexed = tx.output_box(1).expect("change output");
        indexed.confirmed = true;
        provider.add_box(indexed);

        let boxes = utxo
            .fetch_spendable_boxes(TEST_WALLET, false)
            .await
            .expect("fetch");
        assert_eq!(boxes.len(), 1);
        assert!(boxes[0].confirmed, "remote copy wins over the snapshot");
    }

    #[tokio::test]
    async fn prune_removes_confirmed_and_stale_dropped_rows() {
        let provider = Arc::new(MockProvider::builder().build());
        let store = Arc::new(MemoryStore::new());
        let utxo = reconciler(provider.clone(), store.clone());

        let confirmed_tx = spend_tx(make_box(1, p2pk_tree(0), erg(3), 100, vec![]));
        let pending_tx = spend_tx(make_box(2, p2pk_tree(0), erg(3), 100, vec![]));
        let own = HashSet::new();
        utxo.record_pending(TEST_WALLET, &confirmed_tx, &own).await.expect("record");
        utxo.record_pending(TEST_WALLET, &pending_tx, &own).await.expect("record");
        provider.set_status(confirmed_tx.id(), TxStatus::Confirmed);
        provider.set_status(pending_tx.id(), TxStatus::Pending);

        let stale = OverlayBox {
            box_id: box_id_from_byte(9),
            wallet_id: TEST_WALLET,
            transaction_id: tx_id_from_byte(9),
            locked: true,
            content: None,
            created_at: 0,
        };
        let fresh_dropped = OverlayBox {
            box_id: box_id_from_byte(10),
            transaction_id: tx_id_from_byte(10),
            created_at: now_millis(),
            ..stale.clone()
        };
        store
            .put_overlay_boxes(&[stale, fresh_dropped])
            .await
            .expect("seed overlay");

        let report = utxo.prune_overlay(TEST_WALLET).await.expect("prune");
        assert_eq!(report.confirmed, vec![confirmed_tx.id()]);
        assert_eq!(report.dropped, vec![tx_id_from_byte(9)]);

        let remaining: Vec<BoxId> = store
            .get_overlay_boxes(TEST_WALLET)
            .await
            .expect("overlay")
            .into_iter()
            .map(|o| o.box_id)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&box_id_from_byte(2)));
        assert!(remaining.contains(&box_id_from_byte(10)));
    }
}
