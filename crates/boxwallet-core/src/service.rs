//! Wallet service: the engine's components wired for one session.
//!
//! A send runs reconcile, liquidity discovery, build and interpret in that
//! order and returns everything a reviewer needs before signing. Broadcast
//! goes through the narrow submission retry and then records the overlay
//! rows that keep spent inputs out of the next selection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::auth::{self, AuthProof};
use crate::babel;
use crate::builder::{BuiltTransaction, FeeSettings, SendRequest, TxBuilder};
use crate::config::WalletSettings;
use crate::error::WalletError;
use crate::interpreter::{InterpretedTx, Interpreter, TxView};
use crate::keyring::KeyRing;
use crate::prover::SigningSession;
use crate::provider::{submit_with_retry, AssetBalance, ChainProvider};
use crate::selection::SelectionStrategy;
use crate::store::{AssetQuery, WalletStore};
use crate::sync::{SyncOutcome, Synchronizer};
use crate::tx::{SignedTransaction, UnsignedTransaction};
use crate::types::{AssetMetadata, ErgoBox, Token, TokenId, TxId, Wallet, WalletId};
use crate::utxo::{PruneReport, UtxoReconciler};

/// What the user asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendIntent {
    pub recipient: String,
    pub assets: Vec<Token>,
    pub fee: FeeSettings,
    pub burn: Vec<Token>,
    /// Defaults to the wallet's lowest-index address.
    pub change_address: Option<String>,
    pub include_unconfirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedSend {
    pub built: BuiltTransaction,
    pub review: InterpretedTx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: TxId,
    pub inclusion_height: Option<u32>,
    pub timestamp: Option<u64>,
    pub summary: InterpretedTx,
}

pub struct WalletService {
    provider: Arc<dyn ChainProvider>,
    store: Arc<dyn WalletStore>,
    settings: WalletSettings,
    keys: KeyRing,
    synchronizer: Synchronizer,
    reconciler: UtxoReconciler,
}

impl WalletService {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        store: Arc<dyn WalletStore>,
        settings: WalletSettings,
    ) -> Self {
        Self {
            synchronizer: Synchronizer::new(
                Arc::clone(&provider),
                Arc::clone(&store),
                settings.clone(),
            ),
            reconciler: UtxoReconciler::new(
                Arc::clone(&provider),
                Arc::clone(&store),
                settings.clone(),
            ),
            keys: KeyRing::new(),
            provider,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &WalletSettings {
        &self.settings
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    pub fn reconciler(&self) -> &UtxoReconciler {
        &self.reconciler
    }

    pub async fn sync(&self, wallet: &Wallet) -> Result<SyncOutcome, WalletError> {
        let key = self.keys.for_wallet(wallet).await?;
        self.synchronizer.sync(wallet, &key).await
    }

    /// Persisted addresses of `wallet_id` as address strings.
    pub async fn own_scripts(&self, wallet_id: WalletId) -> Result<HashSet<String>, WalletError> {
        Ok(self
            .store
            .get_addresses(wallet_id)
            .await?
            .into_iter()
            .map(|a| a.script)
            .collect())
    }

    /// Per-token totals across the wallet's addresses, native coin first.
    pub async fn balance(&self, wallet_id: WalletId) -> Result<Vec<AssetBalance>, WalletError> {
        let mut totals: BTreeMap<TokenId, AssetBalance> = BTreeMap::new();
        for record in self.store.get_assets(AssetQuery::Wallet(wallet_id)).await? {
            let entry = totals.entry(record.token_id).or_insert(AssetBalance {
                token_id: record.token_id,
                confirmed: 0,
                unconfirmed: None,
            });
            entry.confirmed = entry.confirmed.saturating_add(record.confirmed_amount);
            if let Some(pending) = record.unconfirmed_amount {
                entry.unconfirmed = Some(entry.unconfirmed.unwrap_or(0).saturating_add(pending));
            }
        }
        Ok(totals.into_values().collect())
    }

    /// Spendable boxes after pruning settled overlay rows.
    pub async fn spendable_boxes(
        &self,
        wallet_id: WalletId,
        include_unconfirmed: bool,
    ) -> Result<(Vec<ErgoBox>, PruneReport), WalletError> {
        let pruned = self.reconciler.prune_overlay(wallet_id).await?;
        let boxes = self
            .reconciler
            .fetch_spendable_boxes(wallet_id, include_unconfirmed)
            .await?;
        Ok((boxes, pruned))
    }

    async fn change_address(&self, wallet: &Wallet, intent: &SendIntent) -> Result<String, WalletError> {
        if let Some(address) = &intent.change_address {
            return Ok(address.clone());
        }
        self.store
            .get_addresses(wallet.id)
            .await?
            .into_iter()
            .min_by_key(|a| a.index)
            .map(|a| a.script)
            .ok_or_else(|| WalletError::InvalidRequest(format!("wallet {} has no addresses; sync first", wallet.id)))
    }

    /// Build and interpret a send. Nothing is signed; the only store write is
    /// overlay pruning, which runs once liquidity for a token fee is found.
    pub async fn prepare_send(
        &self,
        wallet: &Wallet,
        intent: &SendIntent,
        metadata: &HashMap<TokenId, AssetMetadata>,
    ) -> Result<PreparedSend, WalletError> {
        let height = self.provider.get_height().await?;

        // Liquidity is resolved before overlay pruning so a send without a
        // usable liquidity box leaves the store untouched.
        let swap = if intent.fee.is_native() {
            None
        } else {
            Some(
                babel::discover(
                    self.provider.as_ref(),
                    &intent.fee.token_id,
                    intent.fee.value,
                    intent.fee.liquidity_box.as_ref(),
                    self.settings.suggested_fee,
                    self.settings.min_box_value,
                )
                .await?,
            )
        };

        let (candidates, _) = self
            .spendable_boxes(wallet.id, intent.include_unconfirmed)
            .await?;

        let request = SendRequest {
            recipient: intent.recipient.clone(),
            assets: intent.assets.clone(),
            fee: intent.fee.clone(),
            burn: intent.burn.clone(),
            change_address: self.change_address(wallet, intent).await?,
            strategy: SelectionStrategy::for_wallet(wallet.kind),
        };
        let built = TxBuilder::new(self.settings.clone()).build(
            &request,
            &candidates,
            swap.as_ref(),
            height,
        )?;

        let own = self.own_scripts(wallet.id).await?;
        let review = Interpreter::new(self.settings.network, &own, metadata)
            .interpret(&TxView::from(&built.unsigned));
        info!(
            wallet_id = %wallet.id,
            tx_id = %built.unsigned.id(),
            inputs = built.unsigned.inputs.len(),
            outputs = built.unsigned.outputs.len(),
            fee = built.fee,
            "prepared transaction"
        );
        Ok(PreparedSend { built, review })
    }

    /// A signing session for `wallet` with chain context already loaded.
    pub async fn signing_session(&self, wallet: &Wallet) -> Result<SigningSession, WalletError> {
        let addresses = self.store.get_addresses(wallet.id).await?;
        let change_index = addresses.iter().map(|a| a.index).min().unwrap_or(0);
        let mut session = SigningSession::new(wallet, &addresses).with_change_index(change_index);
        session.load_context(self.provider.as_ref()).await?;
        Ok(session)
    }

    /// Broadcast, then lock the spent inputs and remember own outputs.
    pub async fn submit(
        &self,
        wallet_id: WalletId,
        unsigned: &UnsignedTransaction,
        signed: &SignedTransaction,
    ) -> Result<TxId, WalletError> {
        if signed.id != unsigned.id() {
            return Err(WalletError::InvalidTransaction(format!(
                "signed transaction {} does not match unsigned {}",
                signed.id,
                unsigned.id()
            )));
        }
        let tx_id = submit_with_retry(self.provider.as_ref(), signed).await?;
        let own = self.own_scripts(wallet_id).await?;
        self.reconciler.record_pending(wallet_id, unsigned, &own).await?;
        info!(wallet_id = %wallet_id, tx_id = %tx_id, "transaction submitted");
        Ok(tx_id)
    }

    /// Prove control of one of the wallet's addresses to `origin`.
    pub async fn sign_message(
        &self,
        wallet: &Wallet,
        address: &str,
        message: &str,
        origin: &str,
    ) -> Result<AuthProof, WalletError> {
        let key = self.keys.for_wallet(wallet).await?;
        let addresses = self.store.get_addresses(wallet.id).await?;
        auth::sign_message(&key, &addresses, address, message, origin)
    }

    /// Recent transactions touching the wallet, classified.
    pub async fn history(
        &self,
        wallet_id: WalletId,
        limit: usize,
        metadata: &HashMap<TokenId, AssetMetadata>,
    ) -> Result<Vec<HistoryEntry>, WalletError> {
        let own = self.own_scripts(wallet_id).await?;
        if own.is_empty() {
            return Ok(Vec::new());
        }
        let mut addresses: Vec<String> = own.iter().cloned().collect();
        addresses.sort();
        let transactions = self.provider.get_transactions(&addresses, limit).await?;
        debug!(wallet_id = %wallet_id, count = transactions.len(), "fetched history");

        let interpreter = Interpreter::new(self.settings.network, &own, metadata);
        Ok(transactions
            .iter()
            .map(|tx| HistoryEntry {
                id: tx.id,
                inclusion_height: tx.inclusion_height,
                timestamp: tx.timestamp,
                summary: interpreter.interpret(&TxView::from(tx)),
            })
            .collect())
    }
}
