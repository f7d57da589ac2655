use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{ProviderError, WalletError};
use crate::tx::SignedTransaction;
use crate::types::{amount_str, ChainTransaction, ErgoBox, ErgoTree, Header, TokenId, TxId};

use super::{
    rejected, AddressInfo, AssetBalance, BoxQuery, BoxSource, BoxTarget, ChainProvider, TxStatus,
};

/// Per-address requests issued concurrently during a fan-out.
const MAX_CONCURRENT_REQUESTS: usize = 8;

/// Page size for paginated box listings.
const PAGE_LIMIT: usize = 100;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Chain-data provider backed by the public explorer REST API.
///
/// Every outbound request passes the optional rate limiter. Per-address
/// lookups fan out in bounded chunks.
pub struct ExplorerClient {
    client: reqwest::Client,
    base_url: String,
    limiter: Option<DirectRateLimiter>,
}

impl ExplorerClient {
    pub fn new(base_url: &str, requests_per_second: Option<u32>) -> Result<Self, WalletError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(WalletError::InvalidRequest(format!(
                "explorer url must be http(s): {base_url}"
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .build()
            .map_err(ProviderError::Transport)?;

        let limiter = match requests_per_second {
            None => None,
            Some(limit) => {
                let limit = NonZeroU32::new(limit).ok_or_else(|| {
                    WalletError::InvalidRequest("requests_per_second must be at least 1".into())
                })?;
                Some(RateLimiter::direct(Quota::per_second(limit)))
            }
        };

        Ok(Self {
            client,
            base_url: base_url.to_owned(),
            limiter,
        })
    }

    async fn wait_for_rate_limit(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// GET `path`, treating 404 as `None`.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, WalletError> {
        self.wait_for_rate_limit().await;
        debug!(http.path = path, "explorer request");
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(ProviderError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ProviderError::Transport)?;
        debug!(http.path = path, %status, body_len = body.len(), "explorer response");
        trace!(http.path = path, body = %body, "explorer response body");

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(rejected(path, rejection_message(&body)));
        }
        decode(path, &body).map(Some)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, WalletError> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| rejected(path, "not found"))
    }

    /// Collect every page of an `{items, total}` listing.
    async fn get_all_pages<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, WalletError> {
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut items = Vec::new();
        loop {
            let page: Items<T> = self
                .get_json(&format!(
                    "{path}{separator}offset={}&limit={PAGE_LIMIT}",
                    items.len()
                ))
                .await?;
            let fetched = page.items.len();
            items.extend(page.items);
            if fetched < PAGE_LIMIT || items.len() as u64 >= page.total {
                return Ok(items);
            }
        }
    }

    async fn address_info(&self, address: &str) -> Result<AddressInfo, WalletError> {
        let balance: TotalBalance = self
            .get_json(&format!("/api/v1/addresses/{address}/balance/total"))
            .await?;
        let history: Items<serde_json::Value> = self
            .get_json(&format!("/api/v1/addresses/{address}/transactions?limit=1"))
            .await?;
        Ok(balance.into_address_info(address, history.total > 0))
    }

    async fn boxes_at_address(
        &self,
        address: &str,
        source: BoxSource,
    ) -> Result<Vec<ErgoBox>, WalletError> {
        let mut boxes: Vec<ErgoBox> = self
            .get_all_pages::<ExplorerBox>(&format!("/api/v1/boxes/unspent/byAddress/{address}"))
            .await?
            .into_iter()
            .map(|b| b.into_box(true))
            .collect();

        if source == BoxSource::ChainAndPending {
            let pending: Vec<ExplorerTransaction> = self
                .get_all_pages(&format!("/api/v1/mempool/transactions/byAddress/{address}"))
                .await?;
            for tx in pending {
                boxes.extend(
                    tx.outputs
                        .into_iter()
                        .filter(|o| o.address.as_deref() == Some(address))
                        .map(|o| o.into_box(false)),
                );
            }
        }
        Ok(boxes)
    }

    async fn transactions_at_address(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<ChainTransaction>, WalletError> {
        let confirmed: Items<ExplorerTransaction> = self
            .get_json(&format!("/api/v1/addresses/{address}/transactions?limit={limit}"))
            .await?;
        let pending: Items<ExplorerTransaction> = self
            .get_json(&format!(
                "/api/v1/mempool/transactions/byAddress/{address}?limit={limit}"
            ))
            .await?;
        Ok(pending
            .items
            .into_iter()
            .chain(confirmed.items)
            .map(ExplorerTransaction::into_chain_transaction)
            .collect())
    }
}

#[async_trait]
impl ChainProvider for ExplorerClient {
    async fn get_address_info(&self, addresses: &[String]) -> Result<Vec<AddressInfo>, WalletError> {
        let mut infos = Vec::with_capacity(addresses.len());
        for chunk in addresses.chunks(MAX_CONCURRENT_REQUESTS) {
            let fetched = try_join_all(chunk.iter().map(|a| self.address_info(a))).await?;
            infos.extend(fetched);
        }
        Ok(infos)
    }

    async fn get_boxes(&self, query: &BoxQuery) -> Result<Vec<ErgoBox>, WalletError> {
        match &query.target {
            BoxTarget::Addresses(addresses) => {
                let mut boxes = Vec::new();
                for chunk in addresses.chunks(MAX_CONCURRENT_REQUESTS) {
                    let fetched = try_join_all(
                        chunk
                            .iter()
                            .map(|a| self.boxes_at_address(a, query.source)),
                    )
                    .await?;
                    boxes.extend(fetched.into_iter().flatten());
                }
                Ok(dedup_boxes(boxes))
            }
            BoxTarget::TokenId(token_id) => Ok(self
                .get_all_pages::<ExplorerBox>(&format!("/api/v1/boxes/unspent/byTokenId/{token_id}"))
                .await?
                .into_iter()
                .map(|b| b.into_box(true))
                .collect()),
            BoxTarget::ErgoTree(tree) => Ok(self
                .get_all_pages::<ExplorerBox>(&format!(
                    "/api/v1/boxes/unspent/byErgoTree/{}",
                    tree.to_hex()
                ))
                .await?
                .into_iter()
                .map(|b| b.into_box(true))
                .collect()),
        }
    }

    async fn get_block_headers(&self, count: usize) -> Result<Vec<Header>, WalletError> {
        let page: Items<Header> = self
            .get_json(&format!(
                "/api/v1/blocks/headers?limit={count}&sortBy=height&sortDirection=desc"
            ))
            .await?;
        Ok(page.items)
    }

    async fn get_height(&self) -> Result<u32, WalletError> {
        let state: NetworkState = self.get_json("/api/v1/networkState").await?;
        Ok(state.height)
    }

    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<TxId, WalletError> {
        const PATH: &str = "/api/v1/mempool/transactions/submit";
        self.wait_for_rate_limit().await;
        debug!(tx_id = %tx.id, inputs = tx.inputs.len(), outputs = tx.outputs.len(), "submitting transaction");
        let response = self
            .client
            .post(format!("{}{PATH}", self.base_url))
            .json(&node_json(tx)?)
            .send()
            .await
            .map_err(ProviderError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ProviderError::Transport)?;
        if !status.is_success() {
            return Err(rejected(PATH, rejection_message(&body)));
        }
        let accepted: Submitted = decode(PATH, &body)?;
        Ok(accepted.id)
    }

    async fn transaction_status(&self, tx_id: &TxId) -> Result<TxStatus, WalletError> {
        if self
            .get_optional::<serde_json::Value>(&format!("/api/v1/transactions/{tx_id}"))
            .await?
            .is_some()
        {
            return Ok(TxStatus::Confirmed);
        }
        if self
            .get_optional::<serde_json::Value>(&format!("/api/v0/transactions/unconfirmed/{tx_id}"))
            .await?
            .is_some()
        {
            return Ok(TxStatus::Pending);
        }
        Ok(TxStatus::Dropped)
    }

    async fn get_transactions(
        &self,
        addresses: &[String],
        limit: usize,
    ) -> Result<Vec<ChainTransaction>, WalletError> {
        let mut by_id: HashMap<TxId, ChainTransaction> = HashMap::new();
        for chunk in addresses.chunks(MAX_CONCURRENT_REQUESTS) {
            let fetched =
                try_join_all(chunk.iter().map(|a| self.transactions_at_address(a, limit))).await?;
            for tx in fetched.into_iter().flatten() {
                by_id.entry(tx.id).or_insert(tx);
            }
        }
        let mut txs: Vec<ChainTransaction> = by_id.into_values().collect();
        // Pending first, then newest confirmed.
        txs.sort_by(|a, b| {
            let rank = |tx: &ChainTransaction| tx.inclusion_height.map_or(u32::MAX, |h| h);
            rank(b).cmp(&rank(a)).then_with(|| a.id.cmp(&b.id))
        });
        txs.truncate(limit);
        Ok(txs)
    }
}

fn decode<T: DeserializeOwned>(path: &str, body: &str) -> Result<T, WalletError> {
    serde_json::from_str(body).map_err(|e| {
        ProviderError::InvalidResponse(format!("decode {path}: {e}; body={body}")).into()
    })
}

/// Explorer errors arrive as `{"status": .., "reason": ".."}`; fall back to
/// the raw body otherwise.
fn rejection_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ApiError {
        reason: String,
    }
    serde_json::from_str::<ApiError>(body)
        .map(|e| e.reason)
        .unwrap_or_else(|_| body.trim().to_owned())
}

fn dedup_boxes(boxes: Vec<ErgoBox>) -> Vec<ErgoBox> {
    let mut seen = std::collections::HashSet::new();
    boxes.into_iter().filter(|b| seen.insert(b.box_id)).collect()
}

/// Node wire format: plain numbers for values and amounts.
fn node_json(tx: &SignedTransaction) -> Result<serde_json::Value, WalletError> {
    let outputs: Vec<serde_json::Value> = tx
        .outputs
        .iter()
        .map(|o| {
            serde_json::json!({
                "value": o.value,
                "ergoTree": o.ergo_tree.to_hex(),
                "creationHeight": o.creation_height,
                "assets": o.assets.iter().map(|t| serde_json::json!({
                    "tokenId": t.token_id.to_string(),
                    "amount": t.amount,
                })).collect::<Vec<_>>(),
                "additionalRegisters": o.additional_registers,
            })
        })
        .collect();
    let inputs = serde_json::to_value(&tx.inputs)
        .map_err(|e| WalletError::InvalidTransaction(format!("encode inputs: {e}")))?;
    let data_inputs = serde_json::to_value(&tx.data_inputs)
        .map_err(|e| WalletError::InvalidTransaction(format!("encode data inputs: {e}")))?;
    Ok(serde_json::json!({
        "id": tx.id.to_string(),
        "inputs": inputs,
        "dataInputs": data_inputs,
        "outputs": outputs,
    }))
}

// ==============================================================================
// Explorer Wire Types
// ==============================================================================

#[derive(Debug, Deserialize)]
struct Items<T> {
    items: Vec<T>,
    total: u64,
}

#[derive(Debug, Deserialize)]
struct NetworkState {
    height: u32,
}

#[derive(Debug, Deserialize)]
struct Submitted {
    id: TxId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExplorerAsset {
    token_id: TokenId,
    #[serde(with = "amount_str")]
    amount: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Balance {
    #[serde(with = "amount_str")]
    nano_ergs: u64,
    #[serde(default)]
    tokens: Vec<ExplorerAsset>,
}

#[derive(Debug, Deserialize)]
struct TotalBalance {
    confirmed: Balance,
    #[serde(default)]
    unconfirmed: Balance,
}

impl TotalBalance {
    fn into_address_info(self, address: &str, has_history: bool) -> AddressInfo {
        let mut unconfirmed: HashMap<TokenId, u64> = self
            .unconfirmed
            .tokens
            .iter()
            .map(|t| (t.token_id, t.amount))
            .collect();
        if self.unconfirmed.nano_ergs > 0 {
            unconfirmed.insert(TokenId::NATIVE, self.unconfirmed.nano_ergs);
        }

        let mut confirmed: Vec<(TokenId, u64)> = Vec::new();
        if self.confirmed.nano_ergs > 0 {
            confirmed.push((TokenId::NATIVE, self.confirmed.nano_ergs));
        }
        confirmed.extend(self.confirmed.tokens.iter().map(|t| (t.token_id, t.amount)));

        let mut assets: Vec<AssetBalance> = confirmed
            .into_iter()
            .map(|(token_id, amount)| AssetBalance {
                token_id,
                confirmed: amount,
                unconfirmed: unconfirmed.remove(&token_id),
            })
            .collect();
        // Tokens arriving only through the mempool.
        assets.extend(unconfirmed.into_iter().map(|(token_id, amount)| AssetBalance {
            token_id,
            confirmed: 0,
            unconfirmed: Some(amount),
        }));
        assets.sort_by(|a, b| a.token_id.cmp(&b.token_id));

        AddressInfo {
            address: address.to_owned(),
            used: has_history || !assets.is_empty(),
            assets,
        }
    }
}

/// Registers arrive either as bare hex or as a rendered object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegisterRepr {
    Plain(String),
    Rendered {
        #[serde(rename = "serializedValue")]
        serialized_value: String,
    },
}

/// Box or resolved input as the explorer reports it. Inputs name their
/// origin with `outputTransactionId` / `outputIndex`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExplorerBox {
    box_id: crate::types::BoxId,
    #[serde(alias = "outputTransactionId")]
    transaction_id: Option<TxId>,
    #[serde(default, alias = "outputIndex")]
    index: u16,
    ergo_tree: ErgoTree,
    #[serde(default)]
    address: Option<String>,
    #[serde(with = "amount_str")]
    value: u64,
    #[serde(default)]
    creation_height: u32,
    #[serde(default)]
    assets: Vec<ExplorerAsset>,
    #[serde(default)]
    additional_registers: BTreeMap<String, RegisterRepr>,
}

impl ExplorerBox {
    fn into_box(self, confirmed: bool) -> ErgoBox {
        ErgoBox {
            box_id: self.box_id,
            transaction_id: self.transaction_id.unwrap_or_default(),
            index: self.index,
            ergo_tree: self.ergo_tree,
            value: self.value,
            creation_height: self.creation_height,
            assets: self
                .assets
                .into_iter()
                .map(|a| crate::types::Token::new(a.token_id, a.amount))
                .collect(),
            additional_registers: self
                .additional_registers
                .into_iter()
                .map(|(name, value)| {
                    let hex = match value {
                        RegisterRepr::Plain(hex) => hex,
                        RegisterRepr::Rendered { serialized_value } => serialized_value,
                    };
                    (name, hex)
                })
                .collect(),
            confirmed,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExplorerTransaction {
    id: TxId,
    #[serde(default)]
    inclusion_height: Option<u32>,
    #[serde(default, alias = "creationTimestamp")]
    timestamp: Option<u64>,
    #[serde(default)]
    inputs: Vec<ExplorerBox>,
    #[serde(default)]
    outputs: Vec<ExplorerBox>,
}

impl ExplorerTransaction {
    fn into_chain_transaction(self) -> ChainTransaction {
        let confirmed = self.inclusion_height.is_some();
        ChainTransaction {
            id: self.id,
            inclusion_height: self.inclusion_height,
            timestamp: self.timestamp,
            inputs: self.inputs.into_iter().map(|b| b.into_box(true)).collect(),
            outputs: self
                .outputs
                .into_iter()
                .map(|b| b.into_box(confirmed))
                .collect(),
        }
    }
}
