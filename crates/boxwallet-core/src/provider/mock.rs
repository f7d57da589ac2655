use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::address::{tree_to_address, Network};
use crate::error::WalletError;
use crate::tx::SignedTransaction;
use crate::types::{ChainTransaction, ErgoBox, Header, TxId};

use super::{
    rejected, AddressInfo, AssetBalance, BoxQuery, BoxSource, BoxTarget, ChainProvider, TxStatus,
};

/// A mock chain provider for testing. Serves canned address info, boxes
/// and headers populated via the builder pattern, and counts calls so
/// tests can assert on traffic.
pub struct MockProvider {
    network: Network,
    address_info: Mutex<HashMap<String, AddressInfo>>,
    boxes: Mutex<Vec<ErgoBox>>,
    headers: Vec<Header>,
    height: u32,
    statuses: Mutex<HashMap<TxId, TxStatus>>,
    transactions: Vec<ChainTransaction>,
    submit_rejections: Mutex<VecDeque<String>>,
    fail_address_info_after: Option<usize>,
    address_info_calls: AtomicUsize,
    box_queries: AtomicUsize,
    submit_attempts: AtomicUsize,
    submitted: Mutex<Vec<SignedTransaction>>,
}

impl MockProvider {
    pub fn builder() -> MockProviderBuilder {
        MockProviderBuilder {
            network: Network::Mainnet,
            address_info: HashMap::new(),
            boxes: Vec::new(),
            headers: Vec::new(),
            height: 1_000,
            statuses: HashMap::new(),
            transactions: Vec::new(),
            submit_rejections: VecDeque::new(),
            fail_address_info_after: None,
        }
    }

    /// Replace the remote view of one address.
    pub fn set_address_info(&self, info: AddressInfo) {
        lock(&self.address_info).insert(info.address.clone(), info);
    }

    pub fn add_box(&self, ergo_box: ErgoBox) {
        lock(&self.boxes).push(ergo_box);
    }

    pub fn set_status(&self, tx_id: TxId, status: TxStatus) {
        lock(&self.statuses).insert(tx_id, status);
    }

    pub fn address_info_calls(&self) -> usize {
        self.address_info_calls.load(Ordering::SeqCst)
    }

    pub fn box_queries(&self) -> usize {
        self.box_queries.load(Ordering::SeqCst)
    }

    pub fn submit_attempts(&self) -> usize {
        self.submit_attempts.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<SignedTransaction> {
        lock(&self.submitted).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("mock mutex poisoned")
}

pub struct MockProviderBuilder {
    network: Network,
    address_info: HashMap<String, AddressInfo>,
    boxes: Vec<ErgoBox>,
    headers: Vec<Header>,
    height: u32,
    statuses: HashMap<TxId, TxStatus>,
    transactions: Vec<ChainTransaction>,
    submit_rejections: VecDeque<String>,
    fail_address_info_after: Option<usize>,
}

impl MockProviderBuilder {
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// Mark `address` used with the given balances.
    pub fn with_used_address(mut self, address: &str, assets: Vec<AssetBalance>) -> Self {
        self.address_info.insert(
            address.to_owned(),
            AddressInfo {
                address: address.to_owned(),
                used: true,
                assets,
            },
        );
        self
    }

    pub fn with_address_info(mut self, info: AddressInfo) -> Self {
        self.address_info.insert(info.address.clone(), info);
        self
    }

    /// Boxes are matched to addresses through their tree. Unconfirmed
    /// boxes are only served for pending-inclusive queries.
    pub fn with_box(mut self, ergo_box: ErgoBox) -> Self {
        self.boxes.push(ergo_box);
        self
    }

    pub fn with_headers(mut self, count: u32) -> Self {
        self.headers = (0..count)
            .map(|i| {
                let height = self.height - i;
                Header {
                    id: format!("{height:064x}"),
                    parent_id: format!("{:064x}", height - 1),
                    height,
                    timestamp: 1_700_000_000_000 + u64::from(height) * 120_000,
                    version: 3,
                }
            })
            .collect();
        self
    }

    pub fn with_height(mut self, height: u32) -> Self {
        self.height = height;
        self
    }

    pub fn with_status(mut self, tx_id: TxId, status: TxStatus) -> Self {
        self.statuses.insert(tx_id, status);
        self
    }

    pub fn with_transaction(mut self, tx: ChainTransaction) -> Self {
        self.transactions.push(tx);
        self
    }

    /// Queue rejection messages returned by successive submissions before
    /// one succeeds.
    pub fn with_submit_rejections(mut self, messages: Vec<String>) -> Self {
        self.submit_rejections = messages.into();
        self
    }

    /// Fail every address-info call after the first `calls` succeed.
    pub fn fail_address_info_after(mut self, calls: usize) -> Self {
        self.fail_address_info_after = Some(calls);
        self
    }

    pub fn build(self) -> MockProvider {
        MockProvider {
            network: self.network,
            address_info: Mutex::new(self.address_info),
            boxes: Mutex::new(self.boxes),
            headers: self.headers,
            height: self.height,
            statuses: Mutex::new(self.statuses),
            transactions: self.transactions,
            submit_rejections: Mutex::new(self.submit_rejections),
            fail_address_info_after: self.fail_address_info_after,
            address_info_calls: AtomicUsize::new(0),
            box_queries: AtomicUsize::new(0),
            submit_attempts: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn get_address_info(&self, addresses: &[String]) -> Result<Vec<AddressInfo>, WalletError> {
        let call = self.address_info_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_address_info_after.is_some_and(|limit| call >= limit) {
            return Err(rejected("mock/addresses", "injected failure"));
        }
        let known = lock(&self.address_info);
        Ok(addresses
            .iter()
            .map(|address| {
                known.get(address).cloned().unwrap_or_else(|| AddressInfo {
                    address: address.clone(),
                    used: false,
                    assets: vec![],
                })
            })
            .collect())
    }

    async fn get_boxes(&self, query: &BoxQuery) -> Result<Vec<ErgoBox>, WalletError> {
        self.box_queries.fetch_add(1, Ordering::SeqCst);
        let boxes = lock(&self.boxes);
        Ok(boxes
            .iter()
            .filter(|b| b.confirmed || query.source == BoxSource::ChainAndPending)
            .filter(|b| match &query.target {
                BoxTarget::Addresses(addresses) => {
                    addresses.contains(&tree_to_address(self.network, &b.ergo_tree))
                }
                BoxTarget::TokenId(token_id) => b.assets.iter().any(|t| t.token_id == *token_id),
                BoxTarget::ErgoTree(tree) => b.ergo_tree == *tree,
            })
            .cloned()
            .collect())
    }

    async fn get_block_headers(&self, count: usize) -> Result<Vec<Header>, WalletError> {
        Ok(self.headers.iter().take(count).cloned().collect())
    }

    async fn get_height(&self) -> Result<u32, WalletError> {
        Ok(self.height)
    }

    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<TxId, WalletError> {
        self.submit_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.submit_rejections).pop_front() {
            return Err(rejected("mock/submit", message));
        }
        lock(&self.submitted).push(tx.clone());
        Ok(tx.id)
    }

    async fn transaction_status(&self, tx_id: &TxId) -> Result<TxStatus, WalletError> {
        Ok(lock(&self.statuses)
            .get(tx_id)
            .copied()
            .unwrap_or(TxStatus::Dropped))
    }

    async fn get_transactions(
        &self,
        addresses: &[String],
        limit: usize,
    ) -> Result<Vec<ChainTransaction>, WalletError> {
        let touches = |b: &ErgoBox| addresses.contains(&tree_to_address(self.network, &b.ergo_tree));
        Ok(self
            .transactions
            .iter()
            .filter(|tx| tx.inputs.iter().any(touches) || tx.outputs.iter().any(touches))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    #[tokio::test]
    async fn unknown_addresses_are_reported_unused() {
        let provider = MockProvider::builder()
            .with_used_address(&own_address(0), vec![])
            .build();
        let info = provider
            .get_address_info(&[own_address(0), own_address(1)])
            .await
            .expect("address info");
        assert!(info[0].used);
        assert!(!info[1].used);
        assert_eq!(provider.address_info_calls(), 1);
    }

    #[tokio::test]
    async fn pending_boxes_need_pending_source() {
        let mut pending = make_box(2, p2pk_tree(0), erg(1), 10, vec![]);
        pending.confirmed = false;
        let provider = MockProvider::builder()
            .with_box(make_box(1, p2pk_tree(0), erg(1), 9, vec![]))
            .with_box(pending)
            .build();

        let chain = provider
            .get_boxes(&BoxQuery::addresses(vec![own_address(0)], false))
            .await
            .expect("boxes");
        assert_eq!(chain.len(), 1);

        let all = provider
            .get_boxes(&BoxQuery::addresses(vec![own_address(0)], true))
            .await
            .expect("boxes");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn injected_failure_starts_after_limit() {
        let provider = MockProvider::builder().fail_address_info_after(1).build();
        assert!(provider.get_address_info(&[own_address(0)]).await.is_ok());
        assert!(provider.get_address_info(&[own_address(0)]).await.is_err());
    }
}
