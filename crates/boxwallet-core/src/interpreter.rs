//! Classification of a transaction's outputs relative to one wallet.
//!
//! Works on a neutral [`TxView`] so the same logic serves pre-sign review
//! of a freshly built transaction and the history feed.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::address::{tree_to_address, Network};
use crate::builder::fee_tree;
use crate::tx::UnsignedTransaction;
use crate::types::{amount_str, AssetMetadata, ChainTransaction, ErgoTree, Token, TokenId};

const NATIVE_DECIMALS: u8 = 9;
const NATIVE_NAME: &str = "ERG";

/// One side of a transaction, stripped to what classification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewBox {
    pub ergo_tree: ErgoTree,
    pub value: u64,
    pub assets: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxView {
    /// Id a token minted by this transaction would carry.
    pub mint_id: Option<TokenId>,
    pub inputs: Vec<ViewBox>,
    pub outputs: Vec<ViewBox>,
}

impl From<&UnsignedTransaction> for TxView {
    fn from(tx: &UnsignedTransaction) -> Self {
        Self {
            mint_id: tx.minted_token_id(),
            inputs: tx
                .inputs
                .iter()
                .map(|i| ViewBox {
                    ergo_tree: i.spent.ergo_tree.clone(),
                    value: i.spent.value,
                    assets: i.spent.assets.clone(),
                })
                .collect(),
            outputs: tx
                .outputs
                .iter()
                .map(|o| ViewBox {
                    ergo_tree: o.ergo_tree.clone(),
                    value: o.value,
                    assets: o.assets.clone(),
                })
                .collect(),
        }
    }
}

impl From<&ChainTransaction> for TxView {
    fn from(tx: &ChainTransaction) -> Self {
        let view = |b: &crate::types::ErgoBox| ViewBox {
            ergo_tree: b.ergo_tree.clone(),
            value: b.value,
            assets: b.assets.clone(),
        };
        Self {
            mint_id: tx.inputs.first().map(|b| TokenId::from(b.box_id)),
            inputs: tx.inputs.iter().map(view).collect(),
            outputs: tx.outputs.iter().map(view).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetAmount {
    pub token_id: TokenId,
    pub name: Option<String>,
    #[serde(with = "amount_str")]
    pub amount: u64,
    /// `amount` scaled by the token's decimals.
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEntry {
    pub index: usize,
    pub address: String,
    /// Native coin first, then tokens.
    pub assets: Vec<AssetAmount>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretedTx {
    /// Address of the first input.
    pub from: Option<String>,
    pub to: Vec<OutputEntry>,
    pub change: Vec<OutputEntry>,
    pub fee: Option<OutputEntry>,
    pub burning: Vec<AssetAmount>,
    /// Heuristic: a token whose id equals the first input's box id.
    pub minting: Vec<AssetAmount>,
    pub total_incoming: Vec<AssetAmount>,
    pub total_leaving: Vec<AssetAmount>,
}

/// Per-asset totals with the native coin under [`TokenId::NATIVE`].
type Totals = BTreeMap<TokenId, u64>;

fn add_box(totals: &mut Totals, b: &ViewBox) {
    let native = totals.entry(TokenId::NATIVE).or_insert(0);
    *native = native.saturating_add(b.value);
    for token in &b.assets {
        let entry = totals.entry(token.token_id).or_insert(0);
        *entry = entry.saturating_add(token.amount);
    }
}

fn totals<'a>(boxes: impl Iterator<Item = &'a ViewBox>) -> Totals {
    let mut out = Totals::new();
    for b in boxes {
        add_box(&mut out, b);
    }
    out
}

/// Positive part of `a - b` per asset.
fn excess(a: &Totals, b: &Totals) -> Totals {
    a.iter()
        .filter_map(|(id, amount)| {
            let other = b.get(id).copied().unwrap_or(0);
            (*amount > other).then(|| (*id, amount - other))
        })
        .collect()
}

/// Render `amount` with `decimals` fractional digits, trimming trailing
/// zeros.
pub fn format_amount(amount: u64, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let scale = 10u128.pow(u32::from(decimals));
    let whole = u128::from(amount) / scale;
    let frac = u128::from(amount) % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:0width$}", width = usize::from(decimals));
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

pub struct Interpreter<'a> {
    network: Network,
    own: &'a HashSet<String>,
    metadata: &'a HashMap<TokenId, AssetMetadata>,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        network: Network,
        own: &'a HashSet<String>,
        metadata: &'a HashMap<TokenId, AssetMetadata>,
    ) -> Self {
        Self {
            network,
            own,
            metadata,
        }
    }

    fn asset(&self, token_id: TokenId, amount: u64) -> AssetAmount {
        let (name, decimals) = if token_id.is_native() {
            (Some(NATIVE_NAME.to_owned()), NATIVE_DECIMALS)
        } else {
            let meta = self.metadata.get(&token_id);
            (
                meta.and_then(|m| m.name.clone()),
                meta.map_or(0, |m| m.decimals),
            )
        };
        AssetAmount {
            token_id,
            name,
            amount,
            display: format_amount(amount, decimals),
        }
    }

    fn assets(&self, totals: &Totals) -> Vec<AssetAmount> {
        totals
            .iter()
            .filter(|(_, amount)| **amount > 0)
            .map(|(id, amount)| self.asset(*id, *amount))
            .collect()
    }

    fn entry(&self, index: usize, b: &ViewBox) -> OutputEntry {
        OutputEntry {
            index,
            address: tree_to_address(self.network, &b.ergo_tree),
            assets: self.assets(&totals(std::iter::once(b))),
        }
    }

    fn is_own(&self, b: &ViewBox) -> bool {
        self.own.contains(&tree_to_address(self.network, &b.ergo_tree))
    }

    pub fn interpret(&self, view: &TxView) -> InterpretedTx {
        let fee_script = fee_tree();
        let fee_index = view.outputs.iter().position(|o| o.ergo_tree == fee_script);
        let fee_value = fee_index.map_or(0, |i| view.outputs[i].value);

        let owned_in = totals(view.inputs.iter().filter(|b| self.is_own(b)));
        let owned_out = totals(view.outputs.iter().filter(|b| self.is_own(b)));
        let leaving = excess(&owned_in, &owned_out);
        let incoming = excess(&owned_out, &owned_in);

        let mut result = InterpretedTx {
            from: view
                .inputs
                .first()
                .map(|b| tree_to_address(self.network, &b.ergo_tree)),
            fee: fee_index.map(|i| self.entry(i, &view.outputs[i])),
            total_incoming: self.assets(&incoming),
            total_leaving: self.assets(&leaving),
            ..InterpretedTx::default()
        };

        let native_leaving = leaving.get(&TokenId::NATIVE).copied().unwrap_or(0);
        let tokens_leave = leaving.keys().any(|id| !id.is_native());
        let spends_own = owned_in.get(&TokenId::NATIVE).copied().unwrap_or(0) > 0;
        let mut is_change = vec![false; view.outputs.len()];

        if spends_own && native_leaving <= fee_value && !tokens_leave {
            // Only the fee left the wallet: everything owned after the fee
            // box returns to it.
            let start = fee_index.map_or(view.outputs.len(), |i| i + 1);
            for (i, output) in view.outputs.iter().enumerate().skip(start) {
                is_change[i] = self.is_own(output);
            }
        } else {
            // Only the part of the fee the wallet funded leaves its capacity;
            // a liquidity box may pay the rest.
            let mut capacity = owned_in.clone();
            if let Some(native) = capacity.get_mut(&TokenId::NATIVE) {
                *native = native.saturating_sub(fee_value.min(native_leaving));
            }
            for (i, output) in view.outputs.iter().enumerate().rev() {
                if Some(i) == fee_index || !self.is_own(output) {
                    continue;
                }
                let need = totals(std::iter::once(output));
                let fits = need
                    .iter()
                    .all(|(id, amount)| capacity.get(id).copied().unwrap_or(0) >= *amount);
                if fits {
                    for (id, amount) in &need {
                        if let Some(left) = capacity.get_mut(id) {
                            *left -= amount;
                        }
                    }
                    is_change[i] = true;
                }
            }
        }

        for (i, output) in view.outputs.iter().enumerate() {
            if Some(i) == fee_index {
                continue;
            }
            let entry = self.entry(i, output);
            if is_change[i] {
                result.change.push(entry);
            } else {
                result.to.push(entry);
            }
        }

        let all_in = totals(view.inputs.iter());
        let all_out = totals(view.outputs.iter());
        let mut burned = excess(&all_in, &all_out);
        burned.remove(&TokenId::NATIVE);
        result.burning = self.assets(&burned);

        if let Some(mint_id) = view.mint_id {
            let minted = all_out.get(&mint_id).copied().unwrap_or(0);
            let spent = all_in.get(&mint_id).copied().unwrap_or(0);
            if minted > spent {
                result.minting = vec![self.asset(mint_id, minted - spent)];
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::babel::test_support::babel_box;
    use crate::babel::BabelSwap;
    use crate::builder::{FeeSettings, SendRequest, TxBuilder};
    use crate::config::{WalletSettings, MIN_BOX_VALUE, SUGGESTED_FEE};
    use crate::selection::SelectionStrategy;
    use crate::test_util::*;
    use crate::tx::{OutputCandidate, UnsignedInput, UNSIGNED_TX_VERSION};

    fn own_set() -> HashSet<String> {
        (0..3).map(own_address).collect()
    }

    fn view(inputs: Vec<ViewBox>, outputs: Vec<ViewBox>) -> TxView {
        TxView {
            mint_id: None,
            inputs,
            outputs,
        }
    }

    fn vb(tree: ErgoTree, value: u64, assets: Vec<Token>) -> ViewBox {
        ViewBox {
            ergo_tree: tree,
            value,
            assets,
        }
    }

    #[test]
    fn formats_amounts_with_decimals() {
        assert_eq!(format_amount(1_500_000_000, 9), "1.5");
        assert_eq!(format_amount(1_000_000_000, 9), "1");
        assert_eq!(format_amount(5, 2), "0.05");
        assert_eq!(format_amount(42, 0), "42");
    }

    #[test]
    fn built_send_classifies_change() {
        let candidates = vec![make_box(1, p2pk_tree(0), erg(2), 100, vec![])];
        let request = SendRequest {
            recipient: tree_to_address(TEST_NETWORK, &foreign_tree(7)),
            assets: vec![Token::new(TokenId::NATIVE, erg(1))],
            fee: FeeSettings::native(SUGGESTED_FEE),
            burn: vec![],
            change_address: own_address(0),
            strategy: SelectionStrategy::Ordered,
        };
        let built = TxBuilder::new(WalletSettings::default())
            .build(&request, &candidates, None, 500)
            .expect("build");

        let own = own_set();
        let metadata = HashMap::new();
        let result = Interpreter::new(TEST_NETWORK, &own, &metadata)
            .interpret(&TxView::from(&built.unsigned));

        assert_eq!(result.to.len(), 1);
        assert_eq!(result.to[0].index, 0);
        assert_eq!(result.change.len(), 1);
        assert_eq!(result.change[0].index, 2);
        assert_eq!(result.fee.as_ref().map(|f| f.index), Some(1));
        assert_eq!(result.total_leaving[0].amount, erg(1) + SUGGESTED_FEE);
        assert!(result.total_incoming.is_empty());
        assert!(result.burning.is_empty());
    }

    #[test]
    fn foreign_fee_send_keeps_wallet_change() {
        let fee_token = token_from_byte(5);
        let sent = token_from_byte(6);
        let liquidity = babel_box(9, fee_token, erg(10), 30_000);
        let swap = BabelSwap::quote(&liquidity, &fee_token, 100, SUGGESTED_FEE, MIN_BOX_VALUE)
            .expect("quote");
        let candidates = vec![make_box(
            1,
            p2pk_tree(0),
            erg(1),
            100,
            vec![Token::new(fee_token, 1_000), Token::new(sent, 3)],
        )];
        let request = SendRequest {
            recipient: tree_to_address(TEST_NETWORK, &foreign_tree(7)),
            assets: vec![Token::new(sent, 3)],
            fee: FeeSettings {
                token_id: fee_token,
                value: 100,
                asset_decimals: None,
                liquidity_box: None,
            },
            burn: vec![],
            change_address: own_address(0),
            strategy: SelectionStrategy::Ordered,
        };
        let built = TxBuilder::new(WalletSettings::default())
            .build(&request, &candidates, Some(&swap), 500)
            .expect("build");

        let own = own_set();
        let metadata = HashMap::new();
        let result = Interpreter::new(TEST_NETWORK, &own, &metadata)
            .interpret(&TxView::from(&built.unsigned));

        let change: Vec<usize> = result.change.iter().map(|e| e.index).collect();
        assert_eq!(change, built.change_outputs);
        assert!(result.to.iter().all(|e| !built.change_outputs.contains(&e.index)));
    }

    #[test]
    fn send_to_own_other_address_is_not_change() {
        let v = view(
            vec![vb(p2pk_tree(0), erg(2), vec![])],
            vec![
                vb(p2pk_tree(1), erg(1), vec![]),
                vb(fee_tree(), SUGGESTED_FEE, vec![]),
                vb(p2pk_tree(0), erg(1) - SUGGESTED_FEE, vec![]),
            ],
        );
        let own = own_set();
        let metadata = HashMap::new();
        let result = Interpreter::new(TEST_NETWORK, &own, &metadata).interpret(&v);

        assert_eq!(result.to.iter().map(|e| e.index).collect::<Vec<_>>(), vec![0]);
        assert_eq!(result.change.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn received_outputs_are_incoming() {
        let v = view(
            vec![vb(foreign_tree(1), erg(5), vec![])],
            vec![
                vb(p2pk_tree(1), erg(2), vec![]),
                vb(fee_tree(), SUGGESTED_FEE, vec![]),
                vb(foreign_tree(1), erg(3) - SUGGESTED_FEE, vec![]),
            ],
        );
        let own = own_set();
        let metadata = HashMap::new();
        let result = Interpreter::new(TEST_NETWORK, &own, &metadata).interpret(&v);

        assert!(result.change.is_empty());
        assert_eq!(result.total_incoming[0].amount, erg(2));
        assert!(result.total_leaving.is_empty());
    }

    #[test]
    fn burn_and_unknown_decimals() {
        let token = token_from_byte(4);
        let named = token_from_byte(5);
        let v = view(
            vec![vb(
                p2pk_tree(0),
                erg(1),
                vec![Token::new(token, 150), Token::new(named, 1_000)],
            )],
            vec![
                vb(foreign_tree(2), erg(1) / 2, vec![Token::new(named, 250)]),
                vb(fee_tree(), SUGGESTED_FEE, vec![]),
                vb(
                    p2pk_tree(0),
                    erg(1) / 2 - SUGGESTED_FEE,
                    vec![Token::new(token, 100), Token::new(named, 750)],
                ),
            ],
        );
        let own = own_set();
        let metadata: HashMap<TokenId, AssetMetadata> = [(
            named,
            AssetMetadata {
                name: Some("Named".into()),
                decimals: 2,
            },
        )]
        .into_iter()
        .collect();
        let result = Interpreter::new(TEST_NETWORK, &own, &metadata).interpret(&v);

        assert_eq!(result.burning.len(), 1);
        assert_eq!(result.burning[0].token_id, token);
        assert_eq!(result.burning[0].display, "50");
        assert_eq!(result.change.len(), 1);
        let sent = &result.to[0].assets;
        let named_sent = sent.iter().find(|a| a.token_id == named).expect("named token");
        assert_eq!(named_sent.display, "2.5");
        assert_eq!(named_sent.name.as_deref(), Some("Named"));
    }

    #[test]
    fn first_input_id_marks_minting() {
        let input = make_box(1, p2pk_tree(0), erg(1), 100, vec![]);
        let mint_id = TokenId::from(input.box_id);
        let tx = UnsignedTransaction {
            version: UNSIGNED_TX_VERSION,
            inputs: vec![UnsignedInput::new(input)],
            data_inputs: vec![],
            outputs: vec![
                OutputCandidate::new(erg(1) - SUGGESTED_FEE, p2pk_tree(0), 200)
                    .with_assets(vec![Token::new(mint_id, 1_000)]),
                OutputCandidate::new(SUGGESTED_FEE, fee_tree(), 200),
            ],
            height: 200,
        };
        let own = own_set();
        let metadata = HashMap::new();
        let result = Interpreter::new(TEST_NETWORK, &own, &metadata).interpret(&TxView::from(&tx));

        assert_eq!(result.minting.len(), 1);
        assert_eq!(result.minting[0].amount, 1_000);
        assert!(result.burning.is_empty());
    }
}
