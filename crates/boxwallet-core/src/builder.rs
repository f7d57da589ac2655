//! Unsigned transaction construction.
//!
//! Output layout is fixed: the recipient box first, then the re-created
//! liquidity box when the fee is paid in a foreign token, then the miner
//! fee box, then change. Wallet inputs precede the liquidity input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::Address;
use crate::babel::BabelSwap;
use crate::config::WalletSettings;
use crate::error::WalletError;
use crate::selection::{ChangePlan, SelectionStrategy, SelectionTarget};
use crate::tx::{OutputCandidate, UnsignedInput, UnsignedTransaction, UNSIGNED_TX_VERSION};
use crate::types::{amount_str, ErgoBox, ErgoTree, Token, TokenId};

/// Standard miner-fee contract.
pub const FEE_CONTRACT: &str = "1005040004000e36100204a00b08cd0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798ea02d192a39a8cc7a701730073011001020402d19683030193a38cc7b2a57300000193c2b2a57301007473027303830108cdeeac93b1a57304";

/// Bound on reselection rounds when change needs more native coin.
const MAX_SELECTION_ROUNDS: usize = 8;

pub fn fee_tree() -> ErgoTree {
    ErgoTree::from_hex(FEE_CONTRACT).unwrap_or_default()
}

/// How the fee is paid. A non-native `token_id` routes the fee through a
/// liquidity box swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeSettings {
    pub token_id: TokenId,
    /// Fee in units of `token_id`.
    #[serde(with = "amount_str")]
    pub value: u64,
    #[serde(default)]
    pub asset_decimals: Option<u8>,
    /// Liquidity box pinned by the caller instead of discovered.
    #[serde(default)]
    pub liquidity_box: Option<ErgoBox>,
}

impl FeeSettings {
    pub fn native(value: u64) -> Self {
        Self {
            token_id: TokenId::NATIVE,
            value,
            asset_decimals: None,
            liquidity_box: None,
        }
    }

    pub fn is_native(&self) -> bool {
        self.token_id.is_native()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub recipient: String,
    /// Requested amounts; the native leg uses [`TokenId::NATIVE`].
    pub assets: Vec<Token>,
    pub fee: FeeSettings,
    /// Tokens the caller explicitly agrees to destroy.
    pub burn: Vec<Token>,
    pub change_address: String,
    pub strategy: SelectionStrategy,
}

/// A balanced transaction plus what a reviewer must confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltTransaction {
    pub unsigned: UnsignedTransaction,
    pub burning: Vec<Token>,
    /// Native coin paid to miners.
    pub fee: u64,
    /// Native coin the liquidity box lent to the recipient output.
    pub borrowed: u64,
    pub change_outputs: Vec<usize>,
}

pub struct TxBuilder {
    settings: WalletSettings,
}

impl TxBuilder {
    pub fn new(settings: WalletSettings) -> Self {
        Self { settings }
    }

    fn parse_address(&self, address: &str) -> Result<ErgoTree, WalletError> {
        let parsed = Address::decode(address)?;
        if parsed.network() != self.settings.network {
            return Err(WalletError::InvalidAddress(format!(
                "{address}: wrong network, expected {:?}",
                self.settings.network
            )));
        }
        Ok(parsed.ergo_tree())
    }

    /// Build against `candidates`. `swap` must be supplied exactly when the
    /// fee is paid in a foreign token.
    pub fn build(
        &self,
        request: &SendRequest,
        candidates: &[ErgoBox],
        swap: Option<&BabelSwap>,
        height: u32,
    ) -> Result<BuiltTransaction, WalletError> {
        let min_box_value = self.settings.min_box_value;
        let recipient_tree = self.parse_address(&request.recipient)?;
        let change_tree = self.parse_address(&request.change_address)?;

        let (nano_ergs, send_tokens) = split_native(&request.assets)?;
        if nano_ergs == 0 && send_tokens.is_empty() {
            return Err(WalletError::InvalidRequest("nothing to send".into()));
        }
        let mut burn = SelectionTarget::default();
        for token in &request.burn {
            if token.token_id.is_native() {
                return Err(WalletError::InvalidRequest("the native coin cannot be burned".into()));
            }
            burn.add_token(token.token_id, token.amount)?;
        }

        let mut target = SelectionTarget::default();
        for (token_id, amount) in send_tokens.iter().chain(burn.tokens.iter()) {
            target.add_token(*token_id, *amount)?;
        }

        // Recipient value and who funds it.
        let recipient_value = nano_ergs.max(min_box_value);
        let shortfall = recipient_value - nano_ergs;
        let (fee, borrowed) = match (request.fee.is_native(), swap) {
            (true, _) => {
                // A native amount below the minimum box value cannot fund
                // its own output.
                if nano_ergs > 0 && shortfall > 0 {
                    return Err(WalletError::InsufficientFunds {
                        token_id: TokenId::NATIVE,
                        required: min_box_value,
                        available: nano_ergs,
                    });
                }
                if request.fee.value == 0 {
                    return Err(WalletError::InvalidRequest("fee must be positive".into()));
                }
                (request.fee.value, 0)
            }
            (false, None) => {
                return Err(WalletError::InsufficientLiquidity(format!(
                    "no liquidity box for fee token {}",
                    request.fee.token_id
                )))
            }
            (false, Some(swap)) => {
                if swap.token_id != request.fee.token_id || swap.token_amount != request.fee.value {
                    return Err(WalletError::InvalidRequest(
                        "liquidity swap does not match the fee settings".into(),
                    ));
                }
                let borrowed = shortfall.min(swap.headroom(self.settings.suggested_fee));
                if nano_ergs > 0 && borrowed < shortfall {
                    return Err(WalletError::InsufficientFunds {
                        token_id: TokenId::NATIVE,
                        required: min_box_value,
                        available: nano_ergs + borrowed,
                    });
                }
                target.add_token(swap.token_id, swap.token_amount)?;
                (swap.native_amount - borrowed, borrowed)
            }
        };
        let wallet_native = if request.fee.is_native() {
            recipient_value
                .checked_add(fee)
                .ok_or_else(|| WalletError::InvalidRequest("amount overflow".into()))?
        } else {
            recipient_value - borrowed
        };

        let pool: Vec<ErgoBox> = candidates
            .iter()
            .filter(|b| swap.map_or(true, |s| s.liquidity_box.box_id != b.box_id))
            .cloned()
            .collect();
        if pool.is_empty() {
            return Err(WalletError::NoInputsAvailable);
        }

        // Select, raising the native target until the change layout fits.
        let strategy = request.strategy;
        let mut extra = 0u64;
        let (selection, change) = 'rounds: {
            for _ in 0..MAX_SELECTION_ROUNDS {
                target.nano_ergs = wallet_native.saturating_add(extra);
                let selection = strategy.select(&pool, &target)?;
                let native_change = selection.nano_ergs - wallet_native;
                let token_change = selection.token_change(&target);
                match strategy.plan_change(
                    native_change,
                    token_change,
                    self.settings.max_tokens_per_change_box,
                    min_box_value,
                ) {
                    ChangePlan::Boxes(boxes) => break 'rounds (selection, boxes),
                    ChangePlan::Shortfall(missing) => {
                        debug!(missing, round_target = target.nano_ergs, "change needs more native coin");
                        // Demand more than the current inputs hold so the
                        // next round pulls in another box.
                        extra = native_change.saturating_add(missing);
                    }
                }
            }
            return Err(WalletError::InsufficientFunds {
                token_id: TokenId::NATIVE,
                required: wallet_native.saturating_add(extra),
                available: pool.iter().map(|b| b.value).fold(0u64, u64::saturating_add),
            });
        };

        let mut outputs = vec![OutputCandidate::new(recipient_value, recipient_tree, height)
            .with_assets(to_tokens(&send_tokens))];
        let mut inputs: Vec<UnsignedInput> =
            selection.inputs.into_iter().map(UnsignedInput::new).collect();
        if let Some(swap) = swap {
            let recreated_index = outputs.len() as u16;
            outputs.push(swap.recreated_output(height)?);
            inputs.push(swap.input(recreated_index));
        }
        outputs.push(OutputCandidate::new(fee, fee_tree(), height));
        let change_outputs: Vec<usize> = (outputs.len()..outputs.len() + change.len()).collect();
        outputs.extend(change.into_iter().map(|c| {
            OutputCandidate::new(c.value, change_tree.clone(), height).with_assets(c.assets)
        }));

        let unsigned = UnsignedTransaction {
            version: UNSIGNED_TX_VERSION,
            inputs,
            data_inputs: Vec::new(),
            outputs,
            height,
        };
        let burning = unsigned.check_balance()?;
        let expected_burn = to_tokens(&burn.tokens);
        if burning != expected_burn {
            return Err(WalletError::InvalidTransaction(format!(
                "unexpected burn: built {burning:?}, requested {expected_burn:?}"
            )));
        }

        debug!(
            tx_id = %unsigned.id(),
            inputs = unsigned.inputs.len(),
            outputs = unsigned.outputs.len(),
            fee,
            borrowed,
            "built transaction"
        );
        Ok(BuiltTransaction {
            unsigned,
            burning,
            fee,
            borrowed,
            change_outputs,
        })
    }
}

fn split_native(assets: &[Token]) -> Result<(u64, BTreeMap<TokenId, u64>), WalletError> {
    let mut native = 0u64;
    let mut tokens = SelectionTarget::default();
    for asset in assets {
        if asset.token_id.is_native() {
            native = native
                .checked_add(asset.amount)
                .ok_or_else(|| WalletError::InvalidRequest("amount overflow".into()))?;
        } else {
            tokens.add_token(asset.token_id, asset.amount)?;
        }
    }
    Ok((native, tokens.tokens))
}

fn to_tokens(tokens: &BTreeMap<TokenId, u64>) -> Vec<Token> {
    tokens.iter().map(|(id, amount)| Token::new(*id, *amount)).collect()
}
