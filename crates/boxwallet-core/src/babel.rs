//! Fee payment in a foreign token through a liquidity ("Babel") box.
//!
//! A Babel box escrows native coin and sells it at a fixed price for one
//! specific token. Whether a box qualifies is a capability check on its
//! script bytes and registers, not a type: any box passing
//! [`is_babel_box`] can fund a fee swap.
//!
//! Registers: `R4` owner, `R5` token id, `R6` price in nanoERG per token
//! unit (`Long`). The re-created box copies `R4..R6` and sets `R7` to the
//! id of the box it replaces.

use crate::error::WalletError;
use crate::provider::{BoxQuery, BoxSource, BoxTarget, ChainProvider};
use crate::sigma::Constant;
use crate::tx::{OutputCandidate, UnsignedInput};
use crate::types::{ErgoBox, ErgoTree, Token, TokenId};

const BABEL_PREFIX: &str = "100604000e20";
const BABEL_SUFFIX: &str = "0400040005000500d803d601e30004d602e4c6a70408d603e4c6a7050595e67201d804d604b2a5e4720100d605b2db63087204730000d606db6308a7d60799c1a7c17204d1968302019683050193c27204c2a7938c720501730193e4c672040408720293e4c672040505720393e4c67204060ec5a796830201929c998c7205029591b1720673028cb272067303000273047203720792720773057202";

/// Context variable the contract reads its re-creation output index from.
pub const OUTPUT_INDEX_VAR: &str = "0";

/// Liquidity contract for `token_id`.
pub fn babel_tree(token_id: &TokenId) -> ErgoTree {
    let mut bytes = hex_bytes(BABEL_PREFIX);
    bytes.extend_from_slice(token_id.as_bytes());
    bytes.extend(hex_bytes(BABEL_SUFFIX));
    ErgoTree(bytes)
}

fn hex_bytes(s: &str) -> Vec<u8> {
    // Compile-time constants; decoding cannot fail.
    hex::decode(s).unwrap_or_default()
}

/// Token a Babel box sells native coin for, read from its script.
fn script_token(tree: &ErgoTree) -> Option<TokenId> {
    let prefix = hex_bytes(BABEL_PREFIX);
    let suffix = hex_bytes(BABEL_SUFFIX);
    let bytes = tree.as_bytes();
    if bytes.len() != prefix.len() + 32 + suffix.len()
        || !bytes.starts_with(&prefix)
        || !bytes.ends_with(&suffix)
    {
        return None;
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&bytes[prefix.len()..prefix.len() + 32]);
    Some(TokenId(id))
}

fn register(ergo_box: &ErgoBox, name: &str) -> Option<Constant> {
    ergo_box
        .additional_registers
        .get(name)
        .and_then(|hex| Constant::from_hex(hex).ok())
}

/// Price in nanoERG per token unit, if the box carries a sane one.
pub fn price(ergo_box: &ErgoBox) -> Option<u64> {
    register(ergo_box, "R6")
        .and_then(|c| c.as_long())
        .and_then(|p| u64::try_from(p).ok())
        .filter(|p| *p > 0)
}

/// Whether `ergo_box` can fund a fee swap for `token_id`.
pub fn is_babel_box(ergo_box: &ErgoBox, token_id: &TokenId) -> bool {
    if script_token(&ergo_box.ergo_tree) != Some(*token_id) {
        return false;
    }
    let owner_ok = matches!(register(ergo_box, "R4"), Some(Constant::SigmaProp(_)));
    let token_ok = register(ergo_box, "R5")
        .as_ref()
        .and_then(Constant::as_coll_byte)
        .is_some_and(|bytes| bytes == token_id.as_bytes());
    owner_ok && token_ok && price(ergo_box).is_some()
}

/// A priced swap against one liquidity box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BabelSwap {
    pub liquidity_box: ErgoBox,
    pub token_id: TokenId,
    pub price: u64,
    /// Tokens the wallet pays into the box.
    pub token_amount: u64,
    /// Native coin released from the box.
    pub native_amount: u64,
}

impl BabelSwap {
    /// Price `token_amount` against `candidate`, checking the caller's
    /// price floor (`suggested_fee`) and the box's depth.
    pub fn quote(
        candidate: &ErgoBox,
        token_id: &TokenId,
        token_amount: u64,
        suggested_fee: u64,
        min_box_value: u64,
    ) -> Result<Self, WalletError> {
        if !is_babel_box(candidate, token_id) {
            return Err(WalletError::InsufficientLiquidity(format!(
                "box {} is not a liquidity box for {token_id}",
                candidate.box_id
            )));
        }
        let price = price(candidate).unwrap_or(0);
        let native_amount = token_amount
            .checked_mul(price)
            .ok_or_else(|| WalletError::InvalidRequest("fee amount overflow".into()))?;
        if native_amount < suggested_fee {
            return Err(WalletError::InsufficientLiquidity(format!(
                "box {} pays {native_amount} for {token_amount} tokens, below the fee of {suggested_fee}",
                candidate.box_id
            )));
        }
        if candidate.value < native_amount.saturating_add(min_box_value) {
            return Err(WalletError::InsufficientLiquidity(format!(
                "box {} holds {} nanoERG, needs {}",
                candidate.box_id,
                candidate.value,
                native_amount.saturating_add(min_box_value)
            )));
        }
        Ok(Self {
            liquidity_box: candidate.clone(),
            token_id: *token_id,
            price,
            token_amount,
            native_amount,
        })
    }

    /// Best-priced quote among `candidates`.
    pub fn best(
        candidates: &[ErgoBox],
        token_id: &TokenId,
        token_amount: u64,
        suggested_fee: u64,
        min_box_value: u64,
    ) -> Result<Self, WalletError> {
        candidates
            .iter()
            .filter_map(|b| {
                Self::quote(b, token_id, token_amount, suggested_fee, min_box_value).ok()
            })
            .max_by(|a, b| {
                a.price
                    .cmp(&b.price)
                    .then_with(|| a.liquidity_box.value.cmp(&b.liquidity_box.value))
            })
            .ok_or_else(|| {
                WalletError::InsufficientLiquidity(format!(
                    "no liquidity box for {token_id} can swap {token_amount} tokens into a {suggested_fee} fee"
                ))
            })
    }

    /// Nanoergs available above the fee for topping up a small send.
    pub fn headroom(&self, suggested_fee: u64) -> u64 {
        self.native_amount.saturating_sub(suggested_fee)
    }

    /// The spent liquidity box, tagged with the index of its re-creation.
    pub fn input(&self, recreated_index: u16) -> UnsignedInput {
        let mut input = UnsignedInput::new(self.liquidity_box.clone());
        input.extension.insert(
            OUTPUT_INDEX_VAR.to_owned(),
            Constant::Int(i32::from(recreated_index)).to_hex(),
        );
        input
    }

    /// The liquidity box after the swap: less native coin, more tokens.
    pub fn recreated_output(&self, creation_height: u32) -> Result<OutputCandidate, WalletError> {
        let source = &self.liquidity_box;
        let value = source.value.checked_sub(self.native_amount).ok_or_else(|| {
            WalletError::InvalidTransaction("swap exceeds liquidity box value".into())
        })?;

        let mut assets = source.assets.clone();
        match assets.iter_mut().find(|t| t.token_id == self.token_id) {
            Some(token) => {
                token.amount = token
                    .amount
                    .checked_add(self.token_amount)
                    .ok_or_else(|| WalletError::InvalidTransaction("token amount overflow".into()))?;
            }
            None => assets.push(Token::new(self.token_id, self.token_amount)),
        }

        let mut registers = crate::types::Registers::new();
        for name in ["R4", "R5", "R6"] {
            if let Some(value) = source.additional_registers.get(name) {
                registers.insert(name.to_owned(), value.clone());
            }
        }
        registers.insert(
            "R7".to_owned(),
            Constant::CollByte(source.box_id.as_bytes().to_vec()).to_hex(),
        );

        Ok(OutputCandidate {
            value,
            ergo_tree: source.ergo_tree.clone(),
            creation_height,
            assets,
            additional_registers: registers,
        })
    }
}

/// Find the best liquidity box for paying `token_amount` of `token_id`.
/// A caller-pinned box is validated the same way instead of searched for.
pub async fn discover(
    provider: &dyn ChainProvider,
    token_id: &TokenId,
    token_amount: u64,
    pinned: Option<&ErgoBox>,
    suggested_fee: u64,
    min_box_value: u64,
) -> Result<BabelSwap, WalletError> {
    if let Some(pinned) = pinned {
        return BabelSwap::quote(pinned, token_id, token_amount, suggested_fee, min_box_value);
    }
    let candidates = provider
        .get_boxes(&BoxQuery {
            target: BoxTarget::ErgoTree(babel_tree(token_id)),
            source: BoxSource::Chain,
        })
        .await?;
    let swap = BabelSwap::best(&candidates, token_id, token_amount, suggested_fee, min_box_value)?;
    tracing::debug!(
        token_id = %token_id,
        candidates = candidates.len(),
        box_id = %swap.liquidity_box.box_id,
        price = swap.price,
        native = swap.native_amount,
        "selected liquidity box"
    );
    Ok(swap)
}


#[cfg(test)]
mod tests {
    use super::test_support::babel_box;
    use super::*;
    use crate::config::{MIN_BOX_VALUE, SUGGESTED_FEE};
    use crate::provider::mock::MockProvider;
    use crate::test_util::*;

    #[test]
    fn predicate_checks_script_and_registers() {
        let token = token_from_byte(1);
        let good = babel_box(1, token, erg(1), 1_000);
        assert!(is_babel_box(&good, &token));
        assert!(!is_babel_box(&good, &token_from_byte(2)));

        let mut no_price = good.clone();
        no_price.additional_registers.remove("R6");
        assert!(!is_babel_box(&no_price, &token));

        let mut wrong_script = good.clone();
        wrong_script.ergo_tree = p2pk_tree(0);
        assert!(!is_babel_box(&wrong_script, &token));
    }

    #[test]
    fn best_prefers_the_highest_price_with_enough_depth() {
        let token = token_from_byte(1);
        let candidates = vec![
            babel_box(1, token, erg(1), 20_000),
            babel_box(2, token, erg(1), 30_000),
            // Best price but too shallow for the swap.
            babel_box(3, token, 2_000_000, 50_000),
        ];
        let swap = BabelSwap::best(&candidates, &token, 100, SUGGESTED_FEE, MIN_BOX_VALUE)
            .expect("a box qualifies");
        assert_eq!(swap.liquidity_box.box_id, box_id_from_byte(2));
        assert_eq!(swap.native_amount, 3_000_000);
        assert_eq!(swap.headroom(SUGGESTED_FEE), 3_000_000 - SUGGESTED_FEE);
    }

    #[test]
    fn price_below_the_fee_is_insufficient_liquidity() {
        let token = token_from_byte(1);
        let candidates = vec![babel_box(1, token, erg(10), 1_000)];
        let err = BabelSwap::best(&candidates, &token, 100, SUGGESTED_FEE, MIN_BOX_VALUE)
            .expect_err("price too low");
        assert!(matches!(err, WalletError::InsufficientLiquidity(_)));
    }

    #[test]
    fn recreation_moves_value_and_tags_self() {
        let token = token_from_byte(1);
        let mut source = babel_box(1, token, erg(1), 20_000);
        source.assets.push(Token::new(token, 7));
        let swap = BabelSwap::quote(&source, &token, 100, SUGGESTED_FEE, MIN_BOX_VALUE)
            .expect("quote");

        let output = swap.recreated_output(600).expect("recreate");
        assert_eq!(output.value, erg(1) - 2_000_000);
        assert_eq!(output.assets, vec![Token::new(token, 107)]);
        assert_eq!(output.ergo_tree, source.ergo_tree);
        assert_eq!(output.additional_registers["R6"], source.additional_registers["R6"]);
        assert_eq!(
            Constant::from_hex(&output.additional_registers["R7"]).expect("R7"),
            Constant::CollByte(source.box_id.as_bytes().to_vec())
        );

        let input = swap.input(1);
        assert_eq!(
            Constant::from_hex(&input.extension[OUTPUT_INDEX_VAR]).expect("var 0"),
            Constant::Int(1)
        );
    }

    #[tokio::test]
    async fn discovery_queries_by_contract_and_validates_pinned_boxes() {
        let token = token_from_byte(1);
        let provider = MockProvider::builder()
            .with_box(babel_box(1, token, erg(1), 20_000))
            .with_box(babel_box(2, token_from_byte(2), erg(5), 90_000))
            .build();

        let swap = discover(&provider, &token, 100, None, SUGGESTED_FEE, MIN_BOX_VALUE)
            .await
            .expect("found");
        assert_eq!(swap.liquidity_box.box_id, box_id_from_byte(1));
        assert_eq!(provider.box_queries(), 1);

        let pinned = babel_box(2, token_from_byte(2), erg(5), 90_000);
        assert!(discover(&provider, &token, 100, Some(&pinned), SUGGESTED_FEE, MIN_BOX_VALUE)
            .await
            .is_err());
        assert_eq!(provider.box_queries(), 1, "pinned boxes skip the lookup");
    }
}
