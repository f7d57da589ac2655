//! Input selection and change planning.
//!
//! Both strategies are pure functions of the candidate set and a target.
//! `Ordered` spends the oldest boxes first; `CherryPick` minimizes the
//! number of distinct tokens pulled in, for signers with little memory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::WalletError;
use crate::types::{ErgoBox, Token, TokenId, WalletKind};

/// Amounts a selection has to cover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionTarget {
    pub nano_ergs: u64,
    pub tokens: BTreeMap<TokenId, u64>,
}

impl SelectionTarget {
    pub fn add_token(&mut self, token_id: TokenId, amount: u64) -> Result<(), WalletError> {
        if amount == 0 {
            return Ok(());
        }
        let entry = self.tokens.entry(token_id).or_insert(0);
        *entry = entry
            .checked_add(amount)
            .ok_or_else(|| WalletError::InvalidRequest("token amount overflow".into()))?;
        Ok(())
    }
}

/// Chosen inputs and what they hold in total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<ErgoBox>,
    pub nano_ergs: u64,
    pub tokens: BTreeMap<TokenId, u64>,
}

impl Selection {
    fn push(&mut self, ergo_box: &ErgoBox) -> Result<(), WalletError> {
        self.nano_ergs = self
            .nano_ergs
            .checked_add(ergo_box.value)
            .ok_or_else(|| WalletError::InvalidTransaction("amount overflow".into()))?;
        for token in &ergo_box.assets {
            let entry = self.tokens.entry(token.token_id).or_insert(0);
            *entry = entry
                .checked_add(token.amount)
                .ok_or_else(|| WalletError::InvalidTransaction("token amount overflow".into()))?;
        }
        self.inputs.push(ergo_box.clone());
        Ok(())
    }

    fn covers(&self, target: &SelectionTarget) -> bool {
        self.nano_ergs >= target.nano_ergs && self.missing_token(target).is_none()
    }

    fn missing_token(&self, target: &SelectionTarget) -> Option<TokenId> {
        target
            .tokens
            .iter()
            .find(|(id, need)| self.tokens.get(id).copied().unwrap_or(0) < **need)
            .map(|(id, _)| *id)
    }

    /// Whether `ergo_box` would move an unmet requirement forward.
    fn helps(&self, ergo_box: &ErgoBox, target: &SelectionTarget) -> bool {
        (self.nano_ergs < target.nano_ergs && ergo_box.value > 0)
            || ergo_box.assets.iter().any(|t| {
                target
                    .tokens
                    .get(&t.token_id)
                    .is_some_and(|need| self.tokens.get(&t.token_id).copied().unwrap_or(0) < *need)
            })
    }

    /// Per-token excess over `target`, sorted by token id.
    pub fn token_change(&self, target: &SelectionTarget) -> Vec<Token> {
        self.tokens
            .iter()
            .filter_map(|(id, have)| {
                let spent = target.tokens.get(id).copied().unwrap_or(0);
                (*have > spent).then(|| Token::new(*id, have - spent))
            })
            .collect()
    }
}

/// A change output before it is bound to a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBox {
    pub value: u64,
    pub assets: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangePlan {
    Boxes(Vec<ChangeBox>),
    /// The change boxes need this many more nanoERG than are left over.
    Shortfall(u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Lowest creation height first; change packs many tokens per box.
    #[default]
    Ordered,
    /// Fewest extra tokens first; one token per change box and the native
    /// coin isolated in its own box.
    CherryPick,
}

impl SelectionStrategy {
    /// Hardware signers get the memory-friendly strategy.
    pub fn for_wallet(kind: WalletKind) -> Self {
        if kind.is_hardware() {
            Self::CherryPick
        } else {
            Self::Ordered
        }
    }

    pub fn select(
        &self,
        candidates: &[ErgoBox],
        target: &SelectionTarget,
    ) -> Result<Selection, WalletError> {
        if candidates.is_empty() {
            return Err(WalletError::NoInputsAvailable);
        }
        let selection = match self {
            Self::Ordered => select_ordered(candidates, target)?,
            Self::CherryPick => select_cherry_pick(candidates, target)?,
        };
        if let Some(token_id) = selection.missing_token(target) {
            return Err(WalletError::InsufficientFunds {
                token_id,
                required: target.tokens[&token_id],
                available: total_token(candidates, &token_id),
            });
        }
        if selection.nano_ergs < target.nano_ergs {
            return Err(WalletError::InsufficientFunds {
                token_id: TokenId::NATIVE,
                required: target.nano_ergs,
                available: candidates.iter().map(|b| b.value).sum(),
            });
        }
        Ok(selection)
    }

    /// Lay out change for `native` nanoERG and `tokens`. Every box carries
    /// at least `min_box_value`; a native remainder too small for its own
    /// box is folded into the last one.
    pub fn plan_change(
        &self,
        native: u64,
        tokens: Vec<Token>,
        max_tokens_per_box: usize,
        min_box_value: u64,
    ) -> ChangePlan {
        let per_box = match self {
            Self::Ordered => max_tokens_per_box.max(1),
            Self::CherryPick => 1,
        };
        let mut boxes: Vec<ChangeBox> = tokens
            .chunks(per_box)
            .map(|chunk| ChangeBox {
                value: min_box_value,
                assets: chunk.to_vec(),
            })
            .collect();

        let reserved = min_box_value.saturating_mul(boxes.len() as u64);
        if native < reserved {
            return ChangePlan::Shortfall(reserved - native);
        }
        let remainder = native - reserved;
        if remainder == 0 {
            return ChangePlan::Boxes(boxes);
        }

        let own_box = matches!(self, Self::CherryPick) || boxes.is_empty();
        if own_box && remainder >= min_box_value {
            boxes.push(ChangeBox {
                value: remainder,
                assets: Vec::new(),
            });
        } else if let Some(last) = boxes.last_mut() {
            last.value += remainder;
        } else {
            // Dust with nothing to fold into.
            return ChangePlan::Shortfall(min_box_value - remainder);
        }
        ChangePlan::Boxes(boxes)
    }
}

fn total_token(candidates: &[ErgoBox], token_id: &TokenId) -> u64 {
    candidates
        .iter()
        .map(|b| b.token_amount(token_id))
        .fold(0u64, u64::saturating_add)
}

fn select_ordered(candidates: &[ErgoBox], target: &SelectionTarget) -> Result<Selection, WalletError> {
    let mut ordered: Vec<&ErgoBox> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        a.creation_height
            .cmp(&b.creation_height)
            .then_with(|| a.box_id.cmp(&b.box_id))
    });

    let mut selection = Selection::default();
    for candidate in ordered {
        if selection.covers(target) {
            break;
        }
        if selection.helps(candidate, target) {
            selection.push(candidate)?;
        }
    }
    Ok(selection)
}

fn select_cherry_pick(
    candidates: &[ErgoBox],
    target: &SelectionTarget,
) -> Result<Selection, WalletError> {
    let mut selection = Selection::default();
    let mut taken = vec![false; candidates.len()];

    // Tokens first: prefer boxes that drag in the fewest other tokens.
    for (token_id, need) in &target.tokens {
        let mut holders: Vec<usize> = (0..candidates.len())
            .filter(|&i| !taken[i] && candidates[i].token_amount(token_id) > 0)
            .collect();
        holders.sort_by(|&a, &b| {
            let (a, b) = (&candidates[a], &candidates[b]);
            a.assets
                .len()
                .cmp(&b.assets.len())
                .then_with(|| b.token_amount(token_id).cmp(&a.token_amount(token_id)))
                .then_with(|| a.box_id.cmp(&b.box_id))
        });
        for i in holders {
            if selection.tokens.get(token_id).copied().unwrap_or(0) >= *need {
                break;
            }
            selection.push(&candidates[i])?;
            taken[i] = true;
        }
    }

    // Then native coin, from the least token-laden boxes.
    let mut rest: Vec<usize> = (0..candidates.len()).filter(|&i| !taken[i]).collect();
    rest.sort_by(|&a, &b| {
        let (a, b) = (&candidates[a], &candidates[b]);
        a.assets
            .len()
            .cmp(&b.assets.len())
            .then_with(|| b.value.cmp(&a.value))
            .then_with(|| a.box_id.cmp(&b.box_id))
    });
    for i in rest {
        if selection.nano_ergs >= target.nano_ergs {
            break;
        }
        selection.push(&candidates[i])?;
    }
    Ok(selection)
}
