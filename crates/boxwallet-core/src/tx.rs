//! Transaction structures exchanged with review UIs, external
//! applications and signers.
//!
//! `UnsignedTransaction` is a versioned plain structure: every input embeds
//! the full box it spends so a reviewer needs no chain access. The
//! canonical `bytes_to_sign` encoding defines the transaction id and the
//! message every proof commits to.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::WalletError;
use crate::sigma::{blake2b256, put_vlq};
use crate::types::{amount_str, BoxId, ErgoBox, ErgoTree, Registers, Token, TokenId, TxId};

/// Structure version of [`UnsignedTransaction`].
pub const UNSIGNED_TX_VERSION: u8 = 1;

/// Context variables attached to an input, keyed by decimal variable id,
/// holding hex-encoded serialized constants.
pub type ContextExtension = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedInput {
    #[serde(flatten)]
    pub spent: ErgoBox,
    #[serde(default)]
    pub extension: ContextExtension,
}

impl UnsignedInput {
    pub fn new(spent: ErgoBox) -> Self {
        Self {
            spent,
            extension: ContextExtension::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataInput {
    pub box_id: BoxId,
}

/// An output that does not exist on chain yet, so it has no id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputCandidate {
    #[serde(with = "amount_str")]
    pub value: u64,
    pub ergo_tree: ErgoTree,
    pub creation_height: u32,
    #[serde(default)]
    pub assets: Vec<Token>,
    #[serde(default)]
    pub additional_registers: Registers,
}

impl OutputCandidate {
    pub fn new(value: u64, ergo_tree: ErgoTree, creation_height: u32) -> Self {
        Self {
            value,
            ergo_tree,
            creation_height,
            assets: Vec::new(),
            additional_registers: Registers::new(),
        }
    }

    pub fn with_assets(mut self, assets: Vec<Token>) -> Self {
        self.assets = assets;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    pub version: u8,
    pub inputs: Vec<UnsignedInput>,
    #[serde(default)]
    pub data_inputs: Vec<DataInput>,
    pub outputs: Vec<OutputCandidate>,
    /// Chain height the transaction was built against.
    pub height: u32,
}

impl UnsignedTransaction {
    /// Canonical encoding every proof commits to. Proofs are excluded, so
    /// the id is stable across signers.
    pub fn bytes_to_sign(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_vlq(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(input.spent.box_id.as_bytes());
            put_vlq(&mut out, input.extension.len() as u64);
            for (id, value) in &input.extension {
                put_vlq(&mut out, id.len() as u64);
                out.extend_from_slice(id.as_bytes());
                put_hex_field(&mut out, value);
            }
        }

        put_vlq(&mut out, self.data_inputs.len() as u64);
        for data_input in &self.data_inputs {
            out.extend_from_slice(data_input.box_id.as_bytes());
        }

        put_vlq(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            put_vlq(&mut out, output.value);
            put_vlq(&mut out, output.ergo_tree.as_bytes().len() as u64);
            out.extend_from_slice(output.ergo_tree.as_bytes());
            put_vlq(&mut out, u64::from(output.creation_height));
            put_vlq(&mut out, output.assets.len() as u64);
            for token in &output.assets {
                out.extend_from_slice(token.token_id.as_bytes());
                put_vlq(&mut out, token.amount);
            }
            put_vlq(&mut out, output.additional_registers.len() as u64);
            for (name, value) in &output.additional_registers {
                put_vlq(&mut out, name.len() as u64);
                out.extend_from_slice(name.as_bytes());
                put_hex_field(&mut out, value);
            }
        }
        out
    }

    pub fn id(&self) -> TxId {
        TxId(blake2b256(&self.bytes_to_sign()))
    }

    /// Id of output `index` once this transaction is on chain.
    pub fn output_box_id(&self, index: u16) -> BoxId {
        let mut preimage = self.id().0.to_vec();
        preimage.extend_from_slice(&index.to_be_bytes());
        BoxId(blake2b256(&preimage))
    }

    /// Materialize output `index` as the box it will become.
    pub fn output_box(&self, index: u16) -> Option<ErgoBox> {
        let output = self.outputs.get(usize::from(index))?;
        Some(ErgoBox {
            box_id: self.output_box_id(index),
            transaction_id: self.id(),
            index,
            ergo_tree: output.ergo_tree.clone(),
            value: output.value,
            creation_height: output.creation_height,
            assets: output.assets.clone(),
            additional_registers: output.additional_registers.clone(),
            confirmed: false,
        })
    }

    /// Verify native-coin conservation and per-token non-inflation.
    ///
    /// Returns the per-token excess that would be burned. A token whose id
    /// equals the first input's box id is a fresh mint and may appear only
    /// on the output side.
    pub fn check_balance(&self) -> Result<Vec<Token>, WalletError> {
        let native_in = checked_sum(self.inputs.iter().map(|i| i.spent.value))?;
        let native_out = checked_sum(self.outputs.iter().map(|o| o.value))?;
        if native_in != native_out {
            return Err(WalletError::InvalidTransaction(format!(
                "native coin not conserved: in {native_in}, out {native_out}"
            )));
        }

        let tokens_in = token_totals(self.inputs.iter().flat_map(|i| i.spent.assets.iter()))?;
        let tokens_out = token_totals(self.outputs.iter().flat_map(|o| o.assets.iter()))?;
        let minted = self.minted_token_id();

        for (token_id, out_amount) in &tokens_out {
            let in_amount = tokens_in.get(token_id).copied().unwrap_or(0);
            if *out_amount > in_amount && Some(*token_id) != minted {
                return Err(WalletError::InvalidTransaction(format!(
                    "token {token_id} inflated: in {in_amount}, out {out_amount}"
                )));
            }
        }

        let mut burned: Vec<Token> = tokens_in
            .iter()
            .filter_map(|(token_id, in_amount)| {
                let out_amount = tokens_out.get(token_id).copied().unwrap_or(0);
                (in_amount > &out_amount).then(|| Token::new(*token_id, in_amount - out_amount))
            })
            .collect();
        burned.sort_by(|a, b| a.token_id.cmp(&b.token_id));
        Ok(burned)
    }

    /// Candidate id of a token minted by this transaction, by convention
    /// the id of the first input box.
    pub fn minted_token_id(&self) -> Option<TokenId> {
        self.inputs.first().map(|i| TokenId::from(i.spent.box_id))
    }
}

fn put_hex_field(out: &mut Vec<u8>, value: &str) {
    // Malformed hex is committed to verbatim so it still changes the id.
    let bytes = hex::decode(value).unwrap_or_else(|_| value.as_bytes().to_vec());
    put_vlq(out, bytes.len() as u64);
    out.extend_from_slice(&bytes);
}

pub(crate) fn checked_sum(mut values: impl Iterator<Item = u64>) -> Result<u64, WalletError> {
    values.try_fold(0u64, |acc, v| {
        acc.checked_add(v)
            .ok_or_else(|| WalletError::InvalidTransaction("amount overflow".into()))
    })
}

pub(crate) fn token_totals<'a>(
    tokens: impl Iterator<Item = &'a Token>,
) -> Result<HashMap<TokenId, u64>, WalletError> {
    let mut totals: HashMap<TokenId, u64> = HashMap::new();
    for token in tokens {
        let entry = totals.entry(token.token_id).or_insert(0);
        *entry = entry
            .checked_add(token.amount)
            .ok_or_else(|| WalletError::InvalidTransaction("token amount overflow".into()))?;
    }
    Ok(totals)
}

// ==============================================================================
// Signed Transaction
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingProof {
    /// Hex proof bytes; empty for inputs whose script needs no signature.
    pub proof_bytes: String,
    #[serde(default)]
    pub extension: ContextExtension,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedInput {
    pub box_id: BoxId,
    pub spending_proof: SpendingProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub id: TxId,
    pub inputs: Vec<SignedInput>,
    #[serde(default)]
    pub data_inputs: Vec<DataInput>,
    pub outputs: Vec<OutputCandidate>,
}

impl SignedTransaction {
    /// Attach one proof per input, in input order.
    pub fn from_unsigned(
        unsigned: &UnsignedTransaction,
        proofs: Vec<Vec<u8>>,
    ) -> Result<Self, WalletError> {
        if proofs.len() != unsigned.inputs.len() {
            return Err(WalletError::InvalidTransaction(format!(
                "expected {} proofs, got {}",
                unsigned.inputs.len(),
                proofs.len()
            )));
        }
        let inputs = unsigned
            .inputs
            .iter()
            .zip(proofs)
            .map(|(input, proof)| SignedInput {
                box_id: input.spent.box_id,
                spending_proof: SpendingProof {
                    proof_bytes: hex::encode(proof),
                    extension: input.extension.clone(),
                },
            })
            .collect();
        Ok(Self {
            id: unsigned.id(),
            inputs,
            data_inputs: unsigned.data_inputs.clone(),
            outputs: unsigned.outputs.clone(),
        })
    }
}
