//! In-memory key signing.
//!
//! Proofs are BIP340 Schnorr signatures over the blake2b256 digest of the
//! transaction's signing bytes, one per input the wallet can prove.

use std::collections::BTreeSet;

use bitcoin::secp256k1::{schnorr, Keypair, Message, PublicKey, Secp256k1, SecretKey};
use tracing::debug;

use super::{SigningSession, SigningState};
use crate::error::WalletError;
use crate::keys::ExtendedKey;
use crate::sigma::blake2b256;
use crate::tx::{SignedTransaction, UnsignedTransaction};

pub(crate) fn schnorr_sign(secret: &SecretKey, digest: [u8; 32]) -> [u8; 64] {
    let secp = Secp256k1::signing_only();
    let keypair = Keypair::from_secret_key(&secp, secret);
    secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair)
        .serialize()
}

pub(crate) fn schnorr_verify(public_key: &[u8; 33], digest: [u8; 32], signature: &[u8]) -> bool {
    let Ok(public_key) = PublicKey::from_slice(public_key) else {
        return false;
    };
    let Ok(signature) = schnorr::Signature::from_slice(signature) else {
        return false;
    };
    let (x_only, _) = public_key.x_only_public_key();
    Secp256k1::verification_only()
        .verify_schnorr(&signature, &Message::from_digest(digest), &x_only)
        .is_ok()
}

struct Signer {
    index: u32,
    secret: SecretKey,
    public_key: [u8; 33],
}

impl SigningSession {
    /// Sign every input the wallet can prove. Inputs it cannot prove, such
    /// as a liquidity box, get an empty proof.
    pub fn sign_local(
        &mut self,
        key: &ExtendedKey,
        tx: &UnsignedTransaction,
    ) -> Result<SignedTransaction, WalletError> {
        self.begin()?;
        self.transition(SigningState::LocalSign);
        let all: Vec<usize> = (0..tx.inputs.len()).collect();
        let result = self.local_proofs(key, tx, &all).and_then(|proofs| {
            SignedTransaction::from_unsigned(tx, proofs.into_iter().map(|(_, p)| p).collect())
        });
        self.settle(result)
    }

    /// Proofs for exactly `indices`, leaving the other inputs to another
    /// party.
    pub fn sign_inputs(
        &mut self,
        key: &ExtendedKey,
        tx: &UnsignedTransaction,
        indices: &[usize],
    ) -> Result<Vec<(usize, Vec<u8>)>, WalletError> {
        self.begin()?;
        self.transition(SigningState::LocalSign);
        let result = self.local_proofs(key, tx, indices);
        self.settle(result)
    }

    fn local_proofs(
        &self,
        key: &ExtendedKey,
        tx: &UnsignedTransaction,
        indices: &[usize],
    ) -> Result<Vec<(usize, Vec<u8>)>, WalletError> {
        if key.is_neutered() {
            return Err(WalletError::KeyUnavailable);
        }
        if let Some(bad) = indices.iter().find(|i| **i >= tx.inputs.len()) {
            return Err(WalletError::InvalidRequest(format!(
                "input index {bad} out of range ({} inputs)",
                tx.inputs.len()
            )));
        }

        let owners: Vec<Option<u32>> = tx
            .inputs
            .iter()
            .map(|input| self.owner_index(&input.spent.ergo_tree))
            .collect();
        let mut needed: BTreeSet<u32> = owners.iter().flatten().copied().collect();
        if needed.is_empty() {
            debug!(change_index = self.change_index, "no owned inputs; using change key");
            needed.insert(self.change_index);
        }

        let secp = Secp256k1::signing_only();
        let signers = needed
            .into_iter()
            .map(|index| {
                let secret = key.derive_private_key(index)?;
                Ok(Signer {
                    index,
                    public_key: PublicKey::from_secret_key(&secp, &secret).serialize(),
                    secret,
                })
            })
            .collect::<Result<Vec<_>, WalletError>>()?;

        let digest = blake2b256(&tx.bytes_to_sign());
        Ok(indices
            .iter()
            .map(|&i| {
                let tree = tx.inputs[i].spent.ergo_tree.as_bytes();
                let signer = signers.iter().find(|s| {
                    owners[i] == Some(s.index) || tree.windows(33).any(|w| w == s.public_key)
                });
                let proof = signer
                    .map(|s| schnorr_sign(&s.secret, digest).to_vec())
                    .unwrap_or_default();
                (i, proof)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::babel::test_support::babel_box;
    use crate::prover::tests::recording_session;
    use crate::prover::SigningEvent;
    use crate::provider::mock::MockProvider;
    use crate::test_util::*;
    use crate::tx::{OutputCandidate, UnsignedInput, UNSIGNED_TX_VERSION};
    use crate::types::{ErgoBox, ErgoTree, WalletKind};

    fn tx_spending(boxes: Vec<ErgoBox>) -> UnsignedTransaction {
        let total: u64 = boxes.iter().map(|b| b.value).sum();
        UnsignedTransaction {
            version: UNSIGNED_TX_VERSION,
            inputs: boxes.into_iter().map(UnsignedInput::new).collect(),
            data_inputs: vec![],
            outputs: vec![OutputCandidate::new(total, foreign_tree(9), 1000)],
            height: 1000,
        }
    }

    fn public_key(index: u32) -> [u8; 33] {
        *Address::decode(&own_address(index))
            .expect("decode")
            .public_key()
            .expect("p2pk")
    }

    async fn ready(kind: WalletKind) -> (SigningSession, std::sync::Arc<std::sync::Mutex<Vec<SigningEvent>>>) {
        let provider = MockProvider::builder().with_headers(10).build();
        let (mut session, events) = recording_session(kind);
        session.load_context(&provider).await.expect("load context");
        (session, events)
    }

    #[test]
    fn signing_without_context_fails() {
        let (mut session, _) = recording_session(WalletKind::Standard);
        let tx = tx_spending(vec![make_box(1, p2pk_tree(0), erg(1), 10, vec![])]);

        let err = session.sign_local(&test_key(), &tx).expect_err("missing context");
        assert!(matches!(err, WalletError::MissingContext));
        assert_eq!(session.state(), SigningState::Idle);
    }

    #[tokio::test]
    async fn signs_owned_inputs_and_skips_liquidity_box() {
        let (mut session, events) = ready(WalletKind::Standard).await;
        let tx = tx_spending(vec![
            make_box(1, p2pk_tree(2), erg(1), 10, vec![]),
            babel_box(2, token_from_byte(7), erg(1), 1_000),
        ]);

        let signed = session.sign_local(&test_key(), &tx).expect("sign");

        let digest = blake2b256(&tx.bytes_to_sign());
        let proof = hex::decode(&signed.inputs[0].spending_proof.proof_bytes).expect("hex");
        assert!(schnorr_verify(&public_key(2), digest, &proof));
        assert!(!schnorr_verify(&public_key(0), digest, &proof));
        assert!(signed.inputs[1].spending_proof.proof_bytes.is_empty());
        assert_eq!(signed.id, tx.id());
        assert_eq!(session.state(), SigningState::Signed);

        let states: Vec<SigningState> = events
            .lock()
            .expect("events lock")
            .iter()
            .filter_map(|e| match e {
                SigningEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![SigningState::ContextLoaded, SigningState::LocalSign, SigningState::Signed]
        );
    }

    #[tokio::test]
    async fn sign_inputs_returns_only_requested() {
        let (mut session, _) = ready(WalletKind::Standard).await;
        let tx = tx_spending(vec![
            make_box(1, p2pk_tree(0), erg(1), 10, vec![]),
            make_box(2, foreign_tree(3), erg(1), 10, vec![]),
            make_box(3, p2pk_tree(1), erg(1), 10, vec![]),
        ]);

        let proofs = session.sign_inputs(&test_key(), &tx, &[2]).expect("sign");

        assert_eq!(proofs.len(), 1);
        assert_eq!(proofs[0].0, 2);
        let digest = blake2b256(&tx.bytes_to_sign());
        assert!(schnorr_verify(&public_key(1), digest, &proofs[0].1));
    }

    #[tokio::test]
    async fn neutered_key_fails_and_attempt_is_retryable() {
        let (mut session, _) = ready(WalletKind::Standard).await;
        let tx = tx_spending(vec![make_box(1, p2pk_tree(0), erg(1), 10, vec![])]);

        let err = session
            .sign_local(&test_key().public_only(), &tx)
            .expect_err("neutered");
        assert!(matches!(err, WalletError::KeyUnavailable));
        assert_eq!(session.state(), SigningState::Failed);

        session.sign_local(&test_key(), &tx).expect("retry with full key");
        assert_eq!(session.state(), SigningState::Signed);
    }

    #[tokio::test]
    async fn unowned_transaction_falls_back_to_change_key() {
        let (session, _) = ready(WalletKind::Standard).await;
        let mut session = session.with_change_index(1);
        // A script that embeds the change key without being its P2PK tree.
        let mut script = vec![0x10, 0x01, 0x08, 0xcd];
        script.extend_from_slice(&public_key(1));
        script.extend_from_slice(&[0x73, 0x00]);
        let tx = tx_spending(vec![make_box(1, ErgoTree(script), erg(1), 10, vec![])]);

        let signed = session.sign_local(&test_key(), &tx).expect("sign");

        let digest = blake2b256(&tx.bytes_to_sign());
        let proof = hex::decode(&signed.inputs[0].spending_proof.proof_bytes).expect("hex");
        assert!(schnorr_verify(&public_key(1), digest, &proof));
    }

    #[tokio::test]
    async fn out_of_range_index_is_rejected() {
        let (mut session, _) = ready(WalletKind::Standard).await;
        let tx = tx_spending(vec![make_box(1, p2pk_tree(0), erg(1), 10, vec![])]);

        let err = session.sign_inputs(&test_key(), &tx, &[3]).expect_err("range");
        assert!(matches!(err, WalletError::InvalidRequest(_)));
    }
}
