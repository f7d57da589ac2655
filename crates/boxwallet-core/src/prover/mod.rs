//! Transaction signing.
//!
//! A [`SigningSession`] is one signing attempt. It walks an explicit state
//! machine:
//!
//! ```text
//! Idle -> ContextLoaded -> LocalSign ---------------------------------> Signed
//!                       \-> DeviceConnecting -> DeviceWaitingApproval
//!                              -> DeviceSigning ----------------------> Signed
//! ```
//!
//! and any step may end in `Failed`. Every transition is reported to the
//! caller as a [`SigningEvent`]. Signing never mutates the unsigned
//! transaction, so a failed attempt can be retried, or handed to another
//! signer, with the same object.

mod device;
mod local;

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::address::{tree_to_address, Network};
use crate::error::WalletError;
use crate::provider::ChainProvider;
use crate::types::{ErgoTree, Header, Wallet, WalletAddress};

pub use device::{Device, DeviceError, DeviceInput, DeviceSignRequest, DeviceSigned, DeviceTransport};
pub(crate) use local::{schnorr_sign, schnorr_verify};

/// Recent headers fetched as signing context.
pub const CONTEXT_HEADERS: usize = 10;

/// Index signing falls back to when the wallet owns none of the inputs.
pub const DEFAULT_CHANGE_INDEX: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningState {
    Idle,
    ContextLoaded,
    LocalSign,
    DeviceConnecting,
    DeviceWaitingApproval,
    DeviceSigning,
    Signed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SigningEvent {
    StateChanged {
        from: SigningState,
        to: SigningState,
    },
    /// Inputs whose owner could not be matched; the device was asked to
    /// sign them with the primary path.
    UntrustedInputs { indices: Vec<usize> },
}

/// Chain state the proofs are made against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainContext {
    /// Newest first.
    pub headers: Vec<Header>,
    pub height: u32,
}

type Observer = Box<dyn FnMut(&SigningEvent) + Send>;

pub struct SigningSession {
    network: Network,
    /// Address string to derivation index.
    owned: HashMap<String, u32>,
    change_index: u32,
    state: SigningState,
    context: Option<ChainContext>,
    observer: Option<Observer>,
}

impl SigningSession {
    pub fn new(wallet: &Wallet, addresses: &[WalletAddress]) -> Self {
        Self {
            network: wallet.network,
            owned: addresses
                .iter()
                .filter(|a| a.wallet_id == wallet.id)
                .map(|a| (a.script.clone(), a.index))
                .collect(),
            change_index: DEFAULT_CHANGE_INDEX,
            state: SigningState::Idle,
            context: None,
            observer: None,
        }
    }

    pub fn with_change_index(mut self, index: u32) -> Self {
        self.change_index = index;
        self
    }

    /// Receive every state transition and untrusted-input report.
    pub fn on_event(mut self, observer: impl FnMut(&SigningEvent) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> SigningState {
        self.state
    }

    pub fn context(&self) -> Option<&ChainContext> {
        self.context.as_ref()
    }

    /// Fetch recent headers. Required before either signing path.
    pub async fn load_context(&mut self, provider: &dyn ChainProvider) -> Result<(), WalletError> {
        match fetch_context(provider).await {
            Ok(context) => {
                debug!(headers = context.headers.len(), height = context.height, "signing context loaded");
                self.context = Some(context);
                self.transition(SigningState::ContextLoaded);
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Derivation index of the address that owns `tree`, if any.
    pub fn owner_index(&self, tree: &ErgoTree) -> Option<u32> {
        self.owned
            .get(&tree_to_address(self.network, tree))
            .copied()
    }

    fn transition(&mut self, to: SigningState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.emit(SigningEvent::StateChanged { from, to });
    }

    fn emit(&mut self, event: SigningEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&event);
        }
    }

    fn fail(&mut self, err: &WalletError) {
        warn!(state = ?self.state, error = %err, "signing failed");
        self.transition(SigningState::Failed);
    }

    /// Start an attempt: context must be present. A previous `Signed` or
    /// `Failed` attempt rewinds to `ContextLoaded`.
    fn begin(&mut self) -> Result<(), WalletError> {
        if self.context.is_none() {
            return Err(WalletError::MissingContext);
        }
        self.transition(SigningState::ContextLoaded);
        Ok(())
    }

    /// Record the outcome of a step, moving to `Failed` on error.
    fn settle<T>(&mut self, result: Result<T, WalletError>) -> Result<T, WalletError> {
        match result {
            Ok(value) => {
                self.transition(SigningState::Signed);
                Ok(value)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }
}

async fn fetch_context(provider: &dyn ChainProvider) -> Result<ChainContext, WalletError> {
    let headers = provider.get_block_headers(CONTEXT_HEADERS).await?;
    let height = match headers.first() {
        Some(tip) => tip.height,
        None => provider.get_height().await?,
    };
    Ok(ChainContext { headers, height })
}
