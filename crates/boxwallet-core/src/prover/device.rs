//! Hardware signing device path.
//!
//! The device is an exclusive resource: one session holds the transport at
//! a time, and the transport is closed when the holder goes away on any
//! exit path, cancellation included.

use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use bitcoin::bip32::DerivationPath;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{SigningEvent, SigningSession, SigningState};
use crate::error::WalletError;
use crate::keys::ExtendedKey;
use crate::tx::{ContextExtension, DataInput, OutputCandidate, SignedTransaction, UnsignedTransaction};
use crate::types::{ErgoBox, TokenId};

/// Status word: the user rejected the request on the device.
pub const SW_DENIED: u16 = 0x6985;
/// Status words reported while the device is locked.
pub const SW_LOCKED: [u16; 2] = [0x5515, 0x6982];

/// Raw error reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device status {code:#06x}: {message}")]
pub struct DeviceError {
    pub code: u16,
    pub message: String,
}

impl From<DeviceError> for WalletError {
    fn from(err: DeviceError) -> Self {
        match err.code {
            SW_DENIED => WalletError::UserDenied,
            code if SW_LOCKED.contains(&code) => WalletError::DeviceLocked,
            _ => WalletError::Device(err.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInput {
    pub spent: ErgoBox,
    pub extension: ContextExtension,
    pub sign_path: DerivationPath,
}

/// Everything streamed to the device for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSignRequest {
    pub inputs: Vec<DeviceInput>,
    pub data_inputs: Vec<DataInput>,
    pub outputs: Vec<OutputCandidate>,
    /// Distinct token ids across inputs and outputs, in first-seen order.
    pub tokens: Vec<TokenId>,
    pub change_path: DerivationPath,
}

#[async_trait]
pub trait DeviceTransport: Send {
    async fn open(&mut self) -> Result<(), DeviceError>;

    /// One proof per input, in input order. Resolves once the user has
    /// approved or rejected the transaction on the device.
    async fn sign_transaction(
        &mut self,
        request: &DeviceSignRequest,
    ) -> Result<Vec<Vec<u8>>, DeviceError>;

    fn close(&mut self);
}

/// Shared handle to a signing device.
pub struct Device<T> {
    transport: Mutex<T>,
}

/// Holds the device and closes its transport on drop.
struct OpenDevice<'a, T: DeviceTransport> {
    guard: MutexGuard<'a, T>,
}

impl<T: DeviceTransport> Deref for OpenDevice<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: DeviceTransport> DerefMut for OpenDevice<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: DeviceTransport> Drop for OpenDevice<'_, T> {
    fn drop(&mut self) {
        self.guard.close();
        debug!("device transport closed");
    }
}

impl<T: DeviceTransport> Device<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Mutex::new(transport),
        }
    }

    fn acquire(&self) -> Result<OpenDevice<'_, T>, WalletError> {
        let guard = self
            .transport
            .try_lock()
            .map_err(|_| WalletError::DeviceUnavailable("device is busy with another request".into()))?;
        Ok(OpenDevice { guard })
    }
}

/// Device signing result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSigned {
    pub signed: SignedTransaction,
    /// Inputs signed with the primary path because no wallet address owns
    /// them; the caller should not trust these proofs to be valid.
    pub untrusted_inputs: Vec<usize>,
}

impl SigningSession {
    /// Sign on an external device.
    pub async fn sign_device<T: DeviceTransport>(
        &mut self,
        device: &Device<T>,
        tx: &UnsignedTransaction,
    ) -> Result<DeviceSigned, WalletError> {
        self.begin()?;
        let result = self.run_device(device, tx).await;
        self.settle(result)
    }

    async fn run_device<T: DeviceTransport>(
        &mut self,
        device: &Device<T>,
        tx: &UnsignedTransaction,
    ) -> Result<DeviceSigned, WalletError> {
        let (request, untrusted_inputs) = self.device_request(tx)?;
        if !untrusted_inputs.is_empty() {
            warn!(inputs = ?untrusted_inputs, "inputs not owned by wallet; signing with primary path");
            self.emit(SigningEvent::UntrustedInputs {
                indices: untrusted_inputs.clone(),
            });
        }

        let mut transport = device.acquire()?;
        self.transition(SigningState::DeviceConnecting);
        transport.open().await?;
        info!(inputs = request.inputs.len(), "device connected");

        self.transition(SigningState::DeviceWaitingApproval);
        let proofs = transport.sign_transaction(&request).await?;
        drop(transport);

        self.transition(SigningState::DeviceSigning);
        let signed = SignedTransaction::from_unsigned(tx, proofs)?;
        Ok(DeviceSigned {
            signed,
            untrusted_inputs,
        })
    }

    fn device_request(
        &self,
        tx: &UnsignedTransaction,
    ) -> Result<(DeviceSignRequest, Vec<usize>), WalletError> {
        let mut untrusted = Vec::new();
        let mut inputs = Vec::with_capacity(tx.inputs.len());
        for (i, input) in tx.inputs.iter().enumerate() {
            let index = match self.owner_index(&input.spent.ergo_tree) {
                Some(index) => index,
                None => {
                    untrusted.push(i);
                    0
                }
            };
            inputs.push(DeviceInput {
                spent: input.spent.clone(),
                extension: input.extension.clone(),
                sign_path: ExtendedKey::full_path(index)?,
            });
        }

        let mut seen = BTreeSet::new();
        let tokens = tx
            .inputs
            .iter()
            .flat_map(|i| i.spent.assets.iter())
            .chain(tx.outputs.iter().flat_map(|o| o.assets.iter()))
            .map(|t| t.token_id)
            .filter(|id| seen.insert(*id))
            .collect();

        let request = DeviceSignRequest {
            inputs,
            data_inputs: tx.data_inputs.clone(),
            outputs: tx.outputs.clone(),
            tokens,
            change_path: ExtendedKey::full_path(self.change_index)?,
        };
        Ok((request, untrusted))
    }
}
