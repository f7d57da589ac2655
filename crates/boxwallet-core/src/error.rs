use serde::Serialize;

use crate::types::TokenId;

/// Every failure the wallet engine can surface.
///
/// Variants map onto a stable [`ErrorKind`] so a UI layer can tell
/// "not enough funds" apart from "device locked" apart from
/// "network unreachable" without string matching.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("insufficient funds for {token_id}: required {required}, available {available}")]
    InsufficientFunds {
        token_id: TokenId,
        required: u64,
        available: u64,
    },

    #[error("insufficient liquidity: {0}")]
    InsufficientLiquidity(String),

    #[error("no inputs available to spend")]
    NoInputsAvailable,

    #[error("private key unavailable: wallet key is neutered")]
    KeyUnavailable,

    #[error("address is not owned by this wallet: {0}")]
    AddressNotOwned(String),

    #[error("wallet key not loaded: {0}")]
    NotLoaded(String),

    #[error("signing device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("request denied on the signing device")]
    UserDenied,

    #[error("signing device is locked")]
    DeviceLocked,

    #[error("signing device error: {0}")]
    Device(String),

    #[error("chain context must be loaded before signing")]
    MissingContext,

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("store failure: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Chain-data provider failures, carrying the origin of the message.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider rejected request ({origin}): {message}")]
    Rejected { origin: String, message: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// The network reports an input as already spent while its index lags
    /// behind; the only rejection worth retrying a submission for.
    pub fn is_input_already_spent(&self) -> bool {
        match self {
            Self::Rejected { message, .. } => {
                let lower = message.to_ascii_lowercase();
                lower.contains("already spent") || lower.contains("double spending")
            }
            _ => false,
        }
    }
}

/// Coarse error category exposed to presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientFunds,
    InsufficientLiquidity,
    NoInputsAvailable,
    KeyUnavailable,
    AddressNotOwned,
    NotLoaded,
    DeviceUnavailable,
    UserDenied,
    DeviceLocked,
    DeviceOther,
    MissingContext,
    InvalidTransaction,
    InvalidRequest,
    Network,
    Storage,
}

impl WalletError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::InsufficientLiquidity(_) => ErrorKind::InsufficientLiquidity,
            Self::NoInputsAvailable => ErrorKind::NoInputsAvailable,
            Self::KeyUnavailable => ErrorKind::KeyUnavailable,
            Self::AddressNotOwned(_) => ErrorKind::AddressNotOwned,
            Self::NotLoaded(_) => ErrorKind::NotLoaded,
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::UserDenied => ErrorKind::UserDenied,
            Self::DeviceLocked => ErrorKind::DeviceLocked,
            Self::Device(_) => ErrorKind::DeviceOther,
            Self::MissingContext => ErrorKind::MissingContext,
            Self::InvalidTransaction(_) => ErrorKind::InvalidTransaction,
            Self::InvalidRequest(_) | Self::InvalidAddress(_) => ErrorKind::InvalidRequest,
            Self::Provider(_) => ErrorKind::Network,
            Self::Store(_) | Self::Io(_) => ErrorKind::Storage,
        }
    }

    /// Structured form for handing an error across a process boundary.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}
