pub mod address;
pub mod auth;
pub mod babel;
pub mod builder;
pub mod config;
pub mod error;
pub mod interpreter;
pub mod keyring;
pub mod keys;
pub mod prover;
pub mod provider;
pub mod selection;
pub mod service;
pub mod sigma;
pub mod store;
pub mod sync;
pub mod tx;
pub mod types;
pub mod utxo;

#[cfg(test)]
mod test_util;

pub use config::WalletSettings;
pub use error::{ErrorKind, WalletError};
pub use service::{PreparedSend, SendIntent, WalletService};
