use serde::{Deserialize, Serialize};

use crate::address::Network;

/// Smallest native-coin value a box may carry.
pub const MIN_BOX_VALUE: u64 = 1_000_000;

/// Default miner fee for a standard transaction.
pub const SUGGESTED_FEE: u64 = 1_100_000;

/// Tunables shared by the synchronizer, reconciler and builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct WalletSettings {
    pub network: Network,
    /// Addresses queried per scan chunk; also the effective gap limit.
    pub chunk_size: u32,
    pub min_box_value: u64,
    pub suggested_fee: u64,
    /// Token cap per change box for the ordered strategy.
    pub max_tokens_per_change_box: usize,
    /// How long an overlay row for a vanished transaction survives before
    /// it is treated as dropped.
    pub overlay_grace_secs: u64,
    pub explorer_url: String,
    /// Outbound explorer requests per second; `None` disables limiting.
    pub requests_per_second: Option<u32>,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            chunk_size: 20,
            min_box_value: MIN_BOX_VALUE,
            suggested_fee: SUGGESTED_FEE,
            max_tokens_per_change_box: 100,
            overlay_grace_secs: 600,
            explorer_url: "https://api.ergoplatform.com".to_owned(),
            requests_per_second: Some(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_fill_from_defaults() {
        let settings: WalletSettings =
            serde_json::from_str(r#"{"network":"testnet","chunk_size":5}"#).expect("parse");
        assert_eq!(settings.network, Network::Testnet);
        assert_eq!(settings.chunk_size, 5);
        assert_eq!(settings.min_box_value, MIN_BOX_VALUE);
        assert_eq!(settings.requests_per_second, Some(10));
    }
}
