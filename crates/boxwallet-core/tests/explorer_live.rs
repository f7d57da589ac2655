use std::env;
use std::sync::{Arc, Once};

use boxwallet_core::address::Network;
use boxwallet_core::keys::ExtendedKey;
use boxwallet_core::provider::{BoxQuery, ChainProvider, ExplorerClient};
use boxwallet_core::store::MemoryStore;
use boxwallet_core::sync::SyncOutcome;
use boxwallet_core::types::{Wallet, WalletId, WalletKind};
use boxwallet_core::{WalletService, WalletSettings};

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("boxwallet_core=debug")),
            )
            .with_target(true)
            .try_init();
    });
}

fn network() -> Network {
    env::var("BOXWALLET_TEST_NETWORK")
        .ok()
        .map(|n| n.parse().expect("BOXWALLET_TEST_NETWORK must be mainnet or testnet"))
        .unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a reachable explorer; set BOXWALLET_TEST_EXPLORER_URL"]
async fn live_explorer_serves_headers_and_address_queries() {
    init_tracing();

    let url = env::var("BOXWALLET_TEST_EXPLORER_URL").expect("BOXWALLET_TEST_EXPLORER_URL must be set");
    let client = ExplorerClient::new(&url, Some(5)).expect("explorer client must construct");

    eprintln!("[itest] fetching headers from {url}");
    let height = client.get_height().await.expect("height must load");
    let headers = client.get_block_headers(5).await.expect("headers must load");
    assert_eq!(headers.len(), 5);
    assert!(headers[0].height <= height);
    assert!(
        headers.windows(2).all(|w| w[0].height > w[1].height),
        "headers must be newest first"
    );

    let key = ExtendedKey::from_mnemonic(
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        "",
    )
    .expect("fixture mnemonic must parse");
    let first = key.derive_address(0, network()).expect("derive").address;

    let info = client
        .get_address_info(std::slice::from_ref(&first))
        .await
        .expect("address info must load");
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].address, first);

    let boxes = client
        .get_boxes(&BoxQuery::addresses(vec![first.clone()], true))
        .await
        .expect("box query must succeed");
    eprintln!("[itest] {first} holds {} unspent boxes", boxes.len());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a reachable explorer; set BOXWALLET_TEST_EXPLORER_URL"]
async fn live_sync_of_public_key_wallet_completes() {
    init_tracing();

    let url = env::var("BOXWALLET_TEST_EXPLORER_URL").expect("BOXWALLET_TEST_EXPLORER_URL must be set");
    let settings = WalletSettings {
        network: network(),
        explorer_url: url.clone(),
        requests_per_second: Some(5),
        ..WalletSettings::default()
    };
    let client = ExplorerClient::new(&url, settings.requests_per_second).expect("explorer client");
    let service = WalletService::new(Arc::new(client), Arc::new(MemoryStore::new()), settings);

    let key = ExtendedKey::from_mnemonic(
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        "",
    )
    .expect("fixture mnemonic must parse")
    .public_only();
    let wallet = Wallet {
        id: WalletId(1),
        name: "itest".into(),
        kind: WalletKind::ReadOnly,
        extended_public_key: key.to_extended_public_key(),
        network: network(),
    };
    service.keys().insert(key).await;

    match service.sync(&wallet).await.expect("sync must succeed") {
        SyncOutcome::Completed(report) => {
            assert!(report.scanned > 0, "a fresh wallet must scan at least one chunk");
            let addresses = service.own_scripts(wallet.id).await.expect("addresses");
            assert!(!addresses.is_empty());
        }
        SyncOutcome::Discarded => panic!("no other wallet is active"),
    }
}
