mod cli;

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use eyre::{bail, eyre, WrapErr};
use serde::Serialize;

use boxwallet_core::address::Network;
use boxwallet_core::auth::{verify_message, AuthProof};
use boxwallet_core::builder::FeeSettings;
use boxwallet_core::keys::ExtendedKey;
use boxwallet_core::provider::{ChainProvider, ExplorerClient};
use boxwallet_core::store::{FileStore, WalletStore};
use boxwallet_core::sync::SyncOutcome;
use boxwallet_core::types::{Token, TokenId, Wallet, WalletId, WalletKind};
use boxwallet_core::{ErrorKind, SendIntent, WalletError, WalletService, WalletSettings};

use cli::{Command, SendArgs};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let network: Network = args.network.parse().wrap_err("parse --network")?;
    let mut settings = WalletSettings {
        network,
        chunk_size: args.chunk_size,
        requests_per_second: (args.requests_per_second > 0).then_some(args.requests_per_second),
        ..WalletSettings::default()
    };
    if let Some(url) = &args.explorer_url {
        settings.explorer_url = url.clone();
    }

    let key = load_key(&args)?;
    let wallet = Wallet {
        id: WalletId(args.wallet_id),
        name: format!("wallet-{}", args.wallet_id),
        kind: if key.is_neutered() {
            WalletKind::ReadOnly
        } else {
            WalletKind::Standard
        },
        extended_public_key: key.to_extended_public_key(),
        network,
    };

    // Commands that need neither the explorer nor the state file.
    match &args.command {
        Command::Addresses { count, offset } => {
            let addresses = key
                .derive_addresses(*count, *offset, network)
                .wrap_err("derive addresses")?;
            return print_json(&addresses);
        }
        Command::VerifyMessage { proof } => {
            let proof: AuthProof = serde_json::from_str(proof).wrap_err("parse --proof")?;
            let valid = verify_message(&proof).map_err(with_hint)?;
            return print_json(&serde_json::json!({ "valid": valid }));
        }
        _ => {}
    }

    let provider: Arc<dyn ChainProvider> = Arc::new(
        ExplorerClient::new(&settings.explorer_url, settings.requests_per_second)
            .wrap_err("create explorer client")?,
    );
    let store: Arc<dyn WalletStore> = Arc::new(
        FileStore::open(&args.store)
            .wrap_err_with(|| format!("open state file {}", args.store.display()))?,
    );
    tracing::info!(
        network = ?network,
        explorer = %settings.explorer_url,
        store = %args.store.display(),
        wallet_id = %wallet.id,
        "wallet session ready"
    );

    let service = WalletService::new(provider, store, settings);
    service.keys().insert(key).await;
    // No metadata source is wired in; amounts render with 0 decimals.
    let metadata = HashMap::new();

    match args.command {
        Command::Addresses { .. } | Command::VerifyMessage { .. } => Ok(()),
        Command::Sync => match service.sync(&wallet).await.map_err(with_hint)? {
            SyncOutcome::Completed(report) => {
                tracing::info!(
                    addresses = report.addresses.len(),
                    updated_assets = report.updated_assets.len(),
                    removed_assets = report.removed_assets.len(),
                    scanned = report.scanned,
                    "sync complete"
                );
                print_json(&report)
            }
            SyncOutcome::Discarded => bail!("sync result discarded: active wallet changed"),
        },
        Command::Balance => print_json(&service.balance(wallet.id).await.map_err(with_hint)?),
        Command::Utxos { pending } => {
            let (boxes, pruned) = service
                .spendable_boxes(wallet.id, pending)
                .await
                .map_err(with_hint)?;
            if !pruned.confirmed.is_empty() || !pruned.dropped.is_empty() {
                tracing::info!(
                    confirmed = pruned.confirmed.len(),
                    dropped = pruned.dropped.len(),
                    "pruned pending overlay"
                );
            }
            print_json(&boxes)
        }
        Command::Send(send) => {
            let intent = send_intent(&send, service.settings())?;
            let prepared = service
                .prepare_send(&wallet, &intent, &metadata)
                .await
                .map_err(with_hint)?;
            if !send.broadcast {
                return print_json(&prepared);
            }

            let key = service.keys().for_wallet(&wallet).await.map_err(with_hint)?;
            let mut session = service.signing_session(&wallet).await.map_err(with_hint)?;
            let signed = session
                .sign_local(&key, &prepared.built.unsigned)
                .map_err(with_hint)?;
            let tx_id = service
                .submit(wallet.id, &prepared.built.unsigned, &signed)
                .await
                .map_err(with_hint)?;
            print_json(&serde_json::json!({ "transactionId": tx_id }))
        }
        Command::History { limit } => print_json(
            &service
                .history(wallet.id, limit, &metadata)
                .await
                .map_err(with_hint)?,
        ),
        Command::SignMessage {
            address,
            message,
            origin,
        } => print_json(
            &service
                .sign_message(&wallet, &address, &message, &origin)
                .await
                .map_err(with_hint)?,
        ),
    }
}

fn load_key(args: &cli::Cli) -> eyre::Result<ExtendedKey> {
    match (&args.mnemonic, &args.xpub) {
        (Some(phrase), _) => {
            ExtendedKey::from_mnemonic(phrase, &args.passphrase).wrap_err("load mnemonic")
        }
        (None, Some(xpub)) => {
            ExtendedKey::from_extended_public_key(xpub).wrap_err("load extended public key")
        }
        (None, None) => Err(eyre!(
            "no wallet key: pass --mnemonic (or BOXWALLET_MNEMONIC) or --xpub"
        )),
    }
}

fn send_intent(args: &SendArgs, settings: &WalletSettings) -> eyre::Result<SendIntent> {
    let mut assets = Vec::new();
    if args.amount > 0 {
        assets.push(Token::new(TokenId::NATIVE, args.amount));
    }
    for spec in &args.tokens {
        assets.push(parse_token(spec).wrap_err_with(|| format!("parse --token {spec}"))?);
    }
    let burn = args
        .burn
        .iter()
        .map(|spec| parse_token(spec).wrap_err_with(|| format!("parse --burn {spec}")))
        .collect::<eyre::Result<Vec<_>>>()?;

    let fee = match &args.fee_token {
        Some(token) => FeeSettings {
            token_id: token.parse().wrap_err("parse --fee-token")?,
            value: args.fee.unwrap_or_default(),
            asset_decimals: None,
            liquidity_box: None,
        },
        None => FeeSettings::native(args.fee.unwrap_or(settings.suggested_fee)),
    };

    Ok(SendIntent {
        recipient: args.to.clone(),
        assets,
        fee,
        burn,
        change_address: args.change_address.clone(),
        include_unconfirmed: !args.confirmed_only,
    })
}

/// `TOKEN_ID:AMOUNT`
fn parse_token(spec: &str) -> eyre::Result<Token> {
    let (id, amount) = spec
        .split_once(':')
        .ok_or_else(|| eyre!("expected TOKEN_ID:AMOUNT"))?;
    let token_id: TokenId = id.parse().wrap_err("token id must be 64 hex characters")?;
    let amount: u64 = amount.parse().wrap_err("token amount must be an integer")?;
    if amount == 0 {
        bail!("token amount must be positive");
    }
    Ok(Token::new(token_id, amount))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> eyre::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).wrap_err("serialize output")?
    );
    Ok(())
}

/// Attach an actionable hint to wallet errors where one exists.
fn with_hint(err: WalletError) -> eyre::Report {
    let hint = match err.kind() {
        ErrorKind::Network => {
            Some("hint: verify --explorer-url, network access, and that the explorer is synced")
        }
        ErrorKind::InsufficientFunds | ErrorKind::NoInputsAvailable => {
            Some("hint: run `sync` to refresh balances, or wait for pending transactions")
        }
        ErrorKind::InsufficientLiquidity => {
            Some("hint: no liquidity box can cover this fee; pay the fee in the native coin")
        }
        ErrorKind::KeyUnavailable => {
            Some("hint: this wallet was loaded from an extended public key; pass --mnemonic to sign")
        }
        ErrorKind::AddressNotOwned => Some("hint: run `sync` so the address is known locally"),
        _ => None,
    };
    let kind = err.kind();
    let report = eyre::Report::new(err).wrap_err(format!("wallet error ({kind:?})"));
    match hint {
        Some(hint) => report.wrap_err(hint),
        None => report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_specs() {
        let id = "ab".repeat(32);
        let token = parse_token(&format!("{id}:25")).expect("parse");
        assert_eq!(token.amount, 25);
        assert_eq!(token.token_id.to_string(), id);

        assert!(parse_token("abcd").is_err());
        assert!(parse_token(&format!("{id}:0")).is_err());
        assert!(parse_token(&format!("{id}:x")).is_err());
    }

    #[test]
    fn hints_follow_error_kind() {
        let report = with_hint(WalletError::KeyUnavailable);
        assert!(report.to_string().contains("--mnemonic"));
        let report = with_hint(WalletError::Store("disk".into()));
        assert!(report.to_string().contains("wallet error"));
    }
}
