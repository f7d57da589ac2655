use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// boxwallet: non-custodial wallet engine for box-based UTXO ledgers.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// BIP39 mnemonic of a standard wallet.
    #[arg(long, env = "BOXWALLET_MNEMONIC", hide_env_values = true, conflicts_with = "xpub")]
    pub mnemonic: Option<String>,

    /// Optional BIP39 passphrase.
    #[arg(long, env = "BOXWALLET_PASSPHRASE", hide_env_values = true, default_value = "")]
    pub passphrase: String,

    /// Account extended public key of a read-only wallet.
    #[arg(long, env = "BOXWALLET_XPUB")]
    pub xpub: Option<String>,

    /// Local wallet id the state is stored under.
    #[arg(long, default_value = "1", env = "BOXWALLET_WALLET_ID")]
    pub wallet_id: u32,

    /// Path of the JSON state file.
    #[arg(long, default_value = "boxwallet.json", env = "BOXWALLET_STORE")]
    pub store: PathBuf,

    /// mainnet or testnet.
    #[arg(long, default_value = "mainnet", env = "BOXWALLET_NETWORK")]
    pub network: String,

    /// Explorer API base URL.
    #[arg(long, env = "BOXWALLET_EXPLORER_URL")]
    pub explorer_url: Option<String>,

    /// Outbound explorer requests per second (0 disables limiting).
    #[arg(long, default_value = "10", env = "BOXWALLET_RPS")]
    pub requests_per_second: u32,

    /// Addresses queried per scan chunk.
    #[arg(long, default_value = "20", env = "BOXWALLET_CHUNK_SIZE")]
    pub chunk_size: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Derive addresses locally without touching the network.
    Addresses {
        #[arg(long, default_value = "5")]
        count: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
    },
    /// Scan addresses and refresh balances.
    Sync,
    /// Print stored per-token balances.
    Balance,
    /// List spendable boxes.
    Utxos {
        /// Include boxes from pending transactions.
        #[arg(long)]
        pending: bool,
    },
    /// Build a transaction; sign and broadcast with --broadcast.
    Send(SendArgs),
    /// Recent transactions, classified.
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Prove control of an address to an application.
    SignMessage {
        #[arg(long)]
        address: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        origin: String,
    },
    /// Check a proof produced by sign-message.
    VerifyMessage {
        /// Proof JSON.
        #[arg(long)]
        proof: String,
    },
}

#[derive(Args)]
pub struct SendArgs {
    /// Recipient address.
    #[arg(long)]
    pub to: String,

    /// Native amount in nanoERG.
    #[arg(long, default_value = "0")]
    pub amount: u64,

    /// Token to send as TOKEN_ID:AMOUNT (repeatable).
    #[arg(long = "token")]
    pub tokens: Vec<String>,

    /// Token to burn as TOKEN_ID:AMOUNT (repeatable).
    #[arg(long = "burn")]
    pub burn: Vec<String>,

    /// Miner fee in nanoERG, or in units of --fee-token.
    #[arg(long)]
    pub fee: Option<u64>,

    /// Pay the fee in this token through a liquidity box.
    #[arg(long, requires = "fee")]
    pub fee_token: Option<String>,

    /// Change address; defaults to the first wallet address.
    #[arg(long)]
    pub change_address: Option<String>,

    /// Only spend confirmed boxes.
    #[arg(long)]
    pub confirmed_only: bool,

    /// Sign locally and submit instead of printing the unsigned transaction.
    #[arg(long)]
    pub broadcast: bool,
}
