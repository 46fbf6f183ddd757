use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bdk_wallet::bitcoin::bip32::Xpub;
use clap::{Parser, Subcommand, ValueEnum};

use ambient_core::addressing::{AccountPath, Chain};
use ambient_core::bitcoin_provider::Bip84Provider;
use ambient_core::config::{self, Config, Network};
use ambient_core::crypto::Account;
use ambient_core::discovery::{next_address, AddressDiscovery, RestoredAccount};
use ambient_core::ledger::HttpLedgerApi;
use ambient_core::logging::init_logging;
use ambient_core::sync::BatchedSynchronizer;

/// CLI arguments
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Network to use; overrides the config file
    #[arg(short, long, value_enum)]
    network: Option<Net>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log to stderr instead of the per-network log file
    #[arg(long)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan both chains of an account and list its used address range
    Discover(AccountArgs),
    /// Discover, then report UTXO count and balance
    Balance(AccountArgs),
    /// Discover, then list the account's transaction history
    History(AccountArgs),
}

#[derive(clap::Args)]
struct AccountArgs {
    /// Account-level extended public key (m/84'/coin'/account')
    #[arg(long)]
    xpub: String,

    /// Account index
    #[arg(long, default_value_t = 0)]
    account: u32,
}

#[derive(ValueEnum, Clone, Copy)]
enum Net {
    Regtest,
    Signet,
    Mainnet,
}

impl From<Net> for Network {
    fn from(net: Net) -> Self {
        match net {
            Net::Regtest => Network::Regtest,
            Net::Signet => Network::Signet,
            Net::Mainnet => Network::Mainnet,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(net) = args.network {
        config.network = net.into();
    }
    config.validate()?;

    if args.log_stderr {
        init_logging(None)?;
    } else {
        let log_path = config::data_dir(config.network).join("logs").join("ambient-core.log");
        init_logging(Some(log_path.as_path()))?;
    }

    let api = HttpLedgerApi::new(config.backend_url.clone(), config.request_timeout_secs)
        .context("Failed to create ledger client")?;
    let sync = BatchedSynchronizer::new(Arc::new(api), config.sync_config())?;
    let discovery = AddressDiscovery::new(&sync, config.discovery_config())?;

    let account_args = match &args.command {
        Command::Discover(a) | Command::Balance(a) | Command::History(a) => a,
    };
    let account = open_account(&config, account_args)?;

    tracing::info!("🚀 Restoring account {} on {}", account_args.account, config.network);
    let restored = discovery.restore_account(&account).await?;

    match &args.command {
        Command::Discover(_) => print_discovery(&account, &restored)?,
        Command::Balance(_) => {
            let addresses = restored.addresses();
            let (utxos, balance) = futures::try_join!(
                sync.utxos_for_addresses(&addresses),
                sync.utxo_sum_for_addresses(&addresses),
            )?;
            println!("Addresses: {}", addresses.len());
            println!("UTXOs:     {}", utxos.len());
            println!("Balance:   {} sats", balance.unwrap_or(0));
        }
        Command::History(_) => {
            let history = sync.history_for_addresses(&restored.addresses(), None).await?;
            println!("{} transactions", history.len());
            for tx in history {
                let block = tx
                    .block_num
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "mempool".to_string());
                println!("  {}  {:?}  block {}", tx.hash, tx.tx_state, block);
            }
        }
    }

    Ok(())
}

fn open_account(config: &Config, args: &AccountArgs) -> Result<Account<Bip84Provider>> {
    let provider = Arc::new(Bip84Provider::new(config.network.to_bdk_network()));
    let xpub = Xpub::from_str(&args.xpub).context("Invalid account xpub")?;
    let path = AccountPath::bip84(provider.coin_type(), args.account)?;
    Ok(Account::new(provider, xpub, path))
}

fn print_discovery(account: &Account<Bip84Provider>, restored: &RestoredAccount) -> Result<()> {
    if restored.is_empty() {
        let fresh = next_address(account, Chain::External, &restored.external)?;
        println!("No used addresses. First receive address: {}", fresh.address);
        return Ok(());
    }

    for (label, records) in [("External", &restored.external), ("Internal", &restored.internal)] {
        println!("{} chain ({} addresses):", label, records.len());
        for record in records {
            let mark = if record.is_used { "used" } else { "    " };
            println!("  {:>4}  {}  {}", record.index(), mark, record.address());
        }
    }

    let fresh = next_address(account, Chain::External, &restored.external)?;
    println!("Next receive address: {}", fresh.address);
    Ok(())
}
