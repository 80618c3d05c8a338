use clap::{Parser, Subcommand};
use escrow_engine::application::engine::EscrowEngine;
use escrow_engine::application::scheduler::{Job, Scheduler};
use escrow_engine::config::{EngineSettings, ScheduleSettings};
use escrow_engine::domain::ports::{LedgerStoreRef, SystemClock};
use escrow_engine::infrastructure::chain::{ChainSettings, JsonRpcEscrowContract};
use escrow_engine::infrastructure::in_memory::InMemoryLedgerStore;
use escrow_engine::infrastructure::rail::{HttpRailClient, RailCredentials};
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about = "Payment escrow automation engine", long_about = None)]
struct Cli {
    /// Custodial rail API base URL
    #[arg(long, env = "ESCROW_RAIL_URL")]
    rail_url: String,

    #[arg(long, env = "ESCROW_RAIL_API_KEY", hide_env_values = true)]
    rail_api_key: String,

    #[arg(long, env = "ESCROW_RAIL_API_SECRET", hide_env_values = true)]
    rail_api_secret: String,

    /// JSON-RPC endpoint of a node that signs for the bridge wallet
    #[arg(long, env = "ESCROW_RPC_URL")]
    rpc_url: String,

    #[arg(long, env = "ESCROW_CONTRACT_ADDRESS")]
    escrow_contract: String,

    #[arg(long, env = "ESCROW_TOKEN_ADDRESS")]
    token_address: String,

    /// Custodial wallet acting as escrow payer and payee
    #[arg(long, env = "ESCROW_BRIDGE_WALLET")]
    bridge_wallet: String,

    /// Rail deposit address for tokens returned from the bridge wallet
    #[arg(long, env = "ESCROW_RAIL_WALLET")]
    rail_wallet: String,

    #[arg(long, env = "ESCROW_TOKEN_CURRENCY", default_value = "mxnb")]
    token_currency: String,

    #[arg(long, env = "ESCROW_FIAT_CURRENCY", default_value = "mxn")]
    fiat_currency: String,

    #[arg(long, env = "ESCROW_NETWORK", default_value = "arbitrum")]
    network: String,

    #[arg(long, env = "ESCROW_BATCH_SIZE", default_value_t = 50)]
    batch_size: usize,

    #[arg(long, env = "ESCROW_PARALLELISM", default_value_t = 4)]
    parallelism: usize,

    /// Per-request timeout for rail and RPC calls, in seconds
    #[arg(long, env = "ESCROW_CALL_TIMEOUT_SECS", default_value_t = 30)]
    call_timeout_secs: u64,

    #[arg(long, env = "ESCROW_CONFIRMATION_TIMEOUT_SECS", default_value_t = 180)]
    confirmation_timeout_secs: u64,

    /// Age after which an unresolved step is verified externally, in seconds
    #[arg(long, env = "ESCROW_CLAIM_TTL_SECS", default_value_t = 600)]
    claim_ttl_secs: u64,

    #[arg(long, env = "ESCROW_DEPOSIT_INTERVAL_SECS", default_value_t = 30)]
    deposit_interval_secs: u64,

    #[arg(long, env = "ESCROW_FUNDING_INTERVAL_SECS", default_value_t = 60)]
    funding_interval_secs: u64,

    #[arg(long, env = "ESCROW_RELEASE_INTERVAL_SECS", default_value_t = 60)]
    release_interval_secs: u64,

    #[arg(long, env = "ESCROW_PAYOUT_INTERVAL_SECS", default_value_t = 60)]
    payout_interval_secs: u64,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "ESCROW_DB_PATH")]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every job on its interval until interrupted
    Run,
    /// Run a single job once and print its report as JSON
    Once {
        #[arg(value_enum)]
        job: Job,
    },
}

impl Cli {
    fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            bridge_wallet: self.bridge_wallet.clone(),
            rail_wallet: self.rail_wallet.clone(),
            token_currency: self.token_currency.to_lowercase(),
            fiat_currency: self.fiat_currency.to_lowercase(),
            network: self.network.clone(),
            batch_size: self.batch_size,
            parallelism: self.parallelism,
            claim_ttl: Duration::from_secs(self.claim_ttl_secs),
        }
    }

    fn schedule(&self) -> ScheduleSettings {
        ScheduleSettings {
            deposit_interval: Duration::from_secs(self.deposit_interval_secs),
            funding_interval: Duration::from_secs(self.funding_interval_secs),
            release_interval: Duration::from_secs(self.release_interval_secs),
            payout_interval: Duration::from_secs(self.payout_interval_secs),
        }
    }

    fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            rpc_url: self.rpc_url.clone(),
            escrow_contract: self.escrow_contract.clone(),
            token: self.token_address.clone(),
            bridge_wallet: self.bridge_wallet.clone(),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
            poll_interval: Duration::from_secs(2),
        }
    }
}

fn open_store(db_path: Option<&PathBuf>) -> Result<LedgerStoreRef> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(db_path) = db_path {
        let store = escrow_engine::infrastructure::rocksdb::RocksDbLedgerStore::open(db_path)
            .into_diagnostic()?;
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if db_path.is_some() {
        tracing::warn!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }

    Ok(Arc::new(InMemoryLedgerStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = cli.engine_settings();
    settings.validate().into_diagnostic()?;
    let schedule = cli.schedule();
    schedule.validate().into_diagnostic()?;

    let store = open_store(cli.db_path.as_ref())?;
    let rail = HttpRailClient::new(
        &cli.rail_url,
        RailCredentials {
            api_key: cli.rail_api_key.clone(),
            api_secret: cli.rail_api_secret.clone(),
        },
        Duration::from_secs(cli.call_timeout_secs),
    )
    .into_diagnostic()?;
    let contract = JsonRpcEscrowContract::new(cli.chain_settings()).into_diagnostic()?;

    let engine = Arc::new(EscrowEngine::new(
        store,
        Arc::new(rail),
        Arc::new(contract),
        Arc::new(SystemClock),
        settings,
    ));
    let scheduler = Arc::new(Scheduler::new(engine, schedule));

    match cli.command {
        Command::Run => {
            scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "failed to listen for ctrl-c");
                    }
                })
                .await;
        }
        Command::Once { job } => {
            let report = scheduler.run_once(job).await.into_diagnostic()?;
            println!("{}", serde_json::to_string(&report).into_diagnostic()?);
        }
    }

    Ok(())
}
