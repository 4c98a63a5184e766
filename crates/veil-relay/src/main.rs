use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::RngCore;
use tokio::signal;
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use veil_proto::UserId;
use veil_relay::reaper::{spawn_asset_reaper, spawn_mailbox_reaper};
use veil_relay::{HmacTokenAuthenticator, RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Veil encrypted chat relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides `bind_addr`
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Print a bearer token for a user
    IssueToken {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print a fresh hex auth secret
    GenSecret,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, bind } => run_command(config, bind).await,
        Commands::IssueToken { user_id, config } => issue_token_command(&user_id, config),
        Commands::GenSecret => {
            let mut secret = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut secret);
            println!("{}", hex::encode(secret));
            Ok(())
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_command(config_path: Option<PathBuf>, bind: Option<SocketAddr>) -> Result<()> {
    let mut config = RelayConfig::load(config_path.as_deref())?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    init_tracing(&config.log_level);

    let server = veil_relay::build(&config)?;
    let listener = RelayServer::bind(config.bind_addr).await?;
    let mailbox_reaper = spawn_mailbox_reaper(
        server.relay().clone(),
        Duration::from_secs(config.mailbox_sweep_secs.max(1)),
    );
    let asset_reaper = spawn_asset_reaper(
        server.relay().clone(),
        Duration::from_secs(config.asset_sweep_secs.max(1)),
    );

    let result = tokio::select! {
        res = server.clone().serve(listener) => res,
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };
    mailbox_reaper.abort();
    asset_reaper.abort();
    result
}

fn issue_token_command(user_id: &str, config_path: Option<PathBuf>) -> Result<()> {
    let config = RelayConfig::load(config_path.as_deref())?;
    let auth = HmacTokenAuthenticator::new(config.auth_secret_bytes()?);
    let token = auth.issue(&UserId::parse(user_id)?)?;
    println!("{token}");
    Ok(())
}
