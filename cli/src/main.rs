//! Veil command line
//!
//! ```text
//! veil-cli probe [--rpc-url URL]   open an encryption session against a node
//! veil-cli demo                    run a full proposal on an in-process dev chain
//! veil-cli config [--path]         print a sample configuration
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use veil_config::{VeilConfig, global_config};
use veil_core::{
    Backend, CapabilityResolver, Clock, DevChain, DevChainConfig, HttpConnector, ManualClock,
    ProviderSource, RelayerSettings, SessionError, SessionManager, SystemClock, VotingClient,
};

#[derive(Parser, Debug)]
#[command(name = "veil-cli", about = "Confidential voting client")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve which encryption backend a node supports
    Probe {
        /// JSON-RPC endpoint (defaults to network.rpc_url)
        #[arg(long, env = "VEIL_RPC_URL")]
        rpc_url: Option<String>,
    },

    /// Create, vote on, reveal and decrypt a proposal on a dev chain
    Demo {
        #[arg(long, default_value = "Demo proposal")]
        title: String,

        /// Comma-separated option labels
        #[arg(long, value_delimiter = ',', default_value = "A,B,C")]
        options: Vec<String>,

        /// Comma-separated choices, one per voter
        #[arg(long, value_delimiter = ',', default_value = "0,1,0")]
        votes: Vec<usize>,

        /// Voting window in seconds (defaults to proposals.default_duration_secs)
        #[arg(long)]
        duration: Option<u64>,

        /// Defaults to proposals.default_min_voters
        #[arg(long)]
        min_voters: Option<u64>,
    },

    /// Print a sample veil.toml
    Config {
        /// Print the default config path instead
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let config = VeilConfig::load().context("Failed to load configuration")?;
    if VeilConfig::set_global(config).is_err() {
        warn!("Configuration was already initialized");
    }

    match args.command {
        Command::Probe { rpc_url } => probe(rpc_url).await,
        Command::Demo {
            title,
            options,
            votes,
            duration,
            min_voters,
        } => demo(title, options, votes, duration, min_voters).await,
        Command::Config { path } => {
            if path {
                let path = VeilConfig::default_config_path()
                    .context("Could not determine home directory")?;
                println!("{}", path.display());
            } else {
                print!("{}", VeilConfig::generate_sample()?);
            }
            Ok(())
        }
    }
}

async fn probe(rpc_url: Option<String>) -> Result<()> {
    let config = global_config();
    let url = rpc_url.unwrap_or_else(|| config.network.rpc_url.clone());
    let connector = Arc::new(HttpConnector::new(Duration::from_secs(
        config.network.probe_timeout_secs,
    )));
    let manager = SessionManager::new(CapabilityResolver::from_config(config, connector))
        .with_relayer(RelayerSettings::from_config(&config.relayer));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting probe");
            ctrl_c.cancel();
        }
    });

    info!("Probing {}", url);
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            manager.abort().await;
            return Ok(());
        }
        outcome = manager.initialize(ProviderSource::Url(url.clone())) => outcome,
    };

    let chain_id = match outcome {
        Ok(session) => {
            match session.backend() {
                Backend::Mock(mock) => {
                    let metadata = mock.metadata();
                    println!("backend:          mock");
                    println!("acl:              {}", metadata.acl_address);
                    println!("input verifier:   {}", metadata.input_verifier_address);
                    println!("kms verifier:     {}", metadata.kms_verifier_address);
                }
                Backend::Relayer(relayer) => {
                    println!("backend:          relayer");
                    println!("acl:              {}", relayer.keys().acl_address);
                    println!("kms verifier:     {}", relayer.keys().kms_verifier_address);
                }
            }
            println!("chain id:         {}", session.chain_id());
            println!("session:          ready");
            session.chain_id()
        }
        Err(SessionError::RelayerUnavailable { chain_id }) => {
            println!("backend:          production");
            println!("chain id:         {}", chain_id);
            println!("session:          no relayer configured for this chain");
            chain_id
        }
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to open a session on {}", url));
        }
    };
    if let Some(contract) = config.contract_for(chain_id) {
        println!("contract:         {}", contract);
    }
    Ok(())
}

async fn demo(
    title: String,
    options: Vec<String>,
    votes: Vec<usize>,
    duration: Option<u64>,
    min_voters: Option<u64>,
) -> Result<()> {
    if votes.is_empty() {
        bail!("at least one vote is required");
    }
    let config = global_config();
    let duration = duration.unwrap_or(config.proposals.default_duration_secs);
    let min_voters =
        min_voters.unwrap_or_else(|| u64::from(config.proposals.default_min_voters));

    let clock = ManualClock::new(SystemClock.now());
    let chain = DevChain::with_clock(
        DevChainConfig {
            accounts: votes.len() + 1,
            ..DevChainConfig::default()
        },
        Arc::new(clock.clone()),
    );
    let session = chain
        .open_session()
        .await
        .context("Failed to open encryption session")?;
    info!(
        "Dev chain {} ready, ledger at {}",
        chain.chain_id(),
        chain.ledger_address()
    );

    let client = |index: usize| {
        VotingClient::new(
            chain.clone(),
            chain.wallets()[index].address(),
            Arc::new(clock.clone()),
        )
    };

    let creator = client(0);
    let id = creator
        .create_proposal(title, "", options, duration, min_voters)
        .await
        .context("Failed to create proposal")?;
    println!("Proposal created: {}", id);

    for (offset, choice) in votes.iter().enumerate() {
        let voter = client(offset + 1);
        voter
            .vote(&session, id, *choice)
            .await
            .with_context(|| format!("Voter {} failed to vote", voter.account()))?;
        println!("{} voted", voter.account());
    }

    clock.advance(duration);
    creator
        .reveal_result(id)
        .await
        .context("Failed to reveal results")?;

    let proposal = creator.proposal(id).await?;
    let results = creator
        .decrypt_results(&session, &chain.wallets()[0], id)
        .await
        .context("Failed to decrypt results")?;

    println!();
    println!("Proposal: {}", proposal.title);
    println!("Total Voters: {}", proposal.total_voters);
    println!("Min Voters: {}", proposal.min_voters);
    println!();
    println!("Results:");
    for result in &results {
        println!("  {}. {}", result.index + 1, result.label);
        println!("     Votes: {} ({:.2}%)", result.votes, result.percentage);
    }
    Ok(())
}
