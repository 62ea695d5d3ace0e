//! Meridian Metadata Node
//!
//! Runs one member of a metadata cluster: recovers local state from the
//! journal and checkpoint images, follows leadership announcements and
//! serves the node API over HTTP.

mod http;
mod remote;

use anyhow::{Context, Result};
use clap::Parser;
use http::AppState;
use meridian_common::{Config, NodeEndpoint};
use meridian_meta_store::metric_definitions::describe_metrics;
use meridian_meta_store::{FileJournal, LocalElection, StateCoordinator};
use metrics_exporter_prometheus::PrometheusBuilder;
use remote::HttpConnector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "meridian-meta")]
#[command(about = "Meridian Metadata Node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/meridian/meta.toml")]
    config: String,

    /// Node ID, unique in the cluster
    #[arg(long, env = "MERIDIAN_NODE_ID")]
    node_id: Option<u64>,

    /// Listen address for the node API
    #[arg(short, long)]
    listen: Option<String>,

    /// Address peers use to reach this node
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Data directory for journal and images
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run as an observer (replicates, never leads)
    #[arg(long)]
    observer: bool,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Layer file, environment and command line settings
fn load_config(args: &Args) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(
            config::Environment::with_prefix("MERIDIAN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read configuration from {}", args.config))?;
    let mut config: Config = settings
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(node_id) = args.node_id {
        config.node.node_id = node_id;
    }
    if let Some(listen) = &args.listen {
        config.node.listen.clone_from(listen);
    }
    if let Some(advertise) = &args.advertise_addr {
        config.node.advertise_addr = Some(advertise.clone());
    }
    if let Some(data_dir) = &args.data_dir {
        config.node.data_dir.clone_from(data_dir);
    }
    if args.observer {
        config.node.observer = true;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if args.log_json {
        config.logging.json = true;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Build the in-process election from the configured initial leadership
fn initial_election(config: &Config) -> LocalElection {
    match &config.cluster.leader {
        Some(leader) => LocalElection::with_leader(leader.endpoint(), config.cluster.epoch),
        None => LocalElection::new(config.cluster.epoch),
    }
}

fn peers(config: &Config) -> Vec<NodeEndpoint> {
    config
        .cluster
        .members
        .iter()
        .filter(|m| m.node_id != config.node.node_id)
        .map(meridian_common::config::MemberConfig::endpoint)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    init_tracing(&config);
    info!("Starting Meridian Metadata Node {}", config.node.node_id);

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            describe_metrics();
            Some(handle)
        }
        Err(e) => {
            warn!("Metrics recorder unavailable: {}", e);
            None
        }
    };

    let journal_dir = config.node.journal_dir();
    info!("Opening journal at {}", journal_dir.display());
    let journal = Arc::new(
        FileJournal::open(&journal_dir, config.journal.clone())
            .with_context(|| format!("failed to open journal at {}", journal_dir.display()))?,
    );

    let election = Arc::new(initial_election(&config));
    let connector = HttpConnector::new(Duration::from_secs(2))?;
    let peers = Arc::new(peers(&config));
    let listen = config.node.listen.clone();

    let coordinator = StateCoordinator::open(
        config,
        journal,
        election.clone(),
        Arc::new(connector.clone()),
    )
    .await
    .context("failed to recover metadata state")?;
    coordinator.spawn_election_driver();

    let app = http::router(AppState {
        coordinator: coordinator.clone(),
        election,
        connector,
        peers,
        prometheus,
    });

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!("Node API listening on {}", listen);

    let watcher = coordinator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
                reason = watcher.wait_halted() => error!("Node halted: {}", reason),
            }
        })
        .await?;

    coordinator.shutdown().await?;
    if let Some(reason) = coordinator.halted() {
        anyhow::bail!("metadata node halted: {reason}");
    }

    info!("Metadata Node shut down gracefully");
    Ok(())
}
