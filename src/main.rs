//! WolfLite - Lease-Coordinated Database Replication
//!
//! Runs one replication node: the transaction logs, the lease monitor, the
//! replication stream and the status API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolflite::api::HttpServer;
use wolflite::boundary::NoopInvalidator;
use wolflite::config::{LeaseMode, StaticConfig, WolfLiteConfig};
use wolflite::error::{Error, Result};
use wolflite::lease;
use wolflite::store::Store;

/// WolfLite - Lease-Coordinated Database Replication
#[derive(Parser)]
#[command(name = "wolflite")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolflite.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfLite node
    Start,

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolflite.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Query a running node's status
    Status {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:20203")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.clone().unwrap_or_else(|| {
        WolfLiteConfig::from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    });
    init_logging(&level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Status { address } => run_status(address).await,
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the WolfLite node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfLite node...");

    let config = match WolfLiteConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    let leaser = lease::from_config(&config)?;
    let store = Store::open(config.clone(), leaser, Arc::new(NoopInvalidator)).await?;
    store.start().await?;

    let shutdown = CancellationToken::new();
    let http = HttpServer::new(config.api.clone(), store.clone());
    let http_token = shutdown.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http.start(http_token).await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    tokio::select! {
        result = store.wait_ready() => {
            result?;
            tracing::info!("Node {} ready as {}", config.node.id, store.role());
            tokio::signal::ctrl_c().await?;
        }
        _ = tokio::signal::ctrl_c() => {}
    }
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    let _ = http_handle.await;
    store.close().await?;

    tracing::info!("WolfLite node stopped");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfLiteConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Stream Address: {}", config.node.bind_address);
            match config.lease_mode()? {
                LeaseMode::Consul(consul) => println!("  Lease: consul ({})", consul.url),
                LeaseMode::Static(fixed) => println!("  Lease: static (primary {})", fixed.hostname),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfLiteConfig::from_file(&config_path)?;

    println!("WolfLite Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Stream Address:   {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Candidate:        {}", config.node.candidate);
    println!();
    println!("Log Configuration:");
    println!("  Compression:    {}", config.log.compression);
    println!("  Fsync:          {}", config.log.fsync);
    println!("  Strict Verify:  {}", config.log.strict_verify);
    println!("  Segment Size:   {} MB / {} records", config.log.segment_size_mb, config.log.segment_max_records);
    println!();
    println!("Retention:");
    println!("  Window:         {:?}", config.retention.duration());
    println!("  Interval:       {:?}", config.retention.monitor_interval());
    println!();
    println!("HTTP API:         {} ({})", config.api.bind_address, if config.api.enabled { "enabled" } else { "disabled" });

    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!("{:?} already exists", output)));
    }

    let mut config = WolfLiteConfig::new(node_id.clone(), "/var/lib/wolflite");
    config.static_lease = Some(StaticConfig {
        primary: true,
        hostname: node_id,
        advertise_address: config.node.bind_address.clone(),
    });

    let content = toml::to_string_pretty(&config)
        .map_err(|e| Error::Config(format!("cannot render configuration: {}", e)))?;
    std::fs::write(&output, content)?;

    println!("✓ Wrote {:?}", output);
    Ok(())
}

/// Query a running node's status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);
    let status: serde_json::Value = reqwest::get(&url).await?.json().await?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
