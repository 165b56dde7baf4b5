//! ShardKeeper - Year-Partitioned Record Store
//!
//! Serves the record API over a central MariaDB node and two year
//! partitions, and runs WAL recovery.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardkeeper::api::{AppState, HttpServer, RecoveryGate};
use shardkeeper::config::ShardKeeperConfig;
use shardkeeper::coordinator::{RecordReader, WriteCoordinator};
use shardkeeper::error::Result;
use shardkeeper::node::{NodeRegistry, NodeRole};
use shardkeeper::recovery::RecoveryManager;
use shardkeeper::shard::ShardRouter;

/// ShardKeeper - Year-Partitioned Record Store
#[derive(Parser)]
#[command(name = "shardkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shardkeeper.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the config file's level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Start,

    /// Run one recovery pass and print the report
    Recover,

    /// Create the records and WAL tables on every reachable node
    Migrate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "shardkeeper.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| ShardKeeperConfig::from_file(&cli.config).ok().map(|c| c.logging.level))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Start => run_start(&cli.config).await,
        Commands::Recover => run_recover(&cli.config).await,
        Commands::Migrate => run_migrate(&cli.config).await,
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(&cli.config),
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

fn load_config(config_path: &Path) -> Result<ShardKeeperConfig> {
    match ShardKeeperConfig::from_file(config_path) {
        Ok(c) => Ok(c),
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            Err(e)
        }
    }
}

/// Serve the API until Ctrl+C
async fn run_start(config_path: &Path) -> Result<()> {
    tracing::info!("Starting ShardKeeper...");

    let config = load_config(config_path)?;
    let policy = config.retry_policy();
    let registry = Arc::new(NodeRegistry::open(&config)?);
    let recovery = Arc::new(RecoveryManager::new(Arc::clone(&registry), policy.clone()));

    if config.recovery.on_startup {
        tracing::info!("Running startup recovery");
        recovery.recover().await;
    }

    // Periodic recovery
    let periodic = config.recovery_interval().map(|every| {
        let recovery = Arc::clone(&recovery);
        tracing::info!("Periodic recovery every {:?}", every);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                recovery.recover().await;
            }
        })
    });

    let state = Arc::new(AppState {
        writer: WriteCoordinator::new(
            Arc::clone(&registry),
            ShardRouter::new(config.shard.cutoff_year),
            policy.clone(),
        ),
        reader: RecordReader::new(Arc::clone(&registry), policy),
        recovery,
        gate: RecoveryGate::new(config.recovery.gate_requests, config.recovery_gate_interval()),
    });

    let server = HttpServer::new(config.api.clone(), state);
    let served = server.start(shutdown_signal()).await;

    if let Some(task) = periodic {
        task.abort();
    }
    registry.close_all().await;

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, shutting down...");
}

/// One recovery pass
async fn run_recover(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = Arc::new(NodeRegistry::open(&config)?);
    let recovery = RecoveryManager::new(Arc::clone(&registry), config.retry_policy());

    let report = recovery.recover().await;
    registry.close_all().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        eprintln!("Some WAL entries remain active; run recover again once every node is reachable");
    }
    Ok(())
}

/// Create tables on every node
async fn run_migrate(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = NodeRegistry::open(&config)?;

    let unreachable = registry.ensure_schema(&config.retry_policy()).await;
    registry.close_all().await;

    let unreachable = unreachable?;
    for role in NodeRole::ALL {
        if unreachable.contains(&role) {
            println!("✗ {} node unreachable", role);
        } else {
            println!("✓ {} node ready", role);
        }
    }
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let config_content = r#"# ShardKeeper Configuration
# Generated configuration file

[shard]
# Records with year < cutoff_year live on before_cutoff, the rest on after_cutoff
cutoff_year = 1980

[nodes.central]
host = "localhost"
port = 3306
user = "shardkeeper"
password = "changeme"
database = "records_central"
pool_size = 10

[nodes.before_cutoff]
host = "localhost"
port = 3307
user = "shardkeeper"
password = "changeme"
database = "records_before_cutoff"
pool_size = 10

[nodes.after_cutoff]
host = "localhost"
port = 3308
user = "shardkeeper"
password = "changeme"
database = "records_after_cutoff"
pool_size = 10

[acquire]
timeout_ms = 2000
max_attempts = 3
retry_interval_ms = 200
backoff = 1.0

[recovery]
on_startup = true
# 0 disables periodic recovery
interval_secs = 0
gate_requests = true
min_interval_ms = 1000

[api]
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
"#;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point at your three databases.");
    println!("Then create the tables with: shardkeeper --config {} migrate", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> Result<()> {
    match ShardKeeperConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Cutoff Year: {}", config.shard.cutoff_year);
            for role in NodeRole::ALL {
                let db = config.nodes.get(role);
                println!("  {:<14} {}@{} (pool {})", role, db.user, db.endpoint(), db.pool_size);
            }
            let policy = config.retry_policy();
            println!(
                "  Acquire: {:?} x {} attempts, retry every {:?} (backoff {})",
                policy.timeout, policy.max_attempts, policy.interval, policy.backoff
            );
            println!(
                "  Recovery: startup={}, interval={:?}, gated={}",
                config.recovery.on_startup,
                config.recovery_interval(),
                config.recovery.gate_requests
            );
            println!("  API: {}", config.api.bind_address);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
