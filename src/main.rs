//! RegionDB - Multi-Region Record Service
//!
//! Runs one node of the record service. The node's role comes from the
//! region environment; the data source and bind address come from flags.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use regiondb::api::HttpServer;
use regiondb::config::{ApiConfig, DatabaseConfig, LoggingConfig, NodeConfig, RegionConfig};
use regiondb::store::{read_only_dsn, SqliteStore, StoreMode};
use regiondb::topology::{NodeRole, Topology, REPLAY_HEADER};

/// RegionDB - Multi-Region Record Service
#[derive(Parser)]
#[command(name = "regiondb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data source name of the SQLite database
    #[arg(long, global = true, default_value = "")]
    dsn: String,

    /// HTTP bind address
    #[arg(long, global = true, default_value = ":8080")]
    addr: String,

    /// Milliseconds a statement waits on a locked database
    #[arg(long, global = true, default_value_t = 5000)]
    busy_timeout_ms: u64,

    /// Maximum number of concurrent read connections
    #[arg(long, global = true, default_value_t = 8)]
    max_readers: u32,

    /// Milliseconds a request waits to obtain a database connection
    #[arg(long, global = true, default_value_t = 5000)]
    connect_timeout_ms: u64,

    /// Upper bound on a single request, in seconds
    #[arg(long, global = true, default_value_t = 30)]
    request_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Log format (pretty, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the record API (default)
    Serve,

    /// Show the resolved configuration and node role
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Assemble node configuration from flags and the region environment
    fn node_config(&self) -> regiondb::Result<NodeConfig> {
        let mut database = DatabaseConfig::new(self.dsn.clone());
        database.busy_timeout_ms = self.busy_timeout_ms;
        database.max_readers = self.max_readers;
        database.connect_timeout_ms = self.connect_timeout_ms;
        database.validate()?;

        let config = NodeConfig {
            database,
            region: RegionConfig::from_env()?,
            api: ApiConfig {
                bind_address: self.addr.clone(),
                request_timeout_secs: self.request_timeout_secs,
            },
            logging: LoggingConfig {
                level: self.log_level.clone(),
                format: self.log_format.clone(),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command.as_ref().unwrap_or(&Commands::Serve) {
        Commands::Serve => run_serve(&cli).await,
        Commands::Info { json } => run_info(&cli, *json),
    };

    if let Err(e) = result {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let fmt_layer = match logging.format.as_str() {
        "json" => tracing_subscriber::fmt::layer().json().boxed(),
        _ => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Run the node
async fn run_serve(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.node_config()?;
    init_logging(&config.logging);

    let topology = Topology::new(config.region.clone());
    let role = topology.role();
    tracing::info!(
        "Starting {} node {} in region {} (primary region {})",
        role,
        topology.app_name(),
        topology.current_region(),
        topology.primary_region()
    );

    let store = SqliteStore::open_for_role(&config.database, role)
        .with_context(|| format!("open database {}", config.database.dsn))?;
    tracing::info!("Record store opened {} at {}", store.mode(), store.dsn());
    if role == NodeRole::Replica {
        // Read connections open lazily; a missing database shows up per request.
        tracing::info!("Writes will be replayed in region {}", topology.primary_region());
    }

    let store = Arc::new(store);
    let server = HttpServer::new(config.api.clone(), topology, store.clone());
    server
        .start(shutdown_signal())
        .await
        .with_context(|| format!("serve on {}", config.api.bind_address))?;
    drop(server);

    match Arc::try_unwrap(store) {
        Ok(store) => store.close().context("close database")?,
        Err(_) => tracing::warn!("Record store still referenced at shutdown; leaving it to drop"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolved node information
#[derive(Serialize)]
struct NodeInfo<'a> {
    config: &'a NodeConfig,
    role: NodeRole,
    store_mode: StoreMode,
    effective_dsn: String,
    replay_header: Option<String>,
}

/// Show node information
fn run_info(cli: &Cli, json: bool) -> anyhow::Result<()> {
    let config = cli.node_config()?;
    let topology = Topology::new(config.region.clone());
    let role = topology.role();
    let mode = StoreMode::from(role);
    let effective_dsn = match mode {
        StoreMode::ReadWrite => config.database.dsn.clone(),
        StoreMode::ReadOnly => read_only_dsn(&config.database.dsn),
    };

    if json {
        let info = NodeInfo {
            config: &config,
            role,
            store_mode: mode,
            effective_dsn,
            replay_header: topology.route_write().replay_header_value(),
        };
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("RegionDB Node Information");
    println!("=========================");
    println!();
    println!("App:            {}", topology.app_name());
    println!("Region:         {}", topology.current_region());
    println!("Primary Region: {}", topology.primary_region());
    println!("Role:           {}", role);
    println!();
    println!("Database:");
    println!("  DSN:          {}", effective_dsn);
    println!("  Mode:         {}", mode);
    println!("  Busy Timeout: {} ms", config.database.busy_timeout_ms);
    println!("  Readers:      {}", config.database.max_readers);
    println!();
    println!("API:");
    println!("  Listen:       {}", config.api.listen_address());
    println!("  Timeout:      {} s", config.api.request_timeout_secs);
    if let Some(header) = topology.route_write().replay_header_value() {
        println!("  Writes:       {}: {}", REPLAY_HEADER, header);
    } else {
        println!("  Writes:       applied locally");
    }

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Received shutdown signal");
}
