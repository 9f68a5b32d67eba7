//! RegionCtl - Command line client for RegionDB nodes
//!
//! Usage:
//!   regionctl list            - Print every record on the node
//!   regionctl add <value>     - Append a record (reads stdin without a value)

use std::io::Read;

use clap::{Parser, Subcommand};

use regiondb::topology::REPLAY_HEADER;

/// RegionDB Client
#[derive(Parser)]
#[command(name = "regionctl")]
#[command(about = "Read and write records on a RegionDB node", long_about = None)]
struct Cli {
    /// Node endpoint to connect to
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all records
    List,
    /// Add a record
    Add {
        /// Record value (read from stdin when omitted)
        value: Option<String>,
    },
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli.endpoint.trim_end_matches('/').to_string();

    let result = match &cli.command {
        Commands::List => list_records(&endpoint).await,
        Commands::Add { value } => add_record(&endpoint, value.clone()).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

async fn list_records(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/", endpoint);
    let client = reqwest::Client::new();

    let response = client.get(&url).send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(format!("API error: {}: {}", status, body.trim_end()).into());
    }

    print!("{}", body);
    Ok(())
}

async fn add_record(endpoint: &str, value: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let value = match value {
        Some(v) => v.into_bytes(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };

    let url = format!("{}/", endpoint);
    let client = reqwest::Client::new();

    let response = client.post(&url).body(value).send().await?;
    let status = response.status();
    let replay = response
        .headers()
        .get(REPLAY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await?;

    // Only a replica answers with the replay header; through the edge proxy
    // the client sees the primary's response instead.
    if let Some(target) = replay {
        return Err(format!(
            "node is a replica and asked for the write to be replayed ({}); \
             connect through the routing proxy or directly to the primary",
            target
        )
        .into());
    }

    if !status.is_success() {
        return Err(format!("API error: {}: {}", status, body.trim_end()).into());
    }

    print!("{}", body);
    Ok(())
}
