// Blockstash - Cached Chain Data Service
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Blockstash
//!
//! Serves blocks, transactions and receipts from a tiered cache in front of an
//! Ethereum JSON-RPC node.

use blockstash_common::init_logging;
use blockstash_server::{config::ServiceConfig, service::ServiceBuilder};
use clap::{Parser, Subcommand};
use eyre::Result;
use std::{net::SocketAddr, path::PathBuf};
use tracing::info;

/// Blockstash chain data service
#[derive(Parser, Debug)]
#[command(name = "blockstash")]
#[command(about = "Tiered block, transaction and receipt cache")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (repeat for more: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server and the tag pollers
    Server(ServerArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

/// Settings shared by every command; flags override the config file
#[derive(clap::Args, Debug)]
struct ServerArgs {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    // ========== General Configuration ==========
    /// Address to bind to
    /// Example: --host 0.0.0.0
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Upstream JSON-RPC URL
    /// Example: --rpc-url https://eth.llamarpc.com
    #[arg(long)]
    rpc_url: Option<String>,

    // ========== Storage Configuration ==========
    /// SQLite database file (default: ~/.blockstash/chain.sqlite3)
    #[arg(long)]
    database: Option<PathBuf>,

    // ========== Cache Configuration ==========
    /// TTL of tag entries in seconds
    #[arg(long)]
    cache_ttl: Option<u64>,

    // ========== Admission Configuration ==========
    /// Requests allowed per client per window
    #[arg(long)]
    rate: Option<u32>,

    /// Admission window in seconds
    #[arg(long)]
    window: Option<u64>,
}

/// Config mode arguments
#[derive(Parser, Debug)]
struct ConfigArgs {
    #[command(flatten)]
    server: ServerArgs,
}

impl ServerArgs {
    /// Loads the config file (if any) and applies flag overrides
    fn load(self) -> Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::from_file(path)?,
            None => ServiceConfig::default(),
        };

        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(rpc_url) = self.rpc_url {
            config.upstream.rpc_url = rpc_url;
        }
        if let Some(database) = self.database {
            config.storage.database_path = Some(database);
        }
        if let Some(ttl) = self.cache_ttl {
            config.cache.ttl_secs = ttl;
        }
        if let Some(rate) = self.rate {
            config.admission.rate = rate;
        }
        if let Some(window) = self.window {
            config.admission.window_secs = window;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set RUST_LOG based on verbosity
    if std::env::var("RUST_LOG").is_err() {
        let level = match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Config(config_args) => {
            print!("{}", config_args.server.load()?.to_toml()?);
            Ok(())
        }
    }
}

/// Run the HTTP server until interrupted
async fn run_server(args: ServerArgs) -> Result<()> {
    init_logging("blockstash", true)?;

    let config = args.load()?;
    let addr: SocketAddr = config.server.socket_addr()?;
    let service = ServiceBuilder::from_config(config).build()?;

    info!("Starting Blockstash on {}", addr);

    let mut server = tokio::spawn(service.clone().serve(addr));
    tokio::select! {
        result = &mut server => {
            return result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    service.shutdown().await;
    // Let in-flight requests drain before the runtime goes away
    server.await?
}
