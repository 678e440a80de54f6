// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! auctionet CLI
//!
//! # Usage
//!
//! ```bash
//! # Auctioning server with its resources and auctions
//! auctionet server --config node.toml --definitions auctions.json
//!
//! # Agent bidding for its resource requests
//! auctionet agent --config node.toml --definitions requests.json
//!
//! # Example configuration
//! auctionet gen-config -o node.toml
//! ```

use auctionet::{AuctionAgent, AuctionServer, Definitions, LoadReport, ModuleLoader, NodeConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Interval-scheduled resource auctions
#[derive(Parser, Debug)]
#[command(name = "auctionet")]
#[command(about = "Resource auctions between agents and an auctioning server")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the auctioning server
    Server {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Resource and auction definitions (JSON)
        #[arg(short, long)]
        definitions: PathBuf,
    },

    /// Run an agent
    Agent {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Resource request definitions (JSON)
        #[arg(short, long)]
        definitions: PathBuf,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "auctionet.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig, auctionet::ConfigError> {
    match path {
        Some(path) => NodeConfig::from_file(path),
        None => Ok(NodeConfig::default()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_report(report: &LoadReport) {
    println!(
        "Loaded: {} resources, {} auctions, {} requests",
        report.resources, report.auctions, report.requests
    );
    for rejected in &report.rejected {
        println!("  rejected {}", rejected);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::Validate { config } => cmd_validate(config),
        Commands::Server { config, definitions } => {
            let config = load_config(config.as_deref())?;
            init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));
            cmd_server(config, &definitions).await
        }
        Commands::Agent { config, definitions } => {
            let config = load_config(config.as_deref())?;
            init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));
            cmd_agent(config, &definitions).await
        }
    }
}

async fn cmd_server(config: NodeConfig, definitions: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let defs = Definitions::from_file(definitions)?;
    let server = Arc::new(AuctionServer::bind(config, ModuleLoader::with_builtin()).await?);

    println!("auctionet server v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    if let Some(addr) = server.local_addr() {
        println!("Listening on {}", addr);
    }
    print_report(&server.load_definitions(&defs));
    println!();
    println!("Press Ctrl+C to stop...");

    let runner = Arc::clone(&server);
    let task = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    server.shutdown();
    task.await??;
    Ok(())
}

async fn cmd_agent(config: NodeConfig, definitions: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let defs = Definitions::from_file(definitions)?;
    let agent = Arc::new(AuctionAgent::from_config(config, ModuleLoader::with_builtin())?);

    println!("auctionet agent v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!("Server: {}", agent.server());
    print_report(&agent.load_definitions(&defs));
    println!();
    println!("Press Ctrl+C to stop...");

    let runner = Arc::clone(&agent);
    let task = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    agent.shutdown();
    task.await??;

    let allocations = agent.allocations();
    println!("Allocations received: {}", allocations.len());
    for allocation in allocations {
        println!(
            "  {} on {}: {} units [{}, {})",
            allocation.key(),
            allocation.auction,
            allocation.total_quantity(),
            allocation.start,
            allocation.stop
        );
    }
    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NodeConfig {
        name: "example-node".into(),
        ..NodeConfig::default()
    };
    config.modules.insert(
        "first_price".into(),
        auctionet::ModuleConfig::new()
            .with("capacity", "10")
            .with("reserve_price", "0.5"),
    );
    config.modules.insert(
        "fixed_bidder".into(),
        auctionet::ModuleConfig::new().with("max_price", "5"),
    );

    let toml_str = config.to_toml()?;

    let content = format!(
        r#"# auctionet node configuration
# Generated by auctionet gen-config
# [server] is read by `auctionet server`, [agent] by `auctionet agent`.

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match NodeConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Node: {}", config.name);
            println!("Server bind: {}", config.server_bind()?);
            println!("Agent server: {}", config.agent_server()?);
            println!(
                "Handshake timeout: {} ms, max message {} bytes",
                config.protocol.handshake_timeout_ms, config.protocol.max_message_size
            );
            for name in config.modules.keys() {
                println!("  module group [{}]", name);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
