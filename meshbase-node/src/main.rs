//! NetMeshBase node
//!
//! Serves the objects of one NetMeshBase over TCP, resolves access paths
//! through configured peers, and inspects identifiers and paths.
//!
//! Usage:
//!   meshbase-node --identifier localhost:7070 serve
//!   meshbase-node --peer http://b.example/=127.0.0.1:7071 fetch 'http://b.example/#x'
//!   meshbase-node parse 'http://a.example/!http://b.example/#x'

use anyhow::Result;
use clap::{Parser, Subcommand};
use meshbase_node::{describe_identifier, describe_path, fetch, Node, NodeConfig};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meshbase-node")]
#[command(about = "NetMeshBase node: serve, fetch and inspect access paths")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Identifier of this node (overrides the config file)
    #[arg(long, global = true)]
    identifier: Option<String>,

    /// Address to serve on (overrides the config file)
    #[arg(long, global = true)]
    listen: Option<SocketAddr>,

    /// Partner address, as ID=HOST:PORT. Repeatable.
    #[arg(long = "peer", value_name = "ID=ADDR", global = true)]
    peers: Vec<String>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a NetMeshBase identifier and print its canonical form
    Identifier {
        raw: String,
        /// Assume http:// when no protocol is given
        #[arg(long)]
        guess: bool,
        /// Resolve relative input against this identifier
        #[arg(long)]
        context: Option<String>,
    },
    /// Decompose an access path into its hops
    Parse { raw: String },
    /// Serve this node until Ctrl-C
    Serve,
    /// Resolve an access path and print the object
    Fetch { path: String },
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(identifier) = &args.identifier {
        config.identifier.clone_from(identifier);
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    config.add_peers(&args.peers)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match &args.command {
        Command::Identifier { raw, guess, context } => {
            print_json(&describe_identifier(raw, *guess, context.as_deref())?)
        }
        Command::Parse { raw } => print_json(&describe_path(raw)?),
        Command::Fetch { path } => {
            let config = load_config(&args)?;
            print_json(&fetch(&config, path).await?)
        }
        Command::Serve => {
            let config = load_config(&args)?;
            let node = Node::start(&config).await?;

            println!("\n========================================");
            println!("  NetMeshBase Node Running");
            println!("========================================");
            println!("  Identifier: {}", node.base().identifier());
            println!("  Listening:  {}", node.addr());
            println!("  Peers:      {}", config.peers.len());
            println!("========================================\n");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");
            node.shutdown().await
        }
    }
}
