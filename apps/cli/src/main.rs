//! anonet CLI
//!
//! Runs a node (DHT + relay), or performs one-shot lookups and circuit
//! builds against the network. A harness for the core, not a product
//! surface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use anonet_core::AnonetConfig;
use anonet_identity::restore_identity;
use anonet_node::AnonetNode;

/// anonet - decentralized anonymous file sharing
#[derive(Parser)]
#[command(name = "anonet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(long, default_value = ".anonet/config.json")]
    config: PathBuf,

    /// Display name to announce under
    #[arg(long, default_value = "anon")]
    name: String,

    /// Wordlist file for mnemonic generation (one word per line)
    #[arg(long)]
    wordlist: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Run,

    /// Look a peer up by username (name#DISCRIMINATOR)
    Lookup {
        /// Username to resolve
        username: String,
    },

    /// Build an onion circuit and report its hops
    Circuit {
        /// Number of relay hops (1-3)
        #[arg(short = 'n', long, default_value = "3")]
        hops: usize,
    },

    /// Restore the identity from a 12-word recovery phrase
    Restore {
        /// The recovery phrase (quote all twelve words)
        phrase: String,

        /// Passphrase used when the identity was created, if any
        #[arg(long, default_value = "")]
        passphrase: String,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "debug,anonet=trace"
    } else {
        "info,anonet=debug"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_wordlist(path: Option<&PathBuf>) -> Result<Vec<String>> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading wordlist {path:?}"))?;
            let words: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            anyhow::ensure!(
                words.len() == 2048,
                "wordlist must contain 2048 words, found {}",
                words.len()
            );
            Ok(words)
        }
        // Placeholder list; recovery phrases only interoperate with the
        // same list.
        None => Ok((0..2048).map(|i| format!("word{i:04}")).collect()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = AnonetConfig::load_from(&cli.config).context("loading config")?;

    // Restore rewrites the key files and must run before a node would
    // load or generate them.
    if let Commands::Restore { phrase, passphrase } = &cli.command {
        let identity = restore_identity(&config.node.data_dir, phrase.trim(), passphrase)
            .context("restoring identity")?;
        println!("restored identity {}", identity.discriminator());
        println!("fingerprint: {}", identity.fingerprint());
        return Ok(());
    }

    let words = load_wordlist(cli.wordlist.as_ref())?;
    let wordlist: Vec<&str> = words.iter().map(|s| s.as_str()).collect();

    let (node, _inbound) = AnonetNode::start(config, &cli.name, &wordlist)
        .await
        .context("starting node")?;
    info!(
        "node up as {} (fingerprint {})",
        node.username(),
        node.identity().fingerprint()
    );

    match cli.command {
        Commands::Run => {
            let mut events = node.events().subscribe();
            loop {
                tokio::select! {
                    event = events.recv() => {
                        if let Ok(event) = event {
                            info!(?event, "event");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutting down");
                        break;
                    }
                }
            }
        }
        Commands::Lookup { username } => match node.lookup_user(&username).await {
            Some(announcement) => {
                println!("username:    {}", announcement.username);
                println!("fingerprint: {}", announcement.fingerprint);
                println!("ports:       {:?}", announcement.port_candidates);
                println!("timestamp:   {}", announcement.timestamp_ms);
            }
            None => println!("{username}: not found"),
        },
        Commands::Circuit { hops } => {
            let circuit = node.open_circuit(hops).await.context("building circuit")?;
            println!("circuit {} ready:", circuit.circuit_id());
            for (i, hop) in circuit.hops().iter().enumerate() {
                println!("  hop {}: {}", i + 1, hop.addr);
            }
            circuit.destroy().await.ok();
        }
        Commands::Restore { .. } => unreachable!("handled before node start"),
    }

    node.shutdown();
    Ok(())
}
