use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use hashmesh::{load_seeds, Keypair, Node, SwitchConfig};

#[derive(Parser, Debug)]
#[command(name = "hashmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// JSON file listing seeds (`publicKey`, `ip`, `port`, ...).
    #[arg(short, long, value_name = "FILE")]
    seeds: Option<PathBuf>,

    /// File holding the 32-byte secret key as hex. Created if missing.
    #[arg(short, long, value_name = "FILE")]
    key: Option<PathBuf>,

    /// Refuse to relay packets for other peers.
    #[arg(long)]
    no_relay: bool,

    /// Accept bridge requests from any peer, not only seeds.
    #[arg(long)]
    bridging: bool,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

fn load_or_create_keypair(path: &PathBuf) -> Result<Keypair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("key file is not hex")?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .context("key file must hold 64 hex characters")?;
        return Ok(Keypair::from_secret_key_bytes(&secret));
    }
    let keypair = Keypair::generate();
    std::fs::write(path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("failed to write key file {}", path.display()))?;
    info!(path = %path.display(), "generated new identity");
    Ok(keypair)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = match &args.key {
        Some(path) => load_or_create_keypair(path)?,
        None => Keypair::generate(),
    };
    let config = SwitchConfig {
        relay: !args.no_relay,
        bridging: args.bridging,
        ..SwitchConfig::default()
    };

    let node = Node::bind_with_config(&args.bind.to_string(), keypair, config).await?;
    info!(hashname = %node.hashname(), addr = %node.local_addr(), "node started");
    info!("public key: {}", hex::encode(node.public_key()));

    if let Some(path) = &args.seeds {
        for seed in load_seeds(path)? {
            match node.add_seed(seed).await {
                Ok(hashname) => info!(seed = %hashname.short(), "seed added"),
                Err(e) => warn!(error = %e, "ignoring seed"),
            }
        }
    }
    node.online().await?;

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                node.shutdown().await;
                break;
            }
            _ = interval.tick() => {
                let stats = node.telemetry().await?;
                info!(
                    peers = stats.peers,
                    lines = stats.lines,
                    alive = stats.alive,
                    elected = stats.elected,
                    buckets = stats.buckets,
                    channels = stats.channels,
                    lookups = stats.lookups,
                    bridges = stats.bridges,
                    relayed = stats.relayed,
                    relay_dropped = stats.relay_dropped,
                    bridged = stats.bridged,
                    dropped = stats.dropped,
                    "switch stats"
                );
            }
        }
    }

    Ok(())
}
