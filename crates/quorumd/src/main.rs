//! quorumd — the QuorumGrid node daemon.
//!
//! Prepares a controller node for the embedded clustered database:
//! - Agent config loading and validation
//! - Database directory creation
//! - Bind address, replication TLS and peer list composition
//! - Cluster CA and node certificate generation
//!
//! # Usage
//!
//! ```text
//! quorumd options --config /etc/quorumgrid/agent.toml --json
//! quorumd certs --out /etc/quorumgrid --node-id node-0 --address 10.0.0.5
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use quorum_core::AgentConfig;
use quorumgrid_cluster::ClusterOptionFactory;
use quorumgrid_cluster::tls::{generate_ca, generate_node_cert};
use tracing::info;

#[derive(Parser)]
#[command(name = "quorumd", about = "QuorumGrid node daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compose the database options for this node and report them.
    Options {
        /// Path to the agent configuration file.
        #[arg(long, default_value = "/etc/quorumgrid/agent.toml")]
        config: PathBuf,

        /// Print the options summary as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate a cluster CA and a node certificate signed by it.
    Certs {
        /// Directory to write PEM files into.
        #[arg(long)]
        out: PathBuf,

        /// Node identity used as the certificate common name.
        #[arg(long)]
        node_id: String,

        /// IP address or DNS name to include as a SAN (repeatable).
        #[arg(long = "address")]
        addresses: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,quorumd=debug,quorumgrid=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Options { config, json } => run_options(&config, json).await,
        Command::Certs {
            out,
            node_id,
            addresses,
        } => write_certs(&out, &node_id, &addresses),
    }
}

async fn run_options(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = AgentConfig::from_file(path)?;
    config.validate()?;
    info!(path = ?path, cluster_capable = config.is_cluster_capable(), "agent config loaded");

    let factory = ClusterOptionFactory::new(config);
    let options = factory.build().await?;
    let summary = options.summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            data_dir = ?summary.data_dir,
            address = summary.address.as_deref().unwrap_or("-"),
            peers = ?summary.peers,
            tls = summary.tls,
            "node ready for database start"
        );
    }
    Ok(())
}

fn write_certs(out: &Path, node_id: &str, addresses: &[String]) -> anyhow::Result<()> {
    std::fs::create_dir_all(out)?;

    let ca = generate_ca()?;
    let node = generate_node_cert(&ca, node_id, addresses)?;

    write_pem(&out.join("ca.pem"), &ca.pair.cert_pem, false)?;
    write_pem(&out.join("ca-key.pem"), &ca.pair.key_pem, true)?;
    write_pem(&out.join("node.pem"), &node.cert_pem, false)?;
    write_pem(&out.join("node-key.pem"), &node.key_pem, true)?;

    info!(path = ?out, %node_id, "cluster certificates written");
    Ok(())
}

fn write_pem(path: &Path, pem: &str, secret: bool) -> anyhow::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    // `mode` only applies on creation; tighten keys left over from an
    // earlier run before any key material lands in them.
    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = secret;

    file.write_all(pem.as_bytes())?;
    Ok(())
}
