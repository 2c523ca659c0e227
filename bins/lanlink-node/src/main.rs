//! Lanlink node CLI
//!
//! Front-end for the overlay engine. The session substrate itself is
//! provided by the embedding application; this binary drives the
//! overlay against the in-process substrate, which makes it useful for
//! configuration management and for exercising a complete tunnel on one
//! machine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lanlink_core::{OverlayConfig, OverlayMode, OverlayNode};
use lanlink_net::MemoryHub;
use lanlink_proto::{NodeId, UserId};

mod config;

use config::NodeConfig;

/// Lanlink - peer-to-peer overlay tunneling
#[derive(Parser)]
#[command(name = "lanlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.lanlink/config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Config,

    /// Show the node id derived from a user id
    Id {
        /// Numeric user id
        user_id: u64,
    },

    /// Run a two-node tunnel on this machine (in-process substrate)
    Demo {
        /// Port the client-side listener binds
        #[arg(long, default_value = "25565")]
        bind_port: u16,

        /// Port the host side connects to for inbound sessions
        #[arg(long, default_value = "25566")]
        local_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_path(&cli.config)?;
    let mut node_config = NodeConfig::load_or_default(&config_path)?;
    if let Some(level) = &cli.log_level {
        node_config.logging.level = level.clone();
    }

    init_logging(&node_config.logging.level)?;

    match cli.command {
        Commands::Init { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "config already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            NodeConfig::default().save(&config_path)?;
            println!("wrote {}", config_path.display());
        }

        Commands::Config => {
            let raw = toml::to_string_pretty(&node_config)?;
            println!("{}", raw);
        }

        Commands::Id { user_id } => {
            let node_id = NodeId::from_user_id(UserId(user_id));
            println!("{}", node_id);
        }

        Commands::Demo {
            bind_port,
            local_port,
        } => {
            run_demo(node_config.overlay, bind_port, local_port).await?;
        }
    }

    Ok(())
}

/// Two in-process nodes tunneling a local TCP port
///
/// Connect to `bind_port`; bytes emerge from a connection the host node
/// opens to `local_port`, as they would across a real session.
async fn run_demo(base: OverlayConfig, bind_port: u16, local_port: u16) -> Result<()> {
    let hub = MemoryHub::new();
    let client_user = UserId(1001);
    let host_user = UserId(1002);
    let client_sub = hub.endpoint(client_user, "demo-client");
    let host_sub = hub.endpoint(host_user, "demo-host");
    hub.connect(client_user, host_user);

    let client_config = OverlayConfig {
        mode: OverlayMode::Tcp,
        publish: false,
        bind_port,
        local_port: 0,
        ..base.clone()
    };
    let host_config = OverlayConfig {
        mode: OverlayMode::Tcp,
        publish: true,
        bind_port: 0,
        local_port,
        ..base
    };

    let (client, _client_events) =
        OverlayNode::new(client_sub, client_config).context("client node")?;
    let (host, _host_events) = OverlayNode::new(host_sub, host_config).context("host node")?;
    client.start().await.context("starting client node")?;
    host.start().await.context("starting host node")?;
    client.transport().add_peer(host_user);
    host.transport().add_peer(client_user);

    let listen = client
        .listener_port()
        .unwrap_or(bind_port);
    info!(
        listen,
        local_port, "demo tunnel up: connect to 127.0.0.1:{listen}, traffic emerges on 127.0.0.1:{local_port}"
    );
    println!(
        "tunnel ready: 127.0.0.1:{} -> 127.0.0.1:{} (ctrl-c to stop)",
        listen, local_port
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    client.stop().await;
    host.stop().await;
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;
    Ok(())
}

fn expand_path(path: &PathBuf) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .context("cannot resolve home directory")?;
        Ok(PathBuf::from(home).join(rest))
    } else {
        Ok(path.clone())
    }
}
