//! `groundlink` – bridge a local bus across machines.
//!
//! # Usage
//!
//! ```bash
//! # Serve this machine's bus on the configured address
//! groundlink serve --bind 0.0.0.0:9870
//!
//! # Bridge to a server, pulling topics 1 and 2, pushing topic 10
//! groundlink connect --url ws://vehicle:9870 --inbound 1,2 --outbound 10
//!
//! # Write ~/.groundlink/config.toml with defaults
//! groundlink init
//! ```
//!
//! Every value crossing the local bus is logged at `info` unless `--no-tap`
//! is given.  Ctrl-C shuts the bridge down cleanly.

mod config;
mod heartbeat;
mod telemetry;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use groundlink_kernel::{CancellationToken, Worker};
use groundlink_middleware::{
    BridgeClient, BridgeServer, CodecRegistry, LocalBus, WsBridgeServer, WsTransport, callback,
};
use groundlink_types::{LinkError, TopicId};
use tracing::{info, warn};

use crate::config::Config;
use crate::heartbeat::Heartbeat;

/// Distributed publish/subscribe bridge
#[derive(Parser, Debug)]
#[command(name = "groundlink")]
#[command(version)]
struct Args {
    /// Configuration file path (default: ~/.groundlink/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Do not log every value crossing the local bus
    #[arg(long, global = true)]
    no_tap: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the local bus to bridge clients over WebSocket
    Serve {
        /// Listen address, overrides `server.bind`
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Bridge the local bus to a remote server
    Connect {
        /// Server URL, overrides `client.server_url`
        #[arg(short, long)]
        url: Option<String>,

        /// Topics to pull from the server (comma-separated)
        #[arg(long, value_delimiter = ',')]
        inbound: Option<Vec<i32>>,

        /// Topics to push to the server (comma-separated)
        #[arg(long, value_delimiter = ',')]
        outbound: Option<Vec<i32>>,
    },

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = telemetry::init_tracing("groundlink");

    let path = args.config.clone().unwrap_or_else(config::config_path);
    let tap = !args.no_tap;
    let result = match args.command {
        Commands::Init { force } => cmd_init(&path, force),
        Commands::Serve { bind } => run(Role::Serve { bind }, &path, tap).await,
        Commands::Connect { url, inbound, outbound } => {
            run(Role::Connect { url, inbound, outbound }, &path, tap).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

/// The long-running subcommands, with their flag overrides.
#[derive(Debug)]
enum Role {
    Serve {
        bind: Option<String>,
    },
    Connect {
        url: Option<String>,
        inbound: Option<Vec<i32>>,
        outbound: Option<Vec<i32>>,
    },
}

async fn run(role: Role, path: &Path, tap: bool) -> Result<(), LinkError> {
    let cfg = config::load_or_default(path)?;
    let shutdown = CancellationToken::new();
    let on_ctrlc = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting the bridge down …".yellow().bold());
        on_ctrlc.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; the bridge can only be killed");
    }

    let bus = Arc::new(LocalBus::new());
    let codec = Arc::new(CodecRegistry::scalars_only());
    if tap {
        install_tap(&bus)?;
    }

    let mut heartbeat = cfg.heartbeat.topic.map(|topic| {
        let interval = Duration::from_millis(cfg.heartbeat.interval_ms);
        info!(%topic, ?interval, "heartbeat enabled");
        Worker::new("heartbeat", Heartbeat::new(Arc::clone(&bus), topic)).with_interval(interval)
    });

    let result = match role {
        Role::Serve { bind } => {
            let bind = bind.unwrap_or(cfg.server.bind);
            let addr: SocketAddr = bind
                .parse()
                .map_err(|e| LinkError::Config(format!("invalid bind address {bind}: {e}")))?;
            let server = Arc::new(BridgeServer::new(Arc::clone(&bus), codec));
            let ws = WsBridgeServer::bind(server, addr).await?;
            println!("  {} serving on {}", "groundlink".bold().cyan(), ws.local_addr()?.to_string().bold());

            if let Some(worker) = heartbeat.as_mut() {
                worker.start();
            }
            ws.run(shutdown).await
        }
        Role::Connect { url, inbound, outbound } => {
            let url = url.unwrap_or_else(|| cfg.client.server_url.clone());
            let mut bridge = cfg.client.bridge_config();
            if let Some(topics) = inbound {
                bridge.inbound_topics = topics.into_iter().map(TopicId).collect();
            }
            if let Some(topics) = outbound {
                bridge.outbound_topics = topics.into_iter().map(TopicId).collect();
            }

            let transport = Arc::new(WsTransport::new(url.clone()));
            let mut client = BridgeClient::connect(transport, Arc::clone(&bus), codec, bridge).await?;
            println!("  {} bridged to {}", "groundlink".bold().cyan(), url.bold());

            if let Some(worker) = heartbeat.as_mut() {
                worker.start();
            }
            shutdown.cancelled().await;
            client.stop().await;
            Ok(())
        }
    };

    if let Some(mut worker) = heartbeat {
        worker.stop().await;
    }
    println!("{}", "  ✓ Bridge stopped.".green());
    result
}

/// Log every value published on `bus`.
fn install_tap(bus: &LocalBus) -> Result<(), LinkError> {
    bus.subscribe(
        None,
        callback(|p| {
            match p.origin {
                Some(origin) => info!(topic = %p.topic, value = ?p.value, %origin, "bus"),
                None => info!(topic = %p.topic, value = ?p.value, "bus"),
            }
            Ok(())
        }),
    )
}

fn cmd_init(path: &Path, force: bool) -> Result<(), LinkError> {
    if path.exists() && !force {
        return Err(LinkError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    config::save_to(&Config::default(), path)?;
    println!("  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
    Ok(())
}
