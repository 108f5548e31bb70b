//! Wisp Tunnel server
//!
//! Terminates encrypted WebSocket tunnel sessions and relays them to their
//! real TCP destinations. Listen port, password and cipher method honor the
//! `PORT`, `KEY` and `METHOD` environment variables between the config file
//! and the command line.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use wisp_tunnel::config::{FileConfig, Overrides, ServerConfig};
use wisp_tunnel::server::ServerNode;

/// Wisp Tunnel server
#[derive(Parser, Debug)]
#[command(name = "wisp-server")]
#[command(about = "Terminating side of the wisp encrypted WebSocket tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Bind address
    #[arg(short = 'b', long)]
    local_address: Option<String>,

    /// Tunnel listen port
    #[arg(short = 'r', long)]
    remote_port: Option<u16>,

    /// Shared password
    #[arg(short = 'k', long)]
    password: Option<String>,

    /// Cipher method; empty or "null" disable encryption
    #[arg(short = 'm', long)]
    method: Option<String>,

    /// Idle timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            local_address: self.local_address.clone(),
            remote_port: self.remote_port,
            password: self.password.clone(),
            method: self.method.clone(),
            timeout: self.timeout,
            ..Default::default()
        }
    }
}

fn env_overrides() -> Result<Overrides> {
    let mut env = Overrides::default();
    if let Ok(port) = std::env::var("PORT") {
        env.remote_port = Some(port.parse().context("Invalid PORT value")?);
    }
    if let Ok(key) = std::env::var("KEY") {
        env.password = Some(key);
    }
    if let Ok(method) = std::env::var("METHOD") {
        env.method = Some(method);
    }
    Ok(env)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let file = FileConfig::load(&args.config).context("Failed to load configuration")?;
    let config = ServerConfig::merge(file, env_overrides()?, args.overrides())
        .context("Invalid configuration")?;

    info!("wisp-server v{}", wisp_tunnel::VERSION);

    let node = ServerNode::bind(config)
        .await
        .context("Failed to bind tunnel listener")?;

    tokio::select! {
        res = node.run() => res.context("Tunnel listener failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
