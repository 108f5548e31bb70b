//! Wisp Tunnel local endpoint
//!
//! Exposes a SOCKS5 proxy to local applications and carries each proxied
//! connection to a tunnel server over an encrypted WebSocket, optionally
//! routed through the HTTP forward proxy named by `http_proxy`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use url::Url;
use wisp_tunnel::config::{FileConfig, LocalConfig, Overrides};
use wisp_tunnel::local::LocalNode;

/// Wisp Tunnel local endpoint
#[derive(Parser, Debug)]
#[command(name = "wisp-local")]
#[command(about = "SOCKS5 entry point of the wisp encrypted WebSocket tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Local bind address
    #[arg(short = 'b', long)]
    local_address: Option<String>,

    /// SOCKS5 listen port
    #[arg(short = 'l', long)]
    local_port: Option<u16>,

    /// Tunnel server URL or bare address (repeatable)
    #[arg(short = 's', long = "server")]
    server: Vec<String>,

    /// Default port for server addresses given without one
    #[arg(short = 'r', long)]
    remote_port: Option<u16>,

    /// Shared password
    #[arg(short = 'k', long)]
    password: Option<String>,

    /// Cipher method; empty, "null" or "table" disable encryption
    #[arg(short = 'm', long)]
    method: Option<String>,

    /// Default scheme for server addresses given without one
    #[arg(long)]
    scheme: Option<String>,

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
            server: self.server.clone(),
            local_address: self.local_address.clone(),
            local_port: self.local_port,
            remote_port: self.remote_port,
            password: self.password.clone(),
            method: self.method.clone(),
            timeout: self.timeout,
            scheme: self.scheme.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let file = FileConfig::load(&args.config).context("Failed to load configuration")?;
    let config = LocalConfig::merge(file, args.overrides()).context("Invalid configuration")?;

    let proxy = match std::env::var("http_proxy") {
        Ok(raw) => Some(Url::parse(&raw).context("Invalid http_proxy URL")?),
        Err(_) => None,
    };

    info!("wisp-local v{}", wisp_tunnel::VERSION);

    let node = LocalNode::bind(config, proxy)
        .await
        .context("Failed to bind SOCKS5 listener")?;

    tokio::select! {
        res = node.run() => res.context("SOCKS5 listener failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
