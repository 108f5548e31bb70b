//! Configuration management
//!
//! The tunnel core consumes an already merged configuration; this module
//! owns the JSON file format and the explicit merge precedence: command
//! line over environment over file. Environment overrides apply on the
//! server binary only.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default local bind address for the SOCKS5 side
pub const DEFAULT_LOCAL_ADDRESS: &str = "127.0.0.1";
/// Default SOCKS5 listen port
pub const DEFAULT_LOCAL_PORT: u16 = 1080;
/// Default bind address for the tunnel server
pub const DEFAULT_SERVER_ADDRESS: &str = "0.0.0.0";
/// Default tunnel server port
pub const DEFAULT_REMOTE_PORT: u16 = 8080;
/// Default URL scheme for bare server addresses
pub const DEFAULT_SCHEME: &str = "ws";
/// Default idle timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: f64 = 600.0;

/// On-disk configuration, shared by both binaries
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    /// One or more tunnel server addresses
    pub server: Option<ServerList>,
    pub local_address: Option<String>,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub password: Option<String>,
    pub method: Option<String>,
    /// Idle timeout in seconds, fractional allowed
    pub timeout: Option<f64>,
    /// Scheme applied to server addresses given without one
    pub scheme: Option<String>,
}

/// `server` accepts either a single address or a list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerList {
    One(String),
    Many(Vec<String>),
}

impl ServerList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            ServerList::One(server) => vec![server],
            ServerList::Many(servers) => servers,
        }
    }
}

impl FileConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }
}

/// A set of optional overrides from one source (command line or
/// environment); `None` fields defer to the next source down
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server: Vec<String>,
    pub local_address: Option<String>,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub password: Option<String>,
    pub method: Option<String>,
    pub timeout: Option<f64>,
    pub scheme: Option<String>,
}

fn to_duration(secs: f64) -> Duration {
    Duration::from_millis((secs * 1000.0) as u64)
}

/// Merged configuration of the local (SOCKS5) side
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub local_address: String,
    pub local_port: u16,
    pub servers: Vec<String>,
    pub remote_port: u16,
    pub password: String,
    pub method: String,
    pub timeout: Duration,
    pub scheme: String,
}

impl LocalConfig {
    /// Merge file values under command-line overrides
    pub fn merge(file: FileConfig, cli: Overrides) -> crate::Result<Self> {
        let servers = if !cli.server.is_empty() {
            cli.server
        } else {
            file.server.map(ServerList::into_vec).unwrap_or_default()
        };
        if servers.is_empty() {
            return Err(crate::Error::Config(
                "no tunnel server configured".to_string(),
            ));
        }

        Ok(Self {
            local_address: cli
                .local_address
                .or(file.local_address)
                .unwrap_or_else(|| DEFAULT_LOCAL_ADDRESS.to_string()),
            local_port: cli
                .local_port
                .or(file.local_port)
                .unwrap_or(DEFAULT_LOCAL_PORT),
            servers,
            remote_port: cli
                .remote_port
                .or(file.remote_port)
                .unwrap_or(DEFAULT_REMOTE_PORT),
            password: cli.password.or(file.password).unwrap_or_default(),
            method: cli.method.or(file.method).unwrap_or_default(),
            timeout: to_duration(cli.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT_SECS)),
            scheme: cli
                .scheme
                .or(file.scheme)
                .unwrap_or_else(|| DEFAULT_SCHEME.to_string()),
        })
    }
}

/// Merged configuration of the tunnel-terminator side
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub local_address: String,
    pub remote_port: u16,
    pub password: String,
    pub method: String,
    pub timeout: Duration,
}

impl ServerConfig {
    /// Merge file values under environment overrides under command-line
    /// overrides
    pub fn merge(file: FileConfig, env: Overrides, cli: Overrides) -> crate::Result<Self> {
        Ok(Self {
            local_address: cli
                .local_address
                .or(env.local_address)
                .or(file.local_address)
                .unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.to_string()),
            remote_port: cli
                .remote_port
                .or(env.remote_port)
                .or(file.remote_port)
                .unwrap_or(DEFAULT_REMOTE_PORT),
            password: cli
                .password
                .or(env.password)
                .or(file.password)
                .unwrap_or_default(),
            method: cli.method.or(env.method).or(file.method).unwrap_or_default(),
            timeout: to_duration(
                cli.timeout
                    .or(env.timeout)
                    .or(file.timeout)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
        })
    }
}
