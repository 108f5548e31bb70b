//! Upstream tunnel endpoint set
//!
//! Configured server addresses are normalized once at startup: bare
//! addresses get the configured default scheme, URLs without an explicit
//! port get the configured remote port. Each session picks one endpoint
//! uniformly at random; no affinity or health state is kept across
//! sessions.

use crate::Error;
use rand::Rng;
use url::Url;

/// Immutable, normalized list of tunnel server URLs
#[derive(Debug, Clone)]
pub struct EndpointSet {
    endpoints: Vec<Url>,
}

impl EndpointSet {
    pub fn new(
        servers: &[String],
        default_scheme: &str,
        default_port: u16,
    ) -> crate::Result<Self> {
        if servers.is_empty() {
            return Err(Error::Config("no tunnel servers configured".to_string()));
        }
        let endpoints = servers
            .iter()
            .map(|s| normalize(s, default_scheme, default_port))
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self { endpoints })
    }

    /// Pick an endpoint for a new session, uniformly at random
    pub fn pick(&self) -> &Url {
        let index = rand::thread_rng().gen_range(0..self.endpoints.len());
        &self.endpoints[index]
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Url> {
        self.endpoints.iter()
    }
}

fn normalize(server: &str, default_scheme: &str, default_port: u16) -> crate::Result<Url> {
    let raw = if server.contains("://") {
        server.to_string()
    } else {
        format!("{default_scheme}://{server}")
    };
    let mut url = Url::parse(&raw)
        .map_err(|e| Error::Config(format!("invalid server URL '{server}': {e}")))?;
    if url.host_str().is_none() {
        return Err(Error::Config(format!("server URL '{server}' has no host")));
    }
    if url.port().is_none() {
        url.set_port(Some(default_port))
            .map_err(|_| Error::Config(format!("cannot set port on '{server}'")))?;
    }
    Ok(url)
}
