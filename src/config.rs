use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{bail, Context, Result};
use clap::Parser;

/// Federated UDP chat server speaking the DuckChat protocol.
#[derive(Parser, Debug, Clone)]
#[command(name = "duckchat-server", version, about)]
pub struct ServerConfig {
    /// Host address this server binds to.
    pub host: String,

    /// Port this server listens on.
    pub port: u16,

    /// Neighboring servers, given as trailing `host port` pairs.
    #[arg(trailing_var_arg = true)]
    pub neighbors: Vec<String>,

    /// Seconds between maintenance ticks (keep-alives, join refresh).
    #[arg(long, default_value_t = 60)]
    pub tick_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            neighbors: Vec::new(),
            tick_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Resolve the trailing neighbor arguments into socket addresses.
    pub fn resolve_neighbors(&self) -> Result<Vec<SocketAddr>> {
        if self.neighbors.len() % 2 != 0 {
            bail!("neighbors must be given as host/port pairs");
        }
        let mut resolved = Vec::with_capacity(self.neighbors.len() / 2);
        for pair in self.neighbors.chunks(2) {
            let (host, port) = (&pair[0], &pair[1]);
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid neighbor port {port:?}"))?;
            let addr = (host.as_str(), port)
                .to_socket_addrs()
                .with_context(|| format!("failed to locate the host at {host}"))?
                .next()
                .with_context(|| format!("no address found for {host}"))?;
            resolved.push(addr);
        }
        Ok(resolved)
    }
}
