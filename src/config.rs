use clap::Parser;

/// IRC daemon with token-protocol server linking.
#[derive(Parser, Debug, Clone)]
#[command(name = "ircd", version, about)]
pub struct ServerConfig {
    /// Client listener address.
    #[arg(long, default_value = "127.0.0.1:6667")]
    pub client_addr: String,

    /// Server-link listener address.
    #[arg(long, default_value = "127.0.0.1:4400")]
    pub server_addr: String,

    /// Numeric server id. The one-character routing token is derived from it.
    #[arg(long, default_value = "1")]
    pub server_id: u16,

    /// Server name used in IRC messages.
    #[arg(long, default_value = "irc.local")]
    pub server_name: String,

    /// Network name shown in the welcome numerics.
    #[arg(long, default_value = "LocalNet")]
    pub network_name: String,

    /// Server description, sent to linked peers.
    #[arg(long, default_value = "Rust IRC daemon")]
    pub description: String,

    /// Path to the MOTD text file.
    #[arg(long)]
    pub motd_file: Option<String>,

    /// Configured remote peer, repeatable: name:secret:host:port
    #[arg(long = "peer", value_parser = RemoteServer::parse_arg)]
    pub peers: Vec<RemoteServer>,

    /// Maximum number of simultaneous client connections.
    #[arg(long, default_value = "1024")]
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_addr: "127.0.0.1:6667".to_string(),
            server_addr: "127.0.0.1:4400".to_string(),
            server_id: 1,
            server_name: "irc.local".to_string(),
            network_name: "LocalNet".to_string(),
            description: "Rust IRC daemon".to_string(),
            motd_file: None,
            peers: Vec::new(),
            max_clients: 1024,
        }
    }
}

impl ServerConfig {
    /// One-character routing token for this server.
    pub fn token(&self) -> char {
        (b'A' + (self.server_id % 26) as u8) as char
    }
}

/// A configured remote peer: who may link, and where to dial out.
#[derive(Debug, Clone)]
pub struct RemoteServer {
    pub name: String,
    pub secret: String,
    pub address: String,
    pub port: u16,
}

impl RemoteServer {
    /// Parse a `name:secret:host:port` command-line argument.
    pub fn parse_arg(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.splitn(4, ':').collect();
        if parts.len() != 4 {
            return Err(format!("expected name:secret:host:port, got {s:?}"));
        }
        let port: u16 = parts[3]
            .parse()
            .map_err(|_| format!("invalid port {:?}", parts[3]))?;
        Ok(Self {
            name: parts[0].to_string(),
            secret: parts[1].to_string(),
            address: parts[2].to_string(),
            port,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
