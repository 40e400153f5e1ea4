use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ircd=info".parse()?))
        .init();

    let config = ircd::config::ServerConfig::parse();
    tracing::info!("Starting {} on {}", config.server_name, config.client_addr);
    tracing::info!("Server links on {}", config.server_addr);

    let server = ircd::server::Server::new(config);
    server.run().await
}
