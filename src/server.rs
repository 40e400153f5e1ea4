//! Server façade.
//!
//! Owns the listeners, installs the timeout reaper and the outbound
//! connector, and hands every accepted socket to the right handler.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use crate::config::ServerConfig;
use crate::connection;
use crate::peer;
use crate::state::{IrcState, MotdProvider, unix_now};

/// First reaper fire, then its period.
const REAPER_DELAY: Duration = Duration::from_secs(10);
const REAPER_PERIOD: Duration = Duration::from_secs(5);
/// Outbound connector cadence.
const CONNECT_DELAY: Duration = Duration::from_secs(1);
const CONNECT_PERIOD: Duration = Duration::from_secs(10);

const DEFAULT_MOTD: &str = "Welcome to the network.";

pub struct Server {
    config: ServerConfig,
    motd: MotdProvider,
}

/// A started server: bound addresses, shared state, accept-loop task.
pub struct ServerHandle {
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub state: Arc<Mutex<IrcState>>,
    pub task: JoinHandle<Result<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let motd: MotdProvider = match config.motd_file.clone() {
            Some(path) => Arc::new(move || {
                std::fs::read_to_string(&path).unwrap_or_else(|_| DEFAULT_MOTD.to_string())
            }),
            None => Arc::new(|| DEFAULT_MOTD.to_string()),
        };
        Self { config, motd }
    }

    /// Create a server with a custom MOTD provider.
    pub fn with_motd(config: ServerConfig, motd: MotdProvider) -> Self {
        Self { config, motd }
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        handle.task.await?
    }

    /// Bind both listeners and start the periodic tasks. Returns the bound
    /// addresses and a handle onto the shared state (for testing and
    /// embedding).
    pub async fn start(self) -> Result<ServerHandle> {
        let client_listener = TcpListener::bind(&self.config.client_addr).await?;
        let server_listener = TcpListener::bind(&self.config.server_addr).await?;
        let client_addr = client_listener.local_addr()?;
        let server_addr = server_listener.local_addr()?;
        tracing::info!("Accepting clients on {client_addr}");
        tracing::info!("Accepting servers on {server_addr}");

        let state = Arc::new(Mutex::new(IrcState::new(&self.config, self.motd)));

        // timeout reaper
        let reap_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + REAPER_DELAY, REAPER_PERIOD);
            loop {
                ticker.tick().await;
                reap_state.lock().unwrap().reap(unix_now());
            }
        });

        // outbound connector
        let dial_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + CONNECT_DELAY, CONNECT_PERIOD);
            loop {
                ticker.tick().await;
                let targets = { dial_state.lock().unwrap().connect_targets() };
                for record in targets {
                    tracing::info!(
                        peer = %record.name,
                        addr = %record.addr(),
                        "Attempting server connection"
                    );
                    tokio::spawn(peer::connect_outbound(record, Arc::clone(&dial_state)));
                }
            }
        });

        // server-link listener
        let link_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                match server_listener.accept().await {
                    Ok((stream, _)) => {
                        link_state
                            .lock()
                            .unwrap()
                            .stats
                            .total_conns
                            .fetch_add(1, Ordering::Relaxed);
                        let st = Arc::clone(&link_state);
                        tokio::spawn(async move {
                            if let Err(e) = peer::handle_incoming(stream, st).await {
                                tracing::warn!("Server connection error: {e}");
                            }
                        });
                    }
                    Err(e) => tracing::error!("Server accept error: {e}"),
                }
            }
        });

        // client listener
        let accept_state = Arc::clone(&state);
        let task: JoinHandle<Result<()>> = tokio::spawn(async move {
            loop {
                let (stream, _addr) = client_listener.accept().await?;
                accept_state
                    .lock()
                    .unwrap()
                    .stats
                    .total_conns
                    .fetch_add(1, Ordering::Relaxed);
                let st = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    if let Err(e) = connection::handle(stream, st).await {
                        tracing::warn!("Connection error: {e}");
                    }
                });
            }
        });

        Ok(ServerHandle {
            client_addr,
            server_addr,
            state,
            task,
        })
    }
}
