//! Client entities.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

/// A user connection, local or learned from a linked server.
///
/// Local clients carry a writer queue; remote clients are bookkeeping
/// entries whose traffic is relayed over the owning server's link.
#[derive(Debug)]
pub struct Client {
    /// Distinguishes this occupant from earlier users of a reused slot.
    /// Liveness itself is slot occupancy; a freed client is simply gone
    /// from the table.
    pub serial: u64,
    /// NICK and USER both accepted (or introduced over a link).
    pub registered: bool,
    pub nick: Option<String>,
    pub user: Option<String>,
    pub host: String,
    pub realname: Option<String>,
    pub ip: String,
    /// User mode string, "+" when no modes are set.
    pub modes: String,
    /// Timestamp the current nick was taken; collision resolution favors
    /// the older value.
    pub nick_ts: u64,
    /// Owning server handle. `None` means the client resides on this server.
    pub server_id: Option<usize>,
    /// Network-unique routing token: owner server token + client handle.
    pub token: String,
    /// Channel handles the client has joined. Ordered for deterministic
    /// broadcast fan-out.
    pub channels: BTreeSet<usize>,
    /// Writer queue; present only for local clients.
    pub queue: Option<mpsc::Sender<Arc<str>>>,
    pub last_activity: u64,
    pub ping_sent: bool,
}

impl Client {
    /// A freshly accepted, unregistered local connection.
    pub fn local(serial: u64, queue: mpsc::Sender<Arc<str>>, ip: String, now: u64) -> Self {
        Self {
            serial,
            registered: false,
            nick: None,
            user: None,
            host: ip.clone(),
            realname: None,
            ip,
            modes: "+".to_string(),
            nick_ts: now,
            server_id: None,
            token: String::new(),
            channels: BTreeSet::new(),
            queue: Some(queue),
            last_activity: now,
            ping_sent: false,
        }
    }

    /// A client introduced over a server link.
    #[allow(clippy::too_many_arguments)]
    pub fn remote(
        serial: u64,
        server_id: usize,
        nick: String,
        user: String,
        host: String,
        ip: String,
        modes: String,
        realname: String,
        token: String,
        nick_ts: u64,
        now: u64,
    ) -> Self {
        Self {
            serial,
            registered: true,
            nick: Some(nick),
            user: Some(user),
            host,
            realname: Some(realname),
            ip,
            modes,
            nick_ts,
            server_id: Some(server_id),
            token,
            channels: BTreeSet::new(),
            queue: None,
            last_activity: now,
            ping_sent: false,
        }
    }

    pub fn is_local(&self) -> bool {
        self.server_id.is_none()
    }

    pub fn nick_or_star(&self) -> &str {
        self.nick.as_deref().unwrap_or("*")
    }

    /// `nick!user@host` source prefix.
    pub fn hostmask(&self) -> String {
        format!(
            "{}!{}@{}",
            self.nick_or_star(),
            self.user.as_deref().unwrap_or("~u"),
            self.host
        )
    }

    /// Enqueue a line for delivery. No-op for remote clients; a full or
    /// closed queue drops the line and the transport cleans up later.
    pub fn send(&self, line: Arc<str>) {
        if let Some(ref queue) = self.queue {
            let _ = queue.try_send(line);
        }
    }
}
