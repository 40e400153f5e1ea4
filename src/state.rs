//! Shared server state and client command handling.
//!
//! All entity tables live in one `IrcState` guarded by a mutex owned by the
//! façade. A command locks the state, runs to completion, and releases the
//! lock before the next suspension point, so broadcast fan-out and netburst
//! emission see the tables in a consistent state without further guarding.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::mpsc;

use crate::channel::{BanEntry, Channel, Topic};
use crate::client::Client;
use crate::config::{RemoteServer, ServerConfig};
use crate::irc::{self, Message};
use crate::peer::{LinkState, PeerServer};
use crate::table::Table;

pub const SERVER_VERSION: &str = concat!("ircd-", env!("CARGO_PKG_VERSION"));

/// Idle seconds before the reaper pings a registered entity.
pub const IDLE_PING_SECS: u64 = 90;
/// Idle seconds before a pinged-but-silent entity is dropped.
pub const IDLE_KILL_SECS: u64 = 180;
/// Idle seconds granted to finish registration or a link handshake.
pub const UNREG_KILL_SECS: u64 = 60;

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Produces the message-of-the-day text.
pub type MotdProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Observable server counters.
#[derive(Debug, Default)]
pub struct Stats {
    pub total_conns: AtomicU64,
    pub total_users: AtomicU64,
    pub local_users: AtomicU64,
    pub max_users: AtomicU64,
    pub channels: AtomicU64,
}

/// How a state change is propagated to linked peers.
#[derive(Debug, Clone, Copy)]
pub enum Relay {
    /// Send to every local registered peer.
    All,
    /// Send to every local registered peer except the link it arrived on.
    Except(usize),
    /// Do not relay.
    None,
}

/// The entity tables and everything needed to mutate them.
pub struct IrcState {
    pub server_name: String,
    pub network_name: String,
    pub description: String,
    pub server_id: u16,
    /// One-character routing token of this server.
    pub token: char,
    pub created_ts: u64,
    pub created_string: String,
    /// Refreshed on each reaper tick; used wherever second-resolution
    /// freshness is sufficient.
    pub cheapstamp: u64,
    pub max_clients: usize,

    pub clients: Table<Client>,
    pub channels: Table<Channel>,
    pub servers: Table<PeerServer>,

    /// lowercased nick -> client handle
    nicks: HashMap<String, usize>,
    /// lowercased channel name -> channel handle
    chan_names: HashMap<String, usize>,
    /// lowercased server name -> server handle
    server_names: HashMap<String, usize>,
    /// client routing token -> client handle
    tokens: HashMap<String, usize>,

    pub remote_servers: Vec<RemoteServer>,
    pub stats: Stats,
    pub motd: MotdProvider,

    next_serial: u64,
}

impl IrcState {
    pub fn new(config: &ServerConfig, motd: MotdProvider) -> Self {
        let now = unix_now();
        let created_string = chrono::DateTime::from_timestamp(now as i64, 0)
            .map(|t| t.to_rfc2822())
            .unwrap_or_default();
        Self {
            server_name: config.server_name.clone(),
            network_name: config.network_name.clone(),
            description: config.description.clone(),
            server_id: config.server_id,
            token: config.token(),
            created_ts: now,
            created_string,
            cheapstamp: now,
            max_clients: config.max_clients,
            clients: Table::new(),
            channels: Table::new(),
            servers: Table::new(),
            nicks: HashMap::new(),
            chan_names: HashMap::new(),
            server_names: HashMap::new(),
            tokens: HashMap::new(),
            remote_servers: config.peers.clone(),
            stats: Stats::default(),
            motd,
            next_serial: 0,
        }
    }

    pub fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    // ── Lookups ──────────────────────────────────────────────────

    pub fn find_client(&self, nick: &str) -> Option<usize> {
        self.nicks.get(&nick.to_lowercase()).copied()
    }

    pub fn find_channel(&self, name: &str) -> Option<usize> {
        self.chan_names.get(&name.to_lowercase()).copied()
    }

    pub fn find_server(&self, name: &str) -> Option<usize> {
        self.server_names.get(&name.to_lowercase()).copied()
    }

    /// Resolve a client routing token.
    pub fn find_client_token(&self, token: &str) -> Option<usize> {
        self.tokens.get(token).copied()
    }

    // Index maintenance, shared with the peer-protocol handlers. The
    // handle check on removal keeps a rename-then-free from evicting a
    // newer holder of the same key.

    pub(crate) fn index_server(&mut self, name: &str, idx: usize) {
        self.server_names.insert(name.to_lowercase(), idx);
    }

    pub(crate) fn unindex_server(&mut self, idx: usize) {
        if let Some(srv) = self.servers.get(idx) {
            let lower = srv.name.to_lowercase();
            if !srv.name.is_empty() && self.server_names.get(&lower) == Some(&idx) {
                self.server_names.remove(&lower);
            }
        }
    }

    pub(crate) fn index_client_nick(&mut self, nick: &str, idx: usize) {
        self.nicks.insert(nick.to_lowercase(), idx);
    }

    pub(crate) fn unindex_client_nick(&mut self, nick_lower: &str, idx: usize) {
        if self.nicks.get(nick_lower) == Some(&idx) {
            self.nicks.remove(nick_lower);
        }
    }

    pub(crate) fn index_client_token(&mut self, token: &str, idx: usize) {
        self.tokens.insert(token.to_string(), idx);
    }

    /// Resolve a server routing token character.
    pub fn find_server_token(&self, token: char) -> Option<usize> {
        self.servers
            .iter()
            .find(|(_, s)| s.token == token && s.is_registered())
            .map(|(idx, _)| idx)
    }

    /// True while the slot still holds the same client the caller bound to.
    pub fn client_alive(&self, idx: usize, serial: u64) -> bool {
        self.clients
            .get(idx)
            .is_some_and(|c| c.serial == serial)
    }

    pub fn touch_client(&mut self, idx: usize) {
        let now = self.cheapstamp;
        if let Some(client) = self.clients.get_mut(idx) {
            client.last_activity = now;
            client.ping_sent = false;
        }
    }

    // ── Entity lifecycle ─────────────────────────────────────────

    /// Bind a freshly accepted socket to a client slot. `None` when the
    /// table is full; the caller refuses the connection.
    pub fn create_client(
        &mut self,
        queue: mpsc::Sender<Arc<str>>,
        ip: String,
    ) -> Option<(usize, u64)> {
        if self.clients.count() >= self.max_clients {
            return None;
        }
        let serial = self.next_serial();
        let now = self.cheapstamp;
        let idx = self.clients.insert(Client::local(serial, queue, ip, now));
        let token = format!("{}{}", self.token, idx);
        if let Some(client) = self.clients.get_mut(idx) {
            client.token = token.clone();
        }
        self.tokens.insert(token, idx);
        Some((idx, serial))
    }

    /// Counter bookkeeping for a client that just registered.
    pub fn new_registered_client(&self, local: bool) {
        let total = self.stats.total_users.fetch_add(1, Ordering::Relaxed) + 1;
        if local {
            self.stats.local_users.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.max_users.fetch_max(total, Ordering::Relaxed);
    }

    /// Release a client slot: leave every channel (freeing any channel
    /// emptied by the departure), drop the indexes, fix the counters.
    pub fn free_client(&mut self, idx: usize) {
        let Some(client) = self.clients.remove(idx) else {
            return;
        };
        if client.registered {
            self.stats.total_users.fetch_sub(1, Ordering::Relaxed);
            if client.is_local() {
                self.stats.local_users.fetch_sub(1, Ordering::Relaxed);
            }
        }
        if let Some(ref nick) = client.nick {
            let lower = nick.to_lowercase();
            if self.nicks.get(&lower) == Some(&idx) {
                self.nicks.remove(&lower);
            }
        }
        self.tokens.remove(&client.token);

        let mut emptied = Vec::new();
        for &ch in &client.channels {
            if let Some(channel) = self.channels.get_mut(ch) {
                channel.members.remove(&idx);
                channel.ops.remove(&idx);
                channel.voiced.remove(&idx);
                channel.invites.remove(&idx);
                if channel.members.is_empty() {
                    emptied.push(ch);
                }
            }
        }
        for ch in emptied {
            self.free_channel(ch);
        }
    }

    /// Tear down a client: quit broadcast to co-channel members, optional
    /// relay to peers, slot free.
    pub fn quit_client(&mut self, idx: usize, reason: &str, relay: Relay) {
        let Some(client) = self.clients.get(idx) else {
            return;
        };
        let mask = client.hostmask();
        let token = client.token.clone();
        let registered = client.registered;
        if registered {
            self.user_bcast_butone_raw(idx, &format!(":{mask} QUIT :{reason}\r\n"));
            self.relay(relay, &format!("{token} Q :{reason}\r\n"));
        }
        self.free_client(idx);
    }

    /// Forcibly remove a client. Local clients get an ERROR line before the
    /// quit is broadcast.
    pub fn kill_client(&mut self, idx: usize, reason: &str, relay: Relay) {
        if let Some(client) = self.clients.get(idx)
            && client.is_local()
        {
            client.send(Arc::from(format!("ERROR :Closing Link: {reason}\r\n")));
        }
        self.quit_client(idx, reason, relay);
    }

    /// Kill every client owned by the given server. Used on netsplit, so
    /// nothing is relayed per client; the SQ line covers the network.
    pub fn kill_remote_clients_on(&mut self, srv: usize, reason: &str) {
        for idx in 0..self.clients.len() {
            let on_server = self
                .clients
                .get(idx)
                .is_some_and(|c| c.server_id == Some(srv));
            if on_server {
                self.quit_client(idx, reason, Relay::None);
            }
        }
    }

    pub fn create_channel(&mut self, name: &str) -> usize {
        let idx = self
            .channels
            .insert(Channel::new(name.to_string(), self.cheapstamp));
        self.chan_names.insert(name.to_lowercase(), idx);
        self.stats.channels.fetch_add(1, Ordering::Relaxed);
        idx
    }

    pub fn free_channel(&mut self, idx: usize) {
        if let Some(channel) = self.channels.remove(idx) {
            self.chan_names.remove(&channel.name.to_lowercase());
            self.stats.channels.fetch_sub(1, Ordering::Relaxed);
        }
    }

    // ── Broadcast engine ─────────────────────────────────────────

    /// Destination set for a source client: every member of every channel
    /// the source is in. Ordered, deduplicated.
    fn bcast_targets(&self, idx: usize) -> BTreeSet<usize> {
        let mut set = BTreeSet::new();
        if let Some(client) = self.clients.get(idx) {
            for &ch in &client.channels {
                if let Some(channel) = self.channels.get(ch) {
                    set.extend(channel.members.iter().copied());
                }
            }
        }
        set
    }

    /// Share one payload across every destination queue.
    fn deliver(&self, targets: &BTreeSet<usize>, line: &str) {
        let payload: Arc<str> = Arc::from(line);
        for &idx in targets {
            if let Some(client) = self.clients.get(idx) {
                client.send(payload.clone());
            }
        }
    }

    /// Numeric broadcast to the source and everyone sharing a channel with
    /// it. Each destination receives the line exactly once.
    pub fn user_bcast(&self, idx: usize, from: &str, numeric: u16, tail: &str) {
        self.user_bcast_raw(idx, &format!(":{from} {numeric:03} {tail}\r\n"));
    }

    pub fn user_bcast_raw(&self, idx: usize, line: &str) {
        let mut targets = self.bcast_targets(idx);
        targets.insert(idx);
        self.deliver(&targets, line);
    }

    /// Same destination set as [`user_bcast`], excluding the source.
    pub fn user_bcast_butone(&self, idx: usize, from: &str, numeric: u16, tail: &str) {
        self.user_bcast_butone_raw(idx, &format!(":{from} {numeric:03} {tail}\r\n"));
    }

    pub fn user_bcast_butone_raw(&self, idx: usize, line: &str) {
        let mut targets = self.bcast_targets(idx);
        targets.remove(&idx);
        self.deliver(&targets, line);
    }

    /// Send a line to the members of one channel, optionally excluding one.
    pub fn chan_bcast(&self, ch: usize, except: Option<usize>, line: &str) {
        let Some(channel) = self.channels.get(ch) else {
            return;
        };
        let payload: Arc<str> = Arc::from(line);
        for &member in &channel.members {
            if Some(member) == except {
                continue;
            }
            if let Some(client) = self.clients.get(member) {
                client.send(payload.clone());
            }
        }
    }

    // ── Server-to-server fan-out ─────────────────────────────────

    /// Send a line to every local, registered peer link.
    pub fn sbcast(&self, line: &str) {
        let payload: Arc<str> = Arc::from(line);
        for (_, srv) in self.servers.iter() {
            if srv.is_registered() && srv.local {
                srv.send(payload.clone());
            }
        }
    }

    /// Same, excluding the link the message arrived on.
    pub fn sbcast_butone(&self, origin: usize, line: &str) {
        let payload: Arc<str> = Arc::from(line);
        for (idx, srv) in self.servers.iter() {
            if idx == origin {
                continue;
            }
            if srv.is_registered() && srv.local {
                srv.send(payload.clone());
            }
        }
    }

    pub fn relay(&self, relay: Relay, line: &str) {
        match relay {
            Relay::All => self.sbcast(line),
            Relay::Except(origin) => self.sbcast_butone(origin, line),
            Relay::None => {}
        }
    }

    /// True if the offered name/secret pair matches a configured peer.
    pub fn accept_remote_server(&self, name: &str, pass: &str) -> bool {
        self.remote_servers
            .iter()
            .any(|r| r.name == name && r.secret == pass)
    }

    /// Configured peers with no live server entity, due for a dial attempt.
    pub fn connect_targets(&self) -> Vec<RemoteServer> {
        self.remote_servers
            .iter()
            .filter(|r| self.find_server(&r.name).is_none())
            .cloned()
            .collect()
    }

    // ── Reaper ───────────────────────────────────────────────────

    /// Periodic sweep over clients and peer links. The only place where
    /// time-based liveness is observed.
    pub fn reap(&mut self, now: u64) {
        self.cheapstamp = now;

        for idx in 0..self.clients.len() {
            let Some(client) = self.clients.get(idx) else {
                continue;
            };
            if !client.is_local() {
                continue;
            }
            let idle = now.saturating_sub(client.last_activity);
            let (registered, pinged) = (client.registered, client.ping_sent);
            if pinged && idle > IDLE_KILL_SECS {
                tracing::info!(client = idx, "Ping timeout");
                self.kill_client(idx, "Ping timeout", Relay::All);
            } else if registered && !pinged && idle > IDLE_PING_SECS {
                self.send_to(idx, format!("PING :{}\r\n", self.server_name));
                if let Some(c) = self.clients.get_mut(idx) {
                    c.ping_sent = true;
                }
            } else if !registered && idle > UNREG_KILL_SECS {
                self.kill_client(idx, "Registration timeout", Relay::None);
            }
        }

        for idx in 0..self.servers.len() {
            let Some(srv) = self.servers.get(idx) else {
                continue;
            };
            if !srv.local || matches!(srv.state, LinkState::Closed) {
                continue;
            }
            let idle = now.saturating_sub(srv.last_activity);
            let (state, pinged) = (srv.state, srv.ping_sent);
            match state {
                LinkState::Registered => {
                    if pinged && idle > IDLE_KILL_SECS {
                        self.close_link(idx, "Ping timeout");
                    } else if !pinged && idle > IDLE_PING_SECS {
                        if let Some(s) = self.servers.get(idx) {
                            s.send(Arc::from(format!("PING :{}\r\n", self.server_name)));
                        }
                        if let Some(s) = self.servers.get_mut(idx) {
                            s.ping_sent = true;
                        }
                    }
                }
                LinkState::Connecting | LinkState::Unregistered => {
                    if idle > UNREG_KILL_SECS {
                        self.close_link(idx, "Handshake timeout");
                    }
                }
                LinkState::Closed => {}
            }
        }
    }

    // ── Client command handling ──────────────────────────────────

    /// Process one line from a local client. Returns true when the
    /// connection should close.
    pub fn handle_client_line(&mut self, idx: usize, line: &str) -> bool {
        let Some(msg) = Message::parse(line) else {
            return false;
        };
        tracing::trace!(client = idx, "<- {}", line.trim_end());
        let registered = self.clients.get(idx).is_some_and(|c| c.registered);

        match msg.command.as_str() {
            "NICK" => self.cmd_nick(idx, &msg),
            "USER" => self.cmd_user(idx, &msg),
            "PING" => {
                let token = msg.params.first().map(String::as_str).unwrap_or("");
                self.send_to(
                    idx,
                    format!(
                        ":{} PONG {} :{}\r\n",
                        self.server_name, self.server_name, token
                    ),
                );
            }
            "PONG" => {}
            "QUIT" => {
                let reason = msg
                    .params
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "Client quit".to_string());
                self.quit_client(idx, &reason, Relay::All);
                return true;
            }
            _ if !registered => {
                self.numeric(idx, irc::ERR_NOTREGISTERED, &["You have not registered"]);
            }
            "JOIN" => self.cmd_join(idx, &msg),
            "PART" => self.cmd_part(idx, &msg),
            "PRIVMSG" => self.cmd_privmsg(idx, &msg, false),
            "NOTICE" => self.cmd_privmsg(idx, &msg, true),
            "TOPIC" => self.cmd_topic(idx, &msg),
            "MODE" => self.cmd_mode(idx, &msg),
            "NAMES" => self.cmd_names(idx, &msg),
            "WHOIS" => self.cmd_whois(idx, &msg),
            "MOTD" => self.send_motd(idx),
            "LUSERS" => self.send_lusers(idx),
            other => {
                self.numeric(idx, irc::ERR_UNKNOWNCOMMAND, &[other, "Unknown command"]);
            }
        }
        false
    }

    fn cmd_nick(&mut self, idx: usize, msg: &Message) {
        let Some(nick) = msg.params.first() else {
            self.numeric(idx, irc::ERR_NONICKNAMEGIVEN, &["No nickname given"]);
            return;
        };
        if !valid_nick(nick) {
            self.numeric(idx, irc::ERR_ERRONEUSNICKNAME, &[nick, "Erroneous nickname"]);
            return;
        }
        let lower = nick.to_lowercase();
        if let Some(&other) = self.nicks.get(&lower)
            && other != idx
        {
            self.numeric(
                idx,
                irc::ERR_NICKNAMEINUSE,
                &[nick, "Nickname is already in use"],
            );
            return;
        }

        let Some(client) = self.clients.get(idx) else {
            return;
        };
        let registered = client.registered;
        let old_mask = client.hostmask();
        let old_lower = client.nick.as_ref().map(|n| n.to_lowercase());
        let token = client.token.clone();
        let now = self.cheapstamp;

        if let Some(old) = old_lower {
            self.nicks.remove(&old);
        }
        self.nicks.insert(lower, idx);
        if let Some(client) = self.clients.get_mut(idx) {
            client.nick = Some(nick.clone());
            client.nick_ts = now;
        }

        if registered {
            self.user_bcast_raw(idx, &format!(":{old_mask} NICK :{nick}\r\n"));
            self.sbcast(&format!("{token} N {nick} {now}\r\n"));
        } else {
            self.try_register(idx);
        }
    }

    fn cmd_user(&mut self, idx: usize, msg: &Message) {
        if msg.params.len() < 4 {
            self.numeric(idx, irc::ERR_NEEDMOREPARAMS, &["USER", "Not enough parameters"]);
            return;
        }
        let Some(client) = self.clients.get_mut(idx) else {
            return;
        };
        if client.registered {
            return;
        }
        client.user = Some(msg.params[0].clone());
        client.realname = Some(msg.params[3].clone());
        self.try_register(idx);
    }

    /// Complete registration once NICK and USER have both been accepted.
    fn try_register(&mut self, idx: usize) {
        let Some(client) = self.clients.get(idx) else {
            return;
        };
        if client.registered || client.nick.is_none() || client.user.is_none() {
            return;
        }
        let nick = client.nick.clone().unwrap_or_default();
        let user = client.user.clone().unwrap_or_default();
        let realname = client.realname.clone().unwrap_or_default();
        let host = client.host.clone();
        let ip = client.ip.clone();
        let modes = client.modes.clone();
        let token = client.token.clone();
        let nick_ts = client.nick_ts;

        if let Some(client) = self.clients.get_mut(idx) {
            client.registered = true;
        }
        self.new_registered_client(true);
        tracing::info!(client = idx, %nick, "Client registered");

        let welcome = format!("Welcome to {} {}", self.network_name, nick);
        let yourhost = format!(
            "Your host is {}, running {}",
            self.server_name, SERVER_VERSION
        );
        let created = format!("This server was created {}", self.created_string);
        self.numeric(idx, irc::RPL_WELCOME, &[&welcome]);
        self.numeric(idx, irc::RPL_YOURHOST, &[&yourhost]);
        self.numeric(idx, irc::RPL_CREATED, &[&created]);
        {
            let server_name = self.server_name.clone();
            self.numeric(
                idx,
                irc::RPL_MYINFO,
                &[&server_name, SERVER_VERSION, "i", "ntikb"],
            );
        }
        self.send_lusers(idx);
        self.send_motd(idx);

        // introduce the new user to the network
        self.sbcast(&format!(
            "{} N {} 1 {} {} {} {} {} {} :{}\r\n",
            self.token, nick, nick_ts, user, host, modes, ip, token, realname
        ));
    }

    fn cmd_join(&mut self, idx: usize, msg: &Message) {
        let Some(channels) = msg.params.first() else {
            self.numeric(idx, irc::ERR_NEEDMOREPARAMS, &["JOIN", "Not enough parameters"]);
            return;
        };
        let channels = channels.clone();
        let keys: Vec<String> = msg
            .params
            .get(1)
            .map(|k| k.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        for (i, name) in channels.split(',').enumerate() {
            self.join_channel(idx, name, keys.get(i).map(String::as_str));
        }
    }

    fn join_channel(&mut self, idx: usize, name: &str, key: Option<&str>) {
        if !is_channel_name(name) {
            self.numeric(idx, irc::ERR_NOSUCHCHANNEL, &[name, "No such channel"]);
            return;
        }
        let Some(client) = self.clients.get(idx) else {
            return;
        };
        let mask = client.hostmask();
        let token = client.token.clone();

        let existing = self.find_channel(name);
        if let Some(ch) = existing {
            let Some(channel) = self.channels.get(ch) else {
                return;
            };
            if channel.members.contains(&idx) {
                return;
            }
            if let Some(ref k) = channel.key
                && key != Some(k.as_str())
            {
                self.numeric(idx, irc::ERR_BADCHANNELKEY, &[name, "Cannot join channel (+k)"]);
                return;
            }
            if channel.is_banned(&mask) {
                self.numeric(idx, irc::ERR_BANNEDFROMCHAN, &[name, "Cannot join channel (+b)"]);
                return;
            }
            if channel.invite_only && !channel.invites.contains(&idx) {
                self.numeric(idx, irc::ERR_INVITEONLYCHAN, &[name, "Cannot join channel (+i)"]);
                return;
            }
        }

        let (ch, is_new) = match existing {
            Some(ch) => (ch, false),
            None => (self.create_channel(name), true),
        };
        let display = self
            .channels
            .get(ch)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| name.to_string());
        if let Some(channel) = self.channels.get_mut(ch) {
            channel.members.insert(idx);
            channel.invites.remove(&idx);
            if is_new {
                channel.ops.insert(idx);
            }
        }
        if let Some(client) = self.clients.get_mut(idx) {
            client.channels.insert(ch);
        }

        self.chan_bcast(ch, None, &format!(":{mask} JOIN {display}\r\n"));
        self.send_topic_numerics(idx, ch);
        self.send_names(idx, ch);
        self.sbcast(&format!("{token} J {display}\r\n"));
    }

    fn cmd_part(&mut self, idx: usize, msg: &Message) {
        let Some(channels) = msg.params.first() else {
            self.numeric(idx, irc::ERR_NEEDMOREPARAMS, &["PART", "Not enough parameters"]);
            return;
        };
        let channels = channels.clone();
        let reason = msg
            .params
            .get(1)
            .cloned()
            .unwrap_or_else(|| "Leaving".to_string());
        for name in channels.split(',') {
            self.part_channel(idx, name, &reason);
        }
    }

    fn part_channel(&mut self, idx: usize, name: &str, reason: &str) {
        let Some(ch) = self.find_channel(name) else {
            self.numeric(idx, irc::ERR_NOSUCHCHANNEL, &[name, "No such channel"]);
            return;
        };
        let is_member = self
            .channels
            .get(ch)
            .is_some_and(|c| c.members.contains(&idx));
        if !is_member {
            self.numeric(idx, irc::ERR_NOTONCHANNEL, &[name, "You're not on that channel"]);
            return;
        }
        let Some(client) = self.clients.get(idx) else {
            return;
        };
        let mask = client.hostmask();
        let token = client.token.clone();
        let display = self
            .channels
            .get(ch)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| name.to_string());

        self.chan_bcast(ch, None, &format!(":{mask} PART {display} :{reason}\r\n"));
        self.remove_member(ch, idx);
        self.sbcast(&format!("{token} L {display} :{reason}\r\n"));
    }

    /// Drop one membership edge from both sides, freeing the channel if it
    /// empties.
    pub fn remove_member(&mut self, ch: usize, idx: usize) {
        let mut empty = false;
        if let Some(channel) = self.channels.get_mut(ch) {
            channel.members.remove(&idx);
            channel.ops.remove(&idx);
            channel.voiced.remove(&idx);
            empty = channel.members.is_empty();
        }
        if let Some(client) = self.clients.get_mut(idx) {
            client.channels.remove(&ch);
        }
        if empty {
            self.free_channel(ch);
        }
    }

    fn cmd_privmsg(&mut self, idx: usize, msg: &Message, notice: bool) {
        let cmd = if notice { "NOTICE" } else { "PRIVMSG" };
        let (Some(target), Some(text)) = (msg.params.first(), msg.params.get(1)) else {
            if !notice {
                self.numeric(idx, irc::ERR_NEEDMOREPARAMS, &[cmd, "Not enough parameters"]);
            }
            return;
        };
        let (target, text) = (target.clone(), text.clone());
        let Some(client) = self.clients.get(idx) else {
            return;
        };
        let mask = client.hostmask();
        let token = client.token.clone();
        let verb = if notice { "O" } else { "P" };

        if is_channel_name(&target) {
            let Some(ch) = self.find_channel(&target) else {
                if !notice {
                    self.numeric(idx, irc::ERR_NOSUCHCHANNEL, &[&target, "No such channel"]);
                }
                return;
            };
            let Some(channel) = self.channels.get(ch) else {
                return;
            };
            let is_member = channel.members.contains(&idx);
            if channel.no_external && !is_member {
                if !notice {
                    self.numeric(
                        idx,
                        irc::ERR_CANNOTSENDTOCHAN,
                        &[&target, "Cannot send to channel"],
                    );
                }
                return;
            }
            let display = channel.name.clone();
            let line = format!(":{mask} {cmd} {display} :{text}\r\n");
            if is_member {
                self.user_bcast_butone_raw(idx, &line);
            } else {
                // an outside sender has no shared channels to fan out over
                self.chan_bcast(ch, Some(idx), &line);
            }
            self.sbcast(&format!("{token} {verb} {display} :{text}\r\n"));
        } else {
            match self.find_client(&target) {
                Some(t) => {
                    let Some(dest) = self.clients.get(t) else {
                        return;
                    };
                    if dest.is_local() {
                        let nick = dest.nick_or_star().to_string();
                        self.send_to(t, format!(":{mask} {cmd} {nick} :{text}\r\n"));
                    } else {
                        let nick = dest.nick_or_star().to_string();
                        self.sbcast(&format!("{token} {verb} {nick} :{text}\r\n"));
                    }
                }
                None => {
                    if !notice {
                        self.numeric(idx, irc::ERR_NOSUCHNICK, &[&target, "No such nick"]);
                    }
                }
            }
        }
    }

    fn cmd_topic(&mut self, idx: usize, msg: &Message) {
        let Some(name) = msg.params.first() else {
            self.numeric(idx, irc::ERR_NEEDMOREPARAMS, &["TOPIC", "Not enough parameters"]);
            return;
        };
        let name = name.clone();
        let Some(ch) = self.find_channel(&name) else {
            self.numeric(idx, irc::ERR_NOSUCHCHANNEL, &[&name, "No such channel"]);
            return;
        };
        let Some(new_topic) = msg.params.get(1).cloned() else {
            self.send_topic_query(idx, ch);
            return;
        };

        let (is_member, is_op, locked) = self
            .channels
            .get(ch)
            .map(|c| {
                (
                    c.members.contains(&idx),
                    c.ops.contains(&idx),
                    c.topic_locked,
                )
            })
            .unwrap_or((false, false, false));
        if !is_member {
            self.numeric(idx, irc::ERR_NOTONCHANNEL, &[&name, "You're not on that channel"]);
            return;
        }
        if locked && !is_op {
            self.numeric(
                idx,
                irc::ERR_CHANOPRIVSNEEDED,
                &[&name, "You're not channel operator"],
            );
            return;
        }

        let Some(client) = self.clients.get(idx) else {
            return;
        };
        let mask = client.hostmask();
        let nick = client.nick_or_star().to_string();
        let token = client.token.clone();
        let now = self.cheapstamp;
        let display = self
            .channels
            .get(ch)
            .map(|c| c.name.clone())
            .unwrap_or(name);
        if let Some(channel) = self.channels.get_mut(ch) {
            channel.topic = Some(Topic {
                text: new_topic.clone(),
                set_by: nick,
                set_at: now,
            });
        }
        self.chan_bcast(ch, None, &format!(":{mask} TOPIC {display} :{new_topic}\r\n"));
        self.sbcast(&format!("{token} T {display} :{new_topic}\r\n"));
    }

    fn send_topic_query(&self, idx: usize, ch: usize) {
        let Some(channel) = self.channels.get(ch) else {
            return;
        };
        match channel.topic {
            Some(ref topic) => {
                let set_at = topic.set_at.to_string();
                self.numeric(idx, irc::RPL_TOPIC, &[&channel.name, &topic.text]);
                self.numeric(
                    idx,
                    irc::RPL_TOPICWHOTIME,
                    &[&channel.name, &topic.set_by, &set_at],
                );
            }
            None => {
                self.numeric(idx, irc::RPL_NOTOPIC, &[&channel.name, "No topic is set"]);
            }
        }
    }

    /// 332/333 on join, nothing when no topic is set.
    fn send_topic_numerics(&self, idx: usize, ch: usize) {
        let Some(channel) = self.channels.get(ch) else {
            return;
        };
        if let Some(ref topic) = channel.topic {
            let set_at = topic.set_at.to_string();
            self.numeric(idx, irc::RPL_TOPIC, &[&channel.name, &topic.text]);
            self.numeric(
                idx,
                irc::RPL_TOPICWHOTIME,
                &[&channel.name, &topic.set_by, &set_at],
            );
        }
    }

    fn cmd_mode(&mut self, idx: usize, msg: &Message) {
        let Some(target) = msg.params.first() else {
            self.numeric(idx, irc::ERR_NEEDMOREPARAMS, &["MODE", "Not enough parameters"]);
            return;
        };
        let target = target.clone();
        if !is_channel_name(&target) {
            // user mode query stub
            self.numeric(idx, irc::RPL_UMODEIS, &["+"]);
            return;
        }
        let Some(ch) = self.find_channel(&target) else {
            self.numeric(idx, irc::ERR_NOSUCHCHANNEL, &[&target, "No such channel"]);
            return;
        };
        let Some(mode_str) = msg.params.get(1).cloned() else {
            let (display, modes, created) = match self.channels.get(ch) {
                Some(c) => (c.name.clone(), c.mode_string(), c.created_ts.to_string()),
                None => return,
            };
            self.numeric(idx, irc::RPL_CHANNELMODEIS, &[&display, &modes]);
            self.numeric(idx, irc::RPL_CREATIONTIME, &[&display, &created]);
            return;
        };
        let mode_arg = msg.params.get(2).cloned();

        // +b with no mask lists the bans
        if mode_str == "+b" && mode_arg.is_none() {
            self.send_ban_list(idx, ch);
            return;
        }

        let (is_member, is_op) = self
            .channels
            .get(ch)
            .map(|c| (c.members.contains(&idx), c.ops.contains(&idx)))
            .unwrap_or((false, false));
        if !is_member {
            self.numeric(idx, irc::ERR_NOTONCHANNEL, &[&target, "You're not on that channel"]);
            return;
        }
        if !is_op {
            self.numeric(
                idx,
                irc::ERR_CHANOPRIVSNEEDED,
                &[&target, "You're not channel operator"],
            );
            return;
        }

        let Some(client) = self.clients.get(idx) else {
            return;
        };
        let mask = client.hostmask();
        let token = client.token.clone();
        self.apply_channel_mode(ch, &mode_str, mode_arg.as_deref(), &mask, Some(idx));
        let display = self
            .channels
            .get(ch)
            .map(|c| c.name.clone())
            .unwrap_or(target);
        match mode_arg {
            Some(arg) => self.sbcast(&format!("{token} M {display} {mode_str} {arg}\r\n")),
            None => self.sbcast(&format!("{token} M {display} {mode_str}\r\n")),
        }
    }

    /// Apply a mode string to a channel and broadcast the change locally.
    /// `local_origin` enables error numerics; peer-originated changes apply
    /// silently.
    pub fn apply_channel_mode(
        &mut self,
        ch: usize,
        mode_str: &str,
        mode_arg: Option<&str>,
        source_mask: &str,
        local_origin: Option<usize>,
    ) {
        let display = match self.channels.get(ch) {
            Some(c) => c.name.clone(),
            None => return,
        };
        let now = self.cheapstamp;
        let mut adding = true;
        for mc in mode_str.chars() {
            match mc {
                '+' => adding = true,
                '-' => adding = false,
                'o' | 'v' => {
                    let Some(nick) = mode_arg else {
                        if let Some(origin) = local_origin {
                            self.numeric(
                                origin,
                                irc::ERR_NEEDMOREPARAMS,
                                &["MODE", "Not enough parameters"],
                            );
                        }
                        return;
                    };
                    let Some(t) = self.find_client(nick) else {
                        if let Some(origin) = local_origin {
                            self.numeric(origin, irc::ERR_NOSUCHNICK, &[nick, "No such nick"]);
                        }
                        return;
                    };
                    let in_channel = self
                        .channels
                        .get(ch)
                        .is_some_and(|c| c.members.contains(&t));
                    if !in_channel {
                        if let Some(origin) = local_origin {
                            self.numeric(
                                origin,
                                irc::ERR_USERNOTINCHANNEL,
                                &[nick, &display, "They aren't on that channel"],
                            );
                        }
                        return;
                    }
                    if let Some(channel) = self.channels.get_mut(ch) {
                        let set = if mc == 'o' {
                            &mut channel.ops
                        } else {
                            &mut channel.voiced
                        };
                        if adding {
                            set.insert(t);
                        } else {
                            set.remove(&t);
                        }
                    }
                    let sign = if adding { "+" } else { "-" };
                    self.chan_bcast(
                        ch,
                        None,
                        &format!(":{source_mask} MODE {display} {sign}{mc} {nick}\r\n"),
                    );
                }
                'b' => {
                    let Some(ban_mask) = mode_arg else {
                        return;
                    };
                    if let Some(channel) = self.channels.get_mut(ch) {
                        if adding {
                            if !channel.bans.iter().any(|b| b.mask == ban_mask) {
                                channel.bans.push(BanEntry::new(
                                    ban_mask.to_string(),
                                    source_mask.to_string(),
                                    now,
                                ));
                            }
                        } else {
                            channel.bans.retain(|b| b.mask != ban_mask);
                        }
                    }
                    let sign = if adding { "+" } else { "-" };
                    self.chan_bcast(
                        ch,
                        None,
                        &format!(":{source_mask} MODE {display} {sign}b {ban_mask}\r\n"),
                    );
                }
                't' | 'i' | 'n' => {
                    if let Some(channel) = self.channels.get_mut(ch) {
                        match mc {
                            't' => channel.topic_locked = adding,
                            'i' => channel.invite_only = adding,
                            _ => channel.no_external = adding,
                        }
                    }
                    let sign = if adding { "+" } else { "-" };
                    self.chan_bcast(
                        ch,
                        None,
                        &format!(":{source_mask} MODE {display} {sign}{mc}\r\n"),
                    );
                }
                'k' => {
                    if let Some(channel) = self.channels.get_mut(ch) {
                        channel.key = if adding {
                            match mode_arg {
                                Some(k) => Some(k.to_string()),
                                None => return,
                            }
                        } else {
                            None
                        };
                    }
                    let sign = if adding { "+" } else { "-" };
                    let shown = if adding { mode_arg.unwrap_or("*") } else { "*" };
                    self.chan_bcast(
                        ch,
                        None,
                        &format!(":{source_mask} MODE {display} {sign}k {shown}\r\n"),
                    );
                }
                other => {
                    if let Some(origin) = local_origin {
                        let mode = other.to_string();
                        self.numeric(
                            origin,
                            irc::ERR_UNKNOWNMODE,
                            &[&mode, "is unknown mode char to me"],
                        );
                    }
                }
            }
        }
    }

    fn send_ban_list(&self, idx: usize, ch: usize) {
        let Some(channel) = self.channels.get(ch) else {
            return;
        };
        for ban in &channel.bans {
            let set_at = ban.set_at.to_string();
            self.numeric(
                idx,
                irc::RPL_BANLIST,
                &[&channel.name, &ban.mask, &ban.set_by, &set_at],
            );
        }
        self.numeric(
            idx,
            irc::RPL_ENDOFBANLIST,
            &[&channel.name, "End of channel ban list"],
        );
    }

    fn cmd_names(&mut self, idx: usize, msg: &Message) {
        let Some(name) = msg.params.first() else {
            return;
        };
        if let Some(ch) = self.find_channel(name) {
            self.send_names(idx, ch);
        }
    }

    fn send_names(&self, idx: usize, ch: usize) {
        let Some(channel) = self.channels.get(ch) else {
            return;
        };
        let mut names = Vec::new();
        for &member in &channel.members {
            let Some(client) = self.clients.get(member) else {
                continue;
            };
            let Some(nick) = client.nick.as_deref() else {
                continue;
            };
            let prefix = if channel.ops.contains(&member) {
                "@"
            } else if channel.voiced.contains(&member) {
                "+"
            } else {
                ""
            };
            names.push(format!("{prefix}{nick}"));
        }
        let list = names.join(" ");
        self.numeric(idx, irc::RPL_NAMREPLY, &["=", &channel.name, &list]);
        self.numeric(idx, irc::RPL_ENDOFNAMES, &[&channel.name, "End of /NAMES list"]);
    }

    fn cmd_whois(&mut self, idx: usize, msg: &Message) {
        let Some(target) = msg.params.first() else {
            self.numeric(idx, irc::ERR_NONICKNAMEGIVEN, &["No nickname given"]);
            return;
        };
        let target = target.clone();
        match self.find_client(&target) {
            Some(t) => {
                let Some(dest) = self.clients.get(t) else {
                    return;
                };
                let nick = dest.nick_or_star().to_string();
                let user = dest.user.clone().unwrap_or_default();
                let host = dest.host.clone();
                let realname = dest.realname.clone().unwrap_or_default();
                let (srv_name, srv_desc) = match dest.server_id {
                    None => (self.server_name.clone(), self.description.clone()),
                    Some(s) => match self.servers.get(s) {
                        Some(srv) => (srv.name.clone(), srv.desc.clone()),
                        None => (self.server_name.clone(), self.description.clone()),
                    },
                };
                self.numeric(
                    idx,
                    irc::RPL_WHOISUSER,
                    &[&nick, &user, &host, "*", &realname],
                );
                self.numeric(idx, irc::RPL_WHOISSERVER, &[&nick, &srv_name, &srv_desc]);
                self.numeric(idx, irc::RPL_ENDOFWHOIS, &[&nick, "End of /WHOIS list"]);
            }
            None => {
                self.numeric(idx, irc::ERR_NOSUCHNICK, &[&target, "No such nick"]);
                self.numeric(idx, irc::RPL_ENDOFWHOIS, &[&target, "End of /WHOIS list"]);
            }
        }
    }

    fn send_motd(&self, idx: usize) {
        let header = format!("- {} Message of the day -", self.server_name);
        self.numeric(idx, irc::RPL_MOTDSTART, &[&header]);
        let text = (self.motd)();
        for line in text.lines() {
            let line = format!("- {line}");
            self.numeric(idx, irc::RPL_MOTD, &[&line]);
        }
        self.numeric(idx, irc::RPL_ENDOFMOTD, &["End of /MOTD command"]);
    }

    fn send_lusers(&self, idx: usize) {
        let total = self.stats.total_users.load(Ordering::Relaxed);
        let local = self.stats.local_users.load(Ordering::Relaxed);
        let max = self.stats.max_users.load(Ordering::Relaxed);
        let channels = self.stats.channels.load(Ordering::Relaxed);
        let links = self
            .servers
            .iter()
            .filter(|(_, s)| s.is_registered())
            .count();

        let lusers = format!("There are {} users on {} servers", total, links + 1);
        self.numeric(idx, irc::RPL_LUSERCLIENT, &[&lusers]);
        let nchans = channels.to_string();
        self.numeric(idx, irc::RPL_LUSERCHANNELS, &[&nchans, "channels formed"]);
        let me = format!("I have {local} clients and {links} servers");
        self.numeric(idx, irc::RPL_LUSERME, &[&me]);
        let lstr = local.to_string();
        let cur = format!("Current local users {local}, max {max}");
        self.numeric(idx, irc::RPL_LOCALUSERS, &[&lstr, &max.to_string(), &cur]);
        let tstr = total.to_string();
        let glob = format!("Current global users {total}, max {max}");
        self.numeric(idx, irc::RPL_GLOBALUSERS, &[&tstr, &max.to_string(), &glob]);
    }

    // ── Send helpers ─────────────────────────────────────────────

    pub fn send_to(&self, idx: usize, line: String) {
        if let Some(client) = self.clients.get(idx) {
            client.send(Arc::from(line));
        }
    }

    /// Numeric reply to one client; the client's nick is prepended as the
    /// first parameter per RFC 1459.
    pub fn numeric(&self, idx: usize, code: &str, params: &[&str]) {
        let Some(client) = self.clients.get(idx) else {
            return;
        };
        let nick = client.nick_or_star().to_string();
        let mut all: Vec<&str> = Vec::with_capacity(params.len() + 1);
        all.push(&nick);
        all.extend_from_slice(params);
        let reply = Message::from_server(&self.server_name, code, all);
        client.send(Arc::from(format!("{reply}\r\n")));
    }
}

/// RFC 1459 nickname shape, length-capped.
pub fn valid_nick(nick: &str) -> bool {
    if nick.is_empty() || nick.len() > 30 {
        return false;
    }
    let mut chars = nick.chars();
    let first = chars.next().unwrap_or(' ');
    if !(first.is_ascii_alphabetic() || "[]\\`_^{|}".contains(first)) {
        return false;
    }
    nick.chars()
        .all(|c| c.is_ascii_alphanumeric() || "[]\\`_^{|}-".contains(c))
}

pub fn is_channel_name(name: &str) -> bool {
    name.starts_with('#') || name.starts_with('&')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    fn test_state() -> IrcState {
        let config = ServerConfig::default();
        IrcState::new(&config, Arc::new(|| "test motd".to_string()))
    }

    /// Create and register a local client, returning its handle and the
    /// receiving end of its queue.
    fn add_client(st: &mut IrcState, nick: &str) -> (usize, Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(256);
        let (idx, _serial) = st.create_client(tx, "127.0.0.1".to_string()).unwrap();
        st.handle_client_line(idx, &format!("NICK {nick}\r\n"));
        st.handle_client_line(idx, &format!("USER {nick} 0 * :{nick} real\r\n"));
        (idx, rx)
    }

    /// Link a peer over a fake queue: configure the record, run the
    /// PASS/SERVER exchange, return the handle and the queue end (which
    /// holds our handshake reply and the netburst).
    fn link_peer(st: &mut IrcState, name: &str, token: char) -> (usize, Receiver<Arc<str>>) {
        st.remote_servers.push(RemoteServer {
            name: name.to_string(),
            secret: "sekrit".to_string(),
            address: "127.0.0.1".to_string(),
            port: 9,
        });
        let (tx, rx) = mpsc::channel(256);
        let (sidx, _serial) = st.create_peer_inbound(tx);
        st.handle_peer_line(sidx, "PASS :sekrit\r\n");
        st.handle_peer_line(
            sidx,
            &format!("SERVER {name} 1 1000 2000 J10 {token} :{name} server\r\n"),
        );
        (sidx, rx)
    }

    fn drain(rx: &mut Receiver<Arc<str>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line.to_string());
        }
        out
    }

    #[test]
    fn membership_is_reciprocal() {
        let mut st = test_state();
        let (a, _rx_a) = add_client(&mut st, "alice");
        let (b, _rx_b) = add_client(&mut st, "bob");
        st.handle_client_line(a, "JOIN #x\r\n");
        st.handle_client_line(b, "JOIN #x\r\n");

        let ch = st.find_channel("#x").unwrap();
        for idx in [a, b] {
            assert!(st.clients.get(idx).unwrap().channels.contains(&ch));
            assert!(st.channels.get(ch).unwrap().members.contains(&idx));
        }

        st.handle_client_line(b, "PART #x\r\n");
        assert!(!st.channels.get(ch).unwrap().members.contains(&b));
        assert!(!st.clients.get(b).unwrap().channels.contains(&ch));
    }

    #[test]
    fn channel_freed_when_last_member_leaves() {
        let mut st = test_state();
        let (a, _rx) = add_client(&mut st, "alice");
        st.handle_client_line(a, "JOIN #x\r\n");
        assert_eq!(st.stats.channels.load(Ordering::Relaxed), 1);

        st.handle_client_line(a, "PART #x\r\n");
        assert!(st.find_channel("#x").is_none());
        assert_eq!(st.stats.channels.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn quit_frees_client_and_emptied_channels() {
        let mut st = test_state();
        let (a, _rx_a) = add_client(&mut st, "alice");
        let (b, _rx_b) = add_client(&mut st, "bob");
        st.handle_client_line(a, "JOIN #x\r\n");
        st.handle_client_line(b, "JOIN #x\r\n");
        let ch = st.find_channel("#x").unwrap();

        st.quit_client(a, "bye", Relay::All);
        assert!(st.find_client("alice").is_none());
        assert!(st.channels.get(ch).unwrap().members.contains(&b));

        st.quit_client(b, "bye", Relay::All);
        assert!(st.find_channel("#x").is_none());
    }

    #[test]
    fn broadcast_dedups_across_shared_channels() {
        let mut st = test_state();
        let (a, _rx_a) = add_client(&mut st, "alice");
        let (b, mut rx_b) = add_client(&mut st, "bob");
        for line in ["JOIN #x\r\n", "JOIN #y\r\n"] {
            st.handle_client_line(a, line);
            st.handle_client_line(b, line);
        }
        drain(&mut rx_b);

        st.handle_client_line(a, "NICK alice2\r\n");
        let lines = drain(&mut rx_b);
        let nicks: Vec<&String> = lines.iter().filter(|l| l.contains(" NICK ")).collect();
        assert_eq!(nicks.len(), 1, "one NICK line despite two shared channels");
        assert!(nicks[0].starts_with(":alice!"));
        assert!(nicks[0].contains(":alice2"));
    }

    #[test]
    fn privmsg_excludes_the_source() {
        let mut st = test_state();
        let (a, mut rx_a) = add_client(&mut st, "alice");
        let (b, mut rx_b) = add_client(&mut st, "bob");
        let (c, mut rx_c) = add_client(&mut st, "carol");
        for idx in [a, b, c] {
            st.handle_client_line(idx, "JOIN #x\r\n");
        }
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        st.handle_client_line(a, "PRIVMSG #x :hi\r\n");
        for rx in [&mut rx_b, &mut rx_c] {
            let lines = drain(rx);
            let msgs: Vec<&String> = lines.iter().filter(|l| l.contains("PRIVMSG")).collect();
            assert_eq!(msgs.len(), 1);
            assert!(msgs[0].contains("PRIVMSG #x :hi"));
        }
        assert!(drain(&mut rx_a).iter().all(|l| !l.contains("PRIVMSG")));
    }

    #[test]
    fn privmsg_fans_out_over_every_shared_channel_once() {
        let mut st = test_state();
        let (a, mut rx_a) = add_client(&mut st, "alice");
        let (b, mut rx_b) = add_client(&mut st, "bob");
        let (c, mut rx_c) = add_client(&mut st, "carol");
        // alice and bob share two channels; carol shares only #y
        for line in ["JOIN #x\r\n", "JOIN #y\r\n"] {
            st.handle_client_line(a, line);
            st.handle_client_line(b, line);
        }
        st.handle_client_line(c, "JOIN #y\r\n");
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        st.handle_client_line(a, "PRIVMSG #x :over here\r\n");
        for rx in [&mut rx_b, &mut rx_c] {
            let lines = drain(rx);
            let msgs: Vec<&String> = lines.iter().filter(|l| l.contains("PRIVMSG")).collect();
            assert_eq!(msgs.len(), 1, "every co-channel member hears it once");
            assert!(msgs[0].contains("PRIVMSG #x :over here"));
        }
        assert!(drain(&mut rx_a).iter().all(|l| !l.contains("PRIVMSG")));
    }

    #[test]
    fn numeric_bcast_is_zero_padded_and_reaches_everyone_once() {
        let mut st = test_state();
        let (a, mut rx_a) = add_client(&mut st, "alice");
        let (b, mut rx_b) = add_client(&mut st, "bob");
        st.handle_client_line(a, "JOIN #x\r\n");
        st.handle_client_line(b, "JOIN #x\r\n");
        drain(&mut rx_a);
        drain(&mut rx_b);

        st.user_bcast(a, "irc.local", 42, "alice :testing");
        for rx in [&mut rx_a, &mut rx_b] {
            let lines = drain(rx);
            assert_eq!(lines.len(), 1);
            assert_eq!(lines[0], ":irc.local 042 alice :testing\r\n");
        }
    }

    #[test]
    fn counters_stay_ordered() {
        let mut st = test_state();
        let check = |st: &IrcState| {
            let local = st.stats.local_users.load(Ordering::Relaxed);
            let total = st.stats.total_users.load(Ordering::Relaxed);
            let max = st.stats.max_users.load(Ordering::Relaxed);
            assert!(local <= total, "local {local} > total {total}");
            assert!(total <= max, "total {total} > max {max}");
        };
        check(&st);
        let (a, _rx_a) = add_client(&mut st, "alice");
        check(&st);
        let (_b, _rx_b) = add_client(&mut st, "bob");
        check(&st);
        st.quit_client(a, "bye", Relay::All);
        check(&st);
        assert_eq!(st.stats.max_users.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn peer_handshake_and_burst_ordering() {
        let mut st = test_state();
        let (a, _rx_a) = add_client(&mut st, "alice");
        let (b, _rx_b) = add_client(&mut st, "bob");
        st.handle_client_line(a, "JOIN #x\r\n");
        st.handle_client_line(b, "JOIN #x\r\n");
        st.handle_client_line(a, "TOPIC #x :burst me\r\n");
        st.handle_client_line(a, "JOIN #y\r\n");

        let (_sidx, mut rx) = link_peer(&mut st, "hub", 'H');
        let lines = drain(&mut rx);

        assert!(lines[0].starts_with("PASS :"), "handshake precedes burst");
        assert!(lines[1].starts_with("SERVER irc.local 1 "));

        let kind = |l: &String| -> Option<usize> {
            let words: Vec<&str> = l.split_whitespace().collect();
            if l.starts_with("EB") {
                return Some(4);
            }
            if l.starts_with("C ") {
                return Some(3);
            }
            match words.get(1) {
                Some(&"S") => Some(1),
                Some(&"N") => Some(2),
                Some(&"B") => Some(3),
                _ => None,
            }
        };
        let burst: Vec<usize> = lines[2..].iter().filter_map(kind).collect();
        assert!(
            burst.windows(2).all(|w| w[0] <= w[1]),
            "servers before clients before channels before EB: {lines:?}"
        );
        assert_eq!(burst.iter().filter(|&&k| k == 1).count(), 1, "one S line");
        assert_eq!(burst.iter().filter(|&&k| k == 2).count(), 2, "two N lines");
        assert_eq!(burst.iter().filter(|&&k| k == 3).count(), 2, "two channel lines");
        assert_eq!(burst.last(), Some(&4), "terminated by EB");
        assert!(lines.iter().any(|l| l.contains(" B #x ")));
        assert!(lines.iter().any(|l| l.starts_with("C #y ")));
    }

    #[test]
    fn peer_fanout_excludes_origin() {
        let mut st = test_state();
        let (p1, mut rx1) = link_peer(&mut st, "hub1", 'H');
        let (_p2, mut rx2) = link_peer(&mut st, "hub2", 'I');
        drain(&mut rx1);
        drain(&mut rx2);

        st.sbcast_butone(p1, "X relay\r\n");
        assert!(drain(&mut rx1).is_empty(), "origin link is excluded");
        assert_eq!(drain(&mut rx2), vec!["X relay\r\n"]);

        st.sbcast("Y relay\r\n");
        assert_eq!(drain(&mut rx1), vec!["Y relay\r\n"]);
        assert_eq!(drain(&mut rx2), vec!["Y relay\r\n"]);
    }

    #[test]
    fn bad_peer_credentials_close_the_link() {
        let mut st = test_state();
        st.remote_servers.push(RemoteServer {
            name: "hub".to_string(),
            secret: "sekrit".to_string(),
            address: "127.0.0.1".to_string(),
            port: 9,
        });
        let (tx, mut rx) = mpsc::channel(64);
        let (sidx, serial) = st.create_peer_inbound(tx);
        st.handle_peer_line(sidx, "PASS :wrong\r\n");
        let close = st.handle_peer_line(sidx, "SERVER hub 1 1000 2000 J10 H :hub\r\n");
        assert!(close);
        assert!(!st.peer_alive(sidx, serial));
        let lines = drain(&mut rx);
        assert_eq!(lines, vec!["ERROR :Access denied\r\n"]);
        assert!(st.find_server("hub").is_none());
    }

    #[test]
    fn netsplit_kills_exactly_the_remote_clients() {
        let mut st = test_state();
        let (a, _rx_a) = add_client(&mut st, "alice");
        st.handle_client_line(a, "JOIN #s\r\n");
        let (sidx, mut rx) = link_peer(&mut st, "hub", 'H');
        for i in 0..5 {
            st.handle_peer_line(
                sidx,
                &format!("H N rem{i} 2 100 u host + 0.0.0.0 H{i} :remote {i}\r\n"),
            );
        }
        st.handle_peer_line(sidx, "H0 J #s\r\n");
        drain(&mut rx);

        assert_eq!(st.stats.total_users.load(Ordering::Relaxed), 6);
        assert_eq!(st.stats.local_users.load(Ordering::Relaxed), 1);

        st.close_link(sidx, "read error");
        assert_eq!(st.stats.total_users.load(Ordering::Relaxed), 1);
        assert_eq!(st.stats.local_users.load(Ordering::Relaxed), 1);
        assert!(st.find_server("hub").is_none());
        assert!(st.find_client("rem0").is_none());
        // the co-channel local client saw the netsplit quit
        assert!(st.clients.get(a).is_some());
    }

    #[test]
    fn nick_collision_older_wins() {
        let mut st = test_state();
        let (_dupe, mut rx_dupe) = add_client(&mut st, "dupe");
        let (sidx, mut rx_peer) = link_peer(&mut st, "hub", 'H');
        drain(&mut rx_peer);

        // incoming introduction is older: the local client loses
        st.handle_peer_line(sidx, "H N dupe 2 1 u host + 0.0.0.0 H0 :remote\r\n");
        let remote = st.find_client("dupe").unwrap();
        assert!(
            st.clients.get(remote).unwrap().server_id.is_some(),
            "nick now owned by the remote client"
        );
        assert_eq!(st.stats.local_users.load(Ordering::Relaxed), 0);
        let lines = drain(&mut rx_dupe);
        assert!(
            lines.iter().any(|l| l.contains("Nick collision")),
            "collision reason delivered: {lines:?}"
        );
    }

    #[test]
    fn nick_collision_newer_introduction_is_dropped() {
        let mut st = test_state();
        let (keeper, _rx) = add_client(&mut st, "keeper");
        let (sidx, mut rx_peer) = link_peer(&mut st, "hub", 'H');
        drain(&mut rx_peer);

        st.handle_peer_line(sidx, "H N keeper 2 9999999999 u host + 0.0.0.0 H7 :late\r\n");
        assert_eq!(st.find_client("keeper"), Some(keeper), "older local nick survives");
        let lines = drain(&mut rx_peer);
        assert!(
            lines.iter().any(|l| l.starts_with("H7 Q :")),
            "announcing link told to drop the loser: {lines:?}"
        );
    }

    #[test]
    fn reaper_pings_then_kills() {
        let mut st = test_state();
        let (a, mut rx) = add_client(&mut st, "alice");
        drain(&mut rx);
        let now = st.cheapstamp;

        if let Some(c) = st.clients.get_mut(a) {
            c.last_activity = now - IDLE_PING_SECS - 1;
        }
        st.reap(now);
        let lines = drain(&mut rx);
        assert!(lines.iter().any(|l| l.starts_with("PING :")));
        assert!(st.clients.get(a).unwrap().ping_sent);

        st.reap(now + IDLE_KILL_SECS + 1);
        assert!(st.clients.get(a).is_none(), "silent client reaped");
        let lines = drain(&mut rx);
        assert!(lines.iter().any(|l| l.contains("Ping timeout")));
    }

    #[test]
    fn connector_targets_only_unlinked_records() {
        let mut st = test_state();
        st.remote_servers.push(RemoteServer {
            name: "hub".to_string(),
            secret: "s".to_string(),
            address: "127.0.0.1".to_string(),
            port: 4400,
        });
        assert_eq!(st.connect_targets().len(), 1);
        let _ = st.create_peer_outbound("hub").unwrap();
        assert!(st.connect_targets().is_empty(), "dial in flight suppresses retries");
    }

    #[test]
    fn full_client_table_refuses_creation() {
        let config = ServerConfig {
            max_clients: 1,
            ..ServerConfig::default()
        };
        let mut st = IrcState::new(&config, Arc::new(|| String::new()));
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        assert!(st.create_client(tx1, "127.0.0.1".into()).is_some());
        assert!(st.create_client(tx2, "127.0.0.1".into()).is_none());
    }

    #[test]
    fn nick_in_use_is_rejected() {
        let mut st = test_state();
        let (_a, _rx_a) = add_client(&mut st, "alice");
        let (tx, mut rx) = mpsc::channel(64);
        let (b, _serial) = st.create_client(tx, "127.0.0.1".into()).unwrap();
        st.handle_client_line(b, "NICK alice\r\n");
        let lines = drain(&mut rx);
        assert!(lines.iter().any(|l| l.contains(" 433 ")));
        assert!(st.clients.get(b).unwrap().nick.is_none());
    }
}
