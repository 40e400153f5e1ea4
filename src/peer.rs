//! Server-to-server links.
//!
//! Peers connect over plain TCP and speak a compact token protocol: a
//! PASS/SERVER handshake authenticated against the configured remote
//! server records, a netburst describing the local view of the network,
//! then steady-state relaying. A one-character line prefix addresses a
//! server; a longer prefix addresses a client of that server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::burst;
use crate::channel::{Channel, Topic};
use crate::client::Client;
use crate::config::RemoteServer;
use crate::state::{IrcState, Relay, is_channel_name};

/// Line-read poll interval; liveness against the state is rechecked at
/// least this often.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Outbound connect in flight.
    Connecting,
    /// Socket up, PASS/SERVER exchange not complete.
    Unregistered,
    /// Link live, normal relay.
    Registered,
    /// Terminal.
    Closed,
}

/// Another IRC daemon linked into the network, directly or through a peer.
#[derive(Debug)]
pub struct PeerServer {
    /// Distinguishes this occupant from earlier users of a reused slot.
    pub serial: u64,
    pub state: LinkState,
    pub name: String,
    /// One-character routing token, unique across the network.
    pub token: char,
    pub desc: String,
    /// 1 for a directly connected peer, advertised+1 for learned servers.
    pub hops: u32,
    pub boot_ts: u64,
    pub link_ts: u64,
    /// True when we hold the socket for this link.
    pub local: bool,
    /// For learned servers, the local link they were introduced on.
    pub via: Option<usize>,
    pub queue: Option<mpsc::Sender<Arc<str>>>,
    pub last_activity: u64,
    pub ping_sent: bool,
    /// PASS credentials received, waiting for SERVER.
    pub pass: Option<String>,
    /// Our own PASS/SERVER pair has gone out on this link.
    pub handshake_sent: bool,
    /// The peer has finished its burst (EB seen).
    pub burst_done: bool,
}

impl PeerServer {
    /// An accepted link: socket up, nothing known yet.
    pub fn inbound(serial: u64, queue: mpsc::Sender<Arc<str>>, now: u64) -> Self {
        Self {
            serial,
            state: LinkState::Unregistered,
            name: String::new(),
            token: '?',
            desc: String::new(),
            hops: 1,
            boot_ts: 0,
            link_ts: 0,
            local: true,
            via: None,
            queue: Some(queue),
            last_activity: now,
            ping_sent: false,
            pass: None,
            handshake_sent: false,
            burst_done: false,
        }
    }

    /// An outbound dial in flight.
    pub fn outbound(serial: u64, name: String, now: u64) -> Self {
        Self {
            serial,
            state: LinkState::Connecting,
            name,
            token: '?',
            desc: String::new(),
            hops: 1,
            boot_ts: 0,
            link_ts: 0,
            local: true,
            via: None,
            queue: None,
            last_activity: now,
            ping_sent: false,
            pass: None,
            handshake_sent: false,
            burst_done: false,
        }
    }

    /// A server learned from a peer's burst; no socket of our own.
    #[allow(clippy::too_many_arguments)]
    pub fn learned(
        serial: u64,
        name: String,
        token: char,
        desc: String,
        hops: u32,
        boot_ts: u64,
        link_ts: u64,
        via: usize,
        now: u64,
    ) -> Self {
        Self {
            serial,
            state: LinkState::Registered,
            name,
            token,
            desc,
            hops,
            boot_ts,
            link_ts,
            local: false,
            via: Some(via),
            queue: None,
            last_activity: now,
            ping_sent: false,
            pass: None,
            handshake_sent: true,
            burst_done: true,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.state == LinkState::Registered
    }

    /// Enqueue a line on this link. No-op for remote servers.
    pub fn send(&self, line: Arc<str>) {
        if let Some(ref queue) = self.queue {
            let _ = queue.try_send(line);
        }
    }
}

impl IrcState {
    pub fn create_peer_inbound(&mut self, queue: mpsc::Sender<Arc<str>>) -> (usize, u64) {
        let serial = self.next_serial();
        let now = self.cheapstamp;
        let idx = self.servers.insert(PeerServer::inbound(serial, queue, now));
        (idx, serial)
    }

    /// Reserve a slot for an outbound dial. `None` when a server by that
    /// name already exists, so the connector makes one attempt per tick.
    pub fn create_peer_outbound(&mut self, name: &str) -> Option<(usize, u64)> {
        if self.find_server(name).is_some() {
            return None;
        }
        let serial = self.next_serial();
        let now = self.cheapstamp;
        let idx = self
            .servers
            .insert(PeerServer::outbound(serial, name.to_string(), now));
        self.index_server(name, idx);
        Some((idx, serial))
    }

    /// True while the slot still holds the same link the caller bound to.
    pub fn peer_alive(&self, idx: usize, serial: u64) -> bool {
        self.servers
            .get(idx)
            .is_some_and(|s| s.serial == serial && s.state != LinkState::Closed)
    }

    /// Socket established for an outbound link: attach the writer and send
    /// our side of the handshake.
    pub fn attach_outbound(&mut self, idx: usize, queue: mpsc::Sender<Arc<str>>, record: &RemoteServer) {
        let now = self.cheapstamp;
        if let Some(srv) = self.servers.get_mut(idx) {
            srv.queue = Some(queue);
            srv.state = LinkState::Unregistered;
            srv.last_activity = now;
            srv.handshake_sent = true;
        }
        self.send_handshake(idx, &record.secret);
    }

    fn send_handshake(&self, idx: usize, secret: &str) {
        let Some(srv) = self.servers.get(idx) else {
            return;
        };
        srv.send(Arc::from(format!("PASS :{secret}\r\n")));
        srv.send(Arc::from(format!(
            "SERVER {} 1 {} {} J10 {} :{}\r\n",
            self.server_name, self.created_ts, self.cheapstamp, self.token, self.description
        )));
    }

    /// Process one line from a peer link. Returns true when the link must
    /// close.
    pub fn handle_peer_line(&mut self, sidx: usize, line: &str) -> bool {
        let words = split_tokens(line);
        if words.is_empty() {
            return false;
        }
        let now = self.cheapstamp;
        if let Some(srv) = self.servers.get_mut(sidx) {
            srv.last_activity = now;
            srv.ping_sent = false;
        }
        tracing::trace!(peer = sidx, "<- {}", line.trim_end());

        match words[0].as_str() {
            "PASS" => {
                if let Some(srv) = self.servers.get_mut(sidx) {
                    srv.pass = words.get(1).cloned();
                }
                false
            }
            "SERVER" => self.peer_register(sidx, &words),
            "PING" => {
                let token = words.get(1).cloned().unwrap_or_default();
                if let Some(srv) = self.servers.get(sidx) {
                    srv.send(Arc::from(format!("PONG :{token}\r\n")));
                }
                false
            }
            "PONG" => false,
            "ERROR" => {
                let detail = words.get(1).cloned().unwrap_or_default();
                tracing::warn!(peer = sidx, "Peer error: {detail}");
                self.close_link(sidx, "Remote error");
                true
            }
            "EB" => {
                if let Some(srv) = self.servers.get_mut(sidx) {
                    srv.burst_done = true;
                }
                tracing::debug!(peer = sidx, "End of burst");
                false
            }
            // A bare C is a channel-burst line; the name argument tells it
            // apart from a server whose token is 'C'.
            "C" if words.get(1).is_some_and(|n| is_channel_name(n)) => {
                self.burst_channel(sidx, &words);
                false
            }
            first => {
                if words.len() < 2 {
                    return false;
                }
                let origin = first.to_string();
                let verb = words[1].clone();
                if origin.len() == 1 {
                    let token = origin.chars().next().unwrap_or('?');
                    self.server_origin_cmd(sidx, token, &verb, &words[2..])
                } else {
                    self.client_origin_cmd(sidx, &origin, &verb, &words[2..])
                }
            }
        }
    }

    /// SERVER received: authenticate against the configured records and
    /// bring the link up. The offered name/secret pair must match a
    /// record; a mismatch closes the link without saying which field
    /// failed.
    fn peer_register(&mut self, sidx: usize, words: &[String]) -> bool {
        // SERVER <name> <hops> <boot_ts> <link_ts> <proto> <token> :<desc>
        if words.len() < 7 {
            return self.reject_link(sidx, "Malformed SERVER");
        }
        let name = words[1].clone();
        let boot_ts: u64 = words[3].parse().unwrap_or(0);
        let token = words[6].chars().next().unwrap_or('?');
        let desc = words.get(7).cloned().unwrap_or_default();

        let (registered, offered_pass) = match self.servers.get(sidx) {
            Some(srv) => (srv.is_registered(), srv.pass.clone()),
            None => return true,
        };
        if registered {
            return false;
        }
        let Some(pass) = offered_pass else {
            return self.reject_link(sidx, "Access denied");
        };
        if !self.accept_remote_server(&name, &pass) {
            tracing::warn!(peer = %name, "Server authentication failed");
            return self.reject_link(sidx, "Access denied");
        }
        if name.eq_ignore_ascii_case(&self.server_name)
            || self.find_server_token(token).is_some()
        {
            return self.reject_link(sidx, "Access denied");
        }
        if let Some(other) = self.find_server(&name)
            && other != sidx
        {
            // a dial of ours racing the same peer's inbound link; the
            // authenticated side wins
            let other_unregistered = self.servers.get(other).is_some_and(|s| !s.is_registered());
            if other_unregistered {
                self.close_link(other, "Link collision");
            } else {
                return self.reject_link(sidx, "Access denied");
            }
        }

        let now = self.cheapstamp;
        let need_handshake = {
            let Some(srv) = self.servers.get_mut(sidx) else {
                return true;
            };
            srv.name = name.clone();
            srv.token = token;
            srv.desc = desc;
            srv.hops = 1;
            srv.boot_ts = boot_ts;
            srv.link_ts = now;
            srv.state = LinkState::Registered;
            srv.pass = None;
            !srv.handshake_sent
        };
        self.index_server(&name, sidx);
        if need_handshake {
            let secret = self
                .remote_servers
                .iter()
                .find(|r| r.name == name)
                .map(|r| r.secret.clone())
                .unwrap_or_default();
            if let Some(srv) = self.servers.get_mut(sidx) {
                srv.handshake_sent = true;
            }
            self.send_handshake(sidx, &secret);
        }
        tracing::info!(peer = %name, "Server link registered");

        burst::netburst(self, sidx);

        let intro = match self.servers.get(sidx) {
            Some(srv) => format!(
                "{} S {} {} {} {} J10 {} :{}\r\n",
                self.token, srv.name, srv.hops, srv.boot_ts, srv.link_ts, srv.token, srv.desc
            ),
            None => return true,
        };
        self.sbcast_butone(sidx, &intro);
        false
    }

    /// Close an unwanted link with a generic error line.
    fn reject_link(&mut self, sidx: usize, why: &str) -> bool {
        if let Some(srv) = self.servers.get(sidx) {
            srv.send(Arc::from(format!("ERROR :{why}\r\n")));
        }
        self.close_link(sidx, why);
        true
    }

    /// Tear down a link. For a registered local link this is a netsplit:
    /// every client reachable through it is killed before the server
    /// entities are freed, so the quit broadcasts can still resolve the
    /// owning server.
    pub fn close_link(&mut self, sidx: usize, reason: &str) {
        let Some(srv) = self.servers.get(sidx) else {
            return;
        };
        let was_registered = srv.is_registered() && srv.local;
        let name = srv.name.clone();
        if let Some(srv) = self.servers.get_mut(sidx) {
            srv.state = LinkState::Closed;
            srv.queue = None;
        }

        if was_registered {
            tracing::info!(peer = %name, "Server link closed: {reason}");
            let split = format!("{} {}", self.server_name, name);
            let gone: Vec<usize> = std::iter::once(sidx)
                .chain(
                    self.servers
                        .iter()
                        .filter(|(_, s)| s.via == Some(sidx))
                        .map(|(i, _)| i),
                )
                .collect();
            for &idx in &gone {
                self.kill_remote_clients_on(idx, &split);
            }
            for &idx in &gone {
                self.unindex_server(idx);
                self.servers.remove(idx);
            }
            self.sbcast(&format!("{} SQ {} :{}\r\n", self.token, name, reason));
        } else {
            self.unindex_server(sidx);
            self.servers.remove(sidx);
        }
    }

    fn server_origin_cmd(&mut self, sidx: usize, origin: char, verb: &str, args: &[String]) -> bool {
        match verb {
            "S" => self.peer_server_intro(sidx, args),
            "N" => self.peer_client_intro(sidx, origin, args),
            "B" => self.burst_channel_topic(sidx, origin, args),
            "SQ" => self.peer_squit(sidx, origin, args),
            _ => {
                tracing::debug!(peer = sidx, verb, "Unhandled server-origin verb");
            }
        }
        false
    }

    /// S: a server somewhere behind this link.
    fn peer_server_intro(&mut self, sidx: usize, args: &[String]) {
        // <name> <hops> <boot_ts> <link_ts> <proto> <token> :<desc>
        if args.len() < 6 {
            return;
        }
        let name = args[0].clone();
        let hops: u32 = args[1].parse().unwrap_or(1);
        let boot_ts: u64 = args[2].parse().unwrap_or(0);
        let link_ts: u64 = args[3].parse().unwrap_or(0);
        let token = args[5].chars().next().unwrap_or('?');
        let desc = args.get(6).cloned().unwrap_or_default();

        // the burst echoes the link itself back; skip anything known
        if name.eq_ignore_ascii_case(&self.server_name) || self.find_server(&name).is_some() {
            return;
        }
        if self.find_server_token(token).is_some() {
            tracing::warn!(server = %name, %token, "Duplicate server token, ignoring");
            return;
        }
        let serial = self.next_serial();
        let now = self.cheapstamp;
        let stored_hops = hops + 1;
        let idx = self.servers.insert(PeerServer::learned(
            serial,
            name.clone(),
            token,
            desc.clone(),
            stored_hops,
            boot_ts,
            link_ts,
            sidx,
            now,
        ));
        self.index_server(&name, idx);
        self.sbcast_butone(
            sidx,
            &format!("{} S {name} {stored_hops} {boot_ts} {link_ts} J10 {token} :{desc}\r\n", self.token),
        );
    }

    /// N introduction: a client on a server behind this link. A nick
    /// collision resolves by timestamp; the older nick survives and the
    /// loser is killed with a collision reason.
    fn peer_client_intro(&mut self, sidx: usize, origin: char, args: &[String]) {
        // <nick> <hops> <ts> <user> <host> <modes> <ip> <token> :<realname>
        if args.len() < 9 {
            return;
        }
        let nick = args[0].clone();
        let ts: u64 = args[2].parse().unwrap_or(0);
        let user = args[3].clone();
        let host = args[4].clone();
        let modes = args[5].clone();
        let ip = args[6].clone();
        let token = args[7].clone();
        let realname = args[8].clone();

        let Some(owner) = self.find_server_token(origin) else {
            tracing::warn!(%nick, token = %origin, "N from unknown server token");
            return;
        };
        if let Some(existing) = self.find_client(&nick) {
            let existing_ts = self.clients.get(existing).map(|c| c.nick_ts).unwrap_or(0);
            if ts < existing_ts {
                // incoming nick is older: the local holder loses
                self.kill_client(existing, "Nick collision", Relay::All);
            } else {
                // incoming loses: tell the announcing link to drop it
                if let Some(srv) = self.servers.get(sidx) {
                    srv.send(Arc::from(format!("{token} Q :Nick collision\r\n")));
                }
                return;
            }
        }

        let serial = self.next_serial();
        let now = self.cheapstamp;
        let idx = self.clients.insert(Client::remote(
            serial,
            owner,
            nick.clone(),
            user.clone(),
            host.clone(),
            ip.clone(),
            modes.clone(),
            realname.clone(),
            token.clone(),
            ts,
            now,
        ));
        self.index_client_nick(&nick, idx);
        self.index_client_token(&token, idx);
        self.new_registered_client(false);

        let hops = self.servers.get(owner).map(|s| s.hops + 1).unwrap_or(2);
        self.sbcast_butone(
            sidx,
            &format!("{origin} N {nick} {hops} {ts} {user} {host} {modes} {ip} {token} :{realname}\r\n"),
        );
    }

    /// C: channel without topic.
    fn burst_channel(&mut self, sidx: usize, words: &[String]) {
        // C <name> <modes> <created_ts>
        if words.len() < 3 {
            return;
        }
        let name = words[1].clone();
        let modes = words[2].clone();
        let created: u64 = words
            .get(3)
            .and_then(|t| t.parse().ok())
            .unwrap_or(self.cheapstamp);
        let ch = match self.find_channel(&name) {
            Some(ch) => ch,
            None => self.create_channel(&name),
        };
        if let Some(channel) = self.channels.get_mut(ch) {
            if created < channel.created_ts {
                channel.created_ts = created;
            }
            apply_mode_flags(channel, &modes);
        }
        self.sbcast_butone(sidx, &format!("C {name} {modes} {created}\r\n"));
    }

    /// B: channel burst from the topic-owning side.
    fn burst_channel_topic(&mut self, sidx: usize, origin: char, args: &[String]) {
        // <name> <created_ts> <modes>
        if args.len() < 3 {
            return;
        }
        let name = args[0].clone();
        let created: u64 = args[1].parse().unwrap_or(0);
        let modes = args[2].clone();
        let ch = match self.find_channel(&name) {
            Some(ch) => ch,
            None => self.create_channel(&name),
        };
        if let Some(channel) = self.channels.get_mut(ch) {
            if created > 0 && created < channel.created_ts {
                channel.created_ts = created;
            }
            apply_mode_flags(channel, &modes);
        }
        self.sbcast_butone(sidx, &format!("{origin} B {name} {created} {modes}\r\n"));
    }

    /// SQ: a server (and everything on it) has left the network.
    fn peer_squit(&mut self, sidx: usize, origin: char, args: &[String]) {
        let Some(name) = args.first().cloned() else {
            return;
        };
        let reason = args.get(1).cloned().unwrap_or_default();
        let Some(target) = self.find_server(&name) else {
            return;
        };
        let is_remote = self.servers.get(target).is_some_and(|s| !s.local);
        if !is_remote {
            // our own links split only when their socket dies
            return;
        }
        tracing::info!(server = %name, "Remote server split: {reason}");
        self.kill_remote_clients_on(target, &reason);
        self.unindex_server(target);
        self.servers.remove(target);
        self.sbcast_butone(sidx, &format!("{origin} SQ {name} :{reason}\r\n"));
    }

    fn client_origin_cmd(&mut self, sidx: usize, origin: &str, verb: &str, args: &[String]) -> bool {
        let Some(idx) = self.find_client_token(origin) else {
            tracing::debug!(token = %origin, verb, "Line from unknown client token");
            return false;
        };
        match verb {
            "N" => self.remote_nick_change(sidx, idx, args),
            "J" => self.remote_join(sidx, idx, origin, args),
            "L" => self.remote_part(sidx, idx, origin, args),
            "Q" => {
                let reason = args.first().cloned().unwrap_or_default();
                self.quit_client(idx, &reason, Relay::Except(sidx));
            }
            "P" | "O" => self.remote_privmsg(sidx, idx, origin, verb, args),
            "T" => self.remote_topic(sidx, idx, origin, args),
            "M" => self.remote_mode(sidx, idx, origin, args),
            _ => {
                tracing::debug!(verb, "Unhandled client-origin verb");
            }
        }
        false
    }

    fn remote_nick_change(&mut self, sidx: usize, idx: usize, args: &[String]) {
        let Some(new) = args.first().cloned() else {
            return;
        };
        let ts: u64 = args
            .get(1)
            .and_then(|t| t.parse().ok())
            .unwrap_or(self.cheapstamp);
        if let Some(holder) = self.find_client(&new)
            && holder != idx
        {
            let holder_ts = self.clients.get(holder).map(|c| c.nick_ts).unwrap_or(0);
            if ts < holder_ts {
                self.kill_client(holder, "Nick collision", Relay::All);
            } else {
                self.quit_client(idx, "Nick collision", Relay::Except(sidx));
                return;
            }
        }
        let Some(client) = self.clients.get(idx) else {
            return;
        };
        let mask = client.hostmask();
        let old_lower = client.nick.as_ref().map(|n| n.to_lowercase());
        let token = client.token.clone();
        if let Some(old) = old_lower {
            self.unindex_client_nick(&old, idx);
        }
        self.index_client_nick(&new, idx);
        if let Some(client) = self.clients.get_mut(idx) {
            client.nick = Some(new.clone());
            client.nick_ts = ts;
        }
        self.user_bcast_raw(idx, &format!(":{mask} NICK :{new}\r\n"));
        self.sbcast_butone(sidx, &format!("{token} N {new} {ts}\r\n"));
    }

    fn remote_join(&mut self, sidx: usize, idx: usize, origin: &str, args: &[String]) {
        let Some(name) = args.first().cloned() else {
            return;
        };
        if !is_channel_name(&name) {
            return;
        }
        let ch = match self.find_channel(&name) {
            Some(ch) => ch,
            None => self.create_channel(&name),
        };
        let mask = self
            .clients
            .get(idx)
            .map(|c| c.hostmask())
            .unwrap_or_default();
        if let Some(channel) = self.channels.get_mut(ch) {
            channel.members.insert(idx);
        }
        if let Some(client) = self.clients.get_mut(idx) {
            client.channels.insert(ch);
        }
        let display = self
            .channels
            .get(ch)
            .map(|c| c.name.clone())
            .unwrap_or(name);
        self.chan_bcast(ch, Some(idx), &format!(":{mask} JOIN {display}\r\n"));
        self.sbcast_butone(sidx, &format!("{origin} J {display}\r\n"));
    }

    fn remote_part(&mut self, sidx: usize, idx: usize, origin: &str, args: &[String]) {
        let Some(name) = args.first().cloned() else {
            return;
        };
        let reason = args.get(1).cloned().unwrap_or_default();
        let Some(ch) = self.find_channel(&name) else {
            return;
        };
        let mask = self
            .clients
            .get(idx)
            .map(|c| c.hostmask())
            .unwrap_or_default();
        self.chan_bcast(ch, Some(idx), &format!(":{mask} PART {name} :{reason}\r\n"));
        self.remove_member(ch, idx);
        self.sbcast_butone(sidx, &format!("{origin} L {name} :{reason}\r\n"));
    }

    fn remote_privmsg(&mut self, sidx: usize, idx: usize, origin: &str, verb: &str, args: &[String]) {
        if args.len() < 2 {
            return;
        }
        let target = args[0].clone();
        let text = args[1].clone();
        let cmd = if verb == "O" { "NOTICE" } else { "PRIVMSG" };
        let mask = self
            .clients
            .get(idx)
            .map(|c| c.hostmask())
            .unwrap_or_default();
        if is_channel_name(&target) {
            let Some(ch) = self.find_channel(&target) else {
                return;
            };
            let line = format!(":{mask} {cmd} {target} :{text}\r\n");
            let is_member = self
                .channels
                .get(ch)
                .is_some_and(|c| c.members.contains(&idx));
            if is_member {
                self.user_bcast_butone_raw(idx, &line);
            } else {
                self.chan_bcast(ch, Some(idx), &line);
            }
            self.sbcast_butone(sidx, &format!("{origin} {verb} {target} :{text}\r\n"));
        } else {
            let local_dest = self
                .find_client(&target)
                .filter(|&t| self.clients.get(t).is_some_and(|c| c.is_local()));
            match local_dest {
                Some(t) => self.send_to(t, format!(":{mask} {cmd} {target} :{text}\r\n")),
                None => self.sbcast_butone(sidx, &format!("{origin} {verb} {target} :{text}\r\n")),
            }
        }
    }

    fn remote_topic(&mut self, sidx: usize, idx: usize, origin: &str, args: &[String]) {
        if args.len() < 2 {
            return;
        }
        let name = args[0].clone();
        let text = args[1].clone();
        let Some(ch) = self.find_channel(&name) else {
            return;
        };
        let (mask, nick) = self
            .clients
            .get(idx)
            .map(|c| (c.hostmask(), c.nick_or_star().to_string()))
            .unwrap_or_default();
        let now = self.cheapstamp;
        if let Some(channel) = self.channels.get_mut(ch) {
            channel.topic = Some(Topic {
                text: text.clone(),
                set_by: nick,
                set_at: now,
            });
        }
        self.chan_bcast(ch, Some(idx), &format!(":{mask} TOPIC {name} :{text}\r\n"));
        self.sbcast_butone(sidx, &format!("{origin} T {name} :{text}\r\n"));
    }

    fn remote_mode(&mut self, sidx: usize, idx: usize, origin: &str, args: &[String]) {
        if args.len() < 2 {
            return;
        }
        let name = args[0].clone();
        let mode_str = args[1].clone();
        let mode_arg = args.get(2).cloned();
        let Some(ch) = self.find_channel(&name) else {
            return;
        };
        let mask = self
            .clients
            .get(idx)
            .map(|c| c.hostmask())
            .unwrap_or_default();
        self.apply_channel_mode(ch, &mode_str, mode_arg.as_deref(), &mask, None);
        match mode_arg {
            Some(arg) => self.sbcast_butone(sidx, &format!("{origin} M {name} {mode_str} {arg}\r\n")),
            None => self.sbcast_butone(sidx, &format!("{origin} M {name} {mode_str}\r\n")),
        }
    }
}

/// Reconstruct channel mode flags from a burst mode string.
fn apply_mode_flags(channel: &mut Channel, modes: &str) {
    channel.no_external = modes.contains('n');
    channel.topic_locked = modes.contains('t');
    channel.invite_only = modes.contains('i');
}

/// Split a token-protocol line into words, with a ":"-prefixed trailing
/// argument collapsing into the final element.
fn split_tokens(line: &str) -> Vec<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut out = Vec::new();
    let mut rest = line;
    while !rest.is_empty() {
        if let Some(trailing) = rest.strip_prefix(':') {
            out.push(trailing.to_string());
            break;
        }
        match rest.find(' ') {
            Some(pos) => {
                if pos > 0 {
                    out.push(rest[..pos].to_string());
                }
                rest = &rest[pos + 1..];
            }
            None => {
                out.push(rest.to_string());
                break;
            }
        }
    }
    out
}

// ── Link transport ───────────────────────────────────────────────

/// Handle an inbound server-link connection.
pub async fn handle_incoming(stream: TcpStream, state: Arc<Mutex<IrcState>>) -> Result<()> {
    let peer_addr = stream.peer_addr()?;
    tracing::info!(%peer_addr, "New server connection");
    let (tx, rx) = mpsc::channel::<Arc<str>>(1024);
    let (idx, serial) = {
        let mut st = state.lock().unwrap();
        st.create_peer_inbound(tx)
    };
    run_link(stream, rx, idx, serial, state).await
}

/// Dial a configured remote peer and drive it through the handshake.
pub async fn connect_outbound(record: RemoteServer, state: Arc<Mutex<IrcState>>) {
    let reserved = { state.lock().unwrap().create_peer_outbound(&record.name) };
    let Some((idx, serial)) = reserved else {
        return;
    };
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(record.addr())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(peer = %record.name, "Connect failed: {e}");
            state.lock().unwrap().close_link(idx, "Connect failed");
            return;
        }
        Err(_) => {
            tracing::warn!(peer = %record.name, "Connect timed out");
            state.lock().unwrap().close_link(idx, "Connect timeout");
            return;
        }
    };
    let (tx, rx) = mpsc::channel::<Arc<str>>(1024);
    {
        let mut st = state.lock().unwrap();
        if !st.peer_alive(idx, serial) {
            return;
        }
        st.attach_outbound(idx, tx, &record);
    }
    if let Err(e) = run_link(stream, rx, idx, serial, state).await {
        tracing::warn!(peer = %record.name, "Link error: {e}");
    }
}

/// Read loop shared by both link directions. The writer task drains the
/// entity's queue and ends when the entity drops its sender.
async fn run_link(
    stream: TcpStream,
    mut rx: mpsc::Receiver<Arc<str>>,
    idx: usize,
    serial: u64,
    state: Arc<Mutex<IrcState>>,
) -> Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut reader = BufReader::new(reader);
    let mut line_buf = String::new();
    loop {
        line_buf.clear();
        match timeout(POLL_INTERVAL, reader.read_line(&mut line_buf)).await {
            Err(_) => {
                if !state.lock().unwrap().peer_alive(idx, serial) {
                    return Ok(());
                }
                continue;
            }
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(_)) => {}
        }
        let close = {
            let mut st = state.lock().unwrap();
            if !st.peer_alive(idx, serial) {
                return Ok(());
            }
            st.handle_peer_line(idx, &line_buf)
        };
        if close {
            return Ok(());
        }
    }

    let mut st = state.lock().unwrap();
    if st.peer_alive(idx, serial) {
        st.close_link(idx, "Connection closed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_tokens() {
        let words = split_tokens("A S hub 1 100 200 J10 B :A hub server\r\n");
        assert_eq!(
            words,
            vec!["A", "S", "hub", "1", "100", "200", "J10", "B", "A hub server"]
        );
    }

    #[test]
    fn split_trailing_only() {
        assert_eq!(split_tokens("EB\r\n"), vec!["EB"]);
        assert_eq!(split_tokens("PASS :secret stuff"), vec!["PASS", "secret stuff"]);
    }

    #[test]
    fn split_empty() {
        assert!(split_tokens("\r\n").is_empty());
    }
}
