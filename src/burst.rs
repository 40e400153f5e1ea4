//! Netburst encoding.
//!
//! A newly registered link receives the complete local view of the
//! network: servers first, then clients, then channels, terminated by
//! `EB`. The ordering lets the peer resolve every routing token before it
//! is referenced.

use std::sync::Arc;

use crate::state::IrcState;

/// Emit the burst to one peer. Lines are enqueued under the state lock,
/// so they precede any steady-state relay traffic on the same link.
pub fn netburst(st: &IrcState, target: usize) {
    let Some(peer) = st.servers.get(target) else {
        return;
    };

    for (_, srv) in st.servers.iter() {
        if !srv.is_registered() {
            continue;
        }
        peer.send(Arc::from(format!(
            "{} S {} {} {} {} J10 {} :{}\r\n",
            st.token, srv.name, srv.hops, srv.boot_ts, srv.link_ts, srv.token, srv.desc
        )));
    }

    for idx in 0..st.clients.len() {
        let Some(client) = st.clients.get(idx) else {
            continue;
        };
        if !client.registered {
            continue;
        }
        let (owner_token, hops) = match client.server_id {
            None => (st.token, 1),
            Some(s) => match st.servers.get(s) {
                Some(srv) => (srv.token, srv.hops + 1),
                None => continue,
            },
        };
        peer.send(Arc::from(format!(
            "{} N {} {} {} {} {} {} {} {} :{}\r\n",
            owner_token,
            client.nick_or_star(),
            hops,
            client.nick_ts,
            client.user.as_deref().unwrap_or("~u"),
            client.host,
            client.modes,
            client.ip,
            client.token,
            client.realname.as_deref().unwrap_or("")
        )));
    }

    for idx in 0..st.channels.len() {
        let Some(chan) = st.channels.get(idx) else {
            continue;
        };
        if chan.has_topic() {
            peer.send(Arc::from(format!(
                "{} B {} {} {}\r\n",
                st.token,
                chan.name,
                chan.created_ts,
                chan.mode_string()
            )));
        } else {
            peer.send(Arc::from(format!(
                "C {} {} {}\r\n",
                chan.name,
                chan.mode_string(),
                chan.created_ts
            )));
        }
    }

    peer.send(Arc::from("EB\r\n"));
}
