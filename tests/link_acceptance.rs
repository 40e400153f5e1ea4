//! Server-link acceptance tests.
//!
//! Each test starts a live server and acts as a linked peer over real TCP:
//! PASS/SERVER handshake, netburst, steady-state token relay, netsplit.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{sleep, timeout};

use ircd::config::{RemoteServer, ServerConfig};
use ircd::server::{Server, ServerHandle};

const TIMEOUT: Duration = Duration::from_secs(10);
/// Long enough to span one outbound-connector period.
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn hub_record(port: u16) -> RemoteServer {
    RemoteServer {
        name: "hub".to_string(),
        secret: "sekrit".to_string(),
        address: "127.0.0.1".to_string(),
        port,
    }
}

/// Server with "hub" configured as a linkable peer. Port 2 never accepts,
/// so the outbound connector's own dial attempts fail fast.
async fn start_server() -> ServerHandle {
    start_server_with(hub_record(2)).await
}

async fn start_server_with(record: RemoteServer) -> ServerHandle {
    let config = ServerConfig {
        client_addr: "127.0.0.1:0".to_string(),
        server_addr: "127.0.0.1:0".to_string(),
        peers: vec![record],
        ..ServerConfig::default()
    };
    Server::new(config).start().await.expect("server start")
}

struct TestConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestConn {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("send");
    }

    async fn recv(&mut self) -> String {
        let mut buf = String::new();
        let n = timeout(TIMEOUT, self.reader.read_line(&mut buf))
            .await
            .expect("timed out waiting for a line")
            .expect("read");
        assert!(n > 0, "connection closed unexpectedly");
        buf
    }

    async fn wait_for(&mut self, needle: &str) -> (String, Vec<String>) {
        let mut skipped = Vec::new();
        loop {
            let line = self.recv().await;
            if line.contains(needle) {
                return (line, skipped);
            }
            skipped.push(line);
        }
    }

    /// Link as the peer "hub": our side of the handshake only.
    async fn handshake(&mut self) {
        self.send("PASS :sekrit").await;
        self.send("SERVER hub 1 1000 2000 J10 H :hub test").await;
    }

    /// Collect every line up to and including EB.
    async fn read_until_eb(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.recv().await;
            let done = line.starts_with("EB");
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    async fn register_client(&mut self, nick: &str) {
        self.send(&format!("NICK {nick}")).await;
        self.send(&format!("USER {nick} 0 * :{nick} real")).await;
        self.wait_for(" 376 ").await;
    }
}

/// Poll the shared state until the predicate holds.
async fn wait_state<F: Fn(&ServerHandle) -> bool>(h: &ServerHandle, what: &str, pred: F) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if pred(h) {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for: {what}");
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn netburst_is_ordered_and_complete() {
    let h = start_server().await;

    // some state worth bursting: two users, one topic'd channel, one bare
    let mut a = TestConn::connect(h.client_addr).await;
    let mut b = TestConn::connect(h.client_addr).await;
    a.register_client("alice").await;
    b.register_client("bob").await;
    a.send("JOIN #x").await;
    a.wait_for(" 366 ").await;
    a.send("TOPIC #x :burst me").await;
    a.wait_for("TOPIC #x").await;
    b.send("JOIN #y").await;
    b.wait_for(" 366 ").await;

    let mut p = TestConn::connect(h.server_addr).await;
    p.handshake().await;
    let lines = p.read_until_eb().await;

    // the reply handshake comes first
    assert!(lines[0].starts_with("PASS :"), "lines were {lines:?}");
    assert!(lines[1].starts_with("SERVER irc.local 1 "));

    // classify burst lines: S < N < B/C < EB
    let kind = |l: &String| -> Option<usize> {
        if l.starts_with("EB") {
            return Some(4);
        }
        if l.starts_with("C #") {
            return Some(3);
        }
        match l.split_whitespace().nth(1) {
            Some("S") => Some(1),
            Some("N") => Some(2),
            Some("B") => Some(3),
            _ => None,
        }
    };
    let burst: Vec<usize> = lines[2..].iter().filter_map(kind).collect();
    assert!(
        burst.windows(2).all(|w| w[0] <= w[1]),
        "burst out of order: {lines:?}"
    );
    assert_eq!(burst.iter().filter(|&&k| k == 1).count(), 1, "one server");
    assert_eq!(burst.iter().filter(|&&k| k == 2).count(), 2, "two clients");
    assert_eq!(burst.iter().filter(|&&k| k == 3).count(), 2, "two channels");
    assert_eq!(*burst.last().unwrap(), 4);

    assert!(lines.iter().any(|l| l.contains(" N alice ")));
    assert!(lines.iter().any(|l| l.contains(" N bob ")));
    assert!(lines.iter().any(|l| l.contains(" B #x ") && l.contains("+nt")));
    assert!(lines.iter().any(|l| l.starts_with("C #y ")));
}

#[tokio::test]
async fn netsplit_kills_exactly_the_peers_clients() {
    let h = start_server().await;

    let mut a = TestConn::connect(h.client_addr).await;
    a.register_client("alice").await;
    a.send("JOIN #s").await;
    a.wait_for(" 366 ").await;

    let mut p = TestConn::connect(h.server_addr).await;
    p.handshake().await;
    p.read_until_eb().await;

    for i in 0..5 {
        p.send(&format!("H N rem{i} 2 100 u host + 0.0.0.0 H{i} :remote {i}"))
            .await;
    }
    p.send("H0 J #s").await;

    wait_state(&h, "remote users counted", |h| {
        h.state.lock().unwrap().stats.total_users.load(Ordering::Relaxed) == 6
    })
    .await;
    let (join, _) = a.wait_for("JOIN #s").await;
    assert!(join.starts_with(":rem0!"));

    // split the link
    drop(p);

    wait_state(&h, "remote users killed", |h| {
        h.state.lock().unwrap().stats.total_users.load(Ordering::Relaxed) == 1
    })
    .await;
    assert_eq!(
        h.state.lock().unwrap().stats.local_users.load(Ordering::Relaxed),
        1,
        "local count untouched by the split"
    );

    // the co-channel client saw the netsplit quit with both server names
    let (quit, _) = a.wait_for("QUIT").await;
    assert!(quit.starts_with(":rem0!"));
    assert!(quit.contains("irc.local hub"), "line was {quit:?}");
}

#[tokio::test]
async fn burst_nick_collision_resolved_by_timestamp() {
    let h = start_server().await;

    let mut dupe = TestConn::connect(h.client_addr).await;
    dupe.register_client("dupe").await;
    let mut keeper = TestConn::connect(h.client_addr).await;
    keeper.register_client("keeper").await;

    let mut p = TestConn::connect(h.server_addr).await;
    p.handshake().await;
    p.read_until_eb().await;

    // ts 1 is older than any live registration: the local holder loses
    p.send("H N dupe 2 1 u host + 0.0.0.0 H0 :old timer").await;
    let (error, _) = dupe.wait_for("ERROR").await;
    assert!(error.contains("Nick collision"), "line was {error:?}");

    // a newer introduction loses: the link is told to drop it
    p.send("H N keeper 2 9999999999 u host + 0.0.0.0 H7 :late").await;
    let (q, _) = p.wait_for("H7 Q :").await;
    assert!(q.contains("Nick collision"));

    wait_state(&h, "collision settles", |h| {
        let st = h.state.lock().unwrap();
        let dupe_idx = st.find_client("dupe");
        dupe_idx.is_some_and(|i| st.clients.get(i).is_some_and(|c| !c.is_local()))
            && st
                .find_client("keeper")
                .is_some_and(|i| st.clients.get(i).is_some_and(|c| c.is_local()))
    })
    .await;
}

#[tokio::test]
async fn messages_relay_in_both_directions() {
    let h = start_server().await;

    let mut a = TestConn::connect(h.client_addr).await;
    a.register_client("alice").await;
    a.send("JOIN #x").await;
    a.wait_for(" 366 ").await;

    let mut p = TestConn::connect(h.server_addr).await;
    p.handshake().await;
    p.read_until_eb().await;

    // peer side introduces a user who joins and speaks
    p.send("H N bob2 2 100 u host + 0.0.0.0 H1 :remote bob").await;
    p.send("H1 J #x").await;
    p.send("H1 P #x :hello from hub").await;

    let (join, _) = a.wait_for("JOIN #x").await;
    assert!(join.starts_with(":bob2!"));
    let (msg, _) = a.wait_for("PRIVMSG #x :hello from hub").await;
    assert!(msg.starts_with(":bob2!"));

    // local reply relays out as a token line
    a.send("PRIVMSG #x :hi back").await;
    let (relay, _) = p.wait_for(" P #x :hi back").await;
    assert!(!relay.starts_with(':'), "token line, not a client line: {relay:?}");

    // and a direct message to the remote user routes over the link
    a.send("PRIVMSG bob2 :psst").await;
    p.wait_for(" P bob2 :psst").await;
}

#[tokio::test]
async fn configured_peer_is_redialed_until_linked() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let _h = start_server_with(hub_record(port)).await;

    // first attempt: the server dials and opens with PASS
    let (stream, _) = timeout(RECONNECT_TIMEOUT, listener.accept())
        .await
        .expect("no dial attempt")
        .expect("accept");
    let mut first = TestConn::from_stream(stream);
    let (pass, _) = first.wait_for("PASS :sekrit").await;
    assert!(pass.starts_with("PASS"));
    first.wait_for("SERVER irc.local").await;

    // refuse it; the connector must try again on a later tick
    drop(first);

    let (stream, _) = timeout(RECONNECT_TIMEOUT, listener.accept())
        .await
        .expect("no reconnect attempt")
        .expect("accept");
    let mut second = TestConn::from_stream(stream);
    second.wait_for("PASS :sekrit").await;
}

#[tokio::test]
async fn wrong_secret_is_rejected_without_detail() {
    let h = start_server().await;
    let mut p = TestConn::connect(h.server_addr).await;
    p.send("PASS :guess").await;
    p.send("SERVER hub 1 1000 2000 J10 H :hub test").await;
    let (line, _) = p.wait_for("ERROR").await;
    assert!(line.contains("Access denied"));
    assert!(!line.contains("pass") && !line.contains("secret"), "no field detail leaks");
}
