//! Per-client connection handling.
//!
//! Each accepted socket gets this reader task plus a writer task draining
//! the client's queue. Lines are dispatched into the shared state one at a
//! time; everything between two reads runs to completion under the state
//! lock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::state::{IrcState, Relay};

/// Read poll interval; also bounds how quickly an external kill is
/// noticed by the reader.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Handle one client TCP connection until it closes or the entity dies.
pub async fn handle(stream: TcpStream, state: Arc<Mutex<IrcState>>) -> Result<()> {
    let peer_addr = stream.peer_addr()?;
    let ip = peer_addr.ip().to_string();
    tracing::info!(%peer_addr, "New client connection");

    let (reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(512);
    let created = { state.lock().unwrap().create_client(tx, ip) };
    let Some((idx, serial)) = created else {
        let _ = writer
            .write_all(b"ERROR :Server is full, try again later\r\n")
            .await;
        return Ok(());
    };

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
                if !state.lock().unwrap().client_alive(idx, serial) {
                    return Ok(());
                }
                continue;
            }
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(_)) => {}
        }
        let quit = {
            let mut st = state.lock().unwrap();
            if !st.client_alive(idx, serial) {
                return Ok(());
            }
            st.touch_client(idx);
            st.handle_client_line(idx, &line_buf)
        };
        if quit {
            return Ok(());
        }
    }

    let mut st = state.lock().unwrap();
    if st.client_alive(idx, serial) {
        st.quit_client(idx, "Connection closed", Relay::All);
    }
    tracing::info!(client = idx, "Connection closed");
    Ok(())
}
