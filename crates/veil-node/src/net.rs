//! TCP plumbing.
//!
//! Sockets live on a tokio runtime; the protocol engine runs on the
//! scheduler's worker threads. The two meet over channels: every socket
//! event becomes a [`NetEvent`] on one shared queue, and outbound frames
//! go to a per-connection writer task. Nothing in here understands the
//! protocol — framing and handshake state stay in `veil-protocol`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use veil_protocol::types::{ConnectionId, DEFAULT_BACKLOG};

/// Socket-level event handed to the engine poll task.
#[derive(Debug)]
pub enum NetEvent {
    /// An outbound dial completed.
    Connected { conn: ConnectionId, address: String },
    /// The listener accepted an inbound connection.
    Accepted { conn: ConnectionId, address: String },
    /// Bytes arrived on a connection.
    Data { conn: ConnectionId, bytes: Vec<u8> },
    /// A connection hit EOF or an I/O error.
    Closed { conn: ConnectionId },
    /// An outbound dial failed; the address may be retried later.
    DialFailed { address: String, port: u32 },
}

type Writers = Arc<Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Handle for driving sockets from non-async code.
#[derive(Clone)]
pub struct NetHandle {
    rt: tokio::runtime::Handle,
    events_tx: mpsc::UnboundedSender<NetEvent>,
    writers: Writers,
    next_conn: Arc<AtomicU64>,
}

impl NetHandle {
    pub fn new(rt: tokio::runtime::Handle) -> (Self, mpsc::UnboundedReceiver<NetEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                rt,
                events_tx,
                writers: Arc::new(Mutex::new(HashMap::new())),
                next_conn: Arc::new(AtomicU64::new(1)),
            },
            events_rx,
        )
    }

    /// Bind the listener and start accepting. Bind errors surface here;
    /// accept errors are logged and the loop continues.
    pub fn listen(&self, address: &str, port: u16) -> anyhow::Result<()> {
        let addr: std::net::SocketAddr = format!("{address}:{port}")
            .parse()
            .with_context(|| format!("parsing bind address {address}:{port}"))?;
        let listener = self
            .rt
            .block_on(async {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                socket.bind(addr)?;
                socket.listen(DEFAULT_BACKLOG)
            })
            .with_context(|| format!("binding listener on {address}:{port}"))?;
        debug!(address, port, "listener bound");

        let handle = self.clone();
        self.rt.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let conn = handle.register(stream);
                        let _ = handle.events_tx.send(NetEvent::Accepted {
                            conn,
                            address: peer.ip().to_string(),
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        Ok(())
    }

    /// Dial a peer in the background; the outcome arrives as a
    /// `Connected` or `DialFailed` event.
    pub fn connect(&self, address: String, port: u32) {
        let handle = self.clone();
        self.rt.spawn(async move {
            let Ok(port16) = u16::try_from(port) else {
                warn!(address, port, "dial skipped: port out of range");
                let _ = handle
                    .events_tx
                    .send(NetEvent::DialFailed { address, port });
                return;
            };
            match TcpStream::connect((address.as_str(), port16)).await {
                Ok(stream) => {
                    let conn = handle.register(stream);
                    let _ = handle.events_tx.send(NetEvent::Connected {
                        conn,
                        address: address.clone(),
                    });
                }
                Err(e) => {
                    debug!(address, port, error = %e, "dial failed");
                    let _ = handle
                        .events_tx
                        .send(NetEvent::DialFailed { address, port });
                }
            }
        });
    }

    /// Queue a framed buffer for writing. A missing connection means it
    /// already closed; the engine will hear about it via `Closed`.
    pub fn send(&self, conn: ConnectionId, frame: Vec<u8>) {
        let writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = writers.get(&conn) {
            let _ = tx.send(frame);
        }
    }

    /// Tear down a connection's writer; the read task notices the socket
    /// closing and emits `Closed`.
    pub fn close(&self, conn: ConnectionId) {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        writers.remove(&conn);
    }

    /// Split a fresh socket into reader and writer tasks.
    fn register(&self, stream: TcpStream) -> ConnectionId {
        let conn = ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        // Frames are small and latency-sensitive.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%conn, error = %e, "set_nodelay failed");
        }
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        {
            let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
            writers.insert(conn, frames_tx);
        }
        let (mut read_half, mut write_half) = stream.into_split();

        let events_tx = self.events_tx.clone();
        let writers = Arc::clone(&self.writers);
        self.rt.spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if events_tx
                            .send(NetEvent::Data {
                                conn,
                                bytes: buf[..n].to_vec(),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(%conn, error = %e, "read failed");
                        break;
                    }
                }
            }
            writers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&conn);
            let _ = events_tx.send(NetEvent::Closed { conn });
        });

        self.rt.spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!(%conn, error = %e, "write failed");
                    break;
                }
            }
            // Sender dropped or write failed: shut the socket down so the
            // read task unblocks.
            let _ = write_half.shutdown().await;
        });

        conn
    }
}
