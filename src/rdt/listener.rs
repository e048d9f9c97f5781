//! RDT listener: accepts sub-sessions and pairs them into sessions.
//!
//! One recv loop demultiplexes UDP datagrams by peer address into
//! sub-session flows. Each new flow gets a handshake task that reads the
//! 21-byte record under the read deadline and files the sub-session into
//! the pending table keyed by session id. When both the data and the
//! keepalive sub-session of an id are present the pair is promoted to an
//! [`RdtSession`] and handed to `accept`. A malformed handshake fails its
//! sub-session only; the listener keeps running.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::rdt::conn::{spawn_conn, RdtStream, UdpFlow};
use crate::rdt::packet::{SessionId, HANDSHAKE_LEN, TAG_DATA, TAG_KEEPALIVE};
use crate::rdt::session::RdtSession;
use crate::rdt::RdtConfig;

/// Pending-table capacity; oldest partial entries are evicted beyond this
/// to blunt session-id flooding.
const MAX_PENDING_SESSIONS: usize = 1024;

/// Concurrent sub-session flows one listener will track.
const MAX_FLOWS: usize = 4096;

/// Datagrams queued per flow before the pump drops.
const FLOW_QUEUE: usize = 256;

struct PendingEntry {
    data: Option<RdtStream>,
    keepalive: Option<RdtStream>,
    peer: SocketAddr,
    created: Instant,
}

type PendingTable = HashMap<SessionId, PendingEntry>;

/// Listening side of the transport.
pub struct RdtListener {
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<RdtSession>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl RdtListener {
    /// Bind the UDP socket and start the accept loop.
    pub async fn bind(addr: &str, config: RdtConfig) -> Result<RdtListener> {
        let socket = Arc::new(bind_udp(addr, &config).await?);
        let local_addr = socket.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(socket, config, accept_tx, shutdown.clone()));
        tracing::debug!("rdt listener on {}", local_addr);

        Ok(RdtListener {
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            local_addr,
            shutdown,
        })
    }

    /// Wait for the next complete session.
    pub async fn accept(&self) -> Result<RdtSession> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::transport("listener closed"))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RdtListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    socket: Arc<UdpSocket>,
    config: RdtConfig,
    accept_tx: mpsc::Sender<RdtSession>,
    shutdown: CancellationToken,
) {
    let mut flows: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let pending: Arc<Mutex<PendingTable>> = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let (n, from) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("listener recv error: {}", e);
                    continue;
                }
            },
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        match flows.get(&from) {
            Some(tx) => match tx.try_send(datagram) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => continue,
                Err(mpsc::error::TrySendError::Closed(datagram)) => {
                    // The old sub-session is gone; treat this as a new flow.
                    flows.remove(&from);
                    start_flow(
                        &mut flows, &socket, &config, &pending, &accept_tx, from, datagram,
                    );
                }
            },
            None => {
                start_flow(
                    &mut flows, &socket, &config, &pending, &accept_tx, from, datagram,
                );
            }
        }
    }
}

fn start_flow(
    flows: &mut HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    socket: &Arc<UdpSocket>,
    config: &RdtConfig,
    pending: &Arc<Mutex<PendingTable>>,
    accept_tx: &mpsc::Sender<RdtSession>,
    from: SocketAddr,
    first_datagram: Bytes,
) {
    if flows.len() >= MAX_FLOWS {
        tracing::warn!("flow table full, dropping datagram from {}", from);
        return;
    }

    let (tx, rx) = mpsc::channel(FLOW_QUEUE);
    let stream = spawn_conn(
        UdpFlow::Demuxed {
            socket: Arc::clone(socket),
            peer: from,
            rx,
        },
        config,
    );
    let _ = tx.try_send(first_datagram);
    flows.insert(from, tx);

    tokio::spawn(read_handshake(
        stream,
        from,
        Arc::clone(pending),
        accept_tx.clone(),
        config.clone(),
    ));
}

/// Read the sub-session handshake and file it into the pending table.
async fn read_handshake(
    mut stream: RdtStream,
    from: SocketAddr,
    pending: Arc<Mutex<PendingTable>>,
    accept_tx: mpsc::Sender<RdtSession>,
    config: RdtConfig,
) {
    let mut record = [0u8; HANDSHAKE_LEN];
    if let Err(e) = stream.read_exact(&mut record).await {
        tracing::debug!("handshake from {} failed: {}", from, e);
        return;
    }

    let tag = record[0];
    if tag != TAG_DATA && tag != TAG_KEEPALIVE {
        tracing::debug!("handshake from {} has unknown tag {:#04x}", from, tag);
        return;
    }
    let sid = match SessionId::from_bytes(&record[1..]) {
        Ok(sid) => sid,
        Err(_) => return,
    };

    let promoted = {
        let mut table = pending.lock();
        sweep_stale(&mut table, &config);

        if !table.contains_key(&sid) && table.len() >= MAX_PENDING_SESSIONS {
            evict_oldest(&mut table);
        }

        let entry = table.entry(sid).or_insert_with(|| PendingEntry {
            data: None,
            keepalive: None,
            peer: from,
            created: Instant::now(),
        });

        // A duplicate tag replaces the earlier sub-session, which closes
        // when its stream drops.
        if tag == TAG_DATA {
            entry.data = Some(stream);
        } else {
            entry.keepalive = Some(stream);
        }

        if entry.data.is_some() && entry.keepalive.is_some() {
            table.remove(&sid)
        } else {
            None
        }
    };

    if let Some(entry) = promoted {
        if let (Some(data), Some(keepalive)) = (entry.data, entry.keepalive) {
            tracing::debug!("session {} established from {}", sid, entry.peer);
            let session = RdtSession::accepted(sid, data, keepalive, entry.peer, &config);
            let _ = accept_tx.send(session).await;
        }
    }
}

/// Drop partial entries whose matching sub-session never arrived within
/// the read deadline.
fn sweep_stale(table: &mut PendingTable, config: &RdtConfig) {
    let ttl = if config.read_deadline.is_zero() {
        Duration::from_secs(10)
    } else {
        config.read_deadline
    };
    table.retain(|sid, entry| {
        let keep = entry.created.elapsed() <= ttl;
        if !keep {
            tracing::debug!("evicting stale half-session {}", sid);
        }
        keep
    });
}

fn evict_oldest(table: &mut PendingTable) {
    if let Some(&sid) = table
        .iter()
        .min_by_key(|(_, entry)| entry.created)
        .map(|(sid, _)| sid)
    {
        table.remove(&sid);
    }
}

/// Bind a UDP socket with the configured socket options applied.
pub(crate) async fn bind_udp(addr: &str, config: &RdtConfig) -> Result<UdpSocket> {
    let addr: SocketAddr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::config(format!("cannot resolve {addr}")))?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_nonblocking(true)?;

    if config.sock_buf > 0 {
        if let Err(e) = socket.set_recv_buffer_size(config.sock_buf) {
            tracing::debug!("set_recv_buffer_size: {}", e);
        }
        if let Err(e) = socket.set_send_buffer_size(config.sock_buf) {
            tracing::debug!("set_send_buffer_size: {}", e);
        }
    }
    if config.dscp > 0 && addr.is_ipv4() {
        if let Err(e) = socket.set_tos(config.dscp << 2) {
            tracing::debug!("set_tos: {}", e);
        }
    }

    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}
