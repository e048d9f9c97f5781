//! Paired RDT session: data + keepalive under one session id.
//!
//! The dialer opens the data sub-session, writes the `{0x00, sid}`
//! handshake, opens the keepalive sub-session, writes `{0x01, sid}`, then
//! starts the ping task. The accepter mirrors with a pong task. Either
//! sub-session closing, or a missed heartbeat, tears the whole session
//! down; readers observe EOF and writers a broken pipe.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::rdt::conn::{spawn_conn, RdtStream, UdpFlow};
use crate::rdt::listener::bind_udp;
use crate::rdt::packet::{encode_handshake, SessionId, TAG_DATA, TAG_KEEPALIVE};
use crate::rdt::RdtConfig;

/// An established session. Reads and writes go to the data sub-session;
/// liveness runs on the keepalive sub-session underneath.
pub struct RdtSession {
    sid: SessionId,
    data: RdtStream,
    peer: Option<SocketAddr>,
    close: CancellationToken,
}

impl RdtSession {
    /// Dial a listener: data handshake, keepalive handshake, ping task.
    /// A failure at any step closes whatever is already open.
    pub async fn dial(addr: &str, config: RdtConfig) -> Result<RdtSession> {
        let peer = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| Error::config(format!("cannot resolve {addr}")))?;
        let sid = SessionId::generate();

        let mut data = spawn_conn(
            UdpFlow::Dedicated(connect_udp(peer, &config).await?),
            &config,
        );
        data.write_all(&encode_handshake(TAG_DATA, &sid)).await?;

        let mut keepalive = spawn_conn(
            UdpFlow::Dedicated(connect_udp(peer, &config).await?),
            &config,
        );
        keepalive
            .write_all(&encode_handshake(TAG_KEEPALIVE, &sid))
            .await?;

        tracing::debug!("session {} dialed to {}", sid, peer);
        Ok(Self::assemble(sid, data, keepalive, Some(peer), &config, true))
    }

    /// Build the accepter side from a promoted sub-session pair.
    pub(crate) fn accepted(
        sid: SessionId,
        data: RdtStream,
        keepalive: RdtStream,
        peer: SocketAddr,
        config: &RdtConfig,
    ) -> RdtSession {
        Self::assemble(sid, data, keepalive, Some(peer), config, false)
    }

    fn assemble(
        sid: SessionId,
        data: RdtStream,
        keepalive: RdtStream,
        peer: Option<SocketAddr>,
        config: &RdtConfig,
        dialer: bool,
    ) -> RdtSession {
        let close = CancellationToken::new();

        // Either sub-session dying takes the session with it.
        let data_token = data.shutdown_token();
        let keepalive_token = keepalive.shutdown_token();
        {
            let close = close.clone();
            let data_token = data_token.clone();
            let keepalive_token = keepalive_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = close.cancelled() => {}
                    _ = data_token.cancelled() => {}
                    _ = keepalive_token.cancelled() => {}
                }
                close.cancel();
                data_token.cancel();
                keepalive_token.cancel();
            });
        }

        let interval = config.ping_interval;
        let grace = config.ping_interval + config.pong_timeout;
        if dialer {
            tokio::spawn(ping_loop(keepalive, close.clone(), interval, grace, sid));
        } else {
            tokio::spawn(pong_loop(keepalive, close.clone(), grace, sid));
        }

        RdtSession {
            sid,
            data,
            peer,
            close,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.sid
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Set the data read deadline. Zero disables; tunnel lifetime is then
    /// governed by the keepalive alone.
    pub fn set_read_timeout(&mut self, deadline: Duration) {
        self.data.set_read_deadline(deadline);
    }

    /// Set the data write deadline. Zero disables.
    pub fn set_write_timeout(&mut self, deadline: Duration) {
        self.data.set_write_deadline(deadline);
    }

    /// Cancelled when the session is torn down, whatever the cause.
    pub fn closed(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn close(&self) {
        self.close.cancel();
    }
}

/// Dialer heartbeat: write one ping byte under the write deadline, then
/// read the pong back before the next cycle may start. Any failure closes
/// the whole session.
async fn ping_loop(
    mut keepalive: RdtStream,
    close: CancellationToken,
    interval: Duration,
    grace: Duration,
    sid: SessionId,
) {
    keepalive.set_write_deadline(interval);
    keepalive.set_read_deadline(grace);

    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if keepalive.write_all(&[0x01]).await.is_err() {
            tracing::debug!("session {} ping write failed", sid);
            break;
        }
        let mut pong = [0u8; 1];
        if keepalive.read_exact(&mut pong).await.is_err() {
            tracing::debug!("session {} pong missed", sid);
            break;
        }
    }
    close.cancel();
}

/// Accepter heartbeat: echo each ping byte back. The read deadline covers
/// a full ping interval plus the pong grace, so a silent peer is detected
/// within that bound.
async fn pong_loop(
    mut keepalive: RdtStream,
    close: CancellationToken,
    grace: Duration,
    sid: SessionId,
) {
    keepalive.set_read_deadline(grace);
    keepalive.set_write_deadline(grace);
    let mut byte = [0u8; 1];

    loop {
        let received = tokio::select! {
            _ = close.cancelled() => break,
            received = keepalive.read(&mut byte) => received,
        };
        match received {
            Ok(0) | Err(_) => {
                tracing::debug!("session {} heartbeat lost", sid);
                break;
            }
            Ok(_) => {
                if keepalive.write_all(&byte[..1]).await.is_err() {
                    break;
                }
            }
        }
    }
    close.cancel();
}

async fn connect_udp(peer: SocketAddr, config: &RdtConfig) -> Result<Arc<UdpSocket>> {
    let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = bind_udp(bind_addr, config).await?;
    socket.connect(peer).await?;
    Ok(Arc::new(socket))
}

impl AsyncRead for RdtSession {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().data).poll_read(cx, buf)
    }
}

impl AsyncWrite for RdtSession {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().data).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().data).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().data).poll_shutdown(cx)
    }
}

impl Drop for RdtSession {
    fn drop(&mut self) {
        self.close.cancel();
    }
}
