//! Stream multiplexing over one RDT session.
//!
//! yamux provides the streams; this module provides the glue. One mux
//! session owns one RDT connection. The server side writes a single ready
//! byte before installing yamux and the client side reads it before
//! opening streams: the transport delivers bytes the instant the UDP
//! session exists, so without the interlock the client could open streams
//! before the server's accept loop is in place.
//!
//! The yamux `Connection` is driven by a single task; stream opens arrive
//! over a channel and inbound streams leave over another, so the handles
//! stay cheaply cloneable and `Send`.

use std::task::Poll;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::rdt::RdtSession;

/// A multiplexed stream, in tokio I/O clothing.
pub type MuxStream = Compat<yamux::Stream>;

/// Multiplexer settings. Frame size and the connection receive window map
/// onto yamux; keepalive liveness is provided by the RDT heartbeat on the
/// same wire path underneath.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub max_frame_size: usize,
    pub max_receive_buffer: usize,
    pub max_stream_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(30),
            max_frame_size: 32 * 1024,
            max_receive_buffer: 4 * 1024 * 1024,
            max_stream_buffer: 64 * 1024,
        }
    }
}

const READY_BYTE: u8 = 0x01;

fn yamux_config(config: &MuxConfig) -> yamux::Config {
    let mut yc = yamux::Config::default();
    yc.set_split_send_size(config.max_frame_size);
    yc.set_max_connection_receive_window(Some(config.max_receive_buffer));
    yc
}

type OpenReply = oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>;

/// Client half: opens streams on the session.
pub struct MuxClient {
    open_tx: mpsc::Sender<OpenReply>,
    closed: CancellationToken,
}

impl MuxClient {
    /// Wrap a session. Blocks until the server's ready byte arrives.
    pub async fn new(mut session: RdtSession, config: &MuxConfig) -> Result<MuxClient> {
        let mut ready = [0u8; 1];
        session.read_exact(&mut ready).await?;

        let connection = yamux::Connection::new(
            session.compat(),
            yamux_config(config),
            yamux::Mode::Client,
        );
        let (open_tx, open_rx) = mpsc::channel(64);
        let closed = CancellationToken::new();
        tokio::spawn(drive(connection, Some(open_rx), None, closed.clone()));

        Ok(MuxClient { open_tx, closed })
    }

    /// Open a new logical stream.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx
            .send(reply_tx)
            .await
            .map_err(|_| Error::Mux("connection closed".into()))?;
        let stream = reply_rx
            .await
            .map_err(|_| Error::Mux("connection closed".into()))?
            .map_err(|e| Error::Mux(e.to_string()))?;
        Ok(stream.compat())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Cancelled when the underlying connection dies.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Drop for MuxClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Server half: accepts streams the peer opens.
pub struct MuxServer {
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<yamux::Stream>>,
    closed: CancellationToken,
}

impl MuxServer {
    /// Wrap a session, announcing readiness to the client first.
    pub async fn new(mut session: RdtSession, config: &MuxConfig) -> Result<MuxServer> {
        session.write_all(&[READY_BYTE]).await?;

        let connection = yamux::Connection::new(
            session.compat(),
            yamux_config(config),
            yamux::Mode::Server,
        );
        let (accept_tx, accept_rx) = mpsc::channel(64);
        let closed = CancellationToken::new();
        tokio::spawn(drive(connection, None, Some(accept_tx), closed.clone()));

        Ok(MuxServer {
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed,
        })
    }

    /// Wait for the next stream the peer opens.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let stream = self
            .accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Mux("connection closed".into()))?;
        Ok(stream.compat())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Drop for MuxServer {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

enum Event {
    Inbound(std::result::Result<yamux::Stream, yamux::ConnectionError>),
    Open(OpenReply),
    Done,
}

/// Single task driving one yamux connection: inbound acceptance and
/// outbound opens, serialized over the same poll loop.
async fn drive(
    mut connection: yamux::Connection<Compat<RdtSession>>,
    mut open_rx: Option<mpsc::Receiver<OpenReply>>,
    accept_tx: Option<mpsc::Sender<yamux::Stream>>,
    closed: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            // Handle dropped or explicit close: wind the connection down.
            _ = closed.cancelled() => Event::Done,
            event = std::future::poll_fn(|cx| {
                match connection.poll_next_inbound(cx) {
                    Poll::Ready(Some(result)) => return Poll::Ready(Event::Inbound(result)),
                    Poll::Ready(None) => return Poll::Ready(Event::Done),
                    Poll::Pending => {}
                }
                if let Some(rx) = open_rx.as_mut() {
                    match rx.poll_recv(cx) {
                        Poll::Ready(Some(reply)) => return Poll::Ready(Event::Open(reply)),
                        Poll::Ready(None) => return Poll::Ready(Event::Done),
                        Poll::Pending => {}
                    }
                }
                Poll::Pending
            }) => event,
        };

        match event {
            Event::Inbound(Ok(stream)) => match &accept_tx {
                Some(tx) => {
                    if tx.send(stream).await.is_err() {
                        break;
                    }
                }
                // Client side: the peer must not open streams.
                None => drop(stream),
            },
            Event::Inbound(Err(e)) => {
                tracing::debug!("mux connection ended: {}", e);
                break;
            }
            Event::Open(reply) => {
                let result =
                    std::future::poll_fn(|cx| connection.poll_new_outbound(cx)).await;
                let _ = reply.send(result);
            }
            Event::Done => break,
        }
    }
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdt::{RdtConfig, RdtListener, RdtSession};

    fn fast_config() -> RdtConfig {
        let mut config = RdtConfig::default();
        config.ping_interval = Duration::from_millis(200);
        config.pong_timeout = Duration::from_millis(200);
        config
    }

    /// The listener must outlive the sessions: its socket carries every
    /// accepted flow.
    async fn session_pair() -> (RdtSession, RdtSession, crate::rdt::RdtListener) {
        let listener = RdtListener::bind("127.0.0.1:0", fast_config())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        let dial = tokio::spawn(async move {
            let mut session = RdtSession::dial(&addr, fast_config()).await.unwrap();
            session.set_read_timeout(Duration::ZERO);
            session.set_write_timeout(Duration::ZERO);
            session
        });
        let mut accepted = listener.accept().await.unwrap();
        accepted.set_read_timeout(Duration::ZERO);
        accepted.set_write_timeout(Duration::ZERO);

        (dial.await.unwrap(), accepted, listener)
    }

    #[tokio::test]
    async fn test_open_accept_echo() {
        let (dialed, accepted, _listener) = session_pair().await;
        let config = MuxConfig::default();

        let server_task = tokio::spawn(async move {
            let server = MuxServer::new(accepted, &MuxConfig::default()).await.unwrap();
            let mut stream = server.accept_stream().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.shutdown().await.unwrap();
            server
        });

        let client = MuxClient::new(dialed, &config).await.unwrap();
        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_streams_are_independent() {
        let (dialed, accepted, _listener) = session_pair().await;

        let server_task = tokio::spawn(async move {
            let server = MuxServer::new(accepted, &MuxConfig::default()).await.unwrap();
            for _ in 0..4 {
                let mut stream = server.accept_stream().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 8];
                    stream.read_exact(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                });
            }
            server
        });

        let client = MuxClient::new(dialed, &MuxConfig::default()).await.unwrap();
        let mut tasks = Vec::new();
        for i in 0u8..4 {
            let stream = client.open_stream().await.unwrap();
            tasks.push(tokio::spawn(async move {
                let mut stream = stream;
                stream.write_all(&[i; 8]).await.unwrap();
                let mut buf = [0u8; 8];
                stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, [i; 8]);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_death_closes_mux() {
        let (dialed, accepted, _listener) = session_pair().await;

        let server_task =
            tokio::spawn(
                async move { MuxServer::new(accepted, &MuxConfig::default()).await.unwrap() },
            );
        let client = MuxClient::new(dialed, &MuxConfig::default()).await.unwrap();
        let server = server_task.await.unwrap();

        // Dropping the server tears down its session; the client's driver
        // notices and flags closure.
        drop(server);
        tokio::time::timeout(Duration::from_secs(5), client.closed().cancelled())
            .await
            .expect("client mux did not observe session death");
        assert!(client.is_closed());
    }
}
