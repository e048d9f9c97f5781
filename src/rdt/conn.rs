//! One sub-session: a reliable byte pipe over a single UDP flow.
//!
//! A spawned driver task pumps datagrams through crypto, FEC and the ARQ
//! in both directions. The application holds an [`RdtStream`]: a tokio
//! `AsyncRead`/`AsyncWrite` handle with per-operation read and write
//! deadlines (zero = disabled), short reads, and writes that chunk to the
//! segment size and loop until accepted.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};
use tokio_util::sync::{CancellationToken, PollSender};

use crate::rdt::crypto::BlockCrypt;
use crate::rdt::fec::{FecDecoder, FecEncoder, Repair};
use crate::rdt::packet::{Segment, SegmentType};
use crate::rdt::reliability::Arq;
use crate::rdt::RdtConfig;

/// The UDP path under a sub-session: a connected socket on the dialing
/// side, or a demultiplexed flow fed by the listener's recv loop.
pub(crate) enum UdpFlow {
    Dedicated(Arc<UdpSocket>),
    Demuxed {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        rx: mpsc::Receiver<Bytes>,
    },
}

impl UdpFlow {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            UdpFlow::Dedicated(socket) => socket.recv(buf).await,
            UdpFlow::Demuxed { rx, .. } => match rx.recv().await {
                Some(datagram) => {
                    let n = datagram.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram[..n]);
                    Ok(n)
                }
                None => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "listener closed",
                )),
            },
        }
    }

    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        match self {
            UdpFlow::Dedicated(socket) => socket.send(datagram).await.map(|_| ()),
            UdpFlow::Demuxed { socket, peer, .. } => {
                socket.send_to(datagram, *peer).await.map(|_| ())
            }
        }
    }

}

/// Start a sub-session over `flow`, returning the application handle.
pub(crate) fn spawn_conn(flow: UdpFlow, config: &RdtConfig) -> RdtStream {
    let (app_tx, app_rx) = mpsc::channel::<Bytes>(64);
    let (deliver_tx, deliver_rx) = mpsc::channel::<Bytes>(256);
    let shutdown = CancellationToken::new();

    let fec = if config.fec_enabled() {
        Some((
            FecEncoder::new(config.data_shard, config.parity_shard),
            FecDecoder::new(config.rcv_wnd.max(256)),
        ))
    } else {
        None
    };

    let driver = Driver {
        flow,
        crypt: BlockCrypt::new(config.crypt, &config.key, &config.salt),
        arq: Arq::new(config),
        fec,
        last_fec_pending: 0,
        from_app: app_rx,
        to_app: deliver_tx,
        shutdown: shutdown.clone(),
        interval: Duration::from_millis(config.interval_ms.max(1)),
        ack_nodelay: config.ack_nodelay,
        closing: false,
        seen_valid: false,
    };
    tokio::spawn(driver.run());

    RdtStream {
        sender: PollSender::new(app_tx),
        receiver: deliver_rx,
        leftover: Bytes::new(),
        read_deadline: deadline_opt(config.read_deadline),
        write_deadline: deadline_opt(config.write_deadline),
        read_timer: None,
        write_timer: None,
        mss: config.mss(),
        shutdown,
    }
}

fn deadline_opt(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

struct Driver {
    flow: UdpFlow,
    crypt: BlockCrypt,
    arq: Arq,
    fec: Option<(FecEncoder, FecDecoder)>,
    last_fec_pending: usize,
    from_app: mpsc::Receiver<Bytes>,
    to_app: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
    interval: Duration,
    ack_nodelay: bool,
    /// Write side closed; draining unacked segments before exit.
    closing: bool,
    /// At least one datagram decoded successfully. Before that, a decode
    /// failure means mismatched keys and fails the sub-session fast.
    seen_valid: bool,
}

impl Driver {
    async fn run(mut self) {
        let mut recv_buf = vec![0u8; 64 * 1024];
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                received = self.flow.recv(&mut recv_buf) => {
                    let ok = match received {
                        Ok(n) => self.handle_datagram(&recv_buf[..n]).await.is_ok(),
                        Err(e) => {
                            tracing::debug!("sub-session recv ended: {}", e);
                            false
                        }
                    };
                    if !ok {
                        break;
                    }
                }

                chunk = self.from_app.recv(), if !self.closing && self.arq.can_send() => {
                    match chunk {
                        Some(chunk) => {
                            if self.send_chunk(chunk).await.is_err() {
                                break;
                            }
                        }
                        None => self.closing = true,
                    }
                }

                _ = tick.tick() => {
                    if self.on_tick().await.is_err() {
                        break;
                    }
                    if self.closing && self.arq.pending_count() == 0 {
                        break;
                    }
                }
            }
        }

        // Wake the stream half: reads observe EOF, writes observe closed.
        self.shutdown.cancel();
    }

    async fn handle_datagram(&mut self, wire: &[u8]) -> io::Result<()> {
        let plain = match self.crypt.open(wire) {
            Ok(plain) => Bytes::from(plain),
            Err(e) => return self.reject(e.to_string()),
        };
        let segment = match Segment::decode(plain.clone()) {
            Ok(segment) => segment,
            Err(e) => return self.reject(e.to_string()),
        };
        self.seen_valid = true;

        match segment.segment_type {
            SegmentType::Push => {
                if let Some((_, decoder)) = &mut self.fec {
                    decoder.push_data(segment.seq, plain);
                }
                self.deliver_push(segment.seq, segment.payload).await?;
                if self.ack_nodelay {
                    self.flush_ack().await?;
                }
            }
            SegmentType::Ack => {
                let fast = self.arq.on_ack(&segment);
                for segment in fast {
                    self.transmit(&segment).await?;
                }
            }
            SegmentType::Repair => {
                let recovered = match &mut self.fec {
                    Some((_, decoder)) => match Repair::decode(segment.payload) {
                        Ok(repair) => decoder.push_repair(repair),
                        Err(_) => Vec::new(),
                    },
                    None => Vec::new(),
                };
                for (seq, wire) in recovered {
                    if let Ok(segment) = Segment::decode(wire) {
                        if segment.segment_type == SegmentType::Push {
                            tracing::trace!("FEC recovered segment {}", seq);
                            self.deliver_push(segment.seq, segment.payload).await?;
                        }
                    }
                }
                if self.ack_nodelay {
                    self.flush_ack().await?;
                }
            }
        }
        Ok(())
    }

    fn reject(&self, reason: String) -> io::Result<()> {
        if self.seen_valid {
            // Sporadic garbage after a working exchange: drop the datagram.
            tracing::trace!("dropping undecodable datagram: {}", reason);
            Ok(())
        } else {
            // The very first datagram failed: keys or ciphers mismatch.
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("first datagram undecodable (key mismatch?): {reason}"),
            ))
        }
    }

    async fn deliver_push(&mut self, seq: u64, payload: Bytes) -> io::Result<()> {
        for data in self.arq.on_push(seq, payload) {
            self.to_app
                .send(data)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream dropped"))?;
        }
        Ok(())
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        let segment = self.arq.next_push(chunk);
        let wire = segment.encode();

        let repairs = match &mut self.fec {
            Some((encoder, _)) => encoder.push(segment.seq, wire.clone()),
            None => Vec::new(),
        };

        self.transmit_wire(&wire).await?;
        for repair in repairs {
            self.transmit(&Segment::repair(repair.encode())).await?;
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> io::Result<()> {
        for segment in self.arq.retransmits(std::time::Instant::now()) {
            self.transmit(&segment).await?;
        }
        self.flush_ack().await?;

        // A partial FEC group untouched for a whole tick gets flushed so a
        // trailing burst still has loss cover.
        let idle_repairs = match &mut self.fec {
            Some((encoder, _)) => {
                let pending = encoder.pending();
                let repairs = if pending > 0 && pending == self.last_fec_pending {
                    encoder.flush()
                } else {
                    Vec::new()
                };
                self.last_fec_pending = encoder.pending();
                repairs
            }
            None => Vec::new(),
        };
        for repair in idle_repairs {
            self.transmit(&Segment::repair(repair.encode())).await?;
        }
        Ok(())
    }

    async fn flush_ack(&mut self) -> io::Result<()> {
        if let Some(ack) = self.arq.take_ack() {
            self.transmit(&ack).await?;
        }
        Ok(())
    }

    async fn transmit(&self, segment: &Segment) -> io::Result<()> {
        self.transmit_wire(&segment.encode()).await
    }

    async fn transmit_wire(&self, wire: &[u8]) -> io::Result<()> {
        let datagram = self.crypt.seal(wire);
        self.flow.send(&datagram).await
    }
}

/// Application handle for one sub-session.
pub struct RdtStream {
    sender: PollSender<Bytes>,
    receiver: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    read_deadline: Option<Duration>,
    write_deadline: Option<Duration>,
    read_timer: Option<Pin<Box<Sleep>>>,
    write_timer: Option<Pin<Box<Sleep>>>,
    mss: usize,
    shutdown: CancellationToken,
}

impl RdtStream {
    /// Set the per-read deadline. Zero disables the timeout.
    pub fn set_read_deadline(&mut self, deadline: Duration) {
        self.read_deadline = deadline_opt(deadline);
        self.read_timer = None;
    }

    /// Set the per-write deadline. Zero disables the timeout.
    pub fn set_write_deadline(&mut self, deadline: Duration) {
        self.write_deadline = deadline_opt(deadline);
        self.write_timer = None;
    }

    /// Token cancelled when the sub-session's driver exits.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Drop for RdtStream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl AsyncRead for RdtStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover.split_to(n));
            this.read_timer = None;
            return Poll::Ready(Ok(()));
        }

        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => {
                this.leftover = bytes;
                let n = this.leftover.len().min(buf.remaining());
                buf.put_slice(&this.leftover.split_to(n));
                this.read_timer = None;
                Poll::Ready(Ok(()))
            }
            // Driver gone: EOF.
            Poll::Ready(None) => {
                this.read_timer = None;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => {
                if let Some(deadline) = this.read_deadline {
                    let timer = this
                        .read_timer
                        .get_or_insert_with(|| Box::pin(sleep(deadline)));
                    if timer.as_mut().poll(cx).is_ready() {
                        this.read_timer = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read deadline elapsed",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for RdtStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.sender.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(this.mss);
                if this
                    .sender
                    .send_item(Bytes::copy_from_slice(&buf[..n]))
                    .is_err()
                {
                    return Poll::Ready(Err(closed_pipe()));
                }
                this.write_timer = None;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed_pipe())),
            Poll::Pending => {
                if let Some(deadline) = this.write_deadline {
                    let timer = this
                        .write_timer
                        .get_or_insert_with(|| Box::pin(sleep(deadline)));
                    if timer.as_mut().poll(cx).is_ready() {
                        this.write_timer = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "write deadline elapsed",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Close the write side; the driver drains unacked segments and
        // exits on its own.
        self.get_mut().sender.close();
        Poll::Ready(Ok(()))
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "sub-session closed")
}
