//! Full-duplex stream splicing.
//!
//! Two concurrent copy tasks move bytes between a pair of duplex pipes,
//! drawing from a shared pool of fixed-size buffers. The splice finishes
//! as soon as *either* direction sees EOF or an error; the other direction
//! is then torn down. TCP half-close is deliberately not propagated —
//! early teardown beats leaking a half-open tunnel.

use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Copy buffer size. 32 KiB amortizes syscalls without hoarding memory
/// across many idle streams.
const BUFFER_SIZE: usize = 32 * 1024;

/// Free buffers retained for reuse.
const POOL_KEEP: usize = 64;

struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn checkout(&self) -> Vec<u8> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
    }

    fn put_back(&self, buf: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < POOL_KEEP {
            free.push(buf);
        }
    }
}

fn pool() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(|| BufferPool {
        free: Mutex::new(Vec::new()),
    })
}

/// Splice two duplex pipes together until one direction ends.
pub async fn splice<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let mut forward = tokio::spawn(copy_one_way(a_read, b_write));
    let mut backward = tokio::spawn(copy_one_way(b_read, a_write));

    // First direction to finish wins; cancelling the other drops its
    // halves and with them the underlying pipes.
    tokio::select! {
        _ = &mut forward => backward.abort(),
        _ = &mut backward => forward.abort(),
    }
}

async fn copy_one_way<R, W>(mut reader: ReadHalf<R>, mut writer: WriteHalf<W>)
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = pool().checkout();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    tracing::trace!("splice write ended: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::trace!("splice read ended: {}", e);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    pool().put_back(buf);
}
