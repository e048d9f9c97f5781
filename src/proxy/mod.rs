//! Proxy orchestration.
//!
//! Four arms from (actor, proxy_mode):
//!
//! ```text
//! forward   client: TCP ingress → mux stream → SOCKS5 CONNECT → peer
//!           server: RDT accept → mux server → SOCKS5 direct serve
//! reverse   client: RDT dial → mux server → SOCKS5 direct serve (inside)
//!           server: RDT accept → mux client → TCP ingress (outside)
//! ```
//!
//! In both modes the node running the SOCKS5 *server* engine dials the
//! real targets; direct mode keeps the whole exchange on one mux stream.

pub mod forward;
pub mod reverse;

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::config::{Actor, Config, ProxyMode};
use crate::error::Result;
use crate::mux::{MuxClient, MuxServer};
use crate::socks5::{Socks5Client, Socks5Server};
use crate::splice::splice;

/// Run the configured topology. Returns only on fatal setup errors;
/// per-connection failures are logged and absorbed.
pub async fn run(config: Config) -> Result<()> {
    match (config.actor, config.mode) {
        (Actor::Client, ProxyMode::Forward) => forward::run_client(config).await,
        (Actor::Server, ProxyMode::Forward) => forward::run_server(config).await,
        (Actor::Client, ProxyMode::Reverse) => reverse::run_inside(config).await,
        (Actor::Server, ProxyMode::Reverse) => reverse::run_outside(config).await,
    }
}

/// Serve every stream the peer opens with the SOCKS5 engine until the mux
/// session dies.
pub(crate) async fn serve_streams(mux: MuxServer, engine: Socks5Server, peer: String) {
    loop {
        let stream = match mux.accept_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("mux accept from {} ended: {}", peer, e);
                return;
            }
        };
        let engine = engine.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.serve(stream, &peer).await {
                tracing::debug!("stream from {} ended: {}", peer, e);
            }
        });
    }
}

/// Carry one accepted TCP ingress through the tunnel: open a mux stream,
/// run the SOCKS5 client exchange for `egress`, then splice.
pub(crate) async fn tunnel_ingress(
    tcp: TcpStream,
    mux: Arc<MuxClient>,
    socks5: Socks5Client,
    proxy_server: String,
    egress: String,
) -> Result<()> {
    let mut stream = mux.open_stream().await?;
    socks5.handshake(&mut stream).await?;
    socks5.connect(&mut stream, &proxy_server, &egress).await?;
    splice(tcp, stream).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Route, Socks5Config};
    use crate::mux::MuxConfig;
    use crate::rdt::RdtConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn fast_rdt() -> RdtConfig {
        let mut rdt = RdtConfig::default();
        rdt.ping_interval = Duration::from_millis(200);
        rdt.pong_timeout = Duration::from_millis(200);
        rdt
    }

    fn test_config(
        actor: Actor,
        mode: ProxyMode,
        proxy_port: u16,
        ingress: &str,
        egress: &str,
        socks5: Socks5Config,
    ) -> Config {
        Config {
            actor,
            proxy_server: format!("127.0.0.1:{proxy_port}"),
            mode,
            router: vec![Route {
                ingress: ingress.to_string(),
                egress: egress.to_string(),
            }],
            socks5,
            rdt: fast_rdt(),
            mux: MuxConfig::default(),
        }
    }

    /// Echo server counting accepted connections.
    async fn start_echo() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        (addr, accepted)
    }

    async fn connect_with_retry(addr: &str) -> TcpStream {
        for _ in 0..50 {
            if let Ok(conn) = TcpStream::connect(addr).await {
                return conn;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("ingress {addr} never came up");
    }

    #[tokio::test]
    async fn test_forward_connect_round_trip() {
        let (echo_addr, accepted) = start_echo().await;
        let proxy_port = free_port();
        let ingress_port = free_port();

        let server = tokio::spawn(run(test_config(
            Actor::Server,
            ProxyMode::Forward,
            proxy_port,
            ":0",
            ":0",
            Socks5Config::default(),
        )));
        let client = tokio::spawn(run(test_config(
            Actor::Client,
            ProxyMode::Forward,
            proxy_port,
            &format!("127.0.0.1:{ingress_port}"),
            &echo_addr.to_string(),
            Socks5Config::default(),
        )));

        let mut conn = connect_with_retry(&format!("127.0.0.1:{ingress_port}")).await;
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
            .await
            .expect("no reply through the tunnel")
            .unwrap();
        assert_eq!(&buf, b"ping");

        // A second round trip on the same connection.
        conn.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Exactly one egress dial for one ingress connection.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        server.abort();
        client.abort();
    }

    #[tokio::test]
    async fn test_forward_auth_mismatch_closes_stream() {
        let (echo_addr, accepted) = start_echo().await;
        let proxy_port = free_port();
        let ingress_port = free_port();

        let server = tokio::spawn(run(test_config(
            Actor::Server,
            ProxyMode::Forward,
            proxy_port,
            ":0",
            ":0",
            Socks5Config {
                version: 5,
                username: "hi".into(),
                password: "zerpro".into(),
            },
        )));
        let client = tokio::spawn(run(test_config(
            Actor::Client,
            ProxyMode::Forward,
            proxy_port,
            &format!("127.0.0.1:{ingress_port}"),
            &echo_addr.to_string(),
            Socks5Config {
                version: 5,
                username: "hi".into(),
                password: "wrong".into(),
            },
        )));

        let mut conn = connect_with_retry(&format!("127.0.0.1:{ingress_port}")).await;
        conn.write_all(b"ping").await.unwrap();

        // The failed sub-negotiation closes the stream; no data comes back
        // and no egress connection is ever dialed.
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .expect("auth failure was not observed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(accepted.load(Ordering::SeqCst), 0);

        server.abort();
        client.abort();
    }

    #[tokio::test]
    async fn test_reverse_round_trip() {
        let (echo_addr, _) = start_echo().await;
        let proxy_port = free_port();
        let ingress_port = free_port();

        let outside = tokio::spawn(run(test_config(
            Actor::Server,
            ProxyMode::Reverse,
            proxy_port,
            &format!("127.0.0.1:{ingress_port}"),
            &echo_addr.to_string(),
            Socks5Config::default(),
        )));
        let inside = tokio::spawn(run(test_config(
            Actor::Client,
            ProxyMode::Reverse,
            proxy_port,
            ":0",
            ":0",
            Socks5Config::default(),
        )));

        let mut conn = connect_with_retry(&format!("127.0.0.1:{ingress_port}")).await;
        conn.write_all(b"reverse ping").await.unwrap();
        let mut buf = [0u8; 12];
        tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
            .await
            .expect("no reply through the reverse tunnel")
            .unwrap();
        assert_eq!(&buf, b"reverse ping");

        outside.abort();
        inside.abort();
    }

    #[tokio::test]
    async fn test_reverse_reestablishment() {
        let (echo_addr, _) = start_echo().await;
        let proxy_port = free_port();
        let ingress_port = free_port();
        let ingress = format!("127.0.0.1:{ingress_port}");

        let outside = tokio::spawn(run(test_config(
            Actor::Server,
            ProxyMode::Reverse,
            proxy_port,
            &ingress,
            &echo_addr.to_string(),
            Socks5Config::default(),
        )));
        let inside_config = test_config(
            Actor::Client,
            ProxyMode::Reverse,
            proxy_port,
            ":0",
            ":0",
            Socks5Config::default(),
        );
        let inside = tokio::spawn(run(inside_config.clone()));

        // First generation works.
        let mut conn = connect_with_retry(&ingress).await;
        conn.write_all(b"gen1").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
            .await
            .expect("first generation never served traffic")
            .unwrap();
        assert_eq!(&buf, b"gen1");
        drop(conn);

        // Inside node dies; the generation handle fires on heartbeat loss.
        inside.abort();
        tokio::time::sleep(Duration::from_millis(800)).await;

        // Inside reconnects; a fresh generation listener comes up and new
        // connections succeed.
        let inside = tokio::spawn(run(inside_config));
        let mut conn = connect_with_retry(&ingress).await;
        conn.write_all(b"gen2").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
            .await
            .expect("second generation never served traffic")
            .unwrap();
        assert_eq!(&buf, b"gen2");

        outside.abort();
        inside.abort();
    }
}
