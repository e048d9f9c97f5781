//! Forward topology: internal client → proxy → external target.
//!
//! The client actor owns the TCP ingress listeners and one shared tunnel
//! to the proxy server; the server actor answers every mux stream with
//! the SOCKS5 engine in direct mode and dials the real targets.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::config::{expand_addr, Config, Route};
use crate::error::Result;
use crate::mux::{MuxClient, MuxConfig, MuxServer};
use crate::proxy::{serve_streams, tunnel_ingress};
use crate::rdt::{RdtConfig, RdtListener, RdtSession};
use crate::socks5::{Socks5Client, Socks5Server};

/// Client actor: per-route TCP listeners feeding the shared tunnel.
pub async fn run_client(config: Config) -> Result<()> {
    let socks5 = Socks5Client::new(&config.socks5);
    let tunnel = Arc::new(Tunnel::new(
        config.proxy_server.clone(),
        config.rdt.clone(),
        config.mux.clone(),
    ));

    let mut routes = Vec::new();
    for route in config.router.clone() {
        routes.push(tokio::spawn(run_route(
            route,
            Arc::clone(&tunnel),
            socks5.clone(),
            config.proxy_server.clone(),
        )));
    }
    for route in routes {
        let _ = route.await;
    }
    Ok(())
}

async fn run_route(
    route: Route,
    tunnel: Arc<Tunnel>,
    socks5: Socks5Client,
    proxy_server: String,
) {
    let listener = match TcpListener::bind(expand_addr(&route.ingress)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("cannot listen on {}: {}", route.ingress, e);
            return;
        }
    };
    tracing::info!("forward ingress {} -> {}", route.ingress, route.egress);

    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("accept on {} failed: {}", route.ingress, e);
                continue;
            }
        };

        let tunnel = Arc::clone(&tunnel);
        let socks5 = socks5.clone();
        let proxy_server = proxy_server.clone();
        let egress = route.egress.clone();
        tokio::spawn(async move {
            let mux = match tunnel.acquire().await {
                Ok(mux) => mux,
                Err(e) => {
                    tracing::warn!("tunnel unavailable for {}: {}", peer, e);
                    return;
                }
            };
            if let Err(e) = tunnel_ingress(tcp, mux, socks5, proxy_server, egress).await {
                tracing::debug!("ingress {} ended: {}", peer, e);
            }
        });
    }
}

/// The shared RDT+mux connection to the proxy peer, re-dialed on demand
/// after it dies.
struct Tunnel {
    addr: String,
    rdt: RdtConfig,
    mux: MuxConfig,
    slot: Mutex<Option<Arc<MuxClient>>>,
}

impl Tunnel {
    fn new(addr: String, rdt: RdtConfig, mux: MuxConfig) -> Self {
        Self {
            addr,
            rdt,
            mux,
            slot: Mutex::new(None),
        }
    }

    async fn acquire(&self) -> Result<Arc<MuxClient>> {
        let mut slot = self.slot.lock().await;
        if let Some(mux) = slot.as_ref() {
            if !mux.is_closed() {
                return Ok(Arc::clone(mux));
            }
        }

        let mut session = RdtSession::dial(&self.addr, self.rdt.clone()).await?;
        // Tunnel lifetime is governed by the keepalive.
        session.set_read_timeout(Duration::ZERO);
        session.set_write_timeout(Duration::ZERO);

        let mux = Arc::new(MuxClient::new(session, &self.mux).await?);
        *slot = Some(Arc::clone(&mux));
        tracing::info!("tunnel established to {}", self.addr);
        Ok(mux)
    }
}

/// Server actor: accept RDT sessions, answer their streams in direct mode.
pub async fn run_server(config: Config) -> Result<()> {
    let listener =
        RdtListener::bind(&expand_addr(&config.proxy_server), config.rdt.clone()).await?;
    let engine = Socks5Server::new(&config.socks5, config.rdt.clone()).with_direct_mode(true);
    tracing::info!("forward proxy listening on {}", listener.local_addr());

    loop {
        let mut session = listener.accept().await?;
        session.set_read_timeout(Duration::ZERO);
        session.set_write_timeout(Duration::ZERO);

        let peer = session
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!("tunnel from {}", peer);

        let engine = engine.clone();
        let mux_config = config.mux.clone();
        tokio::spawn(async move {
            match MuxServer::new(session, &mux_config).await {
                Ok(mux) => serve_streams(mux, engine, peer).await,
                Err(e) => tracing::warn!("mux setup with {} failed: {}", peer, e),
            }
        });
    }
}
