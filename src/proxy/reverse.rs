//! Reverse topology: external traffic reaches endpoints behind NAT.
//!
//! The inside node dials outward and runs the mux *server*; the outside
//! node accepts the tunnel, runs the mux *client*, and opens the local
//! TCP ingress listeners. SOCKS5 roles are inverted relative to the TCP
//! ingress direction: the outside performs CONNECT through the tunnel and
//! the inside dials the actual targets. Direct mode is required — there
//! is no route back to bind a fresh listener on the inside.
//!
//! Every inside reconnect starts a new *generation*: the previous
//! generation's cancellation handle fires, its listeners and stream tasks
//! unwind, and after a short drain the new generation's listeners bind.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{expand_addr, Config, Route};
use crate::error::Result;
use crate::mux::{MuxClient, MuxConfig, MuxServer};
use crate::proxy::{serve_streams, tunnel_ingress};
use crate::rdt::{RdtListener, RdtSession};
use crate::socks5::{Socks5Client, Socks5Server};

/// Pause between reconnect attempts on the inside node.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Drain window after cancelling the previous generation.
const GENERATION_DRAIN: Duration = Duration::from_millis(100);

/// Attempts to bind a generation's ingress listener while the previous
/// generation's socket may still be winding down.
const BIND_RETRIES: u32 = 5;

/// Inside-initiator: dial outward, serve SOCKS5 in direct mode, reconnect
/// forever.
pub async fn run_inside(config: Config) -> Result<()> {
    let engine = Socks5Server::new(&config.socks5, config.rdt.clone()).with_direct_mode(true);

    loop {
        match RdtSession::dial(&config.proxy_server, config.rdt.clone()).await {
            Ok(mut session) => {
                session.set_read_timeout(Duration::ZERO);
                session.set_write_timeout(Duration::ZERO);
                tracing::info!("tunnel up to {}", config.proxy_server);

                match MuxServer::new(session, &config.mux).await {
                    Ok(mux) => {
                        serve_streams(mux, engine.clone(), config.proxy_server.clone()).await
                    }
                    Err(e) => tracing::warn!("mux setup failed: {}", e),
                }
                tracing::warn!("tunnel to {} lost", config.proxy_server);
            }
            Err(e) => tracing::warn!("dial {} failed: {}", config.proxy_server, e),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Outside-acceptor: each inside session replaces the previous generation.
pub async fn run_outside(config: Config) -> Result<()> {
    let listener =
        RdtListener::bind(&expand_addr(&config.proxy_server), config.rdt.clone()).await?;
    let socks5 = Socks5Client::new(&config.socks5);
    tracing::info!("reverse acceptor on {}", listener.local_addr());

    let mut generation: Option<CancellationToken> = None;
    loop {
        let mut session = listener.accept().await?;
        session.set_read_timeout(Duration::ZERO);
        session.set_write_timeout(Duration::ZERO);

        if let Some(previous) = generation.take() {
            tracing::info!("new inside peer, retiring previous generation");
            previous.cancel();
            tokio::time::sleep(GENERATION_DRAIN).await;
        }

        let token = CancellationToken::new();
        generation = Some(token.clone());

        let peer = session
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!("inside peer {} connected", peer);

        tokio::spawn(run_generation(
            session,
            config.router.clone(),
            socks5.clone(),
            config.proxy_server.clone(),
            config.mux.clone(),
            token,
        ));
    }
}

async fn run_generation(
    session: RdtSession,
    routes: Vec<Route>,
    socks5: Socks5Client,
    proxy_server: String,
    mux_config: MuxConfig,
    token: CancellationToken,
) {
    let mux = match MuxClient::new(session, &mux_config).await {
        Ok(mux) => Arc::new(mux),
        Err(e) => {
            tracing::warn!("mux setup failed: {}", e);
            token.cancel();
            return;
        }
    };

    // Tunnel death retires the generation even without a replacement.
    {
        let token = token.clone();
        let mux_closed = mux.closed();
        tokio::spawn(async move {
            mux_closed.cancelled().await;
            token.cancel();
        });
    }

    let mut listeners = Vec::new();
    for route in routes {
        listeners.push(tokio::spawn(run_generation_route(
            route,
            Arc::clone(&mux),
            socks5.clone(),
            proxy_server.clone(),
            token.clone(),
        )));
    }
    for listener in listeners {
        let _ = listener.await;
    }
}

/// One ingress listener whose lifetime is bounded by the generation's
/// cancellation handle.
async fn run_generation_route(
    route: Route,
    mux: Arc<MuxClient>,
    socks5: Socks5Client,
    proxy_server: String,
    token: CancellationToken,
) {
    let listener = match bind_ingress(&route.ingress).await {
        Some(listener) => listener,
        None => return,
    };
    tracing::info!("reverse ingress {} -> {}", route.ingress, route.egress);

    loop {
        let (tcp, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("accept on {} failed: {}", route.ingress, e);
                    continue;
                }
            },
        };

        let mux = Arc::clone(&mux);
        let socks5 = socks5.clone();
        let proxy_server = proxy_server.clone();
        let egress = route.egress.clone();
        let stream_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stream_token.cancelled() => {}
                result = tunnel_ingress(tcp, mux, socks5, proxy_server, egress) => {
                    if let Err(e) = result {
                        tracing::debug!("ingress {} ended: {}", peer, e);
                    }
                }
            }
        });
    }
    tracing::info!("ingress {} retired", route.ingress);
}

async fn bind_ingress(ingress: &str) -> Option<TcpListener> {
    let addr = expand_addr(ingress);
    for attempt in 0..BIND_RETRIES {
        match TcpListener::bind(&addr).await {
            Ok(listener) => return Some(listener),
            Err(e) if attempt + 1 < BIND_RETRIES => {
                tracing::debug!("bind {} attempt {} failed: {}", addr, attempt + 1, e);
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => {
                tracing::error!("cannot listen on {}: {}", addr, e);
            }
        }
    }
    None
}
