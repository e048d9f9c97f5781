//! Server side of the SOCKS5 exchange.
//!
//! `serve` runs the whole per-stream state machine: greeting, optional
//! user/pass authentication, then the CONNECT command. In direct mode the
//! success reply carries a zero bind address and the handshake stream is
//! spliced straight onto the outbound TCP socket. In bind-and-reconnect
//! mode a fresh RDT listener is opened on the outbound socket's ephemeral
//! port, the bind address is reported to the client, and exactly one
//! inbound RDT connection is accepted and spliced.

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::Socks5Config;
use crate::error::{Error, Result};
use crate::rdt::{RdtConfig, RdtListener};
use crate::socks5::addr::{read_addr_port, Address};
use crate::socks5::{
    frame, AUTH_NONE, AUTH_NO_ACCEPTABLE, AUTH_USER_PASS, CMD_CONNECT, REPLY_CMD_NOT_SUPPORTED,
    REPLY_GENERAL_FAILURE, REPLY_NET_UNREACHABLE, REPLY_SUCCESS,
};
use crate::splice::splice;

/// SOCKS5 server state machine. All state is per-call; one value may be
/// shared by any number of concurrent stream tasks.
#[derive(Debug, Clone)]
pub struct Socks5Server {
    version: u8,
    supported: Vec<u8>,
    username: String,
    password: String,
    direct_mode: bool,
    rdt: RdtConfig,
}

impl Socks5Server {
    /// Build a server engine. Configuring a username makes user/pass the
    /// required method; otherwise only NO-AUTH is offered.
    pub fn new(config: &Socks5Config, rdt: RdtConfig) -> Self {
        let supported = if config.username.is_empty() {
            vec![AUTH_NONE]
        } else {
            vec![AUTH_USER_PASS]
        };
        Self {
            version: config.version,
            supported,
            username: config.username.clone(),
            password: config.password.clone(),
            direct_mode: true,
            rdt,
        }
    }

    /// Direct mode (the default) replies with a zero bind address and
    /// splices on the handshake stream. Turning it off selects
    /// bind-and-reconnect, which only exists for vanilla SOCKS5 clients
    /// talking to the proxy directly — it costs a second RDT session.
    pub fn with_direct_mode(mut self, on: bool) -> Self {
        self.direct_mode = on;
        self
    }

    fn check_version(&self, version: u8) -> Result<()> {
        if version != self.version {
            return Err(Error::protocol(format!(
                "version mismatch: need socks {}, got {}",
                self.version, version
            )));
        }
        Ok(())
    }

    /// Run the full server exchange on one stream. `peer` is only used in
    /// logs. The stream is consumed: on success it is spliced with the
    /// target, on failure it is dropped after the canonical error reply.
    pub async fn serve<S>(&self, mut stream: S, peer: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let method = self.greet(&mut stream).await?;

        if method == AUTH_USER_PASS {
            self.authenticate(&mut stream).await?;
        }

        self.command(stream, peer).await
    }

    /// Greeting: intersect offered methods with ours, preserving our
    /// configured preference. An empty intersection is answered with 0xFF
    /// before closing.
    async fn greet<S>(&self, stream: &mut S) -> Result<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        self.check_version(head[0])?;

        let offered = if head[1] == 0 {
            vec![AUTH_NONE]
        } else {
            let mut methods = vec![0u8; head[1] as usize];
            stream.read_exact(&mut methods).await?;
            methods
        };

        let chosen = self
            .supported
            .iter()
            .copied()
            .find(|m| offered.contains(m));

        match chosen {
            Some(method) => {
                stream
                    .write_all(&frame::method_select(self.version, method))
                    .await?;
                Ok(method)
            }
            None => {
                stream
                    .write_all(&frame::method_select(self.version, AUTH_NO_ACCEPTABLE))
                    .await?;
                Err(Error::Unsupported(
                    "no acceptable authentication method".into(),
                ))
            }
        }
    }

    /// User/pass sub-negotiation (RFC 1929, except that the version byte
    /// mirrors whatever the peer sent — the deployment quirk).
    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        let sub_version = head[0];

        if head[1] == 0 {
            return Err(Error::protocol("username length is zero"));
        }
        let mut username = vec![0u8; head[1] as usize];
        stream.read_exact(&mut username).await?;

        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        if plen[0] == 0 {
            return Err(Error::protocol("password length is zero"));
        }
        let mut password = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut password).await?;

        if username == self.username.as_bytes() && password == self.password.as_bytes() {
            stream
                .write_all(&frame::userpass_response(sub_version, 0))
                .await?;
            Ok(())
        } else {
            stream
                .write_all(&frame::userpass_response(sub_version, 1))
                .await?;
            Err(Error::Auth)
        }
    }

    /// Command dispatch. Only CONNECT is implemented; everything else gets
    /// the canonical CMD_NOT_SUPPORTED reply and a closed stream.
    async fn command<S>(&self, mut stream: S, peer: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        self.check_version(head[0])?;

        if head[1] != CMD_CONNECT {
            self.reply(&mut stream, REPLY_CMD_NOT_SUPPORTED).await?;
            return Err(Error::Unsupported(format!(
                "command {:#04x} from {peer}",
                head[1]
            )));
        }

        let (dst, port) = read_addr_port(&mut stream).await?;

        let target = match TcpStream::connect((dst.to_host().as_str(), port)).await {
            Ok(target) => target,
            Err(e) => {
                self.reply(&mut stream, REPLY_NET_UNREACHABLE).await?;
                return Err(Error::Unreachable(format!("{dst}:{port}: {e}")));
            }
        };
        tracing::debug!("CONNECT {}:{} for {}", dst, port, peer);

        if self.direct_mode {
            self.reply(&mut stream, REPLY_SUCCESS).await?;
            splice(stream, target).await;
            return Ok(());
        }

        self.bind_and_reconnect(stream, target).await
    }

    /// Vanilla-SOCKS5 interop path: report a fresh RDT listener as the bind
    /// address, accept exactly one connection on it and splice that with
    /// the outbound socket.
    async fn bind_and_reconnect<S>(&self, mut stream: S, target: TcpStream) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let bind_port = target.local_addr()?.port();

        let listener = match RdtListener::bind(&format!("0.0.0.0:{bind_port}"), self.rdt.clone())
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                self.reply(&mut stream, REPLY_GENERAL_FAILURE).await?;
                return Err(e);
            }
        };

        let reply = frame::command_reply(
            self.version,
            REPLY_SUCCESS,
            &Address::V4(Ipv4Addr::UNSPECIFIED),
            bind_port,
        );
        stream.write_all(&reply).await?;

        let session = listener.accept().await?;
        splice(session, target).await;
        Ok(())
    }

    async fn reply<S>(&self, stream: &mut S, code: u8) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let reply = frame::command_reply(
            self.version,
            code,
            &Address::V4(Ipv4Addr::UNSPECIFIED),
            0,
        );
        stream.write_all(&reply).await?;
        Ok(())
    }
}
