//! Client side of the SOCKS5 exchange.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Socks5Config;
use crate::error::{Error, Result};
use crate::socks5::addr::{read_addr_port, Address};
use crate::socks5::{
    frame, reply_message, AUTH_NONE, AUTH_USER_PASS, CMD_CONNECT, REPLY_CMD_NOT_SUPPORTED,
    REPLY_SUCCESS,
};

/// SOCKS5 client state machine. Holds only configuration; every call is
/// logically per-stream, so one value can serve many concurrent tasks.
#[derive(Debug, Clone)]
pub struct Socks5Client {
    version: u8,
    methods: Vec<u8>,
    username: String,
    password: String,
}

impl Socks5Client {
    pub fn new(config: &Socks5Config) -> Self {
        let mut methods = vec![AUTH_NONE];
        if !config.username.is_empty() {
            methods.push(AUTH_USER_PASS);
        }
        Self {
            version: config.version,
            methods,
            username: config.username.clone(),
            password: config.password.clone(),
        }
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

    /// Run the greeting and (if selected) the user/pass sub-negotiation.
    pub async fn handshake<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(&frame::client_greeting(self.version, &self.methods))
            .await?;

        let mut select = [0u8; 2];
        stream.read_exact(&mut select).await?;
        self.check_version(select[0])?;

        match select[1] {
            AUTH_NONE => Ok(()),
            AUTH_USER_PASS => self.authenticate(stream).await,
            other => Err(Error::Unsupported(format!(
                "server selected auth method {other:#04x}"
            ))),
        }
    }

    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(&frame::userpass_request(
                self.version,
                &self.username,
                &self.password,
            ))
            .await?;

        let mut verdict = [0u8; 2];
        stream.read_exact(&mut verdict).await?;
        self.check_version(verdict[0])?;

        if verdict[1] != 0 {
            return Err(Error::Auth);
        }
        Ok(())
    }

    /// Issue CONNECT for `dest` (a `host:port` string) and read the reply.
    ///
    /// Returns the address to dial for the proxied connection: the reply's
    /// BND.PORT paired with the proxy peer's host. The reply's BND.ADDR is
    /// informational only — the server may legitimately report `0.0.0.0`.
    /// In direct mode the returned port is 0 and there is nothing to dial;
    /// the handshake stream itself carries the traffic.
    pub async fn connect<S>(
        &self,
        stream: &mut S,
        proxy_addr: &str,
        dest: &str,
    ) -> Result<(String, u16)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (host, port) = split_host_port(dest)?;
        let host = normalize_host(&host);

        stream
            .write_all(&frame::command_request(
                self.version,
                CMD_CONNECT,
                &Address::from_host(&host),
                port,
            ))
            .await?;

        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        self.check_version(head[0])?;

        match head[1] {
            REPLY_SUCCESS => {}
            REPLY_CMD_NOT_SUPPORTED => {
                return Err(Error::Unsupported(reply_message(head[1]).to_string()))
            }
            other => return Err(Error::Unreachable(reply_message(other).to_string())),
        }

        let (_bind_addr, bind_port) = read_addr_port(stream).await?;

        let proxy_host = proxy_addr
            .rsplit_once(':')
            .map(|(h, _)| h.to_string())
            .unwrap_or_else(|| proxy_addr.to_string());

        Ok((proxy_host, bind_port))
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::config(format!("{addr:?} is not host:port")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::config(format!("{addr:?} has an unparseable port")))?;
    Ok((host.to_string(), port))
}

fn normalize_host(host: &str) -> String {
    if host.is_empty() || host == "localhost" {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_normalization() {
        assert_eq!(normalize_host("localhost"), "127.0.0.1");
        assert_eq!(normalize_host(""), "127.0.0.1");
        assert_eq!(normalize_host("example.com"), "example.com");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("127.0.0.1:9000").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("h:badport").is_err());
    }

    #[tokio::test]
    async fn test_handshake_no_auth() {
        let (mut client_side, mut engine_side) = tokio::io::duplex(256);

        let client = Socks5Client::new(&Socks5Config::default());
        let task = tokio::spawn(async move {
            client.handshake(&mut client_side).await.map(|_| client_side)
        });

        let mut greeting = [0u8; 3];
        engine_side.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        engine_side.write_all(&[0x05, 0x00]).await.unwrap();

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_auth_rejected() {
        let (mut client_side, mut engine_side) = tokio::io::duplex(256);

        let client = Socks5Client::new(&Socks5Config {
            version: 5,
            username: "hi".into(),
            password: "wrong".into(),
        });
        let task = tokio::spawn(async move { client.handshake(&mut client_side).await });

        let mut greeting = [0u8; 4];
        engine_side.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
        engine_side.write_all(&[0x05, 0x02]).await.unwrap();

        // Read the sub-negotiation and fail it.
        let mut sub = vec![0u8; 2 + 2 + 1 + 5];
        engine_side.read_exact(&mut sub).await.unwrap();
        engine_side.write_all(&[0x05, 0x01]).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Auth));
    }

    #[tokio::test]
    async fn test_connect_reply_failure_maps_to_unreachable() {
        let (mut client_side, mut engine_side) = tokio::io::duplex(256);

        let client = Socks5Client::new(&Socks5Config::default());
        let task = tokio::spawn(async move {
            client
                .connect(&mut client_side, "198.51.100.7:8080", "127.0.0.1:9000")
                .await
        });

        let mut request = vec![0u8; 10];
        engine_side.read_exact(&mut request).await.unwrap();
        assert_eq!(request[1], CMD_CONNECT);
        engine_side
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_connect_returns_peer_host_with_reply_port() {
        let (mut client_side, mut engine_side) = tokio::io::duplex(256);

        let client = Socks5Client::new(&Socks5Config::default());
        let task = tokio::spawn(async move {
            client
                .connect(&mut client_side, "198.51.100.7:8080", "localhost:9000")
                .await
        });

        let mut request = vec![0u8; 10];
        engine_side.read_exact(&mut request).await.unwrap();
        // localhost was normalized to an IPv4 literal.
        assert_eq!(&request[3..8], &[0x01, 127, 0, 0, 1]);

        // Reply SUCCESS with BND = 0.0.0.0:4242 — the zero address must not
        // leak into the result.
        engine_reply(&mut engine_side, 4242).await;

        let (host, port) = task.await.unwrap().unwrap();
        assert_eq!(host, "198.51.100.7");
        assert_eq!(port, 4242);
    }

    async fn engine_reply(engine_side: &mut tokio::io::DuplexStream, port: u16) {
        let mut reply = vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0];
        reply.extend_from_slice(&port.to_be_bytes());
        engine_side.write_all(&reply).await.unwrap();
    }
}
