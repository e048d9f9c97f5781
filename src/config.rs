//! Runtime configuration.
//!
//! A TOML file is deserialized into [`ConfigFile`] and converted into the
//! validated runtime [`Config`]. Fields left out of the file inherit the
//! crate defaults, so a minimal config only names the actor, the proxy
//! server address and the routes.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::mux::MuxConfig;
use crate::rdt::{Crypt, Mode, RdtConfig};

/// Which side of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Listens for the RDT tunnel.
    Server,
    /// Dials the RDT tunnel.
    Client,
}

/// Topology of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// TCP ingress on the listening (outside) node; targets dialed by the
    /// dialing (inside) node.
    Reverse,
    /// TCP ingress on the dialing node; targets dialed by the listener.
    Forward,
}

/// One forwarding rule: traffic accepted on `ingress` is carried through
/// the tunnel and dialed out to `egress` by the opposite endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    #[serde(rename = "in")]
    pub ingress: String,
    #[serde(rename = "out")]
    pub egress: String,
}

/// SOCKS5 engine settings.
#[derive(Debug, Clone)]
pub struct Socks5Config {
    pub version: u8,
    pub username: String,
    pub password: String,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            version: 5,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub actor: Actor,
    pub proxy_server: String,
    pub mode: ProxyMode,
    pub router: Vec<Route>,
    pub socks5: Socks5Config,
    pub rdt: RdtConfig,
    pub mux: MuxConfig,
}

/// On-disk configuration file format.
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub actor: String,
    #[serde(default)]
    pub proxy_server: String,
    /// 0 = reverse, 1 = forward.
    #[serde(default = "default_mode")]
    pub proxy_mode: u8,
    #[serde(default)]
    pub proxy_router: Vec<Route>,
    #[serde(default)]
    pub socks5: Socks5Section,
    #[serde(default)]
    pub kcp: KcpSection,
    #[serde(default)]
    pub smux: SmuxSection,
}

fn default_mode() -> u8 {
    1
}

#[derive(Debug, Default, Deserialize)]
pub struct Socks5Section {
    pub version: Option<u8>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Transport settings. Every field is optional; unset fields inherit the
/// [`RdtConfig`] defaults.
#[derive(Debug, Default, Deserialize)]
pub struct KcpSection {
    pub key: Option<String>,
    pub salt: Option<String>,
    pub crypt: Option<String>,
    pub mode: Option<String>,
    pub nodelay: Option<u32>,
    pub interval: Option<u64>,
    pub resend: Option<u32>,
    pub nc: Option<u32>,
    pub mtu: Option<usize>,
    pub sndwnd: Option<usize>,
    pub rcvwnd: Option<usize>,
    pub datashard: Option<usize>,
    pub parityshard: Option<usize>,
    pub dscp: Option<u32>,
    pub acknodelay: Option<bool>,
    pub sockbuf: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SmuxSection {
    pub keep_alive_interval: Option<u64>,
    pub keep_alive_timeout: Option<u64>,
    pub max_frame_size: Option<usize>,
    pub max_receive_buffer: Option<usize>,
    pub max_stream_buffer: Option<usize>,
}

impl ConfigFile {
    /// Convert into the runtime configuration, validating as we go.
    pub fn into_config(self) -> Result<Config> {
        let actor = match self.actor.as_str() {
            "server" => Actor::Server,
            "client" => Actor::Client,
            other => {
                return Err(Error::config(format!(
                    "actor must be \"server\" or \"client\", got {other:?}"
                )))
            }
        };

        let mode = match self.proxy_mode {
            0 => ProxyMode::Reverse,
            1 => ProxyMode::Forward,
            other => {
                return Err(Error::config(format!(
                    "proxy_mode must be 0 (reverse) or 1 (forward), got {other}"
                )))
            }
        };

        validate_addr("proxy_server", &self.proxy_server)?;

        if self.proxy_router.is_empty() {
            return Err(Error::config("proxy_router must not be empty"));
        }
        for route in &self.proxy_router {
            validate_addr("route ingress", &route.ingress)?;
            validate_addr("route egress", &route.egress)?;
        }

        let mut rdt = RdtConfig::default();
        let k = self.kcp;
        if let Some(v) = k.key {
            rdt.key = v;
        }
        if let Some(v) = k.salt {
            rdt.salt = v;
        }
        if let Some(v) = k.crypt {
            rdt.crypt = Crypt::parse(&v)
                .ok_or_else(|| Error::config(format!("unknown crypt {v:?}")))?;
        }
        if let Some(v) = k.nodelay {
            rdt.nodelay = v != 0;
        }
        if let Some(v) = k.interval {
            rdt.interval_ms = v;
        }
        if let Some(v) = k.resend {
            rdt.resend = v;
        }
        if let Some(v) = k.nc {
            rdt.nocongestion = v != 0;
        }
        // The mode tuple overrides the individually named knobs.
        if let Some(v) = k.mode {
            let mode = Mode::parse(&v)
                .ok_or_else(|| Error::config(format!("unknown kcp mode {v:?}")))?;
            mode.apply(&mut rdt);
        }
        if let Some(v) = k.mtu {
            rdt.mtu = v;
        }
        if let Some(v) = k.sndwnd {
            rdt.snd_wnd = v;
        }
        if let Some(v) = k.rcvwnd {
            rdt.rcv_wnd = v;
        }
        if let Some(v) = k.datashard {
            rdt.data_shard = v;
        }
        if let Some(v) = k.parityshard {
            rdt.parity_shard = v;
        }
        if let Some(v) = k.dscp {
            rdt.dscp = v;
        }
        if let Some(v) = k.acknodelay {
            rdt.ack_nodelay = v;
        }
        if let Some(v) = k.sockbuf {
            rdt.sock_buf = v;
        }

        let mut mux = MuxConfig::default();
        let s = self.smux;
        if let Some(v) = s.keep_alive_interval {
            mux.keep_alive_interval = std::time::Duration::from_secs(v);
        }
        if let Some(v) = s.keep_alive_timeout {
            mux.keep_alive_timeout = std::time::Duration::from_secs(v);
        }
        if let Some(v) = s.max_frame_size {
            mux.max_frame_size = v;
        }
        if let Some(v) = s.max_receive_buffer {
            mux.max_receive_buffer = v;
        }
        if let Some(v) = s.max_stream_buffer {
            mux.max_stream_buffer = v;
        }

        let socks5 = Socks5Config {
            version: self.socks5.version.unwrap_or(5),
            username: self.socks5.username.unwrap_or_default(),
            password: self.socks5.password.unwrap_or_default(),
        };

        Ok(Config {
            actor,
            proxy_server: self.proxy_server,
            mode,
            router: self.proxy_router,
            socks5,
            rdt,
            mux,
        })
    }
}

/// Load and validate a configuration file.
pub fn load(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {path}: {e}")))?;
    let file: ConfigFile =
        toml::from_str(&content).map_err(|e| Error::config(format!("cannot parse {path}: {e}")))?;
    file.into_config()
}

/// Expand the Go-style shorthand `":8888"` to `"0.0.0.0:8888"` so the
/// address can be bound or dialed directly.
pub fn expand_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn validate_addr(what: &str, addr: &str) -> Result<()> {
    if addr.is_empty() {
        return Err(Error::config(format!("{what} must not be empty")));
    }
    let (_, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::config(format!("{what} {addr:?} is not host:port")))?;
    port.parse::<u16>()
        .map_err(|_| Error::config(format!("{what} {addr:?} has an unparseable port")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let file: ConfigFile = toml::from_str(toml_text).unwrap();
        file.into_config()
    }

    #[test]
    fn test_minimal_config() {
        let config = parse(
            r#"
            actor = "client"
            proxy_server = "127.0.0.1:8080"
            proxy_router = [{ in = "127.0.0.1:7000", out = "127.0.0.1:9000" }]
            "#,
        )
        .unwrap();

        assert_eq!(config.actor, Actor::Client);
        assert_eq!(config.mode, ProxyMode::Forward);
        assert_eq!(config.router.len(), 1);
        // Defaults survived.
        assert_eq!(config.rdt.key, "creeper");
        assert_eq!(config.rdt.mtu, 1400);
        assert_eq!(config.socks5.version, 5);
    }

    #[test]
    fn test_mode_tuple_overrides_named_fields() {
        let config = parse(
            r#"
            actor = "server"
            proxy_server = "0.0.0.0:8080"
            proxy_mode = 0
            proxy_router = [{ in = ":8888", out = ":8090" }]

            [kcp]
            nodelay = 0
            interval = 99
            mode = "fast3"
            "#,
        )
        .unwrap();

        assert!(config.rdt.nodelay);
        assert_eq!(config.rdt.interval_ms, 10);
        assert_eq!(config.rdt.resend, 2);
        assert!(config.rdt.nocongestion);
    }

    #[test]
    fn test_missing_proxy_server_is_fatal() {
        let err = parse(
            r#"
            actor = "client"
            proxy_router = [{ in = ":1", out = ":2" }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_router_is_fatal() {
        let err = parse(
            r#"
            actor = "client"
            proxy_server = "127.0.0.1:8080"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_port_is_fatal() {
        let err = parse(
            r#"
            actor = "client"
            proxy_server = "127.0.0.1:notaport"
            proxy_router = [{ in = ":1", out = ":2" }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_crypt_rejected() {
        let err = parse(
            r#"
            actor = "client"
            proxy_server = "127.0.0.1:8080"
            proxy_router = [{ in = ":1", out = ":2" }]
            [kcp]
            crypt = "rot13"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
