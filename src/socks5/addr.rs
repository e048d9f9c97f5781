//! SOCKS5 address codec.
//!
//! An address on the wire is a 1-byte type tag followed by 4 bytes (IPv4),
//! 16 bytes (IPv6) or a 1-byte length plus that many bytes (domain), then
//! a big-endian u16 port.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::socks5::{ATYP_DOMAIN, ATYP_V4, ATYP_V6};

/// A destination or bind address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// Build an address from a textual host. A host that parses as an IP
    /// literal becomes `V4`/`V6`; anything else is carried as a domain and
    /// passed through to the peer unresolved.
    pub fn from_host(host: &str) -> Address {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Address::V4(ip),
            Ok(IpAddr::V6(ip)) => Address::V6(ip),
            Err(_) => Address::Domain(host.to_string()),
        }
    }

    /// Textual form, suitable for dialing.
    pub fn to_host(&self) -> String {
        match self {
            Address::V4(ip) => ip.to_string(),
            Address::V6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }

    /// Append the tagged wire form (without the port) to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Address::V4(ip) => {
                buf.push(ATYP_V4);
                buf.extend_from_slice(&ip.octets());
            }
            Address::V6(ip) => {
                buf.push(ATYP_V6);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(d) => {
                buf.push(ATYP_DOMAIN);
                buf.push(d.len() as u8);
                buf.extend_from_slice(d.as_bytes());
            }
        }
    }

    /// Read a tagged address (without the port). Every field is read with
    /// exactly its declared size; anything outside the type's bounds is a
    /// protocol error.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Address> {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag).await?;

        match tag[0] {
            ATYP_V4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                Ok(Address::V4(Ipv4Addr::from(octets)))
            }
            ATYP_V6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                Ok(Address::V6(Ipv6Addr::from(octets)))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                r.read_exact(&mut len).await?;
                if len[0] == 0 {
                    return Err(Error::protocol("domain address with length 0"));
                }
                let mut name = vec![0u8; len[0] as usize];
                r.read_exact(&mut name).await?;
                let name = String::from_utf8(name)
                    .map_err(|_| Error::protocol("domain address is not valid UTF-8"))?;
                Ok(Address::Domain(name))
            }
            other => Err(Error::protocol(format!("unknown address type {other:#04x}"))),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_host())
    }
}

/// Read a tagged address followed by the big-endian port.
pub async fn read_addr_port<R: AsyncRead + Unpin>(r: &mut R) -> Result<(Address, u16)> {
    let addr = Address::read(r).await?;
    let mut port = [0u8; 2];
    r.read_exact(&mut port).await?;
    Ok((addr, u16::from_be_bytes(port)))
}

/// Append a tagged address and big-endian port to `buf`.
pub fn encode_addr_port(addr: &Address, port: u16, buf: &mut Vec<u8>) {
    addr.encode_into(buf);
    buf.extend_from_slice(&port.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(addr: Address, port: u16) -> (Address, u16) {
        let mut buf = Vec::new();
        encode_addr_port(&addr, port, &mut buf);
        let mut cursor = std::io::Cursor::new(buf);
        read_addr_port(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_ipv4_roundtrip() {
        let addr = Address::from_host("93.184.216.34");
        assert!(matches!(addr, Address::V4(_)));
        let (decoded, port) = roundtrip(addr.clone(), 443).await;
        assert_eq!(decoded, addr);
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn test_ipv6_roundtrip() {
        let addr = Address::from_host("2606:2800:220:1::1");
        assert!(matches!(addr, Address::V6(_)));
        let (decoded, port) = roundtrip(addr.clone(), 8443).await;
        assert_eq!(decoded, addr);
        assert_eq!(port, 8443);
    }

    #[tokio::test]
    async fn test_domain_roundtrip() {
        let addr = Address::from_host("example.com");
        assert!(matches!(addr, Address::Domain(_)));
        let (decoded, port) = roundtrip(addr.clone(), 80).await;
        assert_eq!(decoded, addr);
        assert_eq!(port, 80);
    }

    #[test]
    fn test_ip_literal_preference() {
        let mut buf = Vec::new();
        Address::from_host("10.0.0.1").encode_into(&mut buf);
        assert_eq!(buf[0], ATYP_V4);

        buf.clear();
        Address::from_host("::1").encode_into(&mut buf);
        assert_eq!(buf[0], ATYP_V6);

        buf.clear();
        Address::from_host("not-an-ip.example").encode_into(&mut buf);
        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1] as usize, "not-an-ip.example".len());
    }

    #[tokio::test]
    async fn test_zero_length_domain_rejected() {
        let buf = vec![ATYP_DOMAIN, 0x00];
        let mut cursor = std::io::Cursor::new(buf);
        let err = Address::read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_unknown_atyp_rejected() {
        let buf = vec![0x07, 1, 2, 3, 4];
        let mut cursor = std::io::Cursor::new(buf);
        let err = Address::read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_truncated_address_fails() {
        let buf = vec![ATYP_V4, 10, 0];
        let mut cursor = std::io::Cursor::new(buf);
        assert!(Address::read(&mut cursor).await.is_err());
    }
}
