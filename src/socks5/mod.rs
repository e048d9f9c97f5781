//! SOCKS5 protocol engine.
//!
//! A stateless per-connection implementation of the RFC 1928 subset the
//! tunnel needs: greeting, NO-AUTH or USER/PASS authentication, and the
//! CONNECT command. Both sides run over any duplex byte pipe, so the same
//! engine serves plain TCP sockets, RDT sessions and multiplexed streams.
//!
//! Two deployment quirks are kept on purpose: the user/pass
//! sub-negotiation mirrors the outer SOCKS version byte instead of the
//! RFC 1929 value 0x01, and the server supports a *direct mode* that
//! replies with a zero bind address and splices on the handshake stream
//! itself, skipping the bind-and-reconnect dance.

pub mod addr;
pub mod client;
pub mod frame;
pub mod server;

pub use addr::Address;
pub use client::Socks5Client;
pub use server::Socks5Server;

/// Protocol version this engine speaks.
pub const VERSION: u8 = 0x05;

/// No authentication required.
pub const AUTH_NONE: u8 = 0x00;
/// Username/password authentication (RFC 1929).
pub const AUTH_USER_PASS: u8 = 0x02;
/// No acceptable methods; the server closes after sending this.
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;
/// BIND command (rejected).
pub const CMD_BIND: u8 = 0x02;
/// UDP ASSOCIATE command (rejected).
pub const CMD_UDP: u8 = 0x03;

/// Address type: IPv4, 4 bytes.
pub const ATYP_V4: u8 = 0x01;
/// Address type: domain, 1 length byte + bytes.
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type: IPv6, 16 bytes.
pub const ATYP_V6: u8 = 0x04;

/// Reply codes.
pub const REPLY_SUCCESS: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_NET_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONN_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Human-readable text for a reply code, for logs and client errors.
pub fn reply_message(code: u8) -> &'static str {
    match code {
        REPLY_SUCCESS => "success",
        REPLY_GENERAL_FAILURE => "general SOCKS server failure",
        REPLY_NOT_ALLOWED => "connection not allowed by ruleset",
        REPLY_NET_UNREACHABLE => "network unreachable",
        REPLY_HOST_UNREACHABLE => "host unreachable",
        REPLY_CONN_REFUSED => "connection refused",
        REPLY_TTL_EXPIRED => "TTL expired",
        REPLY_CMD_NOT_SUPPORTED => "command not supported",
        REPLY_ADDR_NOT_SUPPORTED => "address type not supported",
        _ => "unassigned reply code",
    }
}
