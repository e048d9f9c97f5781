//! SOCKS5 record encoders.
//!
//! Every record the engine emits is built here, byte-exact:
//!
//! ```text
//! greeting:        VER | NMETHODS | METHODS...
//! method-select:   VER | METHOD
//! user/pass:       VER | ULEN | UNAME | PLEN | PASS
//! user/pass reply: VER | STATUS
//! request:         VER | CMD | RSV=0 | ATYP | DST.ADDR | DST.PORT
//! reply:           VER | REP | RSV=0 | ATYP | BND.ADDR | BND.PORT
//! ```
//!
//! The user/pass record carries the outer SOCKS version byte rather than
//! the RFC 1929 sub-negotiation version; peers in this deployment family
//! expect the mirror.

use crate::socks5::addr::{encode_addr_port, Address};

/// Client greeting: offered authentication methods.
pub fn client_greeting(version: u8, methods: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + methods.len());
    buf.push(version);
    buf.push(methods.len() as u8);
    buf.extend_from_slice(methods);
    buf
}

/// Server method selection.
pub fn method_select(version: u8, method: u8) -> [u8; 2] {
    [version, method]
}

/// Client user/pass sub-negotiation.
pub fn userpass_request(version: u8, username: &str, password: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(version);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    buf
}

/// Server user/pass verdict. Status 0 is success, anything else failure.
pub fn userpass_response(version: u8, status: u8) -> [u8; 2] {
    [version, status]
}

/// Client command request.
pub fn command_request(version: u8, command: u8, addr: &Address, port: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.push(version);
    buf.push(command);
    buf.push(0x00);
    encode_addr_port(addr, port, &mut buf);
    buf
}

/// Server command reply. Callers that do not care about the bind address
/// pass `0.0.0.0:0`.
pub fn command_reply(version: u8, reply: u8, bind: &Address, port: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.push(version);
    buf.push(reply);
    buf.push(0x00);
    encode_addr_port(bind, port, &mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks5::{AUTH_NONE, AUTH_USER_PASS, CMD_CONNECT, REPLY_CMD_NOT_SUPPORTED};

    #[test]
    fn test_greeting_layout() {
        let buf = client_greeting(5, &[AUTH_NONE, AUTH_USER_PASS]);
        assert_eq!(buf, vec![0x05, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn test_userpass_layout() {
        let buf = userpass_request(5, "hi", "zerpro");
        assert_eq!(buf[0], 5);
        assert_eq!(buf[1], 2);
        assert_eq!(&buf[2..4], b"hi");
        assert_eq!(buf[4], 6);
        assert_eq!(&buf[5..11], b"zerpro");
    }

    #[test]
    fn test_request_layout() {
        let buf = command_request(5, CMD_CONNECT, &Address::from_host("127.0.0.1"), 9000);
        assert_eq!(
            buf,
            vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x23, 0x28]
        );
    }

    #[test]
    fn test_command_not_supported_reply_bytes() {
        let buf = command_reply(
            5,
            REPLY_CMD_NOT_SUPPORTED,
            &Address::from_host("0.0.0.0"),
            0,
        );
        assert_eq!(buf, vec![0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
