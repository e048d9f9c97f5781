//! Reliable datagram transport (RDT).
//!
//! An ordered, reliable, encrypted byte pipe over UDP with heartbeat-driven
//! liveness. A full session pairs two sub-sessions under one 20-byte
//! session id: a *data* sub-session carrying the application stream and a
//! *keepalive* sub-session carrying one-byte pings. The listener
//! demultiplexes concurrently arriving sub-sessions back into sessions.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  Session (pairing, handshake, ping/pong)       │
//! ├────────────────────────────────────────────────┤
//! │  Reliability (SACK, RTO, windows)              │
//! ├────────────────────────────────────────────────┤
//! │  FEC (XOR parity shards)                       │
//! ├────────────────────────────────────────────────┤
//! │  Datagram crypto (PBKDF2 key, per-packet IV)   │
//! ├────────────────────────────────────────────────┤
//! │  UDP (dedicated socket or demultiplexed flow)  │
//! └────────────────────────────────────────────────┘
//! ```

pub mod conn;
pub mod crypto;
pub mod fec;
pub mod listener;
pub mod packet;
pub mod reliability;
pub mod session;

pub use conn::RdtStream;
pub use crypto::Crypt;
pub use listener::RdtListener;
pub use packet::SessionId;
pub use session::RdtSession;

use std::time::Duration;

/// Transport configuration. `Default` carries the stock profile; the
/// config file overrides individual fields and a `mode` overrides the
/// four latency knobs as a tuple.
#[derive(Debug, Clone)]
pub struct RdtConfig {
    /// Pre-shared key material for PBKDF2.
    pub key: String,
    /// PBKDF2 salt.
    pub salt: String,
    /// Datagram cipher.
    pub crypt: Crypt,

    /// Lower retransmission latency at the cost of bandwidth.
    pub nodelay: bool,
    /// Internal tick in milliseconds: retransmission checks and
    /// scheduled acknowledgments run at this cadence.
    pub interval_ms: u64,
    /// Fast-retransmit threshold: a pending segment skipped by this many
    /// selective acks is resent without waiting for its timeout.
    pub resend: u32,
    /// Disable the congestion window; flow is bounded only by the
    /// configured and advertised windows.
    pub nocongestion: bool,

    /// Maximum datagram size including transport overhead.
    pub mtu: usize,
    /// Send window in segments.
    pub snd_wnd: usize,
    /// Receive window in segments.
    pub rcv_wnd: usize,
    /// Data shards per FEC group. 0 disables FEC.
    pub data_shard: usize,
    /// Parity shards emitted per FEC group.
    pub parity_shard: usize,
    /// DSCP value for outgoing datagrams (written as TOS).
    pub dscp: u32,
    /// Kernel socket buffer size, bytes.
    pub sock_buf: usize,
    /// Acknowledge every data segment immediately instead of on the tick.
    pub ack_nodelay: bool,

    /// Read deadline for session reads. Zero disables the timeout.
    pub read_deadline: Duration,
    /// Write deadline for session writes. Zero disables the timeout.
    pub write_deadline: Duration,
    /// Heartbeat cadence on the keepalive sub-session.
    pub ping_interval: Duration,
    /// Extra grace for the pong beyond the ping interval.
    pub pong_timeout: Duration,
}

impl Default for RdtConfig {
    fn default() -> Self {
        Self {
            key: "creeper".to_string(),
            salt: "awman".to_string(),
            crypt: Crypt::Aes256,
            // fast3 profile
            nodelay: true,
            interval_ms: 10,
            resend: 2,
            nocongestion: true,
            mtu: 1400,
            snd_wnd: 128,
            rcv_wnd: 1024,
            data_shard: 10,
            parity_shard: 3,
            dscp: 46,
            sock_buf: 10240,
            ack_nodelay: false,
            read_deadline: Duration::from_secs(3),
            write_deadline: Duration::from_secs(3),
            ping_interval: Duration::from_secs(3),
            pong_timeout: Duration::from_secs(3),
        }
    }
}

impl RdtConfig {
    /// Maximum segment payload: the MTU minus segment header and
    /// per-datagram crypto overhead.
    pub fn mss(&self) -> usize {
        self.mtu
            .saturating_sub(packet::HEADER_SIZE + crypto::MAX_OVERHEAD)
            .max(128)
    }

    /// Whether FEC is active.
    pub fn fec_enabled(&self) -> bool {
        self.data_shard > 0 && self.parity_shard > 0
    }
}

/// Latency/throughput profile. Setting a mode overrides the four
/// individually named knobs as one tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Fast,
    Fast2,
    Fast3,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Mode> {
        match s {
            "normal" => Some(Mode::Normal),
            "fast" => Some(Mode::Fast),
            "fast2" => Some(Mode::Fast2),
            "fast3" => Some(Mode::Fast3),
            _ => None,
        }
    }

    /// (nodelay, interval_ms, resend, nocongestion)
    fn tuple(self) -> (bool, u64, u32, bool) {
        match self {
            Mode::Normal => (false, 40, 2, true),
            Mode::Fast => (false, 30, 2, true),
            Mode::Fast2 => (true, 20, 2, true),
            Mode::Fast3 => (true, 10, 2, true),
        }
    }

    pub fn apply(self, config: &mut RdtConfig) {
        let (nodelay, interval_ms, resend, nocongestion) = self.tuple();
        config.nodelay = nodelay;
        config.interval_ms = interval_ms;
        config.resend = resend;
        config.nocongestion = nocongestion;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_tuples() {
        let mut config = RdtConfig::default();
        Mode::Normal.apply(&mut config);
        assert!(!config.nodelay);
        assert_eq!(config.interval_ms, 40);

        Mode::Fast3.apply(&mut config);
        assert!(config.nodelay);
        assert_eq!(config.interval_ms, 10);
        assert_eq!(config.resend, 2);
        assert!(config.nocongestion);
    }

    #[test]
    fn test_mss_leaves_room_for_overhead() {
        let config = RdtConfig::default();
        assert!(config.mss() + packet::HEADER_SIZE + crypto::MAX_OVERHEAD <= config.mtu);
    }
}
