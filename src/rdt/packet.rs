//! Segment framing and session identifiers.
//!
//! Each UDP datagram carries exactly one segment (after decryption):
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ Type (1) │ Seq (8) │ Ack (8) │ Window (2) │ Len (2)  │
//! ├──────────────────────────────────────────────────────┤
//! │ Payload (Len bytes)                                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! `Push` carries stream bytes at `seq`. `Ack` carries the cumulative ack
//! (all segments below `ack` received) plus selective ranges in its
//! payload. `Repair` carries an FEC parity record.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Segment header size in bytes.
pub const HEADER_SIZE: usize = 21;

/// Handshake record length: 1 tag byte + 20-byte session id. Sent as the
/// first payload bytes of every sub-session, before any user data.
pub const HANDSHAKE_LEN: usize = 21;

/// Handshake tag for the data sub-session.
pub const TAG_DATA: u8 = 0x00;
/// Handshake tag for the keepalive sub-session.
pub const TAG_KEEPALIVE: u8 = 0x01;

/// Segment types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    Push = 0x00,
    Ack = 0x01,
    Repair = 0x02,
}

impl TryFrom<u8> for SegmentType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(SegmentType::Push),
            0x01 => Ok(SegmentType::Ack),
            0x02 => Ok(SegmentType::Repair),
            _ => Err(Error::protocol(format!("unknown segment type {value:#04x}"))),
        }
    }
}

/// A transport segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub segment_type: SegmentType,
    /// Sequence number (Push only; 0 otherwise).
    pub seq: u64,
    /// Cumulative acknowledgment: every seq below this was received.
    pub ack: u64,
    /// Advertised receive window, in segments.
    pub window: u16,
    pub payload: Bytes,
}

impl Segment {
    pub fn push(seq: u64, payload: Bytes) -> Self {
        Self {
            segment_type: SegmentType::Push,
            seq,
            ack: 0,
            window: 0,
            payload,
        }
    }

    pub fn ack(ack: u64, window: u16, sack_payload: Bytes) -> Self {
        Self {
            segment_type: SegmentType::Ack,
            seq: 0,
            ack,
            window,
            payload: sack_payload,
        }
    }

    pub fn repair(payload: Bytes) -> Self {
        Self {
            segment_type: SegmentType::Repair,
            seq: 0,
            ack: 0,
            window: 0,
            payload,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.segment_type as u8);
        buf.put_u64(self.seq);
        buf.put_u64(self.ack);
        buf.put_u16(self.window);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Deserialize from wire bytes. Trailing bytes beyond the declared
    /// payload length are ignored (FEC recovery pads with zeros).
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::protocol(format!(
                "segment too short: {} bytes",
                data.len()
            )));
        }

        let segment_type = SegmentType::try_from(data.get_u8())?;
        let seq = data.get_u64();
        let ack = data.get_u64();
        let window = data.get_u16();
        let len = data.get_u16() as usize;

        if data.len() < len {
            return Err(Error::protocol(format!(
                "segment truncated: header says {len} payload bytes, got {}",
                data.len()
            )));
        }

        Ok(Self {
            segment_type,
            seq,
            ack,
            window,
            payload: data.split_to(len),
        })
    }
}

/// Encode the SACK ranges of an Ack payload.
pub fn encode_sack_ranges(ranges: &[(u64, u64)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + ranges.len() * 16);
    buf.put_u8(ranges.len() as u8);
    for (start, end) in ranges {
        buf.put_u64(*start);
        buf.put_u64(*end);
    }
    buf.freeze()
}

/// Decode the SACK ranges of an Ack payload.
pub fn decode_sack_ranges(mut data: Bytes) -> Result<Vec<(u64, u64)>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let count = data.get_u8() as usize;
    if data.len() < count * 16 {
        return Err(Error::protocol("SACK ranges truncated"));
    }
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        let start = data.get_u64();
        let end = data.get_u64();
        ranges.push((start, end));
    }
    Ok(ranges)
}

/// 20-byte k-sortable session identifier: a big-endian unix timestamp
/// prefix for monotonicity, a random suffix for collision resistance
/// across hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub [u8; 20]);

impl SessionId {
    pub const LEN: usize = 20;

    /// Generate a fresh id.
    pub fn generate() -> SessionId {
        use rand::RngCore;

        let mut bytes = [0u8; 20];
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut bytes[4..]);
        SessionId(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SessionId> {
        if bytes.len() != Self::LEN {
            return Err(Error::protocol(format!(
                "session id must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(SessionId(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The short prefix is plenty for logs.
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

/// Build the 21-byte sub-session handshake record.
pub fn encode_handshake(tag: u8, sid: &SessionId) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[0] = tag;
    buf[1..].copy_from_slice(sid.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_roundtrip() {
        let seg = Segment::push(42, Bytes::from_static(b"hello world"));
        let decoded = Segment::decode(seg.encode()).unwrap();

        assert_eq!(decoded.segment_type, SegmentType::Push);
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.payload.as_ref(), b"hello world");
    }

    #[test]
    fn test_segment_ignores_trailing_padding() {
        let seg = Segment::push(7, Bytes::from_static(b"abc"));
        let mut wire = BytesMut::from(seg.encode().as_ref());
        wire.extend_from_slice(&[0u8; 16]);

        let decoded = Segment::decode(wire.freeze()).unwrap();
        assert_eq!(decoded.payload.as_ref(), b"abc");
    }

    #[test]
    fn test_segment_decode_invalid() {
        assert!(Segment::decode(Bytes::from_static(&[0, 1, 2])).is_err());

        let mut bad = BytesMut::zeroed(HEADER_SIZE);
        bad[0] = 0x09;
        assert!(Segment::decode(bad.freeze()).is_err());
    }

    #[test]
    fn test_sack_roundtrip() {
        let ranges = vec![(10, 20), (30, 30)];
        let decoded = decode_sack_ranges(encode_sack_ranges(&ranges)).unwrap();
        assert_eq!(decoded, ranges);
    }

    #[test]
    fn test_session_id_sorts_by_time_prefix() {
        let mut early = [0u8; 20];
        early[..4].copy_from_slice(&100u32.to_be_bytes());
        let mut late = [0u8; 20];
        late[..4].copy_from_slice(&200u32.to_be_bytes());

        assert!(SessionId(early) < SessionId(late));
    }

    #[test]
    fn test_session_ids_are_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_handshake_layout() {
        let sid = SessionId::generate();
        let hs = encode_handshake(TAG_KEEPALIVE, &sid);
        assert_eq!(hs.len(), HANDSHAKE_LEN);
        assert_eq!(hs[0], TAG_KEEPALIVE);
        assert_eq!(&hs[1..], sid.as_bytes());
    }
}
