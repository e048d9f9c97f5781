//! Forward error correction.
//!
//! XOR parity over encoded data segments, keyed by their sequence numbers.
//! Every `data_shard` segments form a group; the group is split into
//! `parity_shard` contiguous sub-ranges and one repair datagram is emitted
//! per sub-range, carrying the XOR of the raw segment bytes it covers. A
//! single loss inside a sub-range is recoverable without retransmission.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// A parity record covering the contiguous range
/// `[start_seq, start_seq + count)`.
#[derive(Debug, Clone)]
pub struct Repair {
    pub start_seq: u64,
    pub count: u16,
    /// XOR of the covered segments' wire bytes, padded to the longest.
    pub data: Bytes,
}

impl Repair {
    /// Serialize as a Repair segment payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10 + self.data.len());
        buf.put_u64(self.start_seq);
        buf.put_u16(self.count);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Deserialize from a Repair segment payload.
    pub fn decode(mut data: Bytes) -> Result<Repair> {
        if data.len() < 10 {
            return Err(Error::protocol("repair record too short"));
        }
        let start_seq = data.get_u64();
        let count = data.get_u16();
        Ok(Repair {
            start_seq,
            count,
            data,
        })
    }

    fn seqs(&self) -> impl Iterator<Item = u64> {
        self.start_seq..self.start_seq + self.count as u64
    }
}

/// Groups outgoing segments and emits parity.
pub struct FecEncoder {
    data_shard: usize,
    parity_shard: usize,
    /// Current group: (seq, wire bytes).
    group: Vec<(u64, Bytes)>,
}

impl FecEncoder {
    pub fn new(data_shard: usize, parity_shard: usize) -> Self {
        Self {
            data_shard: data_shard.max(1),
            parity_shard: parity_shard.max(1),
            group: Vec::with_capacity(data_shard),
        }
    }

    /// Add an outgoing segment. Returns the group's repairs once it fills.
    pub fn push(&mut self, seq: u64, wire: Bytes) -> Vec<Repair> {
        self.group.push((seq, wire));
        if self.group.len() >= self.data_shard {
            self.emit()
        } else {
            Vec::new()
        }
    }

    /// Emit parity for a partial group (idle flush). Single-segment groups
    /// are not worth a repair datagram and are dropped.
    pub fn flush(&mut self) -> Vec<Repair> {
        if self.group.len() >= 2 {
            self.emit()
        } else {
            self.group.clear();
            Vec::new()
        }
    }

    pub fn pending(&self) -> usize {
        self.group.len()
    }

    fn emit(&mut self) -> Vec<Repair> {
        let per_repair = (self.group.len() / self.parity_shard).max(1);
        let mut repairs = Vec::with_capacity(self.parity_shard);

        for i in 0..self.parity_shard {
            let start = i * per_repair;
            if start >= self.group.len() {
                break;
            }
            // The last repair absorbs the remainder of the group.
            let end = if i == self.parity_shard - 1 {
                self.group.len()
            } else {
                (start + per_repair).min(self.group.len())
            };

            let chunk = &self.group[start..end];
            repairs.push(Repair {
                start_seq: chunk[0].0,
                count: chunk.len() as u16,
                data: xor_all(chunk.iter().map(|(_, wire)| wire.as_ref())),
            });
        }

        self.group.clear();
        repairs
    }
}

fn xor_all<'a>(parts: impl Iterator<Item = &'a [u8]>) -> Bytes {
    let mut acc: Vec<u8> = Vec::new();
    for part in parts {
        if part.len() > acc.len() {
            acc.resize(part.len(), 0);
        }
        for (a, b) in acc.iter_mut().zip(part.iter()) {
            *a ^= b;
        }
    }
    Bytes::from(acc)
}

/// Caches received segments and repairs, recovering single losses.
pub struct FecDecoder {
    /// Received segment wire bytes by seq.
    shards: std::collections::HashMap<u64, Bytes>,
    repairs: Vec<Repair>,
    max_cache: usize,
}

impl FecDecoder {
    pub fn new(max_cache: usize) -> Self {
        Self {
            shards: std::collections::HashMap::with_capacity(max_cache.min(1024)),
            repairs: Vec::new(),
            max_cache: max_cache.max(16),
        }
    }

    /// Record a received data segment's wire bytes.
    pub fn push_data(&mut self, seq: u64, wire: Bytes) {
        self.shards.insert(seq, wire);
        if self.shards.len() > self.max_cache {
            if let Some(&min) = self.shards.keys().min() {
                self.shards.remove(&min);
            }
        }
    }

    /// Record a repair and attempt recovery. Returns recovered segments as
    /// (seq, wire bytes), possibly zero-padded at the tail.
    pub fn push_repair(&mut self, repair: Repair) -> Vec<(u64, Bytes)> {
        self.repairs.push(repair);
        if self.repairs.len() > self.max_cache / 2 {
            self.repairs.remove(0);
        }
        self.try_recover()
    }

    fn try_recover(&mut self) -> Vec<(u64, Bytes)> {
        let mut recovered = Vec::new();

        for repair in &self.repairs {
            let missing: Vec<u64> = repair
                .seqs()
                .filter(|seq| !self.shards.contains_key(seq))
                .collect();
            if missing.len() != 1 {
                continue;
            }

            let seq = missing[0];
            let wire = xor_all(
                repair
                    .seqs()
                    .filter(|s| *s != seq)
                    .map(|s| self.shards[&s].as_ref())
                    .chain(std::iter::once(repair.data.as_ref())),
            );
            self.shards.insert(seq, wire.clone());
            recovered.push((seq, wire));
        }

        // A repair whose range is fully present has done its job.
        self.repairs
            .retain(|repair| repair.seqs().any(|seq| !self.shards.contains_key(&seq)));

        recovered
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(seq: u64, len: usize) -> Bytes {
        let mut data = vec![seq as u8; len];
        data[0] = 0xAA;
        Bytes::from(data)
    }

    #[test]
    fn test_group_emits_on_fill() {
        let mut enc = FecEncoder::new(4, 1);
        assert!(enc.push(0, wire(0, 32)).is_empty());
        assert!(enc.push(1, wire(1, 32)).is_empty());
        assert!(enc.push(2, wire(2, 32)).is_empty());

        let repairs = enc.push(3, wire(3, 32));
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].start_seq, 0);
        assert_eq!(repairs[0].count, 4);
        assert_eq!(enc.pending(), 0);
    }

    #[test]
    fn test_multiple_parity_shards_split_the_group() {
        let mut enc = FecEncoder::new(4, 2);
        let mut repairs = Vec::new();
        for seq in 0..4 {
            repairs.extend(enc.push(seq, wire(seq, 16)));
        }
        assert_eq!(repairs.len(), 2);
        assert_eq!(repairs[0].count + repairs[1].count, 4);
    }

    #[test]
    fn test_recover_single_loss() {
        let mut enc = FecEncoder::new(4, 1);
        let mut dec = FecDecoder::new(128);

        let segments: Vec<Bytes> = (0..4).map(|seq| wire(seq, 20 + seq as usize)).collect();
        let mut repairs = Vec::new();
        for (seq, segment) in segments.iter().enumerate() {
            repairs.extend(enc.push(seq as u64, segment.clone()));
        }

        dec.push_data(0, segments[0].clone());
        dec.push_data(1, segments[1].clone());
        // Segment 2 lost.
        dec.push_data(3, segments[3].clone());

        let recovered = dec.push_repair(repairs.pop().unwrap());
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].0, 2);
        // Recovered bytes match, modulo zero padding to the longest shard.
        assert_eq!(&recovered[0].1[..segments[2].len()], segments[2].as_ref());
    }

    #[test]
    fn test_two_losses_not_recoverable() {
        let mut enc = FecEncoder::new(4, 1);
        let mut dec = FecDecoder::new(128);

        let mut repairs = Vec::new();
        for seq in 0..4u64 {
            repairs.extend(enc.push(seq, wire(seq, 24)));
        }

        dec.push_data(0, wire(0, 24));
        dec.push_data(1, wire(1, 24));
        // 2 and 3 both lost.
        assert!(dec.push_repair(repairs.pop().unwrap()).is_empty());
    }

    #[test]
    fn test_flush_partial_group() {
        let mut enc = FecEncoder::new(10, 3);
        enc.push(0, wire(0, 16));
        enc.push(1, wire(1, 16));
        let repairs = enc.flush();
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].count, 2);
        assert_eq!(enc.pending(), 0);

        // A lone segment is not worth parity.
        enc.push(2, wire(2, 16));
        assert!(enc.flush().is_empty());
    }

    #[test]
    fn test_repair_payload_roundtrip() {
        let repair = Repair {
            start_seq: 99,
            count: 5,
            data: Bytes::from_static(b"parity-bytes"),
        };
        let decoded = Repair::decode(repair.encode()).unwrap();
        assert_eq!(decoded.start_seq, 99);
        assert_eq!(decoded.count, 5);
        assert_eq!(decoded.data, repair.data);
    }

    #[test]
    fn test_decoder_cache_is_bounded() {
        let mut dec = FecDecoder::new(16);
        for seq in 0..200u64 {
            dec.push_data(seq, wire(seq, 8));
        }
        assert!(dec.cached() <= 17);
    }
}
