//! Reliability layer.
//!
//! Selective acknowledgment, retransmission and flow control for one
//! sub-session. The driver feeds received segments in and pulls
//! retransmissions out on its tick; this module never touches a socket.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::rdt::packet::{decode_sack_ranges, encode_sack_ranges, Segment};
use crate::rdt::RdtConfig;

/// Initial RTT estimate, microseconds.
const INITIAL_RTT_US: u64 = 100_000;

/// Upper bound for the retransmission timeout.
const MAX_RTO_US: u64 = 60_000_000;

/// SACK ranges carried per ack segment.
const MAX_SACK_RANGES: usize = 4;

struct PendingSegment {
    segment: Segment,
    sent_at: Instant,
    retries: u32,
    /// Times a later segment was selectively acked past this one.
    skips: u32,
}

/// Per-sub-session ARQ state.
pub struct Arq {
    // Send side.
    next_seq: u64,
    pending: BTreeMap<u64, PendingSegment>,
    peer_window: usize,
    cwnd: f64,
    ssthresh: f64,

    // Receive side.
    next_expected: u64,
    reorder: BTreeMap<u64, Bytes>,
    ack_pending: bool,

    // Timing.
    srtt_us: u64,
    rttvar_us: u64,
    rto_us: u64,

    // Config.
    snd_wnd: usize,
    rcv_wnd: usize,
    resend: u32,
    nocongestion: bool,
    min_rto_us: u64,
}

impl Arq {
    pub fn new(config: &RdtConfig) -> Self {
        Self {
            next_seq: 0,
            pending: BTreeMap::new(),
            peer_window: config.snd_wnd,
            cwnd: if config.nocongestion {
                config.snd_wnd as f64
            } else {
                2.0
            },
            ssthresh: config.snd_wnd as f64,
            next_expected: 0,
            reorder: BTreeMap::new(),
            ack_pending: false,
            srtt_us: INITIAL_RTT_US,
            rttvar_us: INITIAL_RTT_US / 2,
            rto_us: INITIAL_RTT_US * 3,
            snd_wnd: config.snd_wnd.max(1),
            rcv_wnd: config.rcv_wnd.max(1),
            resend: config.resend,
            nocongestion: config.nocongestion,
            // nodelay mode accepts spurious retransmits for latency.
            min_rto_us: if config.nodelay { 30_000 } else { 100_000 },
        }
    }

    /// Whether the send window has room for another segment.
    pub fn can_send(&self) -> bool {
        let mut limit = self.snd_wnd.min(self.peer_window.max(1));
        if !self.nocongestion {
            limit = limit.min(self.cwnd as usize).max(1);
        }
        self.pending.len() < limit
    }

    /// Register an outgoing payload; returns the Push segment to transmit.
    pub fn next_push(&mut self, payload: Bytes) -> Segment {
        let seq = self.next_seq;
        self.next_seq += 1;

        let segment = Segment::push(seq, payload);
        self.pending.insert(
            seq,
            PendingSegment {
                segment: segment.clone(),
                sent_at: Instant::now(),
                retries: 0,
                skips: 0,
            },
        );
        segment
    }

    /// Process a received Push. Returns payloads now deliverable in order.
    pub fn on_push(&mut self, seq: u64, payload: Bytes) -> Vec<Bytes> {
        self.ack_pending = true;

        if seq < self.next_expected || self.reorder.contains_key(&seq) {
            // Duplicate; the refreshed ack is answer enough.
            return Vec::new();
        }
        if seq >= self.next_expected + self.rcv_wnd as u64 {
            // Outside the receive window; the peer will retransmit once
            // our advertised window opens.
            return Vec::new();
        }

        self.reorder.insert(seq, payload);

        let mut delivered = Vec::new();
        while let Some(payload) = self.reorder.remove(&self.next_expected) {
            delivered.push(payload);
            self.next_expected += 1;
        }
        delivered
    }

    /// Process a received Ack. Returns fast retransmissions.
    pub fn on_ack(&mut self, segment: &Segment) -> Vec<Segment> {
        let now = Instant::now();
        self.peer_window = segment.window as usize;

        let mut newly_acked = 0u32;

        // Cumulative: everything below `ack` is delivered.
        let cum: Vec<u64> = self
            .pending
            .range(..segment.ack)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in cum {
            if let Some(pending) = self.pending.remove(&seq) {
                newly_acked += 1;
                if pending.retries == 0 {
                    self.update_rtt(now.duration_since(pending.sent_at).as_micros() as u64);
                }
            }
        }

        // Selective ranges.
        let mut highest_sacked = 0u64;
        if let Ok(ranges) = decode_sack_ranges(segment.payload.clone()) {
            for (start, end) in ranges {
                highest_sacked = highest_sacked.max(end);
                let seqs: Vec<u64> = self
                    .pending
                    .range(start..=end)
                    .map(|(&seq, _)| seq)
                    .collect();
                for seq in seqs {
                    if let Some(pending) = self.pending.remove(&seq) {
                        newly_acked += 1;
                        if pending.retries == 0 {
                            self.update_rtt(
                                now.duration_since(pending.sent_at).as_micros() as u64
                            );
                        }
                    }
                }
            }
        }

        self.grow_cwnd(newly_acked);
        self.fast_retransmits(highest_sacked, now)
    }

    /// Count skips for segments the peer has seen past, and resend the
    /// ones that crossed the threshold.
    fn fast_retransmits(&mut self, highest_sacked: u64, now: Instant) -> Vec<Segment> {
        if self.resend == 0 || highest_sacked == 0 {
            return Vec::new();
        }

        let mut out = Vec::new();
        for (&seq, pending) in self.pending.iter_mut() {
            if seq >= highest_sacked {
                break;
            }
            pending.skips += 1;
            if pending.skips >= self.resend {
                pending.skips = 0;
                pending.retries += 1;
                pending.sent_at = now;
                out.push(pending.segment.clone());
            }
        }
        out
    }

    /// Build the pending ack segment, if any data arrived since the last.
    pub fn take_ack(&mut self) -> Option<Segment> {
        if !self.ack_pending {
            return None;
        }
        self.ack_pending = false;

        let ranges = self.sack_ranges();
        Some(Segment::ack(
            self.next_expected,
            self.advertised_window(),
            encode_sack_ranges(&ranges),
        ))
    }

    fn advertised_window(&self) -> u16 {
        self.rcv_wnd.saturating_sub(self.reorder.len()).min(u16::MAX as usize) as u16
    }

    /// Contiguous runs in the reorder buffer, lowest first.
    fn sack_ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for &seq in self.reorder.keys() {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == seq => *end = seq,
                _ => {
                    if ranges.len() == MAX_SACK_RANGES {
                        break;
                    }
                    ranges.push((seq, seq));
                }
            }
        }
        ranges
    }

    /// Segments whose retransmission timeout elapsed. Each retry stretches
    /// the segment's own deadline; delivery never gives up — a dead link
    /// is the keepalive's problem.
    pub fn retransmits(&mut self, now: Instant) -> Vec<Segment> {
        let rto = self.rto_us;
        let mut out = Vec::new();
        let mut lost = false;

        for pending in self.pending.values_mut() {
            let deadline = Duration::from_micros(rto.saturating_mul(pending.retries as u64 + 1));
            if now.duration_since(pending.sent_at) >= deadline {
                pending.retries += 1;
                pending.sent_at = now;
                out.push(pending.segment.clone());
                lost = true;
            }
        }

        if lost && !self.nocongestion {
            self.ssthresh = (self.cwnd / 2.0).max(2.0);
            self.cwnd = 1.0;
        }
        out
    }

    fn grow_cwnd(&mut self, newly_acked: u32) {
        if self.nocongestion {
            return;
        }
        for _ in 0..newly_acked {
            if self.cwnd < self.ssthresh {
                self.cwnd += 1.0;
            } else {
                self.cwnd += 1.0 / self.cwnd;
            }
        }
        self.cwnd = self.cwnd.min(self.snd_wnd as f64);
    }

    /// Jacobson's RTT estimator: alpha 1/8, beta 1/4, K = 4.
    fn update_rtt(&mut self, rtt_us: u64) {
        let diff = self.srtt_us.abs_diff(rtt_us);
        self.rttvar_us = (self.rttvar_us * 3 / 4) + (diff / 4);
        self.srtt_us = (self.srtt_us * 7 / 8) + (rtt_us / 8);

        self.rto_us = (self.srtt_us + (4 * self.rttvar_us).max(10_000))
            .clamp(self.min_rto_us, MAX_RTO_US);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    #[cfg(test)]
    fn rto(&self) -> Duration {
        Duration::from_micros(self.rto_us)
    }
}
