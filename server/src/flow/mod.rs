//! Canonical flow key, the in-memory `Flow` aggregate, and its TCP state
//! machine. See [`crate::flow::table`] for the concurrent flow table itself.

pub mod table;

use std::net::IpAddr;
use std::time::SystemTime;

use uuid::Uuid;

use crate::parser::{tcp_flags, ParsedPacket, Protocol};

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// One endpoint of a transport-layer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

/// Canonical, direction-independent flow key: the protocol plus the two
/// endpoints ordered lexicographically so both directions of the same
/// exchange map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: u8,
    pub a: Endpoint,
    pub b: Endpoint,
}

impl FlowKey {
    /// Build the canonical key for an observed `(src, dst)` tuple. Returns
    /// the key plus whether the observed src endpoint is `a` (i.e. the
    /// packet travels in the table's "forward" direction).
    pub fn canonical(protocol: Protocol, src: Endpoint, dst: Endpoint) -> (Self, bool) {
        let (a, b, src_is_a) = if src <= dst { (src, dst, true) } else { (dst, src, false) };
        (
            FlowKey {
                protocol: protocol.number(),
                a,
                b,
            },
            src_is_a,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    New,
    Handshake,
    Established,
    Closing,
    Closed,
    Reset,
}

/// Per-direction counters and TCP sequence tracking.
#[derive(Debug, Clone, Default)]
pub struct DirectionStats {
    pub bytes: u64,
    pub packets: u64,
    pub retransmissions: u64,
    pub max_seq_seen: u32,
    pub has_seq: bool,
    pub window_min: Option<u16>,
    pub window_max: Option<u16>,
    last_arrival: Option<SystemTime>,
    pub jitter_ms: f64,
}

/// A bounded set of RTT samples with a running average/max.
#[derive(Debug, Clone, Default)]
pub struct RttTracker {
    samples: Vec<f64>,
    pub avg_ms: f64,
    pub max_ms: f64,
}

const RTT_MAX_SAMPLES: usize = 32;

impl RttTracker {
    fn record(&mut self, sample_ms: f64) {
        if self.samples.len() >= RTT_MAX_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push(sample_ms);
        self.avg_ms = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        self.max_ms = self.samples.iter().cloned().fold(0.0, f64::max);
    }
}

/// Resolved naming/classification/geo context, filled in progressively by
/// the enrichment component as the flow is observed and finalized.
#[derive(Debug, Clone, Default)]
pub struct FlowEnrichment {
    pub server_name: Option<String>,
    pub application: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u32>,
    pub local_device_id: Option<String>,
    pub remote_device_id: Option<String>,
}

/// A live flow aggregate. Owned exclusively by the flow table until
/// finalization, at which point it is handed to the persistence sink and
/// never mutated again.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: Uuid,
    pub key: FlowKey,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub finalized_at: Option<SystemTime>,

    /// Stats for packets observed traveling `a -> b`.
    pub fwd: DirectionStats,
    /// Stats for packets observed traveling `b -> a`.
    pub rev: DirectionStats,

    pub tcp_state: TcpState,
    pub flags_union: u8,

    pub rtt: RttTracker,
    pub enrichment: FlowEnrichment,

    pub threat_score: u32,
    pub threat_categories: Vec<String>,

    // Bookkeeping for RTT sampling: last unacked data send per direction.
    fwd_last_data_send: Option<(u32, usize, SystemTime)>, // (seq, len, ts)
    rev_last_data_send: Option<(u32, usize, SystemTime)>,
}

impl Flow {
    pub fn new(key: FlowKey, now: SystemTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            first_seen: now,
            last_seen: now,
            finalized_at: None,
            fwd: DirectionStats::default(),
            rev: DirectionStats::default(),
            tcp_state: TcpState::New,
            flags_union: 0,
            rtt: RttTracker::default(),
            enrichment: FlowEnrichment::default(),
            threat_score: 0,
            threat_categories: Vec::new(),
            fwd_last_data_send: None,
            rev_last_data_send: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// Apply one parsed packet to this flow. `src_is_a` indicates whether
    /// the packet's source endpoint is the key's `a` endpoint (forward).
    pub fn apply(&mut self, pkt: &ParsedPacket<'_>, src_is_a: bool) {
        debug_assert!(!self.is_finalized(), "finalized flows must not be mutated");

        let bytes = pkt.frame_len as u64;
        let now = pkt.timestamp;
        let is_tcp = matches!(pkt.protocol, Protocol::Tcp);

        // Counters and jitter for the sending direction.
        {
            let dir = if src_is_a { &mut self.fwd } else { &mut self.rev };
            if let Some(prev) = dir.last_arrival {
                if let Ok(delta) = now.duration_since(prev) {
                    let delta_ms = delta.as_secs_f64() * 1000.0;
                    let prev_jitter = dir.jitter_ms;
                    dir.jitter_ms = prev_jitter + 0.125 * (delta_ms - prev_jitter).abs();
                }
            }
            dir.last_arrival = Some(now);
            dir.packets += 1;
            dir.bytes = dir.bytes.saturating_add(bytes);
            if is_tcp {
                let w = pkt.tcp_window;
                dir.window_min = Some(dir.window_min.map_or(w, |m| m.min(w)));
                dir.window_max = Some(dir.window_max.map_or(w, |m| m.max(w)));
            }
        }

        if is_tcp {
            self.flags_union |= pkt.tcp_flags;
            let payload_len = pkt.payload.len();

            {
                let dir = if src_is_a { &mut self.fwd } else { &mut self.rev };
                if payload_len > 0 {
                    if dir.has_seq && seq_leq(pkt.tcp_seq, dir.max_seq_seen) {
                        dir.retransmissions += 1;
                    } else {
                        dir.max_seq_seen = pkt.tcp_seq.wrapping_add(payload_len as u32);
                        dir.has_seq = true;
                    }
                }
            }

            if payload_len > 0 {
                let slot = if src_is_a {
                    &mut self.fwd_last_data_send
                } else {
                    &mut self.rev_last_data_send
                };
                *slot = Some((pkt.tcp_seq, payload_len, now));
            }

            // RTT sampling: an ACK in the opposite direction acknowledging a
            // previously observed data send, within a 2s window (§4.3).
            if pkt.tcp_flags & tcp_flags::ACK != 0 {
                let opposite_slot = if src_is_a {
                    &mut self.rev_last_data_send
                } else {
                    &mut self.fwd_last_data_send
                };
                if let Some((seq, len, sent_at)) = *opposite_slot {
                    if pkt.tcp_ack >= seq.wrapping_add(len as u32) {
                        if let Ok(rtt) = now.duration_since(sent_at) {
                            if rtt.as_secs_f64() <= 2.0 {
                                self.rtt.record(rtt.as_secs_f64() * 1000.0);
                            }
                        }
                        *opposite_slot = None;
                    }
                }
            }

            self.drive_tcp_state(pkt.tcp_flags);
        } else if self.tcp_state == TcpState::New {
            self.tcp_state = TcpState::Established;
        }

        self.last_seen = now;
    }

    fn drive_tcp_state(&mut self, flags: u8) {
        if flags & tcp_flags::RST != 0 {
            self.tcp_state = TcpState::Reset;
            return;
        }
        self.tcp_state = match self.tcp_state {
            TcpState::New if flags & tcp_flags::SYN != 0 => TcpState::Handshake,
            TcpState::Handshake if flags & tcp_flags::SYN != 0 && flags & tcp_flags::ACK != 0 => {
                TcpState::Handshake
            }
            TcpState::Handshake if flags & tcp_flags::ACK != 0 => TcpState::Established,
            TcpState::Established if flags & tcp_flags::FIN != 0 => TcpState::Closing,
            TcpState::Closing if flags & tcp_flags::FIN != 0 || flags & tcp_flags::ACK != 0 => {
                TcpState::Closed
            }
            other => other,
        };
    }

    pub fn duration(&self) -> std::time::Duration {
        self.last_seen
            .duration_since(self.first_seen)
            .unwrap_or_default()
    }

    pub fn finalize(&mut self, now: SystemTime) {
        if self.key.protocol != Protocol::Tcp.number() {
            self.tcp_state = TcpState::Closed;
        }
        self.finalized_at = Some(now);
    }
}

/// Wrapping sequence-number comparison: `a <= b` accounting for 32-bit wrap.
fn seq_leq(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}
