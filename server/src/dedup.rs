//! Pre-table deduplication and deterministic sampling (§4.3 "Deduplication
//! (pre-table)").

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime};

use crate::flow::{Endpoint, FlowKey};
use crate::parser::ParsedPacket;

const DEDUP_WINDOW: Duration = Duration::from_millis(1);
const DEDUP_CAPACITY: usize = 10_000;

struct DedupEntry {
    hash: u64,
    seen_at: SystemTime,
}

/// Rolling-hash duplicate detector plus a deterministic 1-in-N sampler.
/// Neither component touches the flow table; both run ahead of it.
pub struct Deduplicator {
    recent: VecDeque<DedupEntry>,
    sample_counter: u64,
    sampling_rate: f64,
    pub dedup_drops: u64,
    pub sampled_out: u64,
}

impl Deduplicator {
    pub fn new(sampling_rate: f64) -> Self {
        Self {
            recent: VecDeque::with_capacity(DEDUP_CAPACITY),
            sample_counter: 0,
            sampling_rate,
            dedup_drops: 0,
            sampled_out: 0,
        }
    }

    /// Returns `true` if the packet should be admitted downstream.
    pub fn admit(&mut self, pkt: &ParsedPacket<'_>) -> bool {
        self.evict_expired(pkt.timestamp);

        let hash = hash_of(pkt);
        if self.recent.iter().any(|e| e.hash == hash) {
            self.dedup_drops += 1;
            return false;
        }

        if self.recent.len() >= DEDUP_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(DedupEntry { hash, seen_at: pkt.timestamp });

        if !self.sample_admit() {
            self.sampled_out += 1;
            return false;
        }

        true
    }

    fn evict_expired(&mut self, now: SystemTime) {
        while let Some(front) = self.recent.front() {
            match now.duration_since(front.seen_at) {
                Ok(age) if age > DEDUP_WINDOW => {
                    self.recent.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Deterministic 1-in-N admission: admits every `round(1/sampling_rate)`-th
    /// packet, so over any window of `N` admissible packets exactly
    /// `floor(N * s)` are admitted.
    fn sample_admit(&mut self) -> bool {
        if self.sampling_rate >= 1.0 {
            return true;
        }
        let every_n = (1.0 / self.sampling_rate).round().max(1.0) as u64;
        let admit = self.sample_counter % every_n == 0;
        self.sample_counter += 1;
        admit
    }
}

fn hash_of(pkt: &ParsedPacket<'_>) -> u64 {
    let (a, b) = match (pkt.src_ip, pkt.dst_ip) {
        (Some(s), Some(d)) => (
            Endpoint { ip: s, port: pkt.src_port },
            Endpoint { ip: d, port: pkt.dst_port },
        ),
        _ => (
            Endpoint { ip: std::net::IpAddr::V4(0.into()), port: 0 },
            Endpoint { ip: std::net::IpAddr::V4(0.into()), port: 0 },
        ),
    };
    let key = FlowKey::canonical(pkt.protocol, a, b).0;

    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    pkt.frame_len.hash(&mut hasher);
    pkt.ip_id.hash(&mut hasher);
    hasher.finish()
}
