//! The concurrent flow table: a sharded lock-striped map from canonical
//! [`FlowKey`] to live [`Flow`] state (§5). `dashmap` already implements
//! shard-level `RwLock` striping internally; pinning the shard count to 64
//! matches the default called out in §5 rather than sizing it off CPU count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;

use crate::config::FlowConfig;
use crate::flow::{Endpoint, Flow, FlowKey, TcpState};
use crate::parser::ParsedPacket;

const SHARD_AMOUNT: usize = 64;

/// Outcome of admitting one packet into the table.
pub enum Admission {
    /// The packet created a brand new flow (its key had no prior entry).
    Created,
    /// The packet updated an existing live flow.
    Updated,
}

#[derive(Default)]
pub struct TableHealth {
    pub active_flows: AtomicU64,
    pub finalized_total: AtomicU64,
    pub evicted_total: AtomicU64,
}

pub struct FlowTable {
    flows: DashMap<FlowKey, Flow>,
    config: FlowConfig,
    pub health: TableHealth,
}

impl FlowTable {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            flows: DashMap::with_shard_amount(SHARD_AMOUNT),
            config,
            health: TableHealth::default(),
        }
    }

    /// Apply a parsed, non-ARP packet to the table, creating a new flow if
    /// this is the first packet of its canonical key.
    pub fn admit(&self, pkt: &ParsedPacket<'_>) -> Option<Admission> {
        let (src_ip, dst_ip) = (pkt.src_ip?, pkt.dst_ip?);
        let src = Endpoint { ip: src_ip, port: pkt.src_port };
        let dst = Endpoint { ip: dst_ip, port: pkt.dst_port };
        let (key, src_is_a) = FlowKey::canonical(pkt.protocol, src, dst);

        let mut entry = self.flows.entry(key).or_insert_with(|| {
            self.health.active_flows.fetch_add(1, Ordering::Relaxed);
            Flow::new(key, pkt.timestamp)
        });
        entry.apply(pkt, src_is_a);

        if let Some(name) = pkt.app.http_host.clone().or(pkt.app.tls_sni.clone()) {
            if entry.enrichment.server_name.is_none() {
                entry.enrichment.server_name = Some(name);
            }
        }

        Some(Admission::Updated)
    }

    /// Idle timeout for the given flow. Non-TCP flows (UDP, ICMP, ...) always
    /// use the UDP timeout, since they have no TCP state machine and are
    /// parked in `Established` from their first packet (§4.3).
    fn idle_timeout(&self, flow: &Flow) -> std::time::Duration {
        use std::time::Duration;
        if flow.key.protocol != crate::parser::Protocol::Tcp.number() {
            return Duration::from_secs(self.config.idle_timeout_udp_secs);
        }
        match flow.tcp_state {
            TcpState::Handshake => Duration::from_secs(self.config.idle_timeout_handshake_secs),
            TcpState::Established | TcpState::Closing => {
                Duration::from_secs(self.config.idle_timeout_tcp_secs)
            }
            TcpState::New | TcpState::Closed | TcpState::Reset => {
                Duration::from_secs(self.config.idle_timeout_udp_secs)
            }
        }
    }

    /// Scan the table for flows that must finalize now: TCP closed/reset,
    /// idle past their state's timeout, or past the hard duration cap.
    /// Returns the finalized flows, removed from the table.
    pub fn sweep(&self, now: SystemTime) -> Vec<Flow> {
        let max_duration = std::time::Duration::from_secs(self.config.max_duration_secs);
        let mut to_finalize = Vec::new();

        self.flows.retain(|_key, flow| {
            let terminal = matches!(flow.tcp_state, TcpState::Closed | TcpState::Reset);
            let idle = now
                .duration_since(flow.last_seen)
                .map(|d| d > self.idle_timeout(flow))
                .unwrap_or(false);
            let over_cap = flow.duration() > max_duration;

            if terminal || idle || over_cap {
                let mut finished = flow.clone();
                finished.finalize(now);
                to_finalize.push(finished);
                false // remove from table
            } else {
                true
            }
        });

        if !to_finalize.is_empty() {
            self.health
                .active_flows
                .fetch_sub(to_finalize.len() as u64, Ordering::Relaxed);
            self.health
                .finalized_total
                .fetch_add(to_finalize.len() as u64, Ordering::Relaxed);
        }
        to_finalize
    }

    /// Evict the least-recently-used flows when over `max_flows`, preferring
    /// to keep active TCP ESTABLISHED flows (evicted last).
    pub fn evict_over_capacity(&self, now: SystemTime) -> Vec<Flow> {
        if self.flows.len() <= self.config.max_flows {
            return Vec::new();
        }
        let overflow = self.flows.len() - self.config.max_flows;

        let mut candidates: Vec<(SystemTime, FlowKey, bool)> = self
            .flows
            .iter()
            .map(|e| (e.last_seen, *e.key(), e.tcp_state == TcpState::Established))
            .collect();

        // Oldest last_seen first; non-established ahead of established ties.
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.2.cmp(&b.2)));

        let mut evicted = Vec::new();
        for (_, key, _) in candidates.into_iter().take(overflow) {
            if let Some((_, mut flow)) = self.flows.remove(&key) {
                flow.finalize(now);
                evicted.push(flow);
            }
        }

        if !evicted.is_empty() {
            self.health
                .active_flows
                .fetch_sub(evicted.len() as u64, Ordering::Relaxed);
            self.health
                .evicted_total
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        }
        evicted
    }

    pub fn active_flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Force-finalize every remaining flow, used during shutdown.
    pub fn drain_all(&self, now: SystemTime) -> Vec<Flow> {
        let keys: Vec<FlowKey> = self.flows.iter().map(|e| *e.key()).collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, mut flow)) = self.flows.remove(&key) {
                flow.finalize(now);
                drained.push(flow);
            }
        }
        self.health.active_flows.store(0, Ordering::Relaxed);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{AppHints, Protocol};
    use std::time::Duration;

    fn pkt<'a>(
        src: &str,
        sport: u16,
        dst: &str,
        dport: u16,
        ts: SystemTime,
        flags: u8,
        payload: &'a [u8],
    ) -> ParsedPacket<'a> {
        ParsedPacket {
            timestamp: ts,
            frame_len: 64 + payload.len(),
            src_mac: crate::flow::MacAddr([0, 0, 0, 0, 0, 1]),
            dst_mac: crate::flow::MacAddr([0, 0, 0, 0, 0, 2]),
            src_ip: Some(src.parse().unwrap()),
            dst_ip: Some(dst.parse().unwrap()),
            ttl: Some(64),
            ip_id: 0,
            protocol: Protocol::Tcp,
            src_port: sport,
            dst_port: dport,
            tcp_flags: flags,
            tcp_seq: 0,
            tcp_ack: 0,
            tcp_window: 65535,
            payload,
            app: AppHints::default(),
        }
    }

    #[test]
    fn admitting_both_directions_updates_one_flow() {
        let table = FlowTable::new(FlowConfig::default());
        let t0 = SystemTime::now();

        table.admit(&pkt("10.0.0.2", 51000, "10.0.0.3", 80, t0, crate::parser::tcp_flags::SYN, &[]));
        table.admit(&pkt(
            "10.0.0.3",
            80,
            "10.0.0.2",
            51000,
            t0 + Duration::from_millis(1),
            crate::parser::tcp_flags::SYN | crate::parser::tcp_flags::ACK,
            &[],
        ));

        assert_eq!(table.active_flow_count(), 1, "both directions must map to one flow");
    }

    #[test]
    fn sweep_finalizes_reset_flows() {
        let table = FlowTable::new(FlowConfig::default());
        let t0 = SystemTime::now();
        table.admit(&pkt("10.0.0.2", 1, "10.0.0.3", 2, t0, crate::parser::tcp_flags::RST, &[]));

        let finalized = table.sweep(t0);
        assert_eq!(finalized.len(), 1);
        assert_eq!(table.active_flow_count(), 0);
        assert!(finalized[0].is_finalized());
    }

    #[test]
    fn sweep_finalizes_idle_udp_flow() {
        let mut cfg = FlowConfig::default();
        cfg.idle_timeout_udp_secs = 60;
        let table = FlowTable::new(cfg);
        let t0 = SystemTime::now();

        let mut udp_pkt = pkt("10.0.0.2", 1, "10.0.0.3", 2, t0, 0, &[]);
        udp_pkt.protocol = Protocol::Udp;
        table.admit(&udp_pkt);

        let too_soon = table.sweep(t0 + Duration::from_secs(10));
        assert!(too_soon.is_empty(), "must not finalize before the idle timeout");

        let finalized = table.sweep(t0 + Duration::from_secs(65));
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].last_seen, finalized[0].first_seen);
        assert_eq!(finalized[0].tcp_state, TcpState::Closed, "a finalized UDP flow must be Closed, not Established");
    }

    #[test]
    fn udp_flow_uses_udp_idle_timeout_not_tcp() {
        let mut cfg = FlowConfig::default();
        cfg.idle_timeout_udp_secs = 60;
        cfg.idle_timeout_tcp_secs = 300;
        let table = FlowTable::new(cfg);
        let t0 = SystemTime::now();

        let mut udp_pkt = pkt("10.0.0.2", 1, "10.0.0.3", 2, t0, 0, &[]);
        udp_pkt.protocol = Protocol::Udp;
        table.admit(&udp_pkt);

        // Past the UDP timeout (60s) but well short of the TCP one (300s):
        // a UDP flow must not be kept alive by the TCP idle window just
        // because `apply` parks it in `Established`.
        let finalized = table.sweep(t0 + Duration::from_secs(65));
        assert_eq!(finalized.len(), 1, "UDP flow must finalize at the UDP idle timeout, not the TCP one");
    }

    #[test]
    fn eviction_prefers_keeping_established_flows() {
        let mut cfg = FlowConfig::default();
        cfg.max_flows = 1;
        let table = FlowTable::new(cfg);
        let t0 = SystemTime::now();

        // Flow A: older, still NEW (half-open).
        table.admit(&pkt("10.0.0.2", 1, "10.0.0.3", 2, t0, crate::parser::tcp_flags::SYN, &[]));
        // Flow B: newer, fully established.
        let t1 = t0 + Duration::from_secs(1);
        table.admit(&pkt("10.0.0.4", 1, "10.0.0.5", 2, t1, crate::parser::tcp_flags::SYN, &[]));
        table.admit(&pkt(
            "10.0.0.5",
            2,
            "10.0.0.4",
            1,
            t1 + Duration::from_millis(1),
            crate::parser::tcp_flags::SYN | crate::parser::tcp_flags::ACK,
            &[],
        ));
        table.admit(&pkt(
            "10.0.0.4",
            1,
            "10.0.0.5",
            2,
            t1 + Duration::from_millis(2),
            crate::parser::tcp_flags::ACK,
            &[],
        ));

        let evicted = table.evict_over_capacity(t1 + Duration::from_secs(2));
        assert_eq!(evicted.len(), 1);
        assert_eq!(table.active_flow_count(), 1);
    }
}
