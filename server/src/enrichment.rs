//! Enrichment: DNS/SNI naming caches, application classification, geo
//! lookup, and the local/external device-attribution split (§4.4).
//!
//! The layered "most specific source wins, never downgrade" pattern here
//! follows the donor's device-profile enrichment (`DHCP > hostname > mDNS >
//! TTL > vendor`, never overwriting a more specific source), generalized
//! from ARP-scan device profiles to flow naming and application labels.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;

use crate::flow::{Flow, FlowKey, MacAddr};

const DNS_CACHE_CAPACITY: usize = 50_000;
const DNS_TTL_MIN: Duration = Duration::from_secs(60);
const DNS_TTL_MAX: Duration = Duration::from_secs(3600);
const GEO_TTL: Duration = Duration::from_secs(24 * 3600);

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// A bounded, TTL-expiring, insertion-order-evicted cache. Not a strict LRU
/// (no recency bump on read) but bounded and monotone, matching the "cache
/// with TTL" requirement without pulling in a dependency solely for this.
struct BoundedCache<K: std::hash::Hash + Eq + Clone, V> {
    map: HashMap<K, CacheEntry<V>>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> BoundedCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self { map: HashMap::new(), order: VecDeque::new(), capacity }
    }

    fn insert(&mut self, key: K, value: V, ttl: Duration, now: Instant) {
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, CacheEntry { value, expires_at: now + ttl });
    }

    fn get(&self, key: &K, now: Instant) -> Option<V> {
        self.map.get(key).filter(|e| e.expires_at > now).map(|e| e.value.clone())
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// IP → last-seen DNS query name, keyed off observed DNS answers.
pub struct DnsCache {
    cache: BoundedCache<IpAddr, String>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self { cache: BoundedCache::new(DNS_CACHE_CAPACITY) }
    }

    pub fn observe_answer(&mut self, ip: IpAddr, name: String, ttl_secs: u32, now: Instant) {
        let ttl = Duration::from_secs(ttl_secs as u64).clamp(DNS_TTL_MIN, DNS_TTL_MAX);
        self.cache.insert(ip, name, ttl, now);
    }

    pub fn lookup(&self, ip: IpAddr, now: Instant) -> Option<String> {
        self.cache.get(&ip, now)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// flow key → SNI/Host name, set on first observation only (never overwritten).
#[derive(Default)]
pub struct SniCache {
    cache: HashMap<FlowKey, String>,
}

impl SniCache {
    pub fn observe(&mut self, key: FlowKey, name: String) {
        self.cache.entry(key).or_insert(name);
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<&str> {
        self.cache.get(key).map(|s| s.as_str())
    }
}

/// Resolved geo context for a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: String,
    pub city: Option<String>,
    pub asn: Option<u32>,
}

/// A pluggable IP → geo resolver. The real resolver (e.g. a MaxMind-style
/// database or an upstream API) is an external collaborator per scope;
/// this trait is the seam it plugs into.
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// A resolver that never returns a result, used when no geo source is configured.
pub struct NullGeoResolver;
impl GeoResolver for NullGeoResolver {
    fn resolve(&self, _ip: IpAddr) -> Option<GeoInfo> {
        None
    }
}

/// Caches geo lookups by /24 (v4) or /48 (v6) network, with a 24h TTL. The
/// 250ms soft deadline (§5) is enforced by the resolver implementation
/// itself (e.g. an HTTP-backed resolver applying its own timeout and
/// returning `None` on miss); this cache never blocks beyond that.
pub struct GeoCache {
    resolver: Box<dyn GeoResolver>,
    cache: BoundedCache<IpNetwork, GeoInfo>,
}

impl GeoCache {
    pub fn new(resolver: Box<dyn GeoResolver>) -> Self {
        Self { resolver, cache: BoundedCache::new(100_000) }
    }

    pub fn lookup(&mut self, ip: IpAddr, now: Instant) -> Option<GeoInfo> {
        let network = aggregation_network(ip);
        if let Some(cached) = self.cache.get(&network, now) {
            return Some(cached);
        }
        let resolved = self.resolver.resolve(ip)?;
        self.cache.insert(network, resolved.clone(), GEO_TTL, now);
        Some(resolved)
    }
}

fn aggregation_network(ip: IpAddr) -> IpNetwork {
    let prefix = match ip {
        IpAddr::V4(_) => 24,
        IpAddr::V6(_) => 48,
    };
    let net = IpNetwork::new(ip, prefix).unwrap();
    IpNetwork::new(net.network(), prefix).unwrap()
}

/// First-match-wins application classification: explicit SNI/Host mapping,
/// then (port, protocol), then `unknown`.
pub struct AppClassifier {
    by_name: HashMap<String, String>,
    by_port: HashMap<u16, String>,
}

impl AppClassifier {
    pub fn with_defaults() -> Self {
        let mut by_port = HashMap::new();
        by_port.insert(80, "http".to_string());
        by_port.insert(8080, "http".to_string());
        by_port.insert(8000, "http".to_string());
        by_port.insert(443, "https".to_string());
        by_port.insert(8443, "https".to_string());
        by_port.insert(53, "dns".to_string());
        by_port.insert(22, "ssh".to_string());
        by_port.insert(25, "smtp".to_string());
        by_port.insert(993, "imaps".to_string());
        by_port.insert(995, "pop3s".to_string());
        Self { by_name: HashMap::new(), by_port }
    }

    pub fn classify(&self, server_name: Option<&str>, dst_port: u16) -> String {
        if let Some(name) = server_name {
            for (substr, label) in &self.by_name {
                if name.contains(substr.as_str()) {
                    return label.clone();
                }
            }
        }
        if let Some(label) = self.by_port.get(&dst_port) {
            return label.clone();
        }
        "unknown".to_string()
    }
}

impl Default for AppClassifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Returns `true` if `ip` falls within any of the configured local subnets.
pub fn is_local(ip: IpAddr, local_subnets: &[IpNetwork]) -> bool {
    local_subnets.iter().any(|n| n.contains(ip))
}

/// Rule-based device-type classification: vendor OUI, hostname hints,
/// observed ports; falls back to `generic`.
pub fn classify_device_type(vendor: Option<&str>, hostname: Option<&str>, observed_ports: &[u16]) -> String {
    if let Some(h) = hostname {
        let lower = h.to_lowercase();
        if lower.contains("iphone") || lower.contains("ipad") || lower.contains("macbook") {
            return "apple_device".to_string();
        }
        if lower.contains("android") {
            return "android_device".to_string();
        }
        if lower.contains("printer") {
            return "printer".to_string();
        }
    }
    if let Some(v) = vendor {
        let lower = v.to_lowercase();
        if lower.contains("raspberry pi") {
            return "single_board_computer".to_string();
        }
        if lower.contains("ubiquiti") || lower.contains("synology") {
            return "network_infrastructure".to_string();
        }
        if lower.contains("sonos") || lower.contains("philips") {
            return "smart_home".to_string();
        }
        if lower.contains("espressif") {
            return "iot".to_string();
        }
        if lower.contains("apple") {
            return "apple_device".to_string();
        }
    }
    if observed_ports.contains(&9100) || observed_ports.contains(&631) {
        return "printer".to_string();
    }
    "generic".to_string()
}

/// Applies accumulated enrichment context to a finalized flow: server name
/// (SNI > DNS-reverse, never downgrading a more-specific source already
/// set), application label, and geo.
///
/// `remote_ip`/`remote_port` identify the non-local endpoint as determined
/// by the caller's local/external split (§4.4) — the canonical key's `a`/`b`
/// order is direction-independent and must not be assumed to track which
/// side is remote.
pub fn enrich_flow(
    flow: &mut Flow,
    remote_ip: IpAddr,
    remote_port: u16,
    dns: &DnsCache,
    sni: &SniCache,
    app_classifier: &AppClassifier,
    geo: &mut GeoCache,
    now: Instant,
) {
    if let Some(name) = sni.lookup(&flow.key) {
        flow.enrichment.server_name = Some(name.to_string());
    } else if flow.enrichment.server_name.is_none() {
        if let Some(name) = dns.lookup(remote_ip, now) {
            flow.enrichment.server_name = Some(name);
        }
    }

    flow.enrichment.application = Some(
        app_classifier.classify(flow.enrichment.server_name.as_deref(), remote_port),
    );

    if let Some(info) = geo.lookup(remote_ip, now) {
        flow.enrichment.country = Some(info.country);
        flow.enrichment.city = info.city;
        flow.enrichment.asn = info.asn;
    }
}

/// Derives a stable device id from a MAC (preferred) or falls back to `ip:<addr>`.
pub fn device_id_for(mac: Option<MacAddr>, ip: IpAddr) -> String {
    match mac {
        Some(m) => m.to_string(),
        None => format!("ip:{ip}"),
    }
}

/// Learns `ip -> MAC` from every packet observed on the local L2 segment
/// (§4.4 "MAC→device"), so the flow-finalize stage can resolve a device
/// identity that the `Flow` aggregate itself never stores a MAC for. Not a
/// bounded cache: local-segment address space is small and entries are
/// naturally overwritten as leases change, same lifetime as the process.
#[derive(Default)]
pub struct MacLearner {
    table: HashMap<IpAddr, MacAddr>,
}

impl MacLearner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, ip: IpAddr, mac: MacAddr) {
        self.table.insert(ip, mac);
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<MacAddr> {
        self.table.get(&ip).copied()
    }
}

#[cfg(test)]
mod mac_learner_tests {
    use super::*;

    #[test]
    fn learns_and_resolves_ip_to_mac() {
        let mut learner = MacLearner::new();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let mac = MacAddr([1, 2, 3, 4, 5, 6]);
        assert_eq!(learner.lookup(ip), None);
        learner.observe(ip, mac);
        assert_eq!(learner.lookup(ip), Some(mac));
    }

    #[test]
    fn later_observation_overwrites_earlier_mac() {
        let mut learner = MacLearner::new();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        learner.observe(ip, MacAddr([1, 1, 1, 1, 1, 1]));
        learner.observe(ip, MacAddr([2, 2, 2, 2, 2, 2]));
        assert_eq!(learner.lookup(ip), Some(MacAddr([2, 2, 2, 2, 2, 2])));
    }
}
